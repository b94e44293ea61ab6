///
/// EngineConfig
///
/// Tuning knobs injected into the engine constructor. Defaults match the
/// behavior documented on each field.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EngineConfig {
    /// Ids reserved per fetch for named sequences. Plain auto-increment key
    /// identities always fetch single ids regardless of this setting.
    pub sequence_batch_size: u64,

    /// Coalesce eligible same-group operations of one flush into batched
    /// store calls. Disabling issues one call per entity, which is useful
    /// when diagnosing store-side failures.
    pub coalesce_flush_calls: bool,
}

impl EngineConfig {
    pub(crate) const AUTO_ID_BATCH_SIZE: u64 = 1;
    pub(crate) const DEFAULT_SEQUENCE_BATCH_SIZE: u64 = 12;
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sequence_batch_size: Self::DEFAULT_SEQUENCE_BATCH_SIZE,
            coalesce_flush_calls: true,
        }
    }
}
