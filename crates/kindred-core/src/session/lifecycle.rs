use std::fmt::{self, Display};

///
/// LifecycleState
///
/// Managed-object lifecycle:
/// `Transient → PersistentNew → PersistentClean ⇄ PersistentDirty → Deleted`,
/// with `DetachedClean/DetachedDirty` for copies that crossed the session
/// boundary. Tracked-field mutation dirties a clean persistent object;
/// flush cleans a dirty one; delete is terminal.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleState {
    Transient,
    PersistentNew,
    PersistentClean,
    PersistentDirty,
    Deleted,
    DetachedClean,
    DetachedDirty,
}

impl LifecycleState {
    #[must_use]
    pub const fn is_persistent(self) -> bool {
        matches!(
            self,
            Self::PersistentNew | Self::PersistentClean | Self::PersistentDirty
        )
    }

    #[must_use]
    pub const fn is_dirty(self) -> bool {
        matches!(self, Self::PersistentDirty | Self::DetachedDirty)
    }

    #[must_use]
    pub const fn is_deleted(self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// State after a tracked-field mutation.
    #[must_use]
    pub const fn after_mutation(self) -> Self {
        match self {
            Self::PersistentClean | Self::PersistentNew => Self::PersistentDirty,
            Self::DetachedClean => Self::DetachedDirty,
            other => other,
        }
    }

    /// State after a successful flush of this object.
    #[must_use]
    pub const fn after_flush(self) -> Self {
        match self {
            Self::PersistentNew | Self::PersistentDirty => Self::PersistentClean,
            other => other,
        }
    }
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Transient => "transient",
            Self::PersistentNew => "persistent-new",
            Self::PersistentClean => "persistent-clean",
            Self::PersistentDirty => "persistent-dirty",
            Self::Deleted => "deleted",
            Self::DetachedClean => "detached-clean",
            Self::DetachedDirty => "detached-dirty",
        };
        write!(f, "{label}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_and_flush_transitions() {
        assert_eq!(
            LifecycleState::PersistentClean.after_mutation(),
            LifecycleState::PersistentDirty
        );
        assert_eq!(
            LifecycleState::PersistentDirty.after_flush(),
            LifecycleState::PersistentClean
        );
        assert_eq!(
            LifecycleState::Transient.after_mutation(),
            LifecycleState::Transient
        );
        assert_eq!(
            LifecycleState::Deleted.after_flush(),
            LifecycleState::Deleted
        );
    }
}
