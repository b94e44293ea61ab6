//! Scalar compatibility and narrowing rules shared by the write and read
//! mapping paths.

use crate::{
    error::PersistError,
    key::KindName,
    meta::{ContainerKind, ScalarKind},
    value::Value,
};
use num_traits::cast::cast;

/// Validate that `value` is assignable to a field of scalar kind `scalar`.
/// `Null` is assignable everywhere; narrow integers are range-checked.
pub(crate) fn check_scalar(
    kind: &KindName,
    field: &str,
    scalar: &ScalarKind,
    value: &Value,
) -> Result<(), PersistError> {
    if value.is_null() {
        return Ok(());
    }

    let ok = match (scalar, value) {
        (ScalarKind::Bool, Value::Bool(_))
        | (ScalarKind::Int64, Value::Int(_))
        | (ScalarKind::Float, Value::Float(_))
        | (ScalarKind::Text, Value::Text(_))
        | (ScalarKind::Timestamp, Value::Timestamp(_))
        | (ScalarKind::KeyRef, Value::Key(_)) => true,
        (ScalarKind::Int8 | ScalarKind::Int16 | ScalarKind::Int32, Value::Int(v)) => {
            if fits(scalar, *v) {
                true
            } else {
                return Err(PersistError::mapping(
                    kind,
                    field,
                    format!("{v} does not fit a {} field", scalar_label(scalar)),
                ));
            }
        }
        (ScalarKind::Enum(variants), Value::Text(text)) => {
            if variants.iter().any(|v| v == text) {
                true
            } else {
                return Err(PersistError::mapping(
                    kind,
                    field,
                    format!("'{text}' is not a declared enum variant"),
                ));
            }
        }
        _ => false,
    };

    if ok {
        Ok(())
    } else {
        Err(PersistError::mapping(
            kind,
            field,
            format!(
                "expected a {} value, found {}",
                scalar_label(scalar),
                value.tag()
            ),
        ))
    }
}

/// Validate a stored scalar on the read path. The wire always carries the
/// wide form; a stored value outside the declared narrow range is fatal.
pub(crate) fn check_stored_scalar(
    kind: &KindName,
    field: &str,
    scalar: &ScalarKind,
    value: &Value,
) -> Result<(), PersistError> {
    check_scalar(kind, field, scalar, value)
}

/// Whether `v` fits the declared narrow integer width.
pub(crate) fn fits(scalar: &ScalarKind, v: i64) -> bool {
    match scalar {
        ScalarKind::Int8 => cast::<i64, i8>(v).is_some(),
        ScalarKind::Int16 => cast::<i64, i16>(v).is_some(),
        ScalarKind::Int32 => cast::<i64, i32>(v).is_some(),
        _ => true,
    }
}

/// Re-bucket a stored list per the target container's semantics: sets
/// de-duplicate (first occurrence wins), ordered containers keep store
/// order.
pub(crate) fn rebucket(container: ContainerKind, items: Vec<Value>) -> Vec<Value> {
    match container {
        ContainerKind::List | ContainerKind::Array => items,
        ContainerKind::Set => {
            let mut out: Vec<Value> = Vec::with_capacity(items.len());
            for item in items {
                if !out.contains(&item) {
                    out.push(item);
                }
            }
            out
        }
    }
}

pub(crate) const fn scalar_label(scalar: &ScalarKind) -> &'static str {
    match scalar {
        ScalarKind::Bool => "bool",
        ScalarKind::Int8 => "int8",
        ScalarKind::Int16 => "int16",
        ScalarKind::Int32 => "int32",
        ScalarKind::Int64 => "int64",
        ScalarKind::Float => "float",
        ScalarKind::Text => "text",
        ScalarKind::Timestamp => "timestamp",
        ScalarKind::KeyRef => "key",
        ScalarKind::Enum(_) => "enum",
    }
}
