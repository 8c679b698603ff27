//! Path navigation over backend values.
//!
//! Reads never fail: a missing intermediate yields `None`. Writes report a
//! path failure and leave the target untouched unless the final assignment
//! succeeds. Leading `@name` and `..` segments select the base value and are
//! handled by the caller; here they only appear as navigation errors.

use varsync_core::{Path, ProtocolError, Segment, Value};

/// Navigate `segments` from `base`.
pub fn resolve(base: &Value, segments: &[Segment]) -> Option<Value> {
    let mut current = base.clone();
    for segment in segments {
        current = step(&current, segment)?;
    }
    Some(current)
}

fn step(current: &Value, segment: &Segment) -> Option<Value> {
    match segment {
        Segment::Property(name) => current.member(name),
        Segment::Index(index) => current.element(*index),
        Segment::Method(name) => current.as_object()?.call(name, None),
        Segment::Parent | Segment::Standard(_) => None,
    }
}

/// Assign `value` at `segments` below `target`.
///
/// Every segment but the last must resolve to an existing node. Identity
/// objects are mutated in place; value-typed intermediates (maps, arrays)
/// held in an object field are copied, updated and stored back only once the
/// final assignment has succeeded.
pub fn write(
    target: &mut Value,
    segments: &[Segment],
    value: Value,
    path: &Path,
) -> Result<(), ProtocolError> {
    let Some((first, rest)) = segments.split_first() else {
        return Err(ProtocolError::path_failure(path.as_str(), "empty path"));
    };
    if rest.is_empty() {
        return assign(target, first, value, path);
    }

    match (target, first) {
        (Value::Object(obj), Segment::Property(name)) => {
            let mut child = obj
                .get(name)
                .ok_or_else(|| missing(path, first))?;
            write(&mut child, rest, value, path)?;
            if !matches!(child, Value::Object(_)) {
                obj.set(name.clone(), child);
            }
            Ok(())
        }
        (Value::Object(obj), Segment::Method(name)) => {
            let mut child = obj.call(name, None).ok_or_else(|| missing(path, first))?;
            write(&mut child, rest, value, path)
        }
        (Value::Map(map), Segment::Property(name)) => {
            let child = map.get_mut(name).ok_or_else(|| missing(path, first))?;
            write(child, rest, value, path)
        }
        (Value::Array(items), Segment::Index(index)) => {
            let child = index
                .checked_sub(1)
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| missing(path, first))?;
            write(child, rest, value, path)
        }
        _ => Err(missing(path, first)),
    }
}

fn assign(target: &mut Value, last: &Segment, value: Value, path: &Path) -> Result<(), ProtocolError> {
    match (target, last) {
        (Value::Object(obj), Segment::Property(name)) => {
            obj.set(name.clone(), value);
            Ok(())
        }
        (Value::Object(obj), Segment::Method(name)) => obj
            .call(name, Some(value))
            .map(|_| ())
            .ok_or_else(|| ProtocolError::path_failure(path.as_str(), format!("no method {last}"))),
        (Value::Map(map), Segment::Property(name)) => {
            map.insert(name.clone(), value);
            Ok(())
        }
        (Value::Array(items), Segment::Index(index)) => {
            let slot = index
                .checked_sub(1)
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| {
                    ProtocolError::path_failure(path.as_str(), format!("index {index} out of bounds"))
                })?;
            *slot = value;
            Ok(())
        }
        (Value::Null, _) => Err(ProtocolError::path_failure(
            path.as_str(),
            format!("no value to hold {last}"),
        )),
        _ => Err(ProtocolError::path_failure(
            path.as_str(),
            format!("cannot write {last}"),
        )),
    }
}

fn missing(path: &Path, segment: &Segment) -> ProtocolError {
    ProtocolError::path_failure(path.as_str(), format!("{segment} is missing"))
}
