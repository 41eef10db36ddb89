//! Path-addressed reads and edits over a JSON DOM.

use serde_json::{Map, Value};

use super::path::PathComponent;
use crate::kvproc::error::SubDocError;

/// Deepest nesting allowed for values written through sub-document ops.
pub const MAX_VALUE_DEPTH: usize = 32;

fn depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Parse a single JSON value supplied by a client.
pub fn parse_value(bytes: &[u8]) -> Result<Value, SubDocError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|_| SubDocError::CantInsert)?;
    if depth(&value) > MAX_VALUE_DEPTH {
        return Err(SubDocError::ValueTooDeep);
    }
    Ok(value)
}

/// Parse a comma separated list of JSON values, as array pushes accept.
pub fn parse_values(bytes: &[u8]) -> Result<Vec<Value>, SubDocError> {
    if bytes.is_empty() {
        return Err(SubDocError::CantInsert);
    }
    let mut wrapped = Vec::with_capacity(bytes.len() + 2);
    wrapped.push(b'[');
    wrapped.extend_from_slice(bytes);
    wrapped.push(b']');
    match parse_value(&wrapped)? {
        Value::Array(items) => Ok(items),
        _ => Err(SubDocError::CantInsert),
    }
}

/// Translate a possibly negative index into a position within `len` items.
fn resolve_index(len: usize, index: i64) -> Option<usize> {
    if index < 0 {
        let back = usize::try_from(index.unsigned_abs()).ok()?;
        len.checked_sub(back)
    } else {
        usize::try_from(index).ok().filter(|pos| *pos < len)
    }
}

fn child<'a>(value: &'a Value, comp: &PathComponent) -> Result<&'a Value, SubDocError> {
    match (comp, value) {
        (PathComponent::Field(name), Value::Object(map)) => {
            map.get(name).ok_or(SubDocError::PathNotFound)
        }
        (PathComponent::Index(index), Value::Array(items)) => resolve_index(items.len(), *index)
            .and_then(|pos| items.get(pos))
            .ok_or(SubDocError::PathNotFound),
        _ => Err(SubDocError::PathMismatch),
    }
}

fn child_mut<'a>(
    value: &'a mut Value,
    comp: &PathComponent,
    create: bool,
) -> Result<&'a mut Value, SubDocError> {
    match (comp, value) {
        (PathComponent::Field(name), Value::Object(map)) => {
            if create {
                Ok(map
                    .entry(name.clone())
                    .or_insert_with(|| Value::Object(Map::new())))
            } else {
                map.get_mut(name).ok_or(SubDocError::PathNotFound)
            }
        }
        (PathComponent::Index(index), Value::Array(items)) => {
            let pos = resolve_index(items.len(), *index).ok_or(SubDocError::PathNotFound)?;
            items.get_mut(pos).ok_or(SubDocError::PathNotFound)
        }
        _ => Err(SubDocError::PathMismatch),
    }
}

/// Value at `path`.
pub fn get<'a>(root: &'a Value, path: &[PathComponent]) -> Result<&'a Value, SubDocError> {
    path.iter().try_fold(root, child)
}

fn get_mut<'a>(
    root: &'a mut Value,
    path: &[PathComponent],
    create: bool,
) -> Result<&'a mut Value, SubDocError> {
    let mut current = root;
    for comp in path {
        current = child_mut(current, comp, create)?;
    }
    Ok(current)
}

/// Split a path into its parent container and final component.
fn split(path: &[PathComponent]) -> Result<(&PathComponent, &[PathComponent]), SubDocError> {
    path.split_last().ok_or(SubDocError::PathInvalid)
}

/// Number of entries in the container at `path`.
pub fn count(root: &Value, path: &[PathComponent]) -> Result<usize, SubDocError> {
    match get(root, path)? {
        Value::Array(items) => Ok(items.len()),
        Value::Object(map) => Ok(map.len()),
        _ => Err(SubDocError::PathMismatch),
    }
}

/// Add a new dictionary entry, failing if it already exists.
pub fn dict_add(
    root: &mut Value,
    path: &[PathComponent],
    value: Value,
    mkdir: bool,
) -> Result<(), SubDocError> {
    let (last, parent_path) = split(path)?;
    let name = last.as_field().ok_or(SubDocError::PathInvalid)?;
    match get_mut(root, parent_path, mkdir)? {
        Value::Object(map) => {
            if map.contains_key(name) {
                return Err(SubDocError::PathExists);
            }
            map.insert(name.to_string(), value);
            Ok(())
        }
        _ => Err(SubDocError::PathMismatch),
    }
}

/// Insert or overwrite the value at `path`.
pub fn dict_upsert(
    root: &mut Value,
    path: &[PathComponent],
    value: Value,
    mkdir: bool,
) -> Result<(), SubDocError> {
    let (last, parent_path) = split(path)?;
    let parent = get_mut(root, parent_path, mkdir)?;
    match (last, parent) {
        (PathComponent::Field(name), Value::Object(map)) => {
            map.insert(name.clone(), value);
            Ok(())
        }
        (PathComponent::Index(_), Value::Array(_)) => Err(SubDocError::PathInvalid),
        _ => Err(SubDocError::PathMismatch),
    }
}

/// Overwrite an existing value. The empty path replaces the whole document.
pub fn replace(root: &mut Value, path: &[PathComponent], value: Value) -> Result<(), SubDocError> {
    let target = get_mut(root, path, false)?;
    *target = value;
    Ok(())
}

/// Remove the value at `path`.
pub fn delete(root: &mut Value, path: &[PathComponent]) -> Result<(), SubDocError> {
    let (last, parent_path) = split(path)?;
    match (last, get_mut(root, parent_path, false)?) {
        (PathComponent::Field(name), Value::Object(map)) => map
            .remove(name)
            .map(|_| ())
            .ok_or(SubDocError::PathNotFound),
        (PathComponent::Index(index), Value::Array(items)) => {
            let pos = resolve_index(items.len(), *index).ok_or(SubDocError::PathNotFound)?;
            items.remove(pos);
            Ok(())
        }
        _ => Err(SubDocError::PathMismatch),
    }
}

/// Array at `path`, created empty when only the last component is missing.
fn array_at<'a>(
    root: &'a mut Value,
    path: &[PathComponent],
    mkdir: bool,
) -> Result<&'a mut Vec<Value>, SubDocError> {
    let target = match path.split_last() {
        None => root,
        Some((last, parent_path)) => {
            let parent = get_mut(root, parent_path, mkdir)?;
            match (last, parent) {
                (PathComponent::Field(name), Value::Object(map)) => map
                    .entry(name.clone())
                    .or_insert_with(|| Value::Array(Vec::new())),
                (comp, parent) => child_mut(parent, comp, false)?,
            }
        }
    };
    match target {
        Value::Array(items) => Ok(items),
        _ => Err(SubDocError::PathMismatch),
    }
}

/// Push values onto the front or back of the array at `path`.
pub fn array_push(
    root: &mut Value,
    path: &[PathComponent],
    values: Vec<Value>,
    front: bool,
    mkdir: bool,
) -> Result<(), SubDocError> {
    let items = array_at(root, path, mkdir)?;
    if front {
        let mut merged = values;
        merged.append(items);
        *items = merged;
    } else {
        items.extend(values);
    }
    Ok(())
}

/// Insert values before the array position named by the last path component.
/// Inserting at the array length appends.
pub fn array_insert(root: &mut Value, path: &[PathComponent], values: Vec<Value>) -> Result<(), SubDocError> {
    let (last, parent_path) = split(path)?;
    let PathComponent::Index(index) = last else {
        return Err(SubDocError::PathInvalid);
    };
    match get_mut(root, parent_path, false)? {
        Value::Array(items) => {
            let pos = if *index < 0 {
                resolve_index(items.len(), *index)
            } else {
                usize::try_from(*index).ok().filter(|pos| *pos <= items.len())
            }
            .ok_or(SubDocError::PathNotFound)?;
            let tail = items.split_off(pos);
            items.extend(values);
            items.extend(tail);
            Ok(())
        }
        _ => Err(SubDocError::PathMismatch),
    }
}

/// Append a primitive value unless an equal one is already present.
pub fn array_add_unique(
    root: &mut Value,
    path: &[PathComponent],
    value: Value,
    mkdir: bool,
) -> Result<(), SubDocError> {
    if value.is_array() || value.is_object() {
        return Err(SubDocError::CantInsert);
    }
    let items = array_at(root, path, mkdir)?;
    if items.iter().any(|item| item.is_array() || item.is_object()) {
        return Err(SubDocError::PathMismatch);
    }
    if items.contains(&value) {
        return Err(SubDocError::PathExists);
    }
    items.push(value);
    Ok(())
}

/// Add `delta` to the integer at `path`, creating it when absent.
pub fn counter(root: &mut Value, path: &[PathComponent], delta: i64, mkdir: bool) -> Result<i64, SubDocError> {
    if delta == 0 {
        return Err(SubDocError::BadDelta);
    }
    let (last, parent_path) = split(path)?;
    let parent = get_mut(root, parent_path, mkdir)?;

    let target = match (last, parent) {
        (PathComponent::Field(name), Value::Object(map)) => {
            map.entry(name.clone()).or_insert_with(|| Value::from(0))
        }
        (comp, parent) => child_mut(parent, comp, false)?,
    };
    let current = match &*target {
        Value::Number(num) => num.as_i64().ok_or(SubDocError::NumRange)?,
        _ => return Err(SubDocError::PathMismatch),
    };
    let updated = current.checked_add(delta).ok_or(SubDocError::NumRange)?;
    *target = Value::from(updated);
    Ok(updated)
}

/// Parse a counter delta, which must be a plain non-zero integer.
pub fn parse_delta(bytes: &[u8]) -> Result<i64, SubDocError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|delta| *delta != 0)
        .ok_or(SubDocError::BadDelta)
}
