//! Small accessors for pulling typed values out of a toml table while
//! keeping track of the dotted path for error messages. The parsers consume
//! keys via `remove` so that the caller can detect leftovers (unknown keys)
//! afterwards.

use anyhow::{anyhow, Result};

pub(crate) fn get_value(
    table: &mut toml::value::Table,
    key: &str,
    path: &str,
) -> Result<toml::Value> {
    table
        .remove(key)
        .ok_or_else(|| anyhow!("missing key: '{}'", path.to_owned() + key))
}

pub(crate) fn get_string(table: &mut toml::value::Table, key: &str, path: &str) -> Result<String> {
    get_value(table, key, path).and_then(|v| {
        if let toml::Value::String(s) = v {
            Ok(s)
        } else {
            Err(expected_type("string", path, key))
        }
    })
}

pub(crate) fn get_opt_string(
    table: &mut toml::value::Table,
    key: &str,
    path: &str,
) -> Result<Option<String>> {
    match table.remove(key) {
        Some(toml::Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(expected_type("string", path, key)),
        None => Ok(None),
    }
}

pub(crate) fn get_opt_bool(
    table: &mut toml::value::Table,
    key: &str,
    path: &str,
) -> Result<Option<bool>> {
    match table.remove(key) {
        Some(toml::Value::Boolean(b)) => Ok(Some(b)),
        Some(_) => Err(expected_type("bool", path, key)),
        None => Ok(None),
    }
}

pub(crate) fn get_table(
    table: &mut toml::value::Table,
    key: &str,
    path: &str,
) -> Result<toml::value::Table> {
    match table.remove(key) {
        Some(toml::Value::Table(t)) => Ok(t),
        Some(_) => Err(expected_type("table", path, key)),
        None => Ok(toml::value::Table::new()),
    }
}

pub(crate) fn get_array(
    table: &mut toml::value::Table,
    key: &str,
    path: &str,
) -> Result<toml::value::Array> {
    match table.remove(key) {
        Some(toml::Value::Array(a)) => Ok(a),
        Some(_) => Err(expected_type("array", path, key)),
        None => Ok(toml::value::Array::new()),
    }
}

/// A non-negative integer, also accepted as a decimal string.
pub(crate) fn get_opt_u64(
    table: &mut toml::value::Table,
    key: &str,
    path: &str,
) -> Result<Option<u64>> {
    match table.remove(key) {
        Some(toml::Value::Integer(i)) if i >= 0 => Ok(Some(i as u64)),
        Some(toml::Value::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| expected_type("integer", path, key)),
        Some(_) => Err(expected_type("integer", path, key)),
        None => Ok(None),
    }
}

/// Array of strings, or a single comma-separated string. Manifests in the
/// wild use both spellings for dependency lists.
pub(crate) fn get_string_list(
    table: &mut toml::value::Table,
    key: &str,
    path: &str,
) -> Result<Vec<String>> {
    match table.remove(key) {
        Some(toml::Value::Array(a)) => a
            .into_iter()
            .map(|v| {
                if let toml::Value::String(s) = v {
                    Ok(s)
                } else {
                    Err(expected_type("string", path, key))
                }
            })
            .collect(),
        Some(toml::Value::String(s)) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()),
        Some(_) => Err(expected_type("array of strings", path, key)),
        None => Ok(Vec::new()),
    }
}

fn expected_type(ty: &str, path: &str, key: &str) -> anyhow::Error {
    anyhow!("expected type: '{}' for '{}'", ty, path.to_owned() + key)
}
