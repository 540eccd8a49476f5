use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Number, Value};
use toml_edit::{DocumentMut, Item};

use super::settings::ensure_known_key;
use crate::core::errors::UpdatesError;

/// Static defaults that runtime overrides are layered on top of.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSource {
    pub(crate) values: BTreeMap<String, Value>,
}

impl ConfigSource {
    /// Built-in defaults only.
    #[must_use]
    pub fn builtin() -> Self {
        Self::default()
    }

    /// Defaults from an explicit value map. Unknown keys are rejected.
    pub fn from_values(values: BTreeMap<String, Value>) -> Result<Self> {
        for key in values.keys() {
            ensure_known_key(key)?;
        }
        Ok(Self { values })
    }

    /// Read defaults from an `ota.toml` file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed, or when it
    /// names a key the resolver does not understand.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse_toml(&contents)
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    pub(crate) fn parse_toml(contents: &str) -> Result<Self> {
        let doc: DocumentMut = contents
            .parse()
            .map_err(|err: toml_edit::TomlError| UpdatesError::InvalidConfig {
                key: "<file>".to_string(),
                reason: err.to_string(),
            })?;
        let mut values = BTreeMap::new();
        for (key, item) in doc.as_table() {
            values.insert(key.to_string(), item_to_json(key, item)?);
        }
        Self::from_values(values)
    }
}

fn item_to_json(key: &str, item: &Item) -> Result<Value> {
    if let Some(value) = item.as_value() {
        return value_to_json(key, value);
    }
    if let Some(table) = item.as_table_like() {
        let mut map = serde_json::Map::new();
        for (inner_key, inner) in table.iter() {
            map.insert(inner_key.to_string(), item_to_json(key, inner)?);
        }
        return Ok(Value::Object(map));
    }
    Err(UpdatesError::InvalidConfig {
        key: key.to_string(),
        reason: "unsupported value".to_string(),
    }
    .into())
}

fn value_to_json(key: &str, value: &toml_edit::Value) -> Result<Value> {
    let json = match value {
        toml_edit::Value::String(s) => Value::String(s.value().clone()),
        toml_edit::Value::Integer(i) => Value::Number(Number::from(*i.value())),
        toml_edit::Value::Boolean(b) => Value::Bool(*b.value()),
        toml_edit::Value::Float(f) => Number::from_f64(*f.value())
            .map(Value::Number)
            .ok_or_else(|| UpdatesError::InvalidConfig {
                key: key.to_string(),
                reason: "non-finite float".to_string(),
            })?,
        toml_edit::Value::InlineTable(table) => {
            let mut map = serde_json::Map::new();
            for (inner_key, inner) in table.iter() {
                map.insert(inner_key.to_string(), value_to_json(key, inner)?);
            }
            Value::Object(map)
        }
        toml_edit::Value::Array(array) => Value::Array(
            array
                .iter()
                .map(|inner| value_to_json(key, inner))
                .collect::<Result<Vec<_>>>()?,
        ),
        toml_edit::Value::Datetime(dt) => Value::String(dt.value().to_string()),
    };
    Ok(json)
}
