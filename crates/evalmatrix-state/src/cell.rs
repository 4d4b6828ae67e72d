//! Execution cell identity.
//!
//! A cell is one (model, dataset, item) unit of scheduled work. The key is
//! always carried explicitly alongside outcomes and never reconstructed from
//! payload content.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

const SEPARATOR: char = '|';

/// Deterministic identity of an execution cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey {
    pub model_id: String,
    pub dataset_id: String,
    pub item_id: String,
}

impl CellKey {
    pub fn new(
        model_id: impl Into<String>,
        dataset_id: impl Into<String>,
        item_id: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            dataset_id: dataset_id.into(),
            item_id: item_id.into(),
        }
    }

    /// Stable composite key used in persisted layouts: `model|dataset|item`.
    ///
    /// `%` and `|` inside a component are percent-escaped so that any id
    /// (including provider-prefixed ids like `openai/gpt-4`) round-trips.
    pub fn composite(&self) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            escape(&self.model_id),
            escape(&self.dataset_id),
            escape(&self.item_id)
        )
    }

    /// Parse a key produced by [`CellKey::composite`].
    pub fn parse_composite(key: &str) -> Result<Self, StorageError> {
        let parts: Vec<&str> = key.split(SEPARATOR).collect();
        let [model, dataset, item] = parts.as_slice() else {
            return Err(StorageError::InvalidCellKey {
                key: key.to_string(),
            });
        };
        let invalid = || StorageError::InvalidCellKey {
            key: key.to_string(),
        };
        Ok(Self {
            model_id: unescape(model).ok_or_else(invalid)?,
            dataset_id: unescape(dataset).ok_or_else(invalid)?,
            item_id: unescape(item).ok_or_else(invalid)?,
        })
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.composite())
    }
}

impl FromStr for CellKey {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_composite(s)
    }
}

fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for ch in component.chars() {
        match ch {
            '%' => out.push_str("%25"),
            SEPARATOR => out.push_str("%7C"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(component: &str) -> Option<String> {
    let mut out = String::with_capacity(component.len());
    let mut rest = component;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3)?;
        match code {
            "25" => out.push('%'),
            "7C" => out.push(SEPARATOR),
            _ => return None,
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}

/// Serde adapter for maps keyed by [`CellKey`], persisted with composite string keys.
pub(crate) mod composite_map {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::CellKey;

    pub fn serialize<V, S>(map: &BTreeMap<CellKey, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        V: Serialize,
        S: Serializer,
    {
        let keyed: BTreeMap<String, &V> = map.iter().map(|(k, v)| (k.composite(), v)).collect();
        keyed.serialize(serializer)
    }

    pub fn deserialize<'de, V, D>(deserializer: D) -> Result<BTreeMap<CellKey, V>, D::Error>
    where
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let keyed: BTreeMap<String, V> = BTreeMap::deserialize(deserializer)?;
        keyed
            .into_iter()
            .map(|(k, v)| {
                CellKey::parse_composite(&k)
                    .map(|key| (key, v))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_is_pipe_joined() {
        let key = CellKey::new("openai/gpt-4", "mmlu", "q-17");
        assert_eq!(key.composite(), "openai/gpt-4|mmlu|q-17");
    }

    #[test]
    fn composite_roundtrips_with_reserved_characters() {
        let key = CellKey::new("weird|model", "100%", "a%7Cb");
        let encoded = key.composite();
        assert_eq!(encoded.matches('|').count(), 2);
        let parsed: CellKey = encoded.parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn parse_rejects_wrong_arity() {
        assert!(CellKey::parse_composite("a|b").is_err());
        assert!(CellKey::parse_composite("a|b|c|d").is_err());
    }

    #[test]
    fn parse_rejects_bad_escape() {
        let err = CellKey::parse_composite("a%zz|b|c").unwrap_err();
        assert!(matches!(err, StorageError::InvalidCellKey { .. }));
        assert!(CellKey::parse_composite("a%2|b|c").is_err());
    }

    #[test]
    fn empty_components_roundtrip() {
        let key = CellKey::new("", "", "");
        assert_eq!(CellKey::parse_composite(&key.composite()).unwrap(), key);
    }
}
