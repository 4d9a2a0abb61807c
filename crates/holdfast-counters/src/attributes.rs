//! Which attributes of which record types are counters, and how each is backed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CounterError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterMode {
    /// Staged in the store and flushed later.
    Buffered,
    /// Written straight to the durable repository.
    Legacy,
}

impl CounterMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CounterMode::Buffered => "buffered",
            CounterMode::Legacy => "legacy",
        }
    }
}

impl fmt::Display for CounterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default)]
pub struct CounterAttributes {
    modes: BTreeMap<String, BTreeMap<String, CounterMode>>,
}

impl CounterAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        record_type: impl Into<String>,
        attribute: impl Into<String>,
        mode: CounterMode,
    ) -> &mut Self {
        self.modes
            .entry(record_type.into())
            .or_default()
            .insert(attribute.into(), mode);
        self
    }

    pub fn mode_for(&self, record_type: &str, attribute: &str) -> Result<CounterMode, CounterError> {
        self.modes
            .get(record_type)
            .and_then(|attributes| attributes.get(attribute))
            .copied()
            .ok_or_else(|| CounterError::UnknownAttribute {
                record_type: record_type.to_string(),
                attribute: attribute.to_string(),
            })
    }

    /// Buffered attributes of `record_type`, in name order.
    pub fn buffered_attributes(&self, record_type: &str) -> Vec<String> {
        self.modes
            .get(record_type)
            .map(|attributes| {
                attributes
                    .iter()
                    .filter(|(_, mode)| **mode == CounterMode::Buffered)
                    .map(|(attribute, _)| attribute.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}

/// Parses `RecordType.attribute` pairs separated by commas, all buffered.
impl FromStr for CounterAttributes {
    type Err = CounterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut attributes = CounterAttributes::new();
        for entry in s.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let Some((record_type, attribute)) = entry.split_once('.') else {
                return Err(CounterError::UnknownAttribute {
                    record_type: entry.to_string(),
                    attribute: String::new(),
                });
            };
            if record_type.is_empty() || attribute.is_empty() {
                return Err(CounterError::UnknownAttribute {
                    record_type: record_type.to_string(),
                    attribute: attribute.to_string(),
                });
            }
            attributes.register(record_type, attribute, CounterMode::Buffered);
        }
        Ok(attributes)
    }
}
