//! HAL pin/signal records and the handle-indexed shadow table
//!
//! The backend assigns every pin and signal an integer handle that stays
//! stable across updates. A full update carries complete records; an
//! incremental update carries partial records that are merged field-by-field
//! into existing entries, never creating new ones.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// HAL value type tags
pub const HAL_BIT: i32 = 1;
pub const HAL_FLOAT: i32 = 2;
pub const HAL_S32: i32 = 3;
pub const HAL_U32: i32 = 4;

/// HAL pin direction tags
pub const HAL_IN: i32 = 16;
pub const HAL_OUT: i32 = 32;
pub const HAL_IO: i32 = 48;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("incremental update references unknown handle {0}")]
    UnknownHandle(i32),
}

/// A typed HAL value; exactly one of the four value attributes is present
/// per record, matching the record's type tag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HalValue {
    Bit(bool),
    Float(f64),
    S32(i32),
    U32(u32),
}

/// A remote pin as reported in a full update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pin {
    pub handle: i32,
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub hal_type: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halbit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halfloat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hals32: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halu32: Option<u32>,
    /// Snapshot attributes this client does not model, kept as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A partial pin record from an incremental update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PinChange {
    pub handle: i32,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub hal_type: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halbit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halfloat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hals32: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halu32: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Pin {
    /// Merge an incremental change field-by-field; fields the change does not
    /// carry keep their current value.
    pub fn apply(&mut self, change: &PinChange) {
        if let Some(t) = change.hal_type {
            self.hal_type = Some(t);
        }
        if let Some(d) = change.dir {
            self.dir = Some(d);
        }
        if let Some(v) = change.halbit {
            self.halbit = Some(v);
        }
        if let Some(v) = change.halfloat {
            self.halfloat = Some(v);
        }
        if let Some(v) = change.hals32 {
            self.hals32 = Some(v);
        }
        if let Some(v) = change.halu32 {
            self.halu32 = Some(v);
        }
        for (key, value) in &change.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }

    /// The typed value matching the record's type tag
    pub fn value(&self) -> Option<HalValue> {
        value_of(
            self.hal_type,
            self.halbit,
            self.halfloat,
            self.hals32,
            self.halu32,
        )
    }
}

/// A remote signal as reported in a full update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub handle: i32,
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub hal_type: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halbit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halfloat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hals32: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halu32: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A partial signal record from an incremental update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalChange {
    pub handle: i32,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub hal_type: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halbit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halfloat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hals32: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halu32: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Signal {
    /// Merge an incremental change field-by-field
    pub fn apply(&mut self, change: &SignalChange) {
        if let Some(t) = change.hal_type {
            self.hal_type = Some(t);
        }
        if let Some(v) = change.halbit {
            self.halbit = Some(v);
        }
        if let Some(v) = change.halfloat {
            self.halfloat = Some(v);
        }
        if let Some(v) = change.hals32 {
            self.hals32 = Some(v);
        }
        if let Some(v) = change.halu32 {
            self.halu32 = Some(v);
        }
        for (key, value) in &change.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }

    /// The typed value matching the record's type tag
    pub fn value(&self) -> Option<HalValue> {
        value_of(
            self.hal_type,
            self.halbit,
            self.halfloat,
            self.hals32,
            self.halu32,
        )
    }
}

fn value_of(
    hal_type: Option<i32>,
    halbit: Option<bool>,
    halfloat: Option<f64>,
    hals32: Option<i32>,
    halu32: Option<u32>,
) -> Option<HalValue> {
    match hal_type? {
        HAL_BIT => halbit.map(HalValue::Bit),
        HAL_FLOAT => halfloat.map(HalValue::Float),
        HAL_S32 => hals32.map(HalValue::S32),
        HAL_U32 => halu32.map(HalValue::U32),
        _ => None,
    }
}

/// Handle-indexed shadow of remote state.
///
/// Full updates insert or replace whole records; incremental updates mutate
/// an existing record through [`ShadowTable::merge_with`]. A merge against an
/// absent handle is a protocol error and never creates an entry.
#[derive(Debug)]
pub struct ShadowTable<T> {
    entries: HashMap<i32, T>,
}

impl<T> Default for ShadowTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> ShadowTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record at `handle`
    pub fn insert(&mut self, handle: i32, record: T) {
        self.entries.insert(handle, record);
    }

    /// Mutate the existing record at `handle`; absent handles are an error
    pub fn merge_with(
        &mut self,
        handle: i32,
        merge: impl FnOnce(&mut T),
    ) -> Result<&T, TableError> {
        match self.entries.get_mut(&handle) {
            Some(record) => {
                merge(record);
                Ok(record)
            }
            None => Err(TableError::UnknownHandle(handle)),
        }
    }

    pub fn get(&self, handle: i32) -> Option<&T> {
        self.entries.get(&handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &T)> {
        self.entries.iter().map(|(handle, record)| (*handle, record))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_then_incremental_merge() {
        let mut table = ShadowTable::new();
        let pin: Pin =
            serde_json::from_value(json!({"handle": 1, "name": "x", "type": HAL_BIT, "halbit": true}))
                .unwrap();
        table.insert(pin.handle, pin);

        let change: PinChange =
            serde_json::from_value(json!({"handle": 1, "halbit": false})).unwrap();
        let merged = table
            .merge_with(change.handle, |pin| pin.apply(&change))
            .unwrap();

        // name and type untouched, only the value changed
        assert_eq!(merged.name, "x");
        assert_eq!(merged.hal_type, Some(HAL_BIT));
        assert_eq!(merged.halbit, Some(false));
        assert_eq!(merged.value(), Some(HalValue::Bit(false)));
    }

    #[test]
    fn test_merge_unknown_handle() {
        let mut table: ShadowTable<Pin> = ShadowTable::new();
        let err = table.merge_with(7, |_| {}).unwrap_err();
        assert!(matches!(err, TableError::UnknownHandle(7)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_extra_attributes_survive_merge() {
        let mut pin: Pin = serde_json::from_value(json!({
            "handle": 2,
            "name": "spindle.speed",
            "type": HAL_FLOAT,
            "dir": HAL_OUT,
            "halfloat": 0.0,
            "linked": true
        }))
        .unwrap();
        assert_eq!(pin.extra.get("linked"), Some(&json!(true)));

        let change: PinChange =
            serde_json::from_value(json!({"handle": 2, "halfloat": 1500.0, "linked": false}))
                .unwrap();
        pin.apply(&change);
        assert_eq!(pin.value(), Some(HalValue::Float(1500.0)));
        assert_eq!(pin.dir, Some(HAL_OUT));
        assert_eq!(pin.extra.get("linked"), Some(&json!(false)));
    }

    #[test]
    fn test_signal_value_by_type() {
        let signal: Signal = serde_json::from_value(json!({
            "handle": 3,
            "name": "counter",
            "type": HAL_U32,
            "halu32": 42
        }))
        .unwrap();
        assert_eq!(signal.value(), Some(HalValue::U32(42)));

        // A value attribute that does not match the type tag is not a value
        let odd: Signal = serde_json::from_value(json!({
            "handle": 4,
            "name": "odd",
            "type": HAL_BIT,
            "halfloat": 1.0
        }))
        .unwrap();
        assert_eq!(odd.value(), None);
    }
}
