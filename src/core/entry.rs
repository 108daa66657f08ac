use crate::core::dn::Dn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A directory entry: its DN plus multi-valued attributes.
///
/// `Clone` is a deep copy; merge relies on that when it copies an entry on the
/// first in-memory change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub dn: Dn,
    attributes: BTreeMap<String, Vec<String>>,
}

impl Entry {
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: &str, values: &[&str]) -> Self {
        for value in values {
            self.add_value(attribute, value);
        }
        self
    }

    pub fn get(&self, attribute: &str) -> Option<&[String]> {
        self.attributes
            .get(&attribute.to_lowercase())
            .map(|values| values.as_slice())
    }

    pub fn contains_value(&self, attribute: &str, value: &str) -> bool {
        self.get(attribute)
            .map(|values| values.iter().any(|v| v == value))
            .unwrap_or(false)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(|k| k.as_str())
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    /// Adds a value unless already present. Returns whether the entry changed.
    pub fn add_value(&mut self, attribute: &str, value: &str) -> bool {
        let values = self.attributes.entry(attribute.to_lowercase()).or_default();
        if values.iter().any(|v| v == value) {
            return false;
        }
        values.push(value.to_string());
        true
    }

    /// Removes a value if present. An attribute left without values is dropped.
    pub fn remove_value(&mut self, attribute: &str, value: &str) -> bool {
        let key = attribute.to_lowercase();
        let Some(values) = self.attributes.get_mut(&key) else {
            return false;
        };
        let before = values.len();
        values.retain(|v| v != value);
        let changed = values.len() != before;
        if values.is_empty() {
            self.attributes.remove(&key);
        }
        changed
    }

    pub fn remove_attribute(&mut self, attribute: &str) -> bool {
        self.attributes.remove(&attribute.to_lowercase()).is_some()
    }

    /// Applies one modification in place.
    ///
    /// Adding a present value or removing an absent one is a no-op, so applying
    /// the same modification twice yields the same entry.
    pub fn apply_modification(&mut self, modification: &Modification) -> bool {
        match modification.op {
            ModOp::Add => {
                let mut changed = false;
                for value in &modification.values {
                    changed |= self.add_value(&modification.attribute, value);
                }
                changed
            }
            ModOp::Remove => {
                if modification.values.is_empty() {
                    return self.remove_attribute(&modification.attribute);
                }
                let mut changed = false;
                for value in &modification.values {
                    changed |= self.remove_value(&modification.attribute, value);
                }
                changed
            }
            ModOp::Replace => {
                let key = modification.attribute.to_lowercase();
                if modification.values.is_empty() {
                    return self.attributes.remove(&key).is_some();
                }
                let mut replacement: Vec<String> = Vec::with_capacity(modification.values.len());
                for value in &modification.values {
                    if !replacement.contains(value) {
                        replacement.push(value.clone());
                    }
                }
                let previous = self.attributes.insert(key, replacement.clone());
                previous.as_ref() != Some(&replacement)
            }
        }
    }

    /// Whether applying `modification` would change this entry.
    pub fn would_change(&self, modification: &Modification) -> bool {
        let current = self.get(&modification.attribute);
        match modification.op {
            ModOp::Add => modification
                .values
                .iter()
                .any(|v| !current.map(|vals| vals.contains(v)).unwrap_or(false)),
            ModOp::Remove => match current {
                None => false,
                Some(vals) => {
                    modification.values.is_empty() || modification.values.iter().any(|v| vals.contains(v))
                }
            },
            ModOp::Replace => {
                let mut replacement: Vec<&String> = Vec::new();
                for value in &modification.values {
                    if !replacement.contains(&value) {
                        replacement.push(value);
                    }
                }
                match current {
                    None => !replacement.is_empty(),
                    Some(vals) => vals.iter().collect::<Vec<_>>() != replacement,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModOp {
    Add,
    Remove,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub op: ModOp,
    pub attribute: String,
    pub values: Vec<String>,
}

impl Modification {
    pub fn new(op: ModOp, attribute: &str, values: &[&str]) -> Self {
        Self {
            op,
            attribute: attribute.to_lowercase(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn add(attribute: &str, values: &[&str]) -> Self {
        Self::new(ModOp::Add, attribute, values)
    }

    pub fn remove(attribute: &str, values: &[&str]) -> Self {
        Self::new(ModOp::Remove, attribute, values)
    }

    pub fn replace(attribute: &str, values: &[&str]) -> Self {
        Self::new(ModOp::Replace, attribute, values)
    }

    /// Builds the modification that undoes `self` against `before`, the entry
    /// as it was prior to applying `self`.
    pub fn undo_against(&self, before: &Entry) -> Modification {
        let previous: Vec<String> = before
            .get(&self.attribute)
            .map(|vals| vals.to_vec())
            .unwrap_or_default();

        match self.op {
            ModOp::Add => Modification {
                op: ModOp::Remove,
                attribute: self.attribute.clone(),
                values: self
                    .values
                    .iter()
                    .filter(|v| !previous.contains(v))
                    .cloned()
                    .collect(),
            },
            ModOp::Remove | ModOp::Replace => Modification {
                op: ModOp::Replace,
                attribute: self.attribute.clone(),
                values: previous,
            },
        }
    }
}
