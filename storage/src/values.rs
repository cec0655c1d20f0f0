use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Marker stored as the sole element of a field that was explicitly set to null.
pub const NULL_VALUE: &str = "+NULL+";

/// Field name to ordered, multi-valued list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValuesMap(BTreeMap<String, Vec<String>>);

impl ValuesMap {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with_field(field: impl Into<String>, values: Vec<String>) -> Self {
        let mut map = Self::new();
        map.put(field, values);
        map
    }

    pub fn get(&self, field: &str) -> Option<&Vec<String>> {
        self.0.get(field)
    }

    pub fn put(&mut self, field: impl Into<String>, values: Vec<String>) {
        self.0.insert(field.into(), values);
    }

    pub fn remove(&mut self, field: &str) -> Option<Vec<String>> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateOperation {
    Create,
    RemoveField,
    Clear,
    ReplaceAll,
    Remove,
    ReplaceSingleton,
    /// Appends treating the list as a set.
    Append,
    AppendOrCreate,
    ReplaceAllOrCreate,
    AppendWithDuplication,
    /// Pairwise replacement of old values by new values.
    Substitute,
    /// Replaces the element at the index argument.
    Set,
    SetFieldNull,
}

impl UpdateOperation {
    pub fn is_upsert(&self) -> bool {
        matches!(self, UpdateOperation::AppendOrCreate | UpdateOperation::ReplaceAllOrCreate)
    }

    pub fn non_upsert_equivalent(&self) -> Self {
        match self {
            UpdateOperation::AppendOrCreate => UpdateOperation::Append,
            UpdateOperation::ReplaceAllOrCreate => UpdateOperation::ReplaceAll,
            other => *other,
        }
    }

    /// Applies the operation to `field` of `values`.
    ///
    /// Returns `false` when nothing changed, which callers treat as a failed
    /// precondition.
    pub fn apply(
        &self,
        values: &mut ValuesMap,
        field: &str,
        new_values: &[String],
        old_values: Option<&[String]>,
        argument: usize,
    ) -> bool {
        if *self == UpdateOperation::RemoveField {
            return values.remove(field).is_some();
        }

        let mut list = values.get(field).cloned().unwrap_or_default();
        if self.apply_to_list(&mut list, new_values, old_values, argument) {
            values.put(field, list);
            true
        } else {
            false
        }
    }

    fn apply_to_list(
        &self,
        list: &mut Vec<String>,
        new_values: &[String],
        old_values: Option<&[String]>,
        argument: usize,
    ) -> bool {
        let is_null = list.first().map(|v| v == NULL_VALUE).unwrap_or(false);

        match self {
            UpdateOperation::RemoveField => false,
            UpdateOperation::Clear => {
                list.clear();
                true
            }
            UpdateOperation::Create | UpdateOperation::ReplaceAll | UpdateOperation::ReplaceAllOrCreate => {
                list.clear();
                list.extend_from_slice(new_values);
                true
            }
            UpdateOperation::AppendWithDuplication => {
                if is_null {
                    list.clear();
                }
                list.extend_from_slice(new_values);
                !new_values.is_empty()
            }
            UpdateOperation::Append | UpdateOperation::AppendOrCreate => {
                if is_null {
                    list.clear();
                }
                let mut seen = HashSet::new();
                let merged: Vec<String> = list
                    .iter()
                    .chain(new_values.iter())
                    .filter(|v| seen.insert(v.as_str()))
                    .cloned()
                    .collect();
                *list = merged;
                true
            }
            UpdateOperation::Remove => {
                if is_null {
                    list.clear();
                    return false;
                }
                let before = list.len();
                list.retain(|v| !new_values.contains(v));
                list.len() != before
            }
            UpdateOperation::ReplaceSingleton => {
                list.clear();
                if let Some(first) = new_values.first() {
                    list.push(first.clone());
                }
                true
            }
            UpdateOperation::Substitute => {
                if is_null {
                    list.clear();
                    return false;
                }
                let old_values = match old_values {
                    Some(old) => old,
                    None => return false,
                };
                let mut changed = false;
                for (old, new) in old_values.iter().zip(new_values.iter()) {
                    for value in list.iter_mut() {
                        if *value == *old {
                            *value = new.clone();
                            changed = true;
                        }
                    }
                }
                changed
            }
            UpdateOperation::Set => {
                if is_null {
                    list.clear();
                    return false;
                }
                match (new_values.first(), list.get_mut(argument)) {
                    (Some(first), Some(slot)) => {
                        *slot = first.clone();
                        true
                    }
                    _ => false,
                }
            }
            UpdateOperation::SetFieldNull => {
                if is_null {
                    return false;
                }
                list.clear();
                list.push(NULL_VALUE.to_string());
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn append_keeps_order_and_drops_duplicates() {
        let mut map = ValuesMap::with_field("x", strings(&["1", "2"]));
        assert!(UpdateOperation::Append.apply(&mut map, "x", &strings(&["2", "3"]), None, 0));
        assert_eq!(map.get("x"), Some(&strings(&["1", "2", "3"])));

        assert!(UpdateOperation::AppendWithDuplication.apply(&mut map, "x", &strings(&["1"]), None, 0));
        assert_eq!(map.get("x"), Some(&strings(&["1", "2", "3", "1"])));
    }

    #[test]
    fn substitute_fails_when_old_value_is_missing() {
        let mut map = ValuesMap::with_field("age", strings(&["30"]));
        assert!(!UpdateOperation::Substitute.apply(&mut map, "age", &strings(&["31"]), Some(&strings(&["29"])), 0));
        assert_eq!(map.get("age"), Some(&strings(&["30"])));

        assert!(UpdateOperation::Substitute.apply(&mut map, "age", &strings(&["31"]), Some(&strings(&["30"])), 0));
        assert_eq!(map.get("age"), Some(&strings(&["31"])));
    }

    #[test]
    fn null_field_handling() {
        let mut map = ValuesMap::with_field("x", strings(&["a"]));
        assert!(UpdateOperation::SetFieldNull.apply(&mut map, "x", &[], None, 0));
        assert!(!UpdateOperation::SetFieldNull.apply(&mut map, "x", &[], None, 0));
        assert!(!UpdateOperation::Remove.apply(&mut map, "x", &strings(&["a"]), None, 0));

        let mut map = ValuesMap::with_field("x", strings(&[NULL_VALUE]));
        assert!(UpdateOperation::Append.apply(&mut map, "x", &strings(&["b"]), None, 0));
        assert_eq!(map.get("x"), Some(&strings(&["b"])));
    }

    #[test]
    fn remove_field_and_set_by_index() {
        let mut map = ValuesMap::with_field("x", strings(&["a", "b", "c"]));
        assert!(UpdateOperation::Set.apply(&mut map, "x", &strings(&["z"]), None, 1));
        assert_eq!(map.get("x"), Some(&strings(&["a", "z", "c"])));

        assert!(!UpdateOperation::Set.apply(&mut map, "x", &strings(&["q"]), None, 3));
        assert!(!UpdateOperation::Set.apply(&mut map, "x", &[], None, 0));
        assert!(!UpdateOperation::Set.apply(&mut map, "missing", &strings(&["q"]), None, 0));
        assert_eq!(map.get("x"), Some(&strings(&["a", "z", "c"])));
        assert!(!map.contains("missing"));

        assert!(UpdateOperation::RemoveField.apply(&mut map, "x", &[], None, 0));
        assert!(!map.contains("x"));
        assert!(!UpdateOperation::RemoveField.apply(&mut map, "x", &[], None, 0));
    }

    #[test]
    fn upsert_equivalents() {
        assert!(UpdateOperation::AppendOrCreate.is_upsert());
        assert_eq!(UpdateOperation::AppendOrCreate.non_upsert_equivalent(), UpdateOperation::Append);
        assert_eq!(UpdateOperation::ReplaceAllOrCreate.non_upsert_equivalent(), UpdateOperation::ReplaceAll);
        assert!(!UpdateOperation::Substitute.is_upsert());
        assert_eq!(UpdateOperation::Clear.non_upsert_equivalent(), UpdateOperation::Clear);
    }
}
