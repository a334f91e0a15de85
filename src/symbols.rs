//! State-vector layout.
//!
//! A [`StateVectorMapping`] assigns every unknown a half-open range of the
//! flat state vector. Ranges are handed out in registration order and are
//! contiguous, so together they cover `[0, len)` exactly once.
//!
//! # Example
//!
//! ```
//! use symdae::symbols::StateVectorMapping;
//!
//! let mut mapping = StateVectorMapping::new();
//! mapping.register("c", 10).unwrap();
//! mapping.register("T", 1).unwrap();
//!
//! assert_eq!(mapping.slice_of("T"), Some(10..11));
//! assert_eq!(mapping.unknown_at(3), Some("c"));
//! assert_eq!(mapping.len(), 11);
//! ```

use std::collections::HashMap;
use std::ops::Range;

/// Errors raised while laying out the state vector.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SymbolError {
    /// The same unknown was registered twice with different sizes
    #[error("Unknown '{name}' is already registered with size {existing}, cannot register it with size {requested}")]
    DuplicateSymbol {
        /// Unknown name
        name: String,
        /// Size of the existing registration
        existing: usize,
        /// Size of the rejected registration
        requested: usize,
    },
    /// Unknowns must occupy at least one entry
    #[error("Unknown '{0}' cannot have size zero")]
    EmptySymbol(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Slot {
    name: String,
    range: Range<usize>,
}

/// Ordered assignment of unknowns to ranges of the flat state vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateVectorMapping {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
}

impl StateVectorMapping {
    /// Creates an empty mapping.
    pub fn new() -> Self {
        StateVectorMapping { slots: Vec::new(), index: HashMap::new() }
    }

    /// Registers `name` with `size` entries and returns its range.
    ///
    /// Registering the same name again with the same size returns the
    /// existing range unchanged.
    pub fn register(&mut self, name: &str, size: usize) -> Result<Range<usize>, SymbolError> {
        if size == 0 {
            return Err(SymbolError::EmptySymbol(name.to_string()));
        }
        if let Some(&i) = self.index.get(name) {
            let existing = &self.slots[i].range;
            if existing.len() != size {
                return Err(SymbolError::DuplicateSymbol {
                    name: name.to_string(),
                    existing: existing.len(),
                    requested: size,
                });
            }
            return Ok(existing.clone());
        }
        let start = self.len();
        let range = start..start + size;
        self.index.insert(name.to_string(), self.slots.len());
        self.slots.push(Slot { name: name.to_string(), range: range.clone() });
        Ok(range)
    }

    /// Range occupied by `name`.
    pub fn slice_of(&self, name: &str) -> Option<Range<usize>> {
        self.index.get(name).map(|&i| self.slots[i].range.clone())
    }

    /// Unknown owning entry `index` of the state vector.
    pub fn unknown_at(&self, index: usize) -> Option<&str> {
        // Slots are sorted by start, so the owner is the last slot starting at or before index
        let pos = self.slots.partition_point(|s| s.range.start <= index);
        if pos == 0 {
            return None;
        }
        let slot = &self.slots[pos - 1];
        slot.range.contains(&index).then_some(slot.name.as_str())
    }

    /// Total length of the state vector.
    pub fn len(&self) -> usize {
        self.slots.last().map_or(0, |s| s.range.end)
    }

    /// Returns true if nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns true if `name` has been registered.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Iterates over `(name, range)` pairs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Range<usize>)> {
        self.slots.iter().map(|s| (s.name.as_str(), s.range.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_are_contiguous_in_registration_order() {
        let mut mapping = StateVectorMapping::new();
        assert_eq!(mapping.register("a", 3).unwrap(), 0..3);
        assert_eq!(mapping.register("b", 1).unwrap(), 3..4);
        assert_eq!(mapping.register("c", 5).unwrap(), 4..9);
        assert_eq!(mapping.len(), 9);

        // Every index is owned by exactly one unknown
        let owners: Vec<&str> = (0..9).filter_map(|i| mapping.unknown_at(i)).collect();
        assert_eq!(owners, vec!["a", "a", "a", "b", "c", "c", "c", "c", "c"]);
        assert_eq!(mapping.unknown_at(9), None);
    }

    #[test]
    fn test_registration_is_deterministic() {
        let build = || {
            let mut m = StateVectorMapping::new();
            for (name, size) in [("x", 2), ("y", 4), ("z", 1)] {
                m.register(name, size).unwrap();
            }
            m
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_duplicate_symbol() {
        let mut mapping = StateVectorMapping::new();
        mapping.register("x", 2).unwrap();
        assert_eq!(mapping.register("x", 2).unwrap(), 0..2);
        assert_eq!(
            mapping.register("x", 3),
            Err(SymbolError::DuplicateSymbol { name: "x".to_string(), existing: 2, requested: 3 })
        );
        assert_eq!(mapping.len(), 2);
    }

    #[test]
    fn test_empty_symbol() {
        let mut mapping = StateVectorMapping::new();
        assert!(matches!(mapping.register("x", 0), Err(SymbolError::EmptySymbol(_))));
        assert!(mapping.is_empty());
    }
}
