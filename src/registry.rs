//! Method registry: shared record of the numerical methods a pipeline used.
//!
//! The registry is passed explicitly to the [`Discretiser`](crate::discretisation::Discretiser)
//! and to the [`Dispatcher`](crate::solvers::Dispatcher). Clones share the same
//! underlying record, so a caller can hand out copies and read the combined
//! result afterwards.
//!
//! # Example
//!
//! ```
//! use symdae::registry::MethodRegistry;
//!
//! let registry = MethodRegistry::new();
//! let shared = registry.clone();
//! shared.register("finite volume");
//!
//! assert!(registry.contains("finite volume"));
//! ```

use std::cell::RefCell;
use std::rc::Rc;

/// Shared, insertion-ordered set of method names.
#[derive(Debug, Clone)]
pub struct MethodRegistry {
    entries: Rc<RefCell<Vec<String>>>,
}

impl MethodRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        MethodRegistry { entries: Rc::new(RefCell::new(Vec::new())) }
    }

    /// Records `method`. Repeated registrations are ignored.
    pub fn register(&self, method: &str) {
        let mut entries = self.entries.borrow_mut();
        if !entries.iter().any(|e| e == method) {
            log::debug!("Registered numerical method '{}'", method);
            entries.push(method.to_string());
        }
    }

    /// Returns true if `method` has been recorded.
    pub fn contains(&self, method: &str) -> bool {
        self.entries.borrow().iter().any(|e| e == method)
    }

    /// Snapshot of all recorded methods, in first-use order.
    pub fn entries(&self) -> Vec<String> {
        self.entries.borrow().clone()
    }

    /// Number of recorded methods.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Forgets every recorded method.
    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let registry = MethodRegistry::new();
        let other = registry.clone();
        other.register("Newton-Raphson");
        other.register("Newton-Raphson");
        registry.register("Dormand-Prince 5(4)");

        assert_eq!(registry.len(), 2);
        assert_eq!(
            other.entries(),
            vec!["Newton-Raphson".to_string(), "Dormand-Prince 5(4)".to_string()]
        );
    }

    #[test]
    fn test_independent_registries() {
        let a = MethodRegistry::new();
        let b = MethodRegistry::new();
        a.register("finite volume");
        assert!(a.contains("finite volume"));
        assert!(!b.contains("finite volume"));
        assert!(b.is_empty());

        a.clear();
        assert!(a.is_empty());
    }
}
