//! Object-type hierarchy with ancestor cost lookup.
//!
//! Reference databases classify objects with hierarchical type codes
//! (SIMBAD-style: `Sy1` is an `AGN` is a `G`). Users list costs for the
//! types they care about; a type without an explicit cost inherits the cost
//! of its **nearest listed ancestor** in the type DAG, found by breadth-first
//! search over the parent links. Ancestors at the same depth are resolved to
//! the lowest cost so the lookup stays deterministic.

use std::collections::BTreeMap;

use ahash::AHashSet;

use crate::constants::ObjectType;

/// Directed acyclic graph of object types (type → parent types).
#[derive(Debug, Clone, Default)]
pub struct TypeHierarchy {
    parents: BTreeMap<ObjectType, Vec<ObjectType>>,
}

impl TypeHierarchy {
    pub fn new(parents: BTreeMap<ObjectType, Vec<ObjectType>>) -> Self {
        TypeHierarchy { parents }
    }

    /// Cost of a type: its own entry, else the entry of the nearest listed
    /// ancestor, else `default_cost`.
    pub fn cost_of(
        &self,
        object_type: &str,
        costs: &BTreeMap<ObjectType, f64>,
        default_cost: f64,
    ) -> f64 {
        if let Some(cost) = costs.get(object_type) {
            return *cost;
        }

        let mut visited: AHashSet<&str> = AHashSet::new();
        visited.insert(object_type);
        let mut frontier: Vec<&str> = vec![object_type];

        while !frontier.is_empty() {
            let mut next: Vec<&str> = Vec::new();
            let mut best_at_level: Option<f64> = None;
            for current in frontier {
                for parent in self.parents.get(current).into_iter().flatten() {
                    if !visited.insert(parent.as_str()) {
                        continue;
                    }
                    if let Some(cost) = costs.get(parent) {
                        best_at_level =
                            Some(best_at_level.map_or(*cost, |b: f64| b.min(*cost)));
                    }
                    next.push(parent.as_str());
                }
            }
            if let Some(cost) = best_at_level {
                return cost;
            }
            frontier = next;
        }
        default_cost
    }
}
