//! Cache of endpoint slices for the peer service.
//!
//! The discovery stream delivers whole slices; the cache keeps the latest
//! copy of each slice keyed by slice name and answers membership queries
//! from consistent snapshots. Re-deliveries with an unchanged generation
//! are dropped before they reach any subscriber.

use std::collections::HashMap;
use std::sync::RwLock;

/// One peer endpoint. The pod name prefix determines the peer's role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub pod_name: String,
    pub addresses: Vec<String>,
}

impl Endpoint {
    pub fn new(pod_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            pod_name: pod_name.into(),
            addresses: vec![address.into()],
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pod_name)
    }
}

#[derive(Debug, Clone)]
pub struct EndpointSlice {
    pub name: String,
    pub generation: i64,
    pub endpoints: Vec<Endpoint>,
}

/// A discovery event for the peer service.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// A slice was added or updated.
    Applied(EndpointSlice),
    /// A slice was deleted.
    Removed(String),
}

#[derive(Debug, Default)]
pub struct SliceCache {
    slices: RwLock<HashMap<String, EndpointSlice>>,
}

impl SliceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a slice. Returns false when the stored generation
    /// already matches, which callers must treat as a no-op.
    pub fn apply(&self, slice: EndpointSlice) -> bool {
        let mut slices = self.slices.write().unwrap();
        if let Some(existing) = slices.get(&slice.name) {
            if existing.generation == slice.generation {
                return false;
            }
        }
        tracing::debug!(slice = %slice.name, generation = slice.generation, "endpoint slice applied");
        slices.insert(slice.name.clone(), slice);
        true
    }

    /// Remove a slice. Returns false when it was not present.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.slices.write().unwrap().remove(name).is_some();
        if removed {
            tracing::debug!(slice = name, "endpoint slice removed");
        }
        removed
    }

    pub fn member_count(&self) -> usize {
        self.slices
            .read()
            .unwrap()
            .values()
            .map(|slice| slice.endpoints.len())
            .sum()
    }

    /// All endpoints across the cached slices, in no particular order.
    pub fn members(&self) -> Vec<Endpoint> {
        self.slices
            .read()
            .unwrap()
            .values()
            .flat_map(|slice| slice.endpoints.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(name: &str, generation: i64, pods: &[&str]) -> EndpointSlice {
        EndpointSlice {
            name: name.to_string(),
            generation,
            endpoints: pods
                .iter()
                .map(|p| Endpoint::new(*p, format!("10.0.0.{}", p.len())))
                .collect(),
        }
    }

    #[test]
    fn apply_and_remove() {
        let cache = SliceCache::new();
        assert!(cache.apply(slice("a", 1, &["p1", "p2"])));
        assert!(cache.apply(slice("b", 1, &["p3"])));
        assert_eq!(cache.member_count(), 3);

        assert!(cache.remove("a"));
        assert_eq!(cache.member_count(), 1);
        assert!(!cache.remove("a"));
    }

    #[test]
    fn unchanged_generation_is_ignored() {
        let cache = SliceCache::new();
        assert!(cache.apply(slice("a", 1, &["p1"])));
        assert!(!cache.apply(slice("a", 1, &["p1", "p2"])));
        assert_eq!(cache.member_count(), 1);

        assert!(cache.apply(slice("a", 2, &["p1", "p2"])));
        assert_eq!(cache.member_count(), 2);
    }
}
