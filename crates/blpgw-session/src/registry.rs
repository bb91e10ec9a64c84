//! Explicit (event name, correlation id) → handler table.

use std::collections::BTreeMap;
use std::ops::Bound;

use blpgw_core::CorrelationId;

/// Routes events to exactly one handler per (event name, correlation id).
///
/// Keys are ordered by id first, so every route for one id is a contiguous
/// range and can be released together.
#[derive(Debug)]
pub struct CorrelationRegistry<H> {
    routes: BTreeMap<(CorrelationId, String), H>,
}

impl<H> Default for CorrelationRegistry<H> {
    fn default() -> Self {
        Self {
            routes: BTreeMap::new(),
        }
    }
}

impl<H> CorrelationRegistry<H> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to (`event`, `id`). Returns `false` and leaves the
    /// existing route untouched if one is already bound.
    #[must_use]
    pub fn register(&mut self, event: &str, id: CorrelationId, handler: H) -> bool {
        let key = (id, event.to_string());
        if self.routes.contains_key(&key) {
            return false;
        }
        let _ = self.routes.insert(key, handler);
        true
    }

    /// Handler bound to (`event`, `id`).
    pub fn get(&self, event: &str, id: CorrelationId) -> Option<&H> {
        self.routes.get(&(id, event.to_string()))
    }

    /// Unbind one route.
    pub fn remove(&mut self, event: &str, id: CorrelationId) -> Option<H> {
        self.routes.remove(&(id, event.to_string()))
    }

    /// Unbind every route for `id`.
    pub fn remove_id(&mut self, id: CorrelationId) -> Vec<H> {
        let keys: Vec<_> = self
            .routes
            .range((Bound::Included((id, String::new())), Bound::Unbounded))
            .take_while(|((route_id, _), _)| *route_id == id)
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| self.routes.remove(&key))
            .collect()
    }

    /// Whether any route is bound for `id`.
    pub fn contains_id(&self, id: CorrelationId) -> bool {
        self.routes
            .range((Bound::Included((id, String::new())), Bound::Unbounded))
            .next()
            .is_some_and(|((route_id, _), _)| *route_id == id)
    }

    /// Remove every route.
    pub fn drain(&mut self) -> Vec<(CorrelationId, H)> {
        std::mem::take(&mut self.routes)
            .into_iter()
            .map(|((id, _), handler)| (id, handler))
            .collect()
    }

    /// Number of bound routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are bound.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
