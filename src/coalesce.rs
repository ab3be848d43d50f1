//! Per-key request coalescing for cache-miss fetches.
//!
//! The first caller for a key runs the fetch; callers that arrive while it is in
//! flight await the same cell and receive a clone of its result. The entry is
//! dropped once the fetch completes, so a later miss fetches fresh data.

use crate::error::QuotaError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

type Slot<T> = Arc<OnceCell<Result<T, QuotaError>>>;

/// In-flight map keyed by request key.
#[derive(Debug)]
pub struct RequestGroup<T> {
    in_flight: Mutex<HashMap<String, Slot<T>>>,
}

impl<T> Default for RequestGroup<T> {
    fn default() -> Self {
        Self { in_flight: Mutex::new(HashMap::new()) }
    }
}

impl<T: Clone> RequestGroup<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fetch` unless an identical request is already in flight.
    pub async fn run<F, Fut>(&self, key: &str, fetch: F) -> Result<T, QuotaError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, QuotaError>>,
    {
        let slot = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.entry(key.to_string()).or_default().clone()
        };

        let result = slot.get_or_init(fetch).await.clone();

        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight.get(key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
            in_flight.remove(key);
        }
        result
    }

    /// Number of keys currently being fetched.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
