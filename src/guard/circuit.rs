use anyhow::Result;
use tracing::warn;

use crate::config::CircuitBreakerSection;
use crate::store::DbHandle;

/// A tripped breaker: `hits` retry markers among the last `window` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitTrip {
    pub hits: usize,
    pub window: usize,
}

/// Feature-wide abort trigger fed by recent status messages.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    window: usize,
    threshold: usize,
    marker: String,
}

impl CircuitBreaker {
    pub fn new(window: usize, threshold: usize, marker: impl Into<String>) -> Self {
        Self {
            window,
            threshold,
            marker: marker.into(),
        }
    }

    pub fn from_config(config: &CircuitBreakerSection) -> Self {
        Self::new(config.window, config.threshold, config.marker.clone())
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Prefix `text` with the retry marker.
    pub fn retry_message(&self, text: &str) -> String {
        format!("{} {}", self.marker, text)
    }

    /// Inspect messages ordered newest first; only the first `window` count.
    pub fn evaluate<S: AsRef<str>>(&self, newest_first: &[S]) -> Option<CircuitTrip> {
        if self.threshold == 0 || self.marker.is_empty() {
            return None;
        }
        let hits = newest_first
            .iter()
            .take(self.window)
            .filter(|m| m.as_ref().contains(&self.marker))
            .count();
        (hits >= self.threshold).then_some(CircuitTrip {
            hits,
            window: self.window,
        })
    }

    /// Load the feature's recent messages and evaluate them.
    pub async fn check(&self, db: &DbHandle, feature_id: &str) -> Result<Option<CircuitTrip>> {
        let id = feature_id.to_string();
        let window = self.window;
        let messages = db
            .call(move |db| db.recent_status_messages(&id, window))
            .await?;
        let trip = self.evaluate(&messages);
        if let Some(trip) = trip {
            warn!(feature_id, hits = trip.hits, window = trip.window, "Circuit breaker tripped");
        }
        Ok(trip)
    }
}
