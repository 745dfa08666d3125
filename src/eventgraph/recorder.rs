use super::{EventStore, NewEvent};
use crate::health::{self, Component};
use serde_json::Value;
use std::sync::Arc;

/// Fire-and-forget event emission for components whose own work must not
/// fail because the log is unavailable.
#[derive(Clone)]
pub struct Recorder {
    store: Arc<dyn EventStore>,
    source: String,
}

impl Recorder {
    pub fn new(store: Arc<dyn EventStore>, source: impl Into<String>) -> Self {
        Self {
            store,
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Append an event and return its id, or `None` when the append failed.
    pub async fn emit(&self, event_type: &str, content: Value, causes: &[String]) -> Option<String> {
        let event = NewEvent::new(event_type, self.source.as_str(), content)
            .caused_by(causes.iter().cloned());
        match self.store.append(event).await {
            Ok(stored) => {
                tracing::debug!(event_type, id = %stored.id, "event recorded");
                Some(stored.id)
            }
            Err(error) => {
                tracing::warn!(event_type, %error, "failed to record event");
                health::mark_error(Component::EventLog, &error);
                None
            }
        }
    }
}
