//! Execution events
//!
//! Sub-transactions emit typed events while they run. Events produced on a
//! chain's own path are re-emitted on the parent execution context, and are
//! carried inside `ExecTxResult` so the other participant sees them too.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttribute {
    pub key: String,
    pub value: String,
    pub index: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub ty: String,
    pub attributes: Vec<EventAttribute>,
}

impl Event {
    pub fn new(ty: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(EventAttribute {
            key: key.into(),
            value: value.into(),
            index: true,
        });
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }
}

/// Shared event sink of one execution context
#[derive(Debug, Clone, Default)]
pub struct EventManager {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = Event>) {
        self.events.lock().extend(events);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Take all events, leaving the sink empty
    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_sink() {
        let manager = EventManager::new();
        let clone = manager.clone();
        clone.emit(Event::new("transfer").with_attribute("amount", "10"));
        manager.emit_all(vec![Event::new("debit")]);

        assert_eq!(manager.len(), 2);
        assert_eq!(manager.events()[0].attribute("amount"), Some("10"));
        assert_eq!(clone.drain().len(), 2);
        assert!(manager.is_empty());
    }
}
