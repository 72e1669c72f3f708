//! Protolab Events
//!
//! Append-only audit trail. Every state-changing engine operation records one
//! event describing what happened; the trail is for display and tests only and
//! is never read back by protocol logic.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Event
// =============================================================================

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub timestamp: u64,
    pub kind: String,
    pub description: String,
    pub data: Value,
}

// =============================================================================
// Event Log
// =============================================================================

/// Ordered collection of audit entries.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<Event>,
    next_id: u64,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and mirror it to the tracing subscriber.
    pub fn record(
        &mut self,
        timestamp: u64,
        kind: &str,
        description: impl Into<String>,
        data: Value,
    ) -> u64 {
        self.next_id += 1;
        let description = description.into();
        tracing::debug!(event = kind, id = self.next_id, "{}", description);
        self.events.push(Event {
            id: self.next_id,
            timestamp,
            kind: kind.to_string(),
            description,
            data,
        });
        self.next_id
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn last(&self) -> Option<&Event> {
        self.events.last()
    }

    /// Entries with the given kind, oldest first.
    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Event> + 'a {
        self.events.iter().filter(move |e| e.kind == kind)
    }

    pub fn count_of(&self, kind: &str) -> usize {
        self.of_kind(kind).count()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.next_id = 0;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_and_filter() {
        let mut log = EventLog::new();
        assert_eq!(log.record(5, "election_started", "S0 starts an election", json!({"term": 1})), 1);
        log.record(6, "vote_granted", "S1 votes for S0", json!({}));
        log.record(7, "vote_granted", "S2 votes for S0", json!({}));

        assert_eq!(log.len(), 3);
        assert_eq!(log.count_of("vote_granted"), 2);
        assert_eq!(log.last().unwrap().timestamp, 7);
        assert_eq!(log.events()[0].data["term"], 1);
    }

    #[test]
    fn test_clear_restarts_ids() {
        let mut log = EventLog::new();
        log.record(0, "a", "a", Value::Null);
        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.record(0, "b", "b", Value::Null), 1);
    }
}
