//! Bounded FIFO ring of recently published envelopes, kept as a debugging
//! aid. Oldest entries are evicted first.

use std::collections::VecDeque;

use crate::envelope::Envelope;

/// FIFO ring of the last `max_size` published envelopes.
#[derive(Debug)]
pub struct EventHistory {
    max_size: usize,
    ring: VecDeque<Envelope>,
}

impl EventHistory {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ring: VecDeque::with_capacity(max_size),
        }
    }

    /// Records an envelope, evicting the oldest entry at capacity.
    pub fn push(&mut self, envelope: Envelope) {
        if self.max_size == 0 {
            return;
        }
        if self.ring.len() >= self.max_size {
            self.ring.pop_front();
        }
        self.ring.push_back(envelope);
    }

    /// Returns the retained envelopes, oldest first.
    pub fn recent(&self) -> Vec<Envelope> {
        self.ring.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn envelope(tag: &str) -> Envelope {
        Envelope::new(tag, Map::new(), "test", None)
    }

    #[test]
    fn bounded_at_max_size_keeping_most_recent() {
        let max = 5;
        let mut history = EventHistory::new(max);

        for i in 0..max + 3 {
            history.push(envelope(&format!("event:{i}")));
        }

        assert_eq!(history.len(), max);
        let recent = history.recent();
        // oldest-first order, containing only the most recent entries
        let types: Vec<&str> = recent.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["event:3", "event:4", "event:5", "event:6", "event:7"]
        );
    }

    #[test]
    fn empty_until_first_push() {
        let mut history = EventHistory::new(3);
        assert!(history.is_empty());
        history.push(envelope("a"));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let mut history = EventHistory::new(0);
        history.push(envelope("a"));
        assert!(history.is_empty());
    }
}
