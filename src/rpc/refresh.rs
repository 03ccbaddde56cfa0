//! Sequential refresh of stale buckets.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::common::Id;

use super::iterative_query::QueryKey;

/// Queue of bucket refresh lookups, run one at a time to bound the load.
#[derive(Debug)]
pub struct BucketRefresh {
    interval: Duration,
    last_refresh: Instant,
    queue: VecDeque<(usize, Id)>,
    current: Option<(usize, QueryKey)>,
    running: bool,
}

impl BucketRefresh {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_refresh: Instant::now(),
            queue: VecDeque::new(),
            current: None,
            running: false,
        }
    }

    // === Getters ===

    pub fn is_running(&self) -> bool {
        self.running
    }

    // === Public Methods ===

    /// Returns true if the periodic refresh is due, and resets the timer.
    pub fn is_due(&mut self) -> bool {
        self.is_due_at(Instant::now())
    }

    /// Queue lookups for buckets that are not already queued or in progress.
    pub fn extend(&mut self, targets: Vec<(usize, Id)>) {
        for (index, target) in targets {
            let queued = self.queue.iter().any(|(i, _)| *i == index)
                || self.current.map_or(false, |(i, _)| i == index);

            if !queued {
                self.queue.push_back((index, target));
            }
        }

        self.running = self.running || !self.queue.is_empty() || self.current.is_some();
    }

    /// Next bucket to refresh, if no lookup is in progress.
    pub fn next(&mut self) -> Option<(usize, Id)> {
        if self.current.is_some() {
            return None;
        }

        self.queue.pop_front()
    }

    pub fn set_current(&mut self, index: usize, key: QueryKey) {
        self.current = Some((index, key));
    }

    /// Clear the current lookup if it matches `key`, returns its bucket index.
    pub fn on_query_done(&mut self, key: &QueryKey) -> Option<usize> {
        match self.current {
            Some((index, current)) if &current == key => {
                self.current = None;
                Some(index)
            }
            _ => None,
        }
    }

    /// Returns true exactly once when the queue drained and the last lookup ended.
    pub fn take_finished(&mut self) -> bool {
        if self.running && self.current.is_none() && self.queue.is_empty() {
            self.running = false;
            return true;
        }

        false
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.current = None;
        self.running = false;
    }

    // === Private Methods ===

    fn is_due_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_refresh) >= self.interval {
            self.last_refresh = now;
            return true;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_queue() {
        let mut refresh = BucketRefresh::new(Duration::from_secs(3600));

        assert!(!refresh.take_finished());

        let a = Id::random();
        let b = Id::random();

        refresh.extend(vec![(0, a), (1, b)]);
        // Duplicate indices are ignored.
        refresh.extend(vec![(1, Id::random())]);

        assert!(refresh.is_running());

        assert_eq!(refresh.next(), Some((0, a)));
        refresh.set_current(0, QueryKey::find_node(a));

        // One at a time.
        assert_eq!(refresh.next(), None);
        assert!(!refresh.take_finished());

        assert_eq!(refresh.on_query_done(&QueryKey::find_node(b)), None);
        assert_eq!(refresh.on_query_done(&QueryKey::find_node(a)), Some(0));

        assert_eq!(refresh.next(), Some((1, b)));
        refresh.set_current(1, QueryKey::find_node(b));
        assert_eq!(refresh.on_query_done(&QueryKey::find_node(b)), Some(1));

        assert!(refresh.take_finished());
        assert!(!refresh.take_finished());
    }

    #[test]
    fn periodic() {
        let mut refresh = BucketRefresh::new(Duration::from_secs(60));
        let start = refresh.last_refresh;

        assert!(!refresh.is_due_at(start + Duration::from_secs(59)));
        assert!(refresh.is_due_at(start + Duration::from_secs(60)));
        // Timer was reset.
        assert!(!refresh.is_due_at(start + Duration::from_secs(61)));
    }
}
