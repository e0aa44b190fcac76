//! Pending-evaluation queue.
//!
//! FIFO of classifier names awaiting evaluation. Watch callbacks push under
//! the queue mutex only; the scheduler drains one tick's worth at a time,
//! coalescing duplicates so a name queued many times in one interval is
//! evaluated once.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Default)]
pub struct JobQueue {
    jobs: Mutex<Vec<String>>,
}

impl JobQueue {
    /// Queue a classifier for evaluation on the next tick.
    pub fn push(&self, name: &str) {
        self.jobs.lock().unwrap().push(name.to_string());
    }

    /// Take everything queued so far, in first-occurrence order, duplicates
    /// dropped.
    pub fn drain(&self) -> Vec<String> {
        let drained = std::mem::take(&mut *self.jobs.lock().unwrap());

        let mut seen = HashSet::new();
        drained
            .into_iter()
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_first_occurrence_order() {
        let queue = JobQueue::default();
        queue.push("b");
        queue.push("a");
        queue.push("c");

        assert_eq!(queue.drain(), vec!["b", "a", "c"]);
    }

    #[test]
    fn drain_coalesces_duplicates() {
        let queue = JobQueue::default();
        queue.push("a");
        queue.push("b");
        queue.push("a");
        queue.push("a");
        queue.push("b");

        assert_eq!(queue.drain(), vec!["a", "b"]);
    }

    #[test]
    fn drain_empties_the_queue() {
        let queue = JobQueue::default();
        queue.push("a");

        assert_eq!(queue.drain(), vec!["a"]);
        assert!(queue.drain().is_empty());
    }
}
