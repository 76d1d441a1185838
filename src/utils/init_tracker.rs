//! Tracks objects that asked the core for their initial state.
//!
//! During session start the client requests a burst of objects at once. The
//! tracker reports the moment the last of those has received its InitData so
//! callers can tell "still loading" apart from "ready".

use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

type ObjectKey = (String, String);

#[derive(Debug)]
pub struct InitTracker {
    pending: Mutex<HashSet<ObjectKey>>,
    finished: watch::Sender<bool>,
}

impl InitTracker {
    pub fn new() -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            pending: Mutex::new(HashSet::new()),
            finished,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<ObjectKey>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// An InitRequest for `class_name:object_name` went out.
    pub fn requested(&self, class_name: &str, object_name: &str) {
        let mut pending = self.lock();
        if pending.insert((class_name.to_owned(), object_name.to_owned())) {
            trace!(class = class_name, object = object_name, "Awaiting init data");
        }
        self.finished.send_replace(false);
    }

    /// InitData for `class_name:object_name` arrived. Returns true if this was
    /// the last outstanding object.
    pub fn received(&self, class_name: &str, object_name: &str) -> bool {
        let mut pending = self.lock();
        let removed = pending.remove(&(class_name.to_owned(), object_name.to_owned()));
        if removed && pending.is_empty() {
            debug!("All requested objects initialized");
            self.finished.send_replace(true);
            return true;
        }
        false
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Resolve once every requested object has been initialized.
    pub async fn wait_finished(&self) {
        let mut receiver = self.finished.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = receiver.wait_for(|done| *done).await;
    }
}

impl Default for InitTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn finishes_when_the_last_object_arrives() {
        let tracker = InitTracker::new();
        tracker.requested("Network", "1");
        tracker.requested("BufferSyncer", "");
        assert_eq!(tracker.pending(), 2);
        assert!(!tracker.received("Network", "1"));
        assert!(!tracker.received("Network", "1"));
        assert!(tracker.received("BufferSyncer", ""));
        assert!(tracker.is_finished());
    }

    #[test]
    fn unknown_objects_are_ignored() {
        let tracker = InitTracker::new();
        assert!(!tracker.received("Identity", "3"));
        assert!(!tracker.is_finished());
    }

    #[tokio::test]
    async fn waiters_wake_on_completion() {
        let tracker = Arc::new(InitTracker::new());
        tracker.requested("Network", "1");
        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_finished().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        tracker.received("Network", "1");
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter).await.is_ok());
    }
}
