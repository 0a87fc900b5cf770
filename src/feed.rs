//! Live upload status feed.
//!
//! Every upload write is fanned out to the current subscribers over unbounded
//! channels. Subscribers only see writes made after they attach; a subscriber
//! whose receiver is gone is dropped on the next publish.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::store::Upload;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFilter {
    pub user_id: String,
    pub submission_id: Option<Uuid>,
}

impl FeedFilter {
    pub fn user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            submission_id: None,
        }
    }

    pub fn with_submission(mut self, submission_id: Uuid) -> Self {
        self.submission_id = Some(submission_id);
        self
    }

    pub fn matches(&self, upload: &Upload) -> bool {
        upload.user_id == self.user_id
            && self
                .submission_id
                .map(|id| id == upload.submission_id)
                .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChangeFeed {
    subscribers: Arc<Mutex<Vec<Sender<Upload>>>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, upload: &Upload) {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|sender| sender.send(upload.clone()).is_ok());
        let dropped = before - subscribers.len();
        if dropped > 0 {
            tracing::debug!(dropped, "removed disconnected feed subscribers");
        }
    }

    pub fn subscribe(&self, filter: FeedFilter) -> UploadFeed {
        let (sender, receiver) = mpsc::channel();
        self.lock().push(sender);
        UploadFeed { receiver, filter }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Sender<Upload>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A subscriber's view of the feed, restricted to one user and optionally
/// one submission.
pub struct UploadFeed {
    receiver: Receiver<Upload>,
    filter: FeedFilter,
}

impl UploadFeed {
    pub fn filter(&self) -> &FeedFilter {
        &self.filter
    }

    /// Next matching event, or `None` once `timeout` has elapsed.
    pub fn next_timeout(&self, timeout: Duration) -> Option<Upload> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(upload) if self.filter.matches(&upload) => return Some(upload),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

impl Iterator for UploadFeed {
    type Item = Upload;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver
            .iter()
            .find(|upload| self.filter.matches(upload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UploadStatus;

    fn upload(user_id: &str, submission_id: Uuid) -> Upload {
        Upload::queued(
            submission_id,
            user_id,
            "S1",
            "sam1",
            Default::default(),
        )
    }

    #[test]
    fn filters_by_user_and_submission() {
        let feed = ChangeFeed::new();
        let wanted = Uuid::new_v4();
        let subscriber = feed.subscribe(FeedFilter::user("alice").with_submission(wanted));

        feed.publish(&upload("bob", wanted));
        feed.publish(&upload("alice", Uuid::new_v4()));
        let mut expected = upload("alice", wanted);
        expected.status = UploadStatus::Processing;
        feed.publish(&expected);

        let received = subscriber.next_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received.upload_id, expected.upload_id);
        assert!(subscriber.next_timeout(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn does_not_replay_history() {
        let feed = ChangeFeed::new();
        let submission_id = Uuid::new_v4();
        feed.publish(&upload("alice", submission_id));
        let subscriber = feed.subscribe(FeedFilter::user("alice"));
        assert!(subscriber.next_timeout(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn drops_disconnected_subscribers() {
        let feed = ChangeFeed::new();
        let subscriber = feed.subscribe(FeedFilter::user("alice"));
        assert_eq!(feed.subscriber_count(), 1);
        drop(subscriber);
        feed.publish(&upload("alice", Uuid::new_v4()));
        assert_eq!(feed.subscriber_count(), 0);
    }
}
