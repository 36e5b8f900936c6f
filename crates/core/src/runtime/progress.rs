//! Progress streaming from workers to observers.
//!
//! Each job gets its own ordered stream of fractional-completion updates,
//! delivered through the job's [`super::host::JobHandle`]. On top of that the
//! host exposes a broadcast channel so a UI can watch every job without
//! holding the individual handles. Both are fire-and-forget: a dropped or
//! coalesced update is not a protocol error.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use super::protocol::JobId;

/// Per-job progress stream endpoints.
pub type ProgressSender = mpsc::UnboundedSender<f64>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<f64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub job_id: JobId,

    /// Percent complete, 0-100. Monotonic in practice but not required to be.
    pub value: f64,

    pub timestamp: i64,
}

/// Broadcast channel carrying progress updates for all jobs of one host.
#[derive(Debug, Clone)]
pub struct ProgressChannel {
    sender: broadcast::Sender<ProgressMessage>,
}

impl ProgressChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send a progress message. Having no subscribers is the normal case.
    pub fn send(&self, message: ProgressMessage) {
        match self.sender.send(message) {
            Ok(subscriber_count) => {
                log::trace!("Progress message sent to {subscriber_count} subscribers");
            }
            Err(_) => {
                log::trace!("No progress subscribers; dropping update");
            }
        }
    }

    /// Get a progress message receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressMessage> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(value: f64) -> ProgressMessage {
        ProgressMessage { job_id: JobId::new(), value, timestamp: chrono::Utc::now().timestamp_millis() }
    }

    #[tokio::test]
    async fn test_subscribers_receive_updates_in_order() {
        let channel = ProgressChannel::new(16);
        let mut rx = channel.subscribe();

        channel.send(msg(10.0));
        channel.send(msg(20.0));
        channel.send(msg(30.0));

        assert_eq!(rx.recv().await.unwrap().value, 10.0);
        assert_eq!(rx.recv().await.unwrap().value, 20.0);
        assert_eq!(rx.recv().await.unwrap().value, 30.0);
    }

    #[tokio::test]
    async fn test_send_without_subscribers_is_not_an_error() {
        let channel = ProgressChannel::new(4);
        channel.send(msg(50.0));
        assert_eq!(channel.subscriber_count(), 0);
    }
}
