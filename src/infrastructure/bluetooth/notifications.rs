//! Notification fan-out channel.
//!
//! Every session publishes decoded notifications into one shared sender; a
//! single consumer drains them. Publishing never blocks a session: a full
//! bounded channel drops the value and a detached consumer is ignored.

use crate::domain::models::ReceivedNotification;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

#[derive(Debug, Clone)]
pub enum NotificationSender {
    Unbounded(mpsc::UnboundedSender<ReceivedNotification>),
    Bounded(mpsc::Sender<ReceivedNotification>),
}

#[derive(Debug)]
pub enum NotificationReceiver {
    Unbounded(mpsc::UnboundedReceiver<ReceivedNotification>),
    Bounded(mpsc::Receiver<ReceivedNotification>),
}

/// Create the channel. `None` keeps it unbounded so no reading is lost.
pub fn notification_channel(capacity: Option<usize>) -> (NotificationSender, NotificationReceiver) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (
                NotificationSender::Bounded(tx),
                NotificationReceiver::Bounded(rx),
            )
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                NotificationSender::Unbounded(tx),
                NotificationReceiver::Unbounded(rx),
            )
        }
    }
}

impl NotificationSender {
    /// Hand a notification to the consumer. Returns whether it was accepted.
    pub fn publish(&self, notification: ReceivedNotification) -> bool {
        match self {
            Self::Unbounded(tx) => match tx.send(notification) {
                Ok(()) => true,
                Err(_) => {
                    trace!("No notification consumer attached, dropping value");
                    false
                }
            },
            Self::Bounded(tx) => match tx.try_send(notification) {
                Ok(()) => true,
                Err(TrySendError::Full(dropped)) => {
                    warn!(
                        device = %dropped.device,
                        "Notification channel full, dropping value"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    trace!("No notification consumer attached, dropping value");
                    false
                }
            },
        }
    }
}

impl NotificationReceiver {
    pub async fn recv(&mut self) -> Option<ReceivedNotification> {
        match self {
            Self::Unbounded(rx) => rx.recv().await,
            Self::Bounded(rx) => rx.recv().await,
        }
    }

    /// Blocking receive for consumers living outside the runtime.
    pub fn blocking_recv(&mut self) -> Option<ReceivedNotification> {
        match self {
            Self::Unbounded(rx) => rx.blocking_recv(),
            Self::Bounded(rx) => rx.blocking_recv(),
        }
    }

    pub fn try_recv(&mut self) -> Option<ReceivedNotification> {
        match self {
            Self::Unbounded(rx) => rx.try_recv().ok(),
            Self::Bounded(rx) => rx.try_recv().ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DeviceIdentity, IncomingNotification, NotificationPayload};
    use crate::domain::pins::Pin;

    fn reading(device: &str, value: f32) -> ReceivedNotification {
        ReceivedNotification {
            device: DeviceIdentity::new(device),
            notification: IncomingNotification {
                origin: 1,
                payload: NotificationPayload::PinReading {
                    pin: Pin::G0,
                    value,
                },
            },
        }
    }

    fn value(n: &ReceivedNotification) -> f32 {
        match n.notification.payload {
            NotificationPayload::PinReading { value, .. } => value,
        }
    }

    #[tokio::test]
    async fn test_unbounded_preserves_order_per_device() {
        let (tx, mut rx) = notification_channel(None);
        for i in 0..100 {
            assert!(tx.publish(reading("D1", i as f32)));
        }
        for i in 0..100 {
            assert_eq!(value(&rx.recv().await.unwrap()), i as f32);
        }
    }

    #[tokio::test]
    async fn test_bounded_drops_when_full() {
        let (tx, mut rx) = notification_channel(Some(2));
        assert!(tx.publish(reading("D1", 1.0)));
        assert!(tx.publish(reading("D1", 2.0)));
        assert!(!tx.publish(reading("D1", 3.0)));

        assert_eq!(value(&rx.recv().await.unwrap()), 1.0);
        assert_eq!(value(&rx.recv().await.unwrap()), 2.0);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_detached_consumer_fails_silently() {
        for capacity in [None, Some(4)] {
            let (tx, rx) = notification_channel(capacity);
            drop(rx);
            assert!(!tx.publish(reading("D1", 1.0)));
        }
    }
}
