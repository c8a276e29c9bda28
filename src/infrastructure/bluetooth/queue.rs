//! Per-session command queue.
//!
//! A single worker task executes batches one at a time and the operations of
//! a batch strictly in order. The first failing operation aborts the rest of
//! its batch. Each session owns its own queue, so queues of different
//! sessions run independently.

use crate::infrastructure::bluetooth::error::{BatchAbort, GattError, GattResult, TransportError};
use crate::infrastructure::bluetooth::transport::{CharacteristicHandle, WriteType};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    NegotiatePayloadSize {
        mtu: u16,
    },
    Write {
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
        write_type: WriteType,
    },
    EnableNotifications {
        characteristic: CharacteristicHandle,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::NegotiatePayloadSize { .. } => OperationKind::NegotiatePayloadSize,
            Self::Write { .. } => OperationKind::Write,
            Self::EnableNotifications { .. } => OperationKind::EnableNotifications,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    NegotiatePayloadSize,
    Write,
    EnableNotifications,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NegotiatePayloadSize => "payload size negotiation",
            Self::Write => "characteristic write",
            Self::EnableNotifications => "notification subscription",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    PayloadSize(usize),
    Written,
    NotificationsEnabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every operation succeeded; outcomes are in submission order.
    Completed(Vec<OperationOutcome>),
    Aborted(BatchAbort),
    /// The queue was shut down before the batch finished.
    Cancelled,
}

impl BatchOutcome {
    pub fn into_result(self) -> GattResult<Vec<OperationOutcome>> {
        match self {
            Self::Completed(outcomes) => Ok(outcomes),
            Self::Aborted(abort) => Err(GattError::BatchAbort(abort)),
            Self::Cancelled => Err(GattError::Cancelled),
        }
    }
}

/// Carries out a single operation against a peripheral.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operation: &Operation) -> Result<OperationOutcome, TransportError>;
}

struct PendingBatch {
    operations: Vec<Operation>,
    reply: oneshot::Sender<BatchOutcome>,
}

/// Resolves once the submitted batch completes, aborts or is cancelled.
#[derive(Debug)]
pub struct BatchHandle {
    reply: oneshot::Receiver<BatchOutcome>,
}

impl BatchHandle {
    pub async fn outcome(self) -> BatchOutcome {
        self.reply.await.unwrap_or(BatchOutcome::Cancelled)
    }
}

pub struct CommandQueue {
    sender: mpsc::UnboundedSender<PendingBatch>,
    worker: JoinHandle<()>,
}

impl CommandQueue {
    /// Start the queue worker on the current runtime.
    pub fn spawn(label: String, executor: Arc<dyn OperationExecutor>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<PendingBatch>();

        let worker = tokio::spawn(async move {
            while let Some(batch) = receiver.recv().await {
                let outcome = run_batch(executor.as_ref(), &batch.operations).await;
                if let BatchOutcome::Aborted(abort) = &outcome {
                    warn!(device = %label, "Batch aborted: {}", abort);
                }
                // The submitter may have stopped waiting.
                let _ = batch.reply.send(outcome);
            }
            debug!(device = %label, "Command queue closed");
        });

        Self { sender, worker }
    }

    /// Queue `operations` to run as one atomic batch.
    pub fn submit_batch(&self, operations: Vec<Operation>) -> BatchHandle {
        let (reply, receiver) = oneshot::channel();
        // A closed queue drops `reply`, which the handle reports as cancelled.
        let _ = self.sender.send(PendingBatch { operations, reply });
        BatchHandle { reply: receiver }
    }

    pub fn submit(&self, operation: Operation) -> BatchHandle {
        self.submit_batch(vec![operation])
    }

    /// Stop the worker, cancelling the in-flight batch and everything queued.
    pub fn cancel(&self) {
        self.worker.abort();
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_batch(executor: &dyn OperationExecutor, operations: &[Operation]) -> BatchOutcome {
    let mut outcomes = Vec::with_capacity(operations.len());

    for (index, operation) in operations.iter().enumerate() {
        match executor.execute(operation).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(error) => {
                return BatchOutcome::Aborted(BatchAbort {
                    index,
                    operation: operation.kind(),
                    error,
                    skipped: operations.len() - index - 1,
                });
            }
        }
    }

    BatchOutcome::Completed(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every executed operation and fails on selected write payloads.
    #[derive(Default)]
    struct RecordingExecutor {
        executed: Mutex<Vec<Operation>>,
        fail_on: Option<Vec<u8>>,
        delay: Option<Duration>,
        hang: bool,
    }

    impl RecordingExecutor {
        fn executed_values(&self) -> Vec<Vec<u8>> {
            self.executed
                .lock()
                .unwrap()
                .iter()
                .filter_map(|op| match op {
                    Operation::Write { value, .. } => Some(value.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl OperationExecutor for RecordingExecutor {
        async fn execute(&self, operation: &Operation) -> Result<OperationOutcome, TransportError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.executed.lock().unwrap().push(operation.clone());
            match operation {
                Operation::Write { value, .. } if Some(value) == self.fail_on.as_ref() => {
                    Err(TransportError::Status { status: 133 })
                }
                Operation::Write { .. } => Ok(OperationOutcome::Written),
                Operation::NegotiatePayloadSize { mtu } => {
                    Ok(OperationOutcome::PayloadSize(*mtu as usize - 3))
                }
                Operation::EnableNotifications { .. } => Ok(OperationOutcome::NotificationsEnabled),
            }
        }
    }

    fn write(tag: u8) -> Operation {
        Operation::Write {
            characteristic: CharacteristicHandle {
                service_uuid: "svc".into(),
                uuid: "cmd".into(),
            },
            value: vec![tag],
            write_type: WriteType::WithResponse,
        }
    }

    #[tokio::test]
    async fn test_batch_completes_in_order() {
        let executor = Arc::new(RecordingExecutor::default());
        let queue = CommandQueue::spawn("test".into(), executor.clone());

        let outcome = queue
            .submit_batch(vec![
                Operation::NegotiatePayloadSize { mtu: 517 },
                write(1),
                write(2),
            ])
            .outcome()
            .await;

        assert_eq!(
            outcome,
            BatchOutcome::Completed(vec![
                OperationOutcome::PayloadSize(514),
                OperationOutcome::Written,
                OperationOutcome::Written,
            ])
        );
        assert_eq!(executor.executed_values(), vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn test_failure_skips_remaining_operations() {
        let executor = Arc::new(RecordingExecutor {
            fail_on: Some(vec![b'B']),
            ..Default::default()
        });
        let queue = CommandQueue::spawn("test".into(), executor.clone());

        let outcome = queue
            .submit_batch(vec![write(b'A'), write(b'B'), write(b'C')])
            .outcome()
            .await;

        assert_eq!(
            outcome,
            BatchOutcome::Aborted(BatchAbort {
                index: 1,
                operation: OperationKind::Write,
                error: TransportError::Status { status: 133 },
                skipped: 1,
            })
        );
        // A executed, B attempted, C never issued
        assert_eq!(executor.executed_values(), vec![vec![b'A'], vec![b'B']]);
    }

    #[tokio::test]
    async fn test_aborted_batch_does_not_affect_next_batch() {
        let executor = Arc::new(RecordingExecutor {
            fail_on: Some(vec![b'B']),
            ..Default::default()
        });
        let queue = CommandQueue::spawn("test".into(), executor.clone());

        let first = queue.submit_batch(vec![write(b'B'), write(b'X')]);
        let second = queue.submit(write(b'D'));

        assert!(matches!(first.outcome().await, BatchOutcome::Aborted(_)));
        assert_eq!(
            second.outcome().await,
            BatchOutcome::Completed(vec![OperationOutcome::Written])
        );
        assert_eq!(executor.executed_values(), vec![vec![b'B'], vec![b'D']]);
    }

    #[tokio::test]
    async fn test_batches_never_interleave() {
        let executor = Arc::new(RecordingExecutor {
            delay: Some(Duration::from_millis(5)),
            ..Default::default()
        });
        let queue = CommandQueue::spawn("test".into(), executor.clone());

        let first = queue.submit_batch(vec![write(1), write(2), write(3)]);
        let second = queue.submit_batch(vec![write(4), write(5)]);
        let (a, b) = tokio::join!(first.outcome(), second.outcome());

        assert!(matches!(a, BatchOutcome::Completed(_)));
        assert!(matches!(b, BatchOutcome::Completed(_)));
        assert_eq!(
            executor.executed_values(),
            vec![vec![1], vec![2], vec![3], vec![4], vec![5]]
        );
    }

    #[tokio::test]
    async fn test_cancel_resolves_pending_batches() {
        let executor = Arc::new(RecordingExecutor {
            hang: true,
            ..Default::default()
        });
        let queue = CommandQueue::spawn("test".into(), executor.clone());

        let in_flight = queue.submit(write(1));
        let queued = queue.submit(write(2));
        tokio::task::yield_now().await;
        queue.cancel();

        assert_eq!(in_flight.outcome().await, BatchOutcome::Cancelled);
        assert_eq!(queued.outcome().await, BatchOutcome::Cancelled);
        assert!(executor.executed_values().is_empty());
    }

    #[test]
    fn test_outcome_into_result() {
        assert!(BatchOutcome::Completed(vec![]).into_result().is_ok());
        assert_eq!(
            BatchOutcome::Cancelled.into_result(),
            Err(GattError::Cancelled)
        );
    }
}
