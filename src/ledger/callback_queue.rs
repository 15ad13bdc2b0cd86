//! Callback Queue
//!
//! The webhook verifies and normalises a callback, enqueues it, and answers
//! the gateway straight away. [`CallbackWorker`] drains the queue and drives
//! the state machine.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::engine::LedgerEngine;
use super::error::LedgerError;
use crate::gateway::CallbackOutcome;

// ============================================================================
// Channel
// ============================================================================

/// Producer side, held by the webhook handler
#[derive(Clone)]
pub struct CallbackSender {
    tx: mpsc::Sender<CallbackOutcome>,
}

impl CallbackSender {
    /// Queue a verified callback. Waits while the queue is full.
    pub async fn enqueue(&self, outcome: CallbackOutcome) -> Result<(), LedgerError> {
        self.tx
            .send(outcome)
            .await
            .map_err(|_| LedgerError::ServiceUnavailable("callback queue closed".into()))
    }

    /// Queue a verified callback without waiting.
    ///
    /// A full queue is `ServiceUnavailable` so the gateway redelivers later.
    pub fn try_enqueue(&self, outcome: CallbackOutcome) -> Result<(), LedgerError> {
        self.tx.try_send(outcome).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                LedgerError::ServiceUnavailable("callback queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                LedgerError::ServiceUnavailable("callback queue closed".into())
            }
        })
    }
}

/// Consumer side, owned by [`CallbackWorker`]
pub struct CallbackReceiver {
    rx: mpsc::Receiver<CallbackOutcome>,
}

impl CallbackReceiver {
    pub async fn recv(&mut self) -> Option<CallbackOutcome> {
        self.rx.recv().await
    }
}

/// Create a bounded callback channel
pub fn callback_channel(buffer: usize) -> (CallbackSender, CallbackReceiver) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (CallbackSender { tx }, CallbackReceiver { rx })
}

// ============================================================================
// Worker
// ============================================================================

/// Applies queued callbacks one at a time
pub struct CallbackWorker {
    engine: Arc<LedgerEngine>,
    receiver: CallbackReceiver,
}

impl CallbackWorker {
    pub fn new(engine: Arc<LedgerEngine>, receiver: CallbackReceiver) -> Self {
        Self { engine, receiver }
    }

    /// Run until every sender is dropped.
    pub async fn run(mut self) {
        info!("Starting callback worker");

        while let Some(outcome) = self.receiver.recv().await {
            self.process(outcome).await;
        }

        info!("Callback queue closed, worker stopping");
    }

    async fn process(&self, outcome: CallbackOutcome) {
        let reference = outcome.external_reference.clone();
        match self.engine.apply_callback(&outcome).await {
            Ok(record) => {
                debug!(
                    external_reference = %reference,
                    record_id = %record.id,
                    state = %record.state,
                    "Callback processed"
                );
            }
            Err(LedgerError::NotFound(_)) => {
                warn!(external_reference = %reference, "Callback for unknown reference dropped");
            }
            Err(e @ LedgerError::MalformedCallback(_)) => {
                warn!(external_reference = %reference, error = %e, "Callback rejected");
            }
            Err(e) => {
                error!(external_reference = %reference, error = %e, "Failed to apply callback");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Outcome;

    #[tokio::test]
    async fn test_enqueue_fails_once_receiver_is_gone() {
        let (tx, rx) = callback_channel(4);
        drop(rx);
        let err = tx
            .enqueue(CallbackOutcome {
                external_reference: "EXT-1".into(),
                outcome: Outcome::Success,
                settled_amount: None,
                receipt: None,
                description: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_try_enqueue_refuses_when_full() {
        let (tx, mut rx) = callback_channel(1);
        let outcome = |reference: &str| CallbackOutcome {
            external_reference: reference.into(),
            outcome: Outcome::Success,
            settled_amount: None,
            receipt: None,
            description: None,
        };

        tx.try_enqueue(outcome("A")).unwrap();
        let err = tx.try_enqueue(outcome("B")).unwrap_err();
        assert_eq!(err.code(), "SERVICE_UNAVAILABLE");

        // Space frees up once the worker drains
        assert_eq!(rx.recv().await.unwrap().external_reference, "A");
        tx.try_enqueue(outcome("C")).unwrap();

        drop(rx);
        assert!(tx.try_enqueue(outcome("D")).is_err());
    }

    #[tokio::test]
    async fn test_receiver_sees_outcomes_in_order() {
        let (tx, mut rx) = callback_channel(4);
        for reference in ["A", "B"] {
            tx.enqueue(CallbackOutcome {
                external_reference: reference.into(),
                outcome: Outcome::Failure,
                settled_amount: None,
                receipt: None,
                description: None,
            })
            .await
            .unwrap();
        }
        assert_eq!(rx.recv().await.unwrap().external_reference, "A");
        assert_eq!(rx.recv().await.unwrap().external_reference, "B");
    }
}
