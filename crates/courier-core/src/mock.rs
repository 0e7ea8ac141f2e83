use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::SendError;
use crate::transport::{MessageTransport, SendReceipt, SendRequest};

/// Pre-programmed transport outcomes for deterministic tests.
#[derive(Clone, Debug)]
pub enum MockOutcome {
    Deliver,
    Fail(SendError),
    /// Wait, then resolve the inner outcome.
    Delay(Duration, Box<MockOutcome>),
}

impl MockOutcome {
    pub fn delayed(delay: Duration, inner: MockOutcome) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Transport that replays scripted outcomes and records every request.
///
/// Once the script is exhausted every call resolves to `fallback`.
pub struct MockTransport {
    script: Mutex<VecDeque<MockOutcome>>,
    fallback: MockOutcome,
    calls: Mutex<Vec<SendRequest>>,
    call_count: AtomicUsize,
}

impl MockTransport {
    pub fn new(script: Vec<MockOutcome>, fallback: MockOutcome) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn always_deliver() -> Self {
        Self::new(Vec::new(), MockOutcome::Deliver)
    }

    pub fn always_fail() -> Self {
        Self::new(
            Vec::new(),
            MockOutcome::Fail(SendError::Network("mock failure".into())),
        )
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<SendRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl MessageTransport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, request: &SendRequest) -> Result<SendReceipt, SendError> {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(request.clone());

        let mut outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        loop {
            match outcome {
                MockOutcome::Deliver => {
                    return Ok(SendReceipt {
                        provider_message_id: Some(format!("mock-{n}")),
                    })
                }
                MockOutcome::Fail(err) => return Err(err),
                MockOutcome::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    outcome = *inner;
                }
            }
        }
    }
}
