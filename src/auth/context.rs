//! Per-request call context.
//!
//! A typed carrier for the translated identity, the cancellation signal and
//! the deadline of one inbound request. It rides along as an axum request
//! extension on the public side and is consulted by the session service and
//! the dispatcher for every store query and outbound call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::types::SignedAssertion;

/// Identity attached to a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// No assertion travels with this call.
    Missing,
    /// Assertion obtained by translating the caller's opaque handle.
    Forwarded(SignedAssertion),
}

/// Ambient data owned by one inbound request.
#[derive(Debug, Clone)]
pub struct CallContext {
    request_id: Uuid,
    identity: Identity,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    /// Anonymous context with no deadline.
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            identity: Identity::Missing,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Bound the whole request to `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_assertion(mut self, assertion: SignedAssertion) -> Self {
        self.identity = Identity::Forwarded(assertion);
        self
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn assertion(&self) -> Option<&SignedAssertion> {
        match &self.identity {
            Identity::Forwarded(assertion) => Some(assertion),
            Identity::Missing => None,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` when the request is unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Drive `fut` until it finishes, the request is cancelled, or the
    /// deadline passes, whichever happens first. The losing future is dropped.
    pub async fn scoped<F, T>(&self, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(GatewayError::Cancelled("request cancelled".to_string()))
            }
            _ = deadline => {
                Err(GatewayError::Cancelled("deadline exceeded".to_string()))
            }
            res = fut => res,
        }
    }
}
