//! Per-request context: cancellation, deadline, caller identity, local flag.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Code, TabletError};

/// Cancellation and deadline carried through a request.
///
/// Cloning shares the same cancellation; `with_timeout` and `child` derive
/// contexts that are cancelled with their parent but not the other way round.
#[derive(Clone, Debug)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    local: bool,
    caller: Option<String>,
}

impl Default for RequestContext {
    fn default() -> Self {
        RequestContext::background()
    }
}

impl RequestContext {
    pub fn background() -> Self {
        RequestContext {
            cancel: CancellationToken::new(),
            deadline: None,
            local: false,
            caller: None,
        }
    }

    /// A trusted in-process context. It bypasses target checks and timeouts.
    pub fn local() -> Self {
        RequestContext {
            local: true,
            ..RequestContext::background()
        }
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn caller(&self) -> Option<&str> {
        self.caller.as_deref()
    }

    /// Child context that can be cancelled independently of `self`.
    pub fn child(&self) -> Self {
        RequestContext {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            local: self.local,
            caller: self.caller.clone(),
        }
    }

    /// Child context whose deadline is the earlier of the current one and `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut ctx = self.child();
        let candidate = Instant::now() + timeout;
        ctx.deadline = Some(match self.deadline {
            Some(d) if d < candidate => d,
            _ => candidate,
        });
        ctx
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Why the context finished, if it has.
    pub fn err(&self) -> Option<TabletError> {
        if self.cancel.is_cancelled() {
            return Some(TabletError::new(Code::Canceled, "context canceled"));
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(TabletError::new(
                Code::DeadlineExceeded,
                "context deadline exceeded",
            )),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(d) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(d) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}
