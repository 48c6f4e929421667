//! Cancellation scope of a single scan or provisioning call

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Combines the caller's token with the client's reset epoch
///
/// Cancelling either one cancels the scope.
#[derive(Debug, Clone)]
pub struct CancelScope {
    caller: CancellationToken,
    epoch: CancellationToken,
}

impl CancelScope {
    pub fn new(caller: CancellationToken, epoch: CancellationToken) -> Self {
        Self { caller, epoch }
    }

    pub fn is_cancelled(&self) -> bool {
        self.caller.is_cancelled() || self.epoch.is_cancelled()
    }

    /// Resolves once the scope is cancelled
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.caller.cancelled() => {}
            _ = self.epoch.cancelled() => {}
        }
    }

    /// Narrow the scope to end after `timeout`, if one is given.
    ///
    /// The timer runs for as long as the returned deadline is kept alive.
    pub fn limited(self, timeout: Option<Duration>) -> (CancelScope, Option<Deadline>) {
        match timeout {
            None => (self, None),
            Some(timeout) => {
                let deadline = Deadline::new(&self.caller, timeout);
                (CancelScope::new(deadline.token(), self.epoch), Some(deadline))
            }
        }
    }

    /// Drive `fut` to completion unless the scope is cancelled first.
    ///
    /// The future is dropped on cancellation, which aborts the pending call.
    pub async fn run<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            output = fut => Some(output),
        }
    }
}

/// Child token that cancels itself once a timeout elapses
///
/// The timer stops when the deadline is dropped.
#[derive(Debug)]
pub struct Deadline {
    token: CancellationToken,
    timer: JoinHandle<()>,
}

impl Deadline {
    pub fn new(parent: &CancellationToken, timeout: Duration) -> Self {
        let token = parent.child_token();
        let timer = tokio::spawn({
            let token = token.clone();
            async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            }
        });
        Self { token, timer }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.timer.abort();
    }
}
