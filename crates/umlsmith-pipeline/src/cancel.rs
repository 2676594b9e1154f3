use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

/// Cancellation plus an optional outer deadline for one request.
///
/// Checked before every backend and validator call. Per-call timeouts are clipped to
/// whatever is left of the deadline.
#[derive(Debug, Clone)]
pub struct RunGuard {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RunGuard {
    pub fn new(token: CancellationToken, budget: Option<Duration>) -> Self {
        Self {
            token,
            deadline: budget.map(|b| Instant::now() + b),
        }
    }

    /// A guard that never fires.
    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn check(&self) -> Result<(), PipelineError> {
        if self.is_stopped() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Timeout for the next call: `per_call`, shortened to the remaining deadline.
    pub fn budget(&self, per_call: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => per_call.min(deadline.saturating_duration_since(Instant::now())),
            None => per_call,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_token_stops_the_run() {
        let token = CancellationToken::new();
        let guard = RunGuard::new(token.child_token(), None);
        assert!(guard.check().is_ok());
        token.cancel();
        assert!(matches!(guard.check(), Err(PipelineError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_clips_the_call_budget() {
        let guard = RunGuard::new(CancellationToken::new(), Some(Duration::from_secs(10)));
        assert_eq!(guard.budget(Duration::from_secs(60)), Duration::from_secs(10));
        assert_eq!(guard.budget(Duration::from_secs(3)), Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(guard.is_stopped());
        assert_eq!(guard.budget(Duration::from_secs(3)), Duration::ZERO);
    }
}
