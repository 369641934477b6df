//! Wall-clock deadline for the build + run sequence.

use crate::error::ExecError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// The only thing allowed to cancel a running execution.
///
/// On expiry the supervised future is dropped, which kills any process it
/// owns (see [`crate::process::run_step`]).
#[derive(Debug, Clone, Copy)]
pub struct TimeoutSupervisor {
    deadline: Duration,
}

impl TimeoutSupervisor {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub async fn supervise<T, F>(&self, work: F) -> Result<T, ExecError>
    where
        F: Future<Output = Result<T, ExecError>>,
    {
        match tokio::time::timeout(self.deadline, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(deadline_secs = self.deadline.as_secs(), "Execution deadline exceeded");
                Err(ExecError::Timeout(self.deadline))
            }
        }
    }
}
