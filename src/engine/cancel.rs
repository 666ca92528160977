pub use tokio_util::sync::CancellationToken;

use crate::error::{ComposerError, Result};

/// Cooperative cancellation points inside a request
///
/// The engine checks the caller's token between stage boundaries, before
/// composition and before commit. A stage that is already running finishes
/// first.
pub trait Checkpoint {
    /// Fail with `Cancelled` if the token has been triggered
    fn checkpoint(&self, completed_steps: usize) -> Result<()>;
}

impl Checkpoint for CancellationToken {
    fn checkpoint(&self, completed_steps: usize) -> Result<()> {
        if self.is_cancelled() {
            Err(ComposerError::Cancelled { completed_steps })
        } else {
            Ok(())
        }
    }
}
