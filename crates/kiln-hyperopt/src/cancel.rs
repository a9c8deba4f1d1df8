use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable cancellation flag shared between the caller and the executor.
///
/// `cancel` may be called from synchronous code (signal handlers, other
/// threads); the executor awaits [`CancelHandle::cancelled`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        if !self.sender.send_replace(true) {
            tracing::info!("Cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once [`CancelHandle::cancel`] has been called on any clone.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // the sender lives as long as any clone, so this cannot fail while we hold self
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}
