use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

/// Graceful shutdown coordinator
///
/// Long-running tasks hold a receiver and stop when it flips to `true`.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    sender: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    pub fn trigger(&self) {
        // send_replace works with zero receivers
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait for ctrl-c, then signal every subscriber.
    pub async fn wait_for_signal(&self) -> Result<()> {
        info!("Shutdown coordinator ready - will shutdown gracefully on SIGINT");
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
        self.trigger();
        Ok(())
    }
}

/// Resolve once `receiver` observes shutdown (or its sender is gone).
pub async fn wait_for_shutdown(receiver: &mut watch::Receiver<bool>) {
    let _ = receiver.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_reaches_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let mut receiver = coordinator.subscribe();
        assert!(!coordinator.is_triggered());

        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut receiver).await });
        coordinator.trigger();
        waiter.await.unwrap();
        assert!(coordinator.is_triggered());
    }
}
