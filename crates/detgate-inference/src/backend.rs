//! Detection backend trait.

use async_trait::async_trait;
use tokio::sync::watch;

use detgate_models::{DetectionResult, UploadArtifact};

use crate::error::InferenceResult;

/// Cancellation signal. The invocation is withdrawn once the value becomes
/// `true`; a dropped sender means "never cancelled".
pub type CancelSignal = watch::Receiver<bool>;

/// A signal that never fires.
pub fn never_cancel() -> CancelSignal {
    let (_tx, rx) = watch::channel(false);
    rx
}

/// Resolve once `cancel` is set. Pends forever if the sender is gone.
pub async fn cancelled(cancel: &mut CancelSignal) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// An external detection engine.
///
/// Implementations must return within their configured bounded wait and
/// must not leave a running worker behind on any path, including
/// cancellation.
#[async_trait]
pub trait DetectionBackend: Send + Sync {
    /// Backend name for logging and metrics.
    fn name(&self) -> &'static str;

    /// Run detection on a staged artifact.
    ///
    /// The artifact is only borrowed: the caller keeps ownership and
    /// releases it after this returns.
    async fn detect(
        &self,
        artifact: &UploadArtifact,
        cancel: CancelSignal,
    ) -> InferenceResult<DetectionResult>;

    /// Check whether the engine is reachable.
    async fn health_check(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_never_cancel_pends() {
        let mut signal = never_cancel();
        let fired = tokio::time::timeout(Duration::from_millis(50), cancelled(&mut signal)).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_cancel_fires() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { cancelled(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancel should fire")
            .unwrap();
    }

    #[tokio::test]
    async fn test_already_cancelled_fires_immediately() {
        let (tx, mut rx) = watch::channel(true);
        tokio::time::timeout(Duration::from_millis(50), cancelled(&mut rx))
            .await
            .expect("should not wait");
        drop(tx);
    }
}
