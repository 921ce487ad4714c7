// Run Signals
// Cancellation and readiness signals shared by steps and resource scripts

use tokio::sync::{oneshot, watch};

/// Receiving side of a cancellation signal. Level-triggered: once set it stays set.
pub type CancelSignal = watch::Receiver<bool>;

/// Sending side of a cancellation signal
pub type CancelHandle = watch::Sender<bool>;

/// Fired once the unit of work has actually started (e.g. its process was spawned)
pub type ReadySignal = oneshot::Sender<()>;

/// Create a new, unfired cancellation signal
pub fn cancel_channel() -> (CancelHandle, CancelSignal) {
    watch::channel(false)
}

/// Create a readiness channel
pub fn ready_channel() -> (ReadySignal, oneshot::Receiver<()>) {
    oneshot::channel()
}

/// Resolve once the signal has been fired.
///
/// If the sending side goes away without firing, this never resolves.
pub async fn cancelled(signal: &mut CancelSignal) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Check the signal without waiting
pub fn is_cancelled(signal: &CancelSignal) -> bool {
    *signal.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancelled_resolves_after_fire() {
        let (tx, mut rx) = cancel_channel();
        let waiter = tokio::spawn(async move {
            cancelled(&mut rx).await;
        });

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_fired_signal() {
        let (tx, _rx) = cancel_channel();
        tx.send_replace(true);

        let mut late = tx.subscribe();
        assert!(is_cancelled(&late));
        tokio::time::timeout(Duration::from_millis(100), cancelled(&mut late))
            .await
            .expect("already fired");
    }

    #[tokio::test]
    async fn test_dropped_sender_never_cancels() {
        let (tx, mut rx) = cancel_channel();
        drop(tx);

        let result = tokio::time::timeout(Duration::from_millis(50), cancelled(&mut rx)).await;
        assert!(result.is_err());
    }
}
