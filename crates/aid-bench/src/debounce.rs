//! Reset-on-new-event timer coalescing.
//!
//! Every value received restarts the quiet-period timer.  When the timer
//! fires, only the most recent value is forwarded; everything it replaced
//! is dropped.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Coalesce `input` into `out` until cancelled or either side closes.
///
/// If `input` closes while a value is pending, that value is flushed
/// immediately.  Cancellation drops any pending value.
pub async fn debounce<T>(
    window: Duration,
    mut input: mpsc::UnboundedReceiver<T>,
    out: mpsc::Sender<T>,
    cancel: CancellationToken,
) {
    let mut pending: Option<T> = None;
    let timer = tokio::time::sleep(window);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            msg = input.recv() => match msg {
                Some(value) => {
                    if pending.replace(value).is_some() {
                        trace!("debounce: superseded pending value");
                    }
                    timer.as_mut().reset(Instant::now() + window);
                }
                None => {
                    if let Some(value) = pending.take() {
                        let _ = out.send(value).await;
                    }
                    break;
                }
            },

            _ = &mut timer, if pending.is_some() => {
                if let Some(value) = pending.take() {
                    if out.send(value).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(300);

    fn spawn(
        cancel: CancellationToken,
    ) -> (mpsc::UnboundedSender<u32>, mpsc::Receiver<u32>) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(4);
        tokio::spawn(debounce(WINDOW, in_rx, out_tx, cancel));
        (in_tx, out_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_last_value() {
        let (tx, mut rx) = spawn(CancellationToken::new());
        for i in 1..=5 {
            tx.send(i).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // 100ms since the last event: still inside the window.
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(rx.try_recv().unwrap(), 5);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_gaps_emit_each_value() {
        let (tx, mut rx) = spawn(CancellationToken::new());
        tx.send(1).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        tx.send(2).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drops_pending_value() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = spawn(cancel.clone());
        tx.send(7).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_input_flushes_pending_value() {
        let (tx, mut rx) = spawn(CancellationToken::new());
        tx.send(9).unwrap();
        drop(tx);
        assert_eq!(rx.recv().await, Some(9));
        assert_eq!(rx.recv().await, None);
    }
}
