//! Debounced, cancellation-safe event pipeline.
//!
//! ```text
//!  push(event) ──► debouncer ──► bounded queue ──► worker: work(event).await ──► publish(out)
//! ```
//!
//! Raw UI events are pushed without blocking.  The debouncer forwards only
//! the last event of each burst into a bounded queue drained by a single
//! worker, so work units run one at a time in arrival order.
//!
//! Teardown cancels the pipeline's liveness token.  Work that is already
//! running is not aborted (store and network calls cannot be recalled), but
//! its result is dropped instead of published.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::debounce::debounce;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("{0} pipeline is shut down")]
    Closed(&'static str),
}

pub struct Pipeline<T> {
    name: &'static str,
    input: mpsc::UnboundedSender<T>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Spawn the debouncer and worker tasks.
    ///
    /// `work` turns one settled event into an output; `publish` receives
    /// that output only while the pipeline is still alive.
    pub fn spawn<O, W, Fut, P>(
        name: &'static str,
        window: Duration,
        queue_depth: usize,
        mut work: W,
        mut publish: P,
    ) -> Self
    where
        O: Send + 'static,
        W: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = O> + Send + 'static,
        P: FnMut(O) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (input, input_rx) = mpsc::unbounded_channel();
        let (queue_tx, mut queue_rx) = mpsc::channel(queue_depth.max(1));

        tokio::spawn(debounce(window, input_rx, queue_tx, cancel.clone()));

        let token = cancel.clone();
        let worker = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    event = queue_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let out = work(event).await;
                if token.is_cancelled() {
                    debug!("{} pipeline: discarding result that finished after teardown", name);
                    break;
                }
                publish(out);
            }
            debug!("{} pipeline: worker stopped", name);
        });

        Self {
            name,
            input,
            cancel,
            worker: Some(worker),
        }
    }

    /// Feed one raw event.  Never blocks.
    pub fn push(&self, event: T) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Closed(self.name));
        }
        self.input
            .send(event)
            .map_err(|_| PipelineError::Closed(self.name))
    }

    pub fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// A token that is cancelled when this pipeline is torn down.
    pub fn liveness(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop reacting to events.  An in-flight work unit keeps running in
    /// the background and its result is dropped.
    pub fn shutdown(self) {
        self.cancel.cancel();
        debug!("{} pipeline: shut down", self.name);
    }

    /// Like [`Pipeline::shutdown`], but waits for an in-flight work unit to
    /// settle first.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        debug!("{} pipeline: closed", self.name);
    }
}

impl<T> Drop for Pipeline<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
