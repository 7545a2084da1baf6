//! Private sequential execution context.
//!
//! A [`SerialWorker`] owns a [`SerialRunnable`] on a dedicated task and feeds
//! it requests one at a time through an mpsc channel. State held by the
//! runnable is therefore only ever touched from that task and needs no lock.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Default request channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Handler driven by a [`SerialWorker`].
#[async_trait]
pub trait SerialRunnable: Send + 'static {
    /// Request type accepted by this runnable.
    type Task: Send + 'static;

    /// Handles a single request. Requests are handled strictly in
    /// submission order.
    async fn run(&mut self, task: Self::Task);

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

/// Handle to a task that serializes all access to a [`SerialRunnable`].
pub struct SerialWorker<R: SerialRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: SerialRunnable> SerialWorker<R> {
    /// Spawns the worker task with [`DEFAULT_CHANNEL_CAPACITY`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(runnable: R) -> Self {
        Self::with_capacity(runnable, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Spawns the worker task with a bounded request channel.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime or if `capacity` is zero.
    pub fn with_capacity(mut runnable: R, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(capacity);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queues a request.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("serial worker channel closed")),
            None => Err(anyhow::anyhow!("serial worker not running")),
        }
    }

    /// Builds a request around a reply channel, submits it and waits for the
    /// reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has stopped or dropped the reply
    /// sender without answering.
    pub async fn call<T: Send + 'static>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> R::Task,
    ) -> anyhow::Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(build(reply_tx)).await?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("serial worker dropped the reply"))
    }

    /// Stops the worker and waits for its task to exit. Requests still queued
    /// are dropped.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tx.is_some()
    }
}

impl<R: SerialRunnable> Drop for SerialWorker<R> {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
