//! Fan-out of independent units of work with a single fan-in aggregator.

use std::future::Future;

use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::cancel::CancellationToken;
use crate::error::{Result, SyncError};

const RESULT_QUEUE: usize = 64;

/// Values and errors gathered from a set of independent tasks.
#[derive(Debug)]
pub struct Collected<T> {
    pub values: Vec<T>,
    pub errors: Vec<SyncError>,
}

impl<T> Default for Collected<T> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> Collected<T> {
    pub fn from_values(values: Vec<T>) -> Self {
        Self {
            values,
            errors: Vec::new(),
        }
    }

    pub fn into_parts(self) -> (Vec<T>, Option<SyncError>) {
        (self.values, SyncError::join(self.errors))
    }
}

/// Spawns tasks onto a [`JoinSet`] and funnels their results through a
/// bounded channel to one aggregator.
///
/// Tasks start running on `submit`; the aggregator only runs inside
/// [`WorkerPool::join`]. Dropping the pool aborts whatever is still running.
pub struct WorkerPool<T> {
    tasks: JoinSet<()>,
    tx: mpsc::Sender<Result<T>>,
    rx: mpsc::Receiver<Result<T>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(RESULT_QUEUE);
        Self {
            tasks: JoinSet::new(),
            tx,
            rx,
            cancel,
        }
    }

    pub fn submit<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let tx = self.tx.clone();
        self.tasks.spawn(async move {
            let result = task.await;
            // The receiver is gone only when the pool was dropped or cancelled.
            let _ = tx.send(result).await;
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every submitted task and gathers their outcomes.
    ///
    /// # Errors
    /// Returns [`SyncError::Cancelled`] as soon as the token fires or a task
    /// reports cancellation; remaining tasks are aborted and results gathered
    /// so far are discarded.
    pub async fn join(self) -> Result<Collected<T>> {
        debug!("Waiting on {} tasks", self.len());
        let Self {
            mut tasks,
            tx,
            mut rx,
            cancel,
        } = self;
        drop(tx);

        let mut collected = Collected::default();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(SyncError::Cancelled);
                }
                item = rx.recv() => match item {
                    Some(Ok(value)) => collected.values.push(value),
                    Some(Err(e)) if e.is_cancelled() => {
                        tasks.abort_all();
                        return Err(SyncError::Cancelled);
                    }
                    Some(Err(e)) => collected.errors.push(e),
                    None => break,
                }
            }
        }

        // Every sender is gone; anything left to reap either panicked or was
        // aborted before reporting.
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    collected.errors.push(SyncError::Task(e.to_string()));
                }
            }
        }

        debug!(
            "Worker pool finished: {} values, {} errors",
            collected.values.len(),
            collected.errors.len()
        );
        Ok(collected)
    }
}
