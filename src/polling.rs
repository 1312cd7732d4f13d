//! Checkpoint polling for read-model projections.
//!
//! [`PollingClient`] tails the store-wide checkpoint order without any push
//! support from the engine. It keeps no durable state: persist the token of
//! the last processed commit (see [`CheckpointFile`](crate::CheckpointFile))
//! and pass it back to [`start_from`](PollingClient::start_from) to resume.
//!
//! Checkpoint tokens are handed out densely, so a page that skips a token has
//! a hole: either a commit that is not visible yet or one that was deleted.
//! The client waits for the hole to fill a bounded number of times before
//! moving past it.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;

use crate::commit::Commit;
use crate::error::StoreError;
use crate::persistence::{AsyncPersistence, PersistStreams};

/// Tuning for [`PollingClient`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_streams::PollingConfig;
///
/// let config = PollingConfig {
///     interval: Duration::from_millis(50),
///     ..PollingConfig::default()
/// };
/// assert_eq!(config.hole_detection_retries, 3);
/// ```
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Delay between polls.
    ///
    /// Default: 200 milliseconds.
    pub interval: Duration,

    /// How long to wait before re-reading a page that has a hole.
    ///
    /// Default: 50 milliseconds.
    pub hole_detection_wait: Duration,

    /// How many times a hole is rechecked before the client moves past it.
    ///
    /// Default: 3.
    pub hole_detection_retries: u32,

    /// Bound of the channel between the poll loop and the consumer.
    ///
    /// Default: 256.
    pub channel_capacity: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            hole_detection_wait: Duration::from_millis(50),
            hole_detection_retries: 3,
            channel_capacity: 256,
        }
    }
}

/// Number of leading commits in `page` whose tokens follow `after` without a
/// gap.
fn contiguous_len(page: &[Commit], after: u64) -> usize {
    let mut expected = after.saturating_add(1);
    for (index, commit) in page.iter().enumerate() {
        if commit.checkpoint_token != expected {
            return index;
        }
        expected = expected.saturating_add(1);
    }
    page.len()
}

/// Resumable, ordered tail over an engine's checkpoint order.
pub struct PollingClient<P: PersistStreams + ?Sized + 'static> {
    persistence: AsyncPersistence<P>,
    config: PollingConfig,
}

impl<P: PersistStreams + ?Sized + 'static> Clone for PollingClient<P> {
    fn clone(&self) -> Self {
        Self {
            persistence: self.persistence.clone(),
            config: self.config.clone(),
        }
    }
}

impl<P: PersistStreams + ?Sized + 'static> std::fmt::Debug for PollingClient<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingClient")
            .field("config", &self.config)
            .finish()
    }
}

impl<P: PersistStreams + ?Sized + 'static> PollingClient<P> {
    /// Poll `persistence` with [`PollingConfig::default`].
    pub fn new(persistence: Arc<P>) -> Self {
        Self::with_config(persistence, PollingConfig::default())
    }

    /// Poll `persistence` with `config`.
    pub fn with_config(persistence: Arc<P>, config: PollingConfig) -> Self {
        Self {
            persistence: AsyncPersistence::new(persistence),
            config,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Read one page of commits after `checkpoint_token`.
    ///
    /// Only the run of commits that directly follows `checkpoint_token` is
    /// returned; anything after a hole waits for a later call. When the page
    /// starts with a hole, it is re-read up to
    /// [`hole_detection_retries`](PollingConfig::hole_detection_retries)
    /// times. A hole that never fills is logged and skipped.
    ///
    /// # Returns
    ///
    /// Commits in strictly ascending token order, all greater than
    /// `checkpoint_token`. Empty if nothing new was committed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the engine read fails.
    pub async fn poll_once(&self, checkpoint_token: u64) -> Result<Vec<Commit>, StoreError> {
        let mut page = self.persistence.get_from_checkpoint(checkpoint_token).await?;
        let mut attempts = 0;
        loop {
            let contiguous = contiguous_len(&page, checkpoint_token);
            if contiguous > 0 || page.is_empty() {
                page.truncate(contiguous);
                return Ok(page);
            }
            let next_token = page[0].checkpoint_token;
            if attempts >= self.config.hole_detection_retries {
                tracing::warn!(
                    hole_after = checkpoint_token,
                    next_token,
                    "checkpoint hole did not fill, skipping"
                );
                let run = contiguous_len(&page, next_token.saturating_sub(1));
                page.truncate(run);
                return Ok(page);
            }
            attempts += 1;
            tracing::debug!(
                hole_after = checkpoint_token,
                attempts,
                "checkpoint hole detected, rechecking"
            );
            tokio::time::sleep(self.config.hole_detection_wait).await;
            page = self.persistence.get_from_checkpoint(checkpoint_token).await?;
        }
    }

    /// Spawn a poll loop that delivers every commit after `checkpoint_token`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// The loop stops when [`PollingHandle::stop`] is called, when every
    /// handle clone is dropped, when the returned stream is dropped, or when
    /// the engine is disposed. Failed reads are logged and retried on the
    /// next tick.
    ///
    /// # Returns
    ///
    /// A handle controlling the loop and the stream of commits, in strictly
    /// ascending checkpoint order.
    pub fn start_from(&self, checkpoint_token: u64) -> (PollingHandle, CommitStream) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stop_requested = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let checkpoint = Arc::new(AtomicU64::new(checkpoint_token));

        let task = tokio::spawn(run_poll_loop(
            self.clone(),
            tx,
            shutdown_rx,
            Arc::clone(&checkpoint),
            Arc::clone(&finished),
        ));
        tracing::info!(checkpoint_token, "polling started");

        let handle = PollingHandle {
            shutdown_tx,
            stop_requested: Arc::clone(&stop_requested),
            finished,
            checkpoint,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        };
        let stream = CommitStream {
            inner: ReceiverStream::new(rx),
            stop_requested,
        };
        (handle, stream)
    }
}

/// The poll loop behind [`PollingClient::start_from`].
async fn run_poll_loop<P: PersistStreams + ?Sized + 'static>(
    client: PollingClient<P>,
    tx: mpsc::Sender<Commit>,
    mut shutdown_rx: watch::Receiver<bool>,
    checkpoint: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
) {
    let mut cursor = checkpoint.load(Ordering::Acquire);
    let mut ticker = tokio::time::interval(client.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'poll: loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => break 'poll,
            _ = tx.closed() => {
                tracing::debug!("commit stream dropped, polling stops");
                break 'poll;
            }
        }

        let page = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break 'poll,
            page = client.poll_once(cursor) => page,
        };
        let page = match page {
            Ok(page) => page,
            Err(StoreError::Disposed) => {
                tracing::info!("engine disposed, polling stops");
                break 'poll;
            }
            Err(e) => {
                tracing::warn!(error = %e, cursor, "poll failed, retrying next tick");
                continue;
            }
        };

        for commit in page {
            let token = commit.checkpoint_token;
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break 'poll,
                sent = tx.send(commit) => {
                    if sent.is_err() {
                        tracing::debug!("commit stream dropped, polling stops");
                        break 'poll;
                    }
                }
            }
            cursor = token;
            checkpoint.store(token, Ordering::Release);
        }
    }

    finished.store(true, Ordering::Release);
    tracing::info!(checkpoint_token = cursor, "polling stopped");
}

/// Handle for controlling a running poll loop.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped or channel handles.
#[derive(Clone)]
pub struct PollingHandle {
    shutdown_tx: watch::Sender<bool>,
    stop_requested: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    checkpoint: Arc<AtomicU64>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for PollingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingHandle")
            .field("stopped", &self.is_stopped())
            .field("checkpoint", &self.checkpoint())
            .finish()
    }
}

impl PollingHandle {
    /// Token of the last commit handed to the stream, or the start token if
    /// none has been yet. Persist this to resume later.
    pub fn checkpoint(&self) -> u64 {
        self.checkpoint.load(Ordering::Acquire)
    }

    /// Whether the loop has stopped or is stopping.
    pub fn is_stopped(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire) || self.finished.load(Ordering::Acquire)
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// Safe to call while a poll is in progress and safe to call more than
    /// once. Once this returns the stream yields no further commits.
    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        // The loop may already have exited and dropped its receiver.
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().await.take();
        if let Some(join_handle) = task
            && let Err(e) = join_handle.await
        {
            tracing::error!(error = %e, "poll loop task panicked");
        }
    }
}

/// Commits delivered by a poll loop, in ascending checkpoint order.
///
/// Ends once the loop stops. Commits still buffered when
/// [`PollingHandle::stop`] is called are discarded; commits buffered before
/// the loop ended on its own are still yielded.
#[derive(Debug)]
pub struct CommitStream {
    inner: ReceiverStream<Commit>,
    stop_requested: Arc<AtomicBool>,
}

impl Stream for CommitStream {
    type Item = Commit;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Commit>> {
        let this = self.get_mut();
        if this.stop_requested.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }
        Pin::new(&mut this.inner).poll_next(cx)
    }
}
