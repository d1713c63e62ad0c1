//! Reconnecting feed supervisor.
//!
//! Drives `Idle -> Connecting -> Subscribed -> Receiving`, falling back to `Backoff` on any
//! connection or transport failure. Consecutive failures are bounded: once `max_retries`
//! attempts in a row have failed the supervisor stops, flushes the batch writer and asks for
//! manual intervention. It never restarts by itself.

use crate::{
    error::FeedError,
    feed::connector::{FeedConnector, FeedFrame, FeedStream},
    instrument::{Instrument, InstrumentDirectory},
    notify::{Notifier, notify_best_effort},
    pipeline::{
        AggregateQueue, BatchWriter, QueueConfig, QueueSender, WriterConfig, WriterControl,
        WriterHandle,
    },
    session::FeedSession,
    sink::AggregateSink,
    token::TokenCache,
};
use derive_more::Display;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Deserialize, Serialize)]
pub enum SupervisorState {
    Idle,
    Connecting,
    Subscribed,
    Receiving,
    Backoff,
    Stopped,
}

/// Feed supervisor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Token owner whose access token authenticates the feed.
    pub token_owner: SmolStr,
    /// Consecutive failed connection attempts before stopping.
    pub max_retries: u32,
    /// Delay after the first failure; doubled for every further consecutive failure.
    pub base_backoff: Duration,
    /// Also enqueue every raw market tick for offline reconstruction.
    pub archive_ticks: bool,
    pub queue: QueueConfig,
    pub writer: WriterConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            token_owner: SmolStr::new_static("default"),
            max_retries: 3,
            base_backoff: Duration::from_secs(5),
            archive_ticks: false,
            queue: QueueConfig::default(),
            writer: WriterConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn with_token_owner(mut self, token_owner: impl Into<SmolStr>) -> Self {
        self.token_owner = token_owner.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    pub fn with_archive_ticks(mut self, archive_ticks: bool) -> Self {
        self.archive_ticks = archive_ticks;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }

    /// Backoff before reconnecting after the `retry`th consecutive failure (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1 << exponent)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum SupervisorError {
    #[error("feed supervisor is already running")]
    AlreadyRunning,

    #[error("feed supervisor is not running")]
    NotRunning,
}

/// Point-in-time view of the supervisor and its pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub retries: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub queue_depth: usize,
    pub buffered: usize,
    pub shed: u64,
    pub persisted: u64,
    pub dead_lettered: u64,
}

#[derive(Debug)]
struct Shared {
    state: RwLock<SupervisorState>,
    retries: AtomicU32,
    last_error: RwLock<Option<FeedError>>,
}

impl Shared {
    fn set_state(&self, state: SupervisorState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(%previous, %state, "feed supervisor state change");
        }
    }
}

struct Run {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    queue: QueueSender,
    writer: WriterControl,
}

struct Inner {
    config: SupervisorConfig,
    connector: Arc<dyn FeedConnector>,
    directory: Arc<dyn InstrumentDirectory>,
    tokens: Arc<TokenCache>,
    sink: Arc<dyn AggregateSink>,
    notifier: Arc<dyn Notifier>,
    shared: Shared,
}

/// Owns the feed connection lifecycle and the aggregation pipeline behind it.
pub struct FeedSupervisor {
    inner: Arc<Inner>,
    run: Mutex<Option<Run>>,
}

impl std::fmt::Debug for FeedSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSupervisor")
            .field("config", &self.inner.config)
            .field("state", &*self.inner.shared.state.read())
            .finish()
    }
}

enum Exit {
    Operator,
    Exhausted(FeedError),
}

enum SessionEnd {
    Cancelled(FeedSession),
    Failed(FeedError),
}

impl FeedSupervisor {
    pub fn new(
        config: SupervisorConfig,
        connector: Arc<dyn FeedConnector>,
        directory: Arc<dyn InstrumentDirectory>,
        tokens: Arc<TokenCache>,
        sink: Arc<dyn AggregateSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                directory,
                tokens,
                sink,
                notifier,
                shared: Shared {
                    state: RwLock::new(SupervisorState::Idle),
                    retries: AtomicU32::new(0),
                    last_error: RwLock::new(None),
                },
            }),
            run: Mutex::new(None),
        }
    }

    /// Spawn a fresh batch writer and the connection loop. Resets the retry counter.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut run = self.run.lock();
        if run.as_ref().is_some_and(|run| !run.task.is_finished()) {
            return Err(SupervisorError::AlreadyRunning);
        }

        let config = &self.inner.config;
        let (queue, receiver) =
            AggregateQueue::bounded(config.queue, Arc::clone(&self.inner.notifier));
        let writer = BatchWriter::new(
            config.writer,
            receiver,
            Arc::clone(&self.inner.sink),
            Arc::clone(&self.inner.notifier),
        )
        .spawn(CancellationToken::new());

        self.inner.shared.retries.store(0, Ordering::Relaxed);
        *self.inner.shared.last_error.write() = None;
        self.inner.shared.set_state(SupervisorState::Connecting);

        let cancel = CancellationToken::new();
        let control = writer.control();
        let task = tokio::spawn(Arc::clone(&self.inner).supervise(
            cancel.clone(),
            queue.clone(),
            writer,
        ));

        *run = Some(Run {
            cancel,
            task,
            queue,
            writer: control,
        });

        info!("feed supervisor started");
        Ok(())
    }

    /// Cancel the connection loop and wait until held candles are drained and the batch
    /// writer has flushed.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let run = self.run.lock().take();
        let Some(run) = run.filter(|run| !run.task.is_finished()) else {
            return Err(SupervisorError::NotRunning);
        };

        run.cancel.cancel();
        if let Err(error) = run.task.await {
            error!(%error, "feed supervisor task failed");
        }
        Ok(())
    }

    /// Force the batch writer to flush its buffer now.
    pub fn flush(&self) -> Result<(), SupervisorError> {
        match self.run.lock().as_ref() {
            Some(run) if !run.task.is_finished() => {
                run.writer.flush();
                Ok(())
            }
            _ => Err(SupervisorError::NotRunning),
        }
    }

    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .as_ref()
            .is_some_and(|run| !run.task.is_finished())
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.shared.state.read()
    }

    pub fn status(&self) -> SupervisorStatus {
        let shared = &self.inner.shared;
        let run = self.run.lock();

        let (queue_depth, shed, buffered, persisted, dead_lettered) = match run.as_ref() {
            Some(run) => (
                run.queue.depth(),
                run.queue.dropped(),
                run.writer.stats().buffered(),
                run.writer.stats().persisted(),
                run.writer.stats().dead_lettered(),
            ),
            None => (0, 0, 0, 0, 0),
        };

        SupervisorStatus {
            state: *shared.state.read(),
            retries: shared.retries.load(Ordering::Relaxed),
            max_retries: self.inner.config.max_retries,
            last_error: shared.last_error.read().as_ref().map(ToString::to_string),
            queue_depth,
            buffered,
            shed,
            persisted,
            dead_lettered,
        }
    }
}

impl Inner {
    async fn supervise(
        self: Arc<Self>,
        cancel: CancellationToken,
        queue: QueueSender,
        writer: WriterHandle,
    ) {
        let max_retries = self.config.max_retries;
        let mut retries = 0;

        let exit = loop {
            self.shared.set_state(SupervisorState::Connecting);

            let failure = match self.connect(&cancel).await {
                None => break Exit::Operator,
                Some(Err(error)) => error,
                Some(Ok((instruments, stream))) => {
                    self.shared.set_state(SupervisorState::Subscribed);
                    notify_best_effort(
                        self.notifier.as_ref(),
                        &format!(
                            "[Ticker] Subscription sent for {} instruments",
                            instruments.len()
                        ),
                    )
                    .await;

                    let session = FeedSession::new(
                        &instruments,
                        queue.clone(),
                        self.config.archive_ticks,
                    );

                    match self.receive(session, stream, &cancel, &mut retries).await {
                        SessionEnd::Cancelled(mut session) => {
                            let drained = session.drain_candles();
                            info!(drained, stats = ?session.stats(), "feed session stopped by operator");
                            break Exit::Operator;
                        }
                        SessionEnd::Failed(error) => error,
                    }
                }
            };

            retries += 1;
            self.shared.retries.store(retries, Ordering::Relaxed);
            *self.shared.last_error.write() = Some(failure.clone());
            error!(%failure, retries, max_retries, "feed connection failed");

            if retries >= max_retries {
                break Exit::Exhausted(failure);
            }

            let backoff = self.config.backoff(retries);
            self.shared.set_state(SupervisorState::Backoff);
            notify_best_effort(
                self.notifier.as_ref(),
                &format!(
                    "[Ticker] Crash detected\nError: {failure}\nRetry {retries}/{max_retries}\nReconnecting in {} seconds...",
                    backoff.as_secs()
                ),
            )
            .await;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Exit::Operator,
                _ = tokio::time::sleep(backoff) => {}
            }
        };

        drop(queue);
        writer.shutdown().await;

        match exit {
            Exit::Operator => {
                self.shared.set_state(SupervisorState::Idle);
                notify_best_effort(self.notifier.as_ref(), "[Ticker] Ticker stopped.").await;
            }
            Exit::Exhausted(failure) => {
                self.shared.set_state(SupervisorState::Stopped);
                error!(%failure, "feed supervisor stopped after max retries");
                notify_best_effort(
                    self.notifier.as_ref(),
                    &format!(
                        "[Ticker] Max retries reached. Stopping Ticker.\nLast error: {failure}\nManual intervention required."
                    ),
                )
                .await;
            }
        }
    }

    /// Fetch the token, load instruments and open a subscribed transport.
    ///
    /// Returns `None` if cancelled.
    async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Option<Result<(Vec<Instrument>, FeedStream), FeedError>> {
        let attempt = async {
            let token = self.tokens.get(&self.config.token_owner).await?;

            let instruments = self.directory.instruments().await?;
            if instruments.is_empty() {
                return Err(FeedError::InstrumentsEmpty);
            }

            let stream = self.connector.connect(&token, &instruments).await?;
            Ok((instruments, stream))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = attempt => Some(result),
        }
    }

    async fn receive(
        &self,
        mut session: FeedSession,
        mut stream: FeedStream,
        cancel: &CancellationToken,
        retries: &mut u32,
    ) -> SessionEnd {
        let mut first_frame = true;

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionEnd::Cancelled(session),
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(FeedFrame::Binary(payload))) => {
                    // Decode errors drop the frame and keep the session alive
                    if session.on_frame(&payload).is_ok() && first_frame {
                        first_frame = false;
                        *retries = 0;
                        self.shared.retries.store(0, Ordering::Relaxed);
                        self.shared.set_state(SupervisorState::Receiving);
                        info!(instruments = session.instruments(), "receiving market data");
                    }
                }
                Some(Ok(FeedFrame::Text(text))) => {
                    debug!(%text, "ignoring text frame from feed");
                }
                Some(Err(error)) if error.is_terminal() => {
                    warn!(%error, "feed connection lost");
                    return SessionEnd::Failed(error);
                }
                Some(Err(error)) => {
                    warn!(%error, "non-terminal feed transport error, continuing");
                }
                None => return SessionEnd::Failed(FeedError::StreamEnded),
            }
        }
    }
}
