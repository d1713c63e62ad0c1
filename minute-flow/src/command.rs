//! Operator command surface.
//!
//! Commands arrive as slash-prefixed chat text (eg/ `/start_ticker`, `/stop_job oi`) and are
//! parsed into a closed [`Command`] enum before being executed by the [`Controller`].

use crate::{
    offline::SessionReconciler,
    scheduler::JobRegistry,
    supervisor::{FeedSupervisor, SupervisorError},
    token::TokenCache,
};
use derive_more::Display;
use smol_str::SmolStr;
use std::{str::FromStr, sync::Arc};
use thiserror::Error;
use tracing::info;

/// Help text returned by [`Command::Help`].
pub const HELP: &str = "\
/start - list available commands
/start_ticker - start the feed
/stop_ticker - stop the feed
/ticker_status - feed and pipeline status
/docs - buffered and queued document counts
/flush - flush buffered documents now
/refresh_token - re-fetch the feed access token
/jobs - scheduled job status
/start_job <name> - start a scheduled job
/stop_job <name> - stop a scheduled job
/reconcile - rebuild today's buckets from the tick archive";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    StartTicker,
    StopTicker,
    TickerStatus,
    Docs,
    Flush,
    RefreshToken,
    Jobs,
    StartJob(SmolStr),
    StopJob(SmolStr),
    Reconcile,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("{0} requires a job name")]
    MissingArgument(&'static str),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut parts = input.split_whitespace();
        let head = parts.next().ok_or(CommandError::Empty)?;

        // Group chats address bots as `/command@bot_name`
        let name = head.split('@').next().unwrap_or(head);
        let argument = parts.next().map(SmolStr::new);

        let job = |command: &'static str| {
            argument
                .clone()
                .ok_or(CommandError::MissingArgument(command))
        };

        match name {
            "/start" | "/help" => Ok(Command::Help),
            "/start_ticker" => Ok(Command::StartTicker),
            "/stop_ticker" => Ok(Command::StopTicker),
            "/ticker_status" => Ok(Command::TickerStatus),
            "/docs" => Ok(Command::Docs),
            "/flush" => Ok(Command::Flush),
            "/refresh_token" => Ok(Command::RefreshToken),
            "/jobs" => Ok(Command::Jobs),
            "/start_job" => job("/start_job").map(Command::StartJob),
            "/stop_job" => job("/stop_job").map(Command::StopJob),
            "/reconcile" => Ok(Command::Reconcile),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// Reply text for the operator, flagged as success or failure.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{text}")]
pub struct CommandReply {
    pub ok: bool,
    pub text: String,
}

impl CommandReply {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            ok: true,
            text: text.into(),
        }
    }

    pub fn failed(text: impl Into<String>) -> Self {
        Self {
            ok: false,
            text: text.into(),
        }
    }
}

/// Executes operator commands against the running components.
#[derive(Debug, Clone)]
pub struct Controller {
    supervisor: Arc<FeedSupervisor>,
    jobs: Arc<JobRegistry>,
    tokens: Arc<TokenCache>,
    token_owner: SmolStr,
}

impl Controller {
    pub fn new(
        supervisor: Arc<FeedSupervisor>,
        jobs: Arc<JobRegistry>,
        tokens: Arc<TokenCache>,
        token_owner: impl Into<SmolStr>,
    ) -> Self {
        Self {
            supervisor,
            jobs,
            tokens,
            token_owner: token_owner.into(),
        }
    }

    /// Parse and execute raw operator text.
    pub async fn dispatch(&self, input: &str) -> CommandReply {
        match input.parse::<Command>() {
            Ok(command) => self.execute(command).await,
            Err(error) => CommandReply::failed(format!("{error}\n\n{HELP}")),
        }
    }

    pub async fn execute(&self, command: Command) -> CommandReply {
        info!(?command, "executing operator command");

        match command {
            Command::Help => CommandReply::ok(HELP),
            Command::StartTicker => match self.supervisor.start() {
                Ok(()) => CommandReply::ok("Ticker started."),
                Err(SupervisorError::AlreadyRunning) => {
                    CommandReply::failed("Ticker is already running.")
                }
                Err(error) => CommandReply::failed(error.to_string()),
            },
            Command::StopTicker => match self.supervisor.stop().await {
                Ok(()) => CommandReply::ok("Ticker stopped."),
                Err(SupervisorError::NotRunning) => CommandReply::failed("Ticker is not running."),
                Err(error) => CommandReply::failed(error.to_string()),
            },
            Command::TickerStatus => {
                let status = self.supervisor.status();
                CommandReply::ok(format!(
                    "Ticker: {}\nRetries: {}/{}\nQueued: {}\nBuffered: {}\nPersisted: {}\nShed: {}\nDead letters: {}\nLast error: {}",
                    status.state,
                    status.retries,
                    status.max_retries,
                    status.queue_depth,
                    status.buffered,
                    status.persisted,
                    status.shed,
                    status.dead_lettered,
                    status.last_error.as_deref().unwrap_or("none"),
                ))
            }
            Command::Docs => {
                let status = self.supervisor.status();
                CommandReply::ok(format!(
                    "Buffered documents: {}\nQueued documents: {}",
                    status.buffered, status.queue_depth
                ))
            }
            Command::Flush => match self.supervisor.flush() {
                Ok(()) => CommandReply::ok("Flush requested."),
                Err(_) => CommandReply::failed("Ticker is not running."),
            },
            Command::RefreshToken => match self.tokens.refresh(&self.token_owner).await {
                Ok(_) => CommandReply::ok(format!("Token refreshed for {}.", self.token_owner)),
                Err(error) => CommandReply::failed(format!("Token refresh failed: {error}")),
            },
            Command::Jobs => {
                let jobs = self.jobs.status();
                if jobs.is_empty() {
                    return CommandReply::ok("No scheduled jobs.");
                }
                CommandReply::ok(
                    jobs.iter()
                        .map(|job| {
                            format!(
                                "{}: every {}m at :{:02} ({})",
                                job.name,
                                job.interval_minutes,
                                job.target_second,
                                if job.running { "running" } else { "stopped" }
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n"),
                )
            }
            Command::StartJob(name) => match self.jobs.start(&name) {
                Ok(()) => CommandReply::ok(format!("Job {name} started.")),
                Err(error) => CommandReply::failed(error.to_string()),
            },
            Command::StopJob(name) => match self.jobs.stop(&name) {
                Ok(()) => CommandReply::ok(format!("Job {name} stopped.")),
                Err(error) => CommandReply::failed(error.to_string()),
            },
            Command::Reconcile => match self.jobs.run_once(SessionReconciler::NAME).await {
                Ok(Ok(())) => CommandReply::ok("Reconciliation completed."),
                Ok(Err(error)) => CommandReply::failed(format!("Reconciliation failed: {error}")),
                Err(error) => CommandReply::failed(error.to_string()),
            },
        }
    }
}
