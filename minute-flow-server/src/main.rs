mod config;

use crate::config::ServerConfig;
use minute_flow::{
    Command, Controller, FeedSupervisor, JobRegistry, TradingSession,
    feed::connector::UpstoxConnector,
    instrument::JsonFileDirectory,
    jobs::HttpRefreshJob,
    notify::{LogNotifier, Notifier, TelegramNotifier, notify_best_effort},
    offline::SessionReconciler,
    sink::{JsonLinesArchive, JsonLinesSink},
    token::{JsonFileTokenSource, TokenCache},
};
use rustls::crypto::ring::default_provider;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_logging();

    // Both the feed WebSocket and the REST clients use rustls
    let _ = default_provider().install_default();

    let config = ServerConfig::from_env()?;
    info!(
        feed_url = %config.feed_url,
        sink = %config.sink_path.display(),
        instruments = %config.instruments_path.display(),
        archive_ticks = config.supervisor.archive_ticks,
        "starting minute-flow server"
    );

    let shutdown = CancellationToken::new();

    let notifier: Arc<dyn Notifier> = match &config.telegram {
        Some(telegram) => Arc::new(TelegramNotifier::new(
            &telegram.bot_token,
            telegram.chat_id.clone(),
        )),
        None => {
            warn!("no Telegram credentials configured, operator notifications are logged only");
            Arc::new(LogNotifier)
        }
    };

    let sink = Arc::new(JsonLinesSink::open(&config.sink_path).await?);
    let tokens = Arc::new(TokenCache::new(Arc::new(JsonFileTokenSource::new(
        &config.tokens_path,
    ))));

    let supervisor = Arc::new(FeedSupervisor::new(
        config.supervisor.clone(),
        Arc::new(UpstoxConnector::new(config.feed_url.clone()).with_read_timeout(config.read_timeout)),
        Arc::new(JsonFileDirectory::new(config.instruments_path.clone())),
        Arc::clone(&tokens),
        sink.clone(),
        Arc::clone(&notifier),
    ));

    let jobs = Arc::new(JobRegistry::new(Arc::clone(&notifier), shutdown.child_token()));
    jobs.register(
        config.reconcile,
        Arc::new(SessionReconciler::new(
            Arc::new(JsonLinesArchive::new(&config.sink_path)),
            sink.clone(),
            TradingSession::default(),
        )),
    );
    if let Some(refresh) = &config.refresh {
        jobs.register(
            refresh.schedule,
            Arc::new(HttpRefreshJob::new("refresh", refresh.url.clone())),
        );
    }

    let controller = Controller::new(
        Arc::clone(&supervisor),
        Arc::clone(&jobs),
        tokens,
        config.supervisor.token_owner.clone(),
    );

    notify_best_effort(notifier.as_ref(), "minute-flow started!").await;

    if config.autostart {
        let reply = controller.execute(Command::StartTicker).await;
        info!(ok = reply.ok, reply = %reply, "autostart ticker");
    }

    let commands = tokio::spawn(command_loop(controller, shutdown.clone()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("shutdown requested"),
            Err(error) => warn!(%error, "failed to listen for shutdown signal"),
        },
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
    jobs.stop_all();
    if supervisor.stop().await.is_ok() {
        info!("feed supervisor drained and stopped");
    }
    commands.abort();

    notify_best_effort(notifier.as_ref(), "minute-flow stopped.").await;
    info!("minute-flow server stopped");
    Ok(())
}

/// Read operator commands from stdin, one per line, and print each reply.
async fn command_loop(controller: Controller, shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                let reply = controller.dispatch(&line).await;
                println!("{reply}");
            }
            Ok(None) => {
                debug!("stdin closed, operator commands disabled");
                break;
            }
            Err(error) => {
                warn!(%error, "failed to read operator command");
                break;
            }
        }
    }
}

/// Initialize logging
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
