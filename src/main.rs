use std::{process, sync::Arc};

use boardsync::{
    cache::{
        AutoRefresh, CacheConfig, CacheKey, InvalidationManager, NotificationBadge, PageSource,
        PollingSafetyNet, QueryClient, Refresh, log_events,
    },
    config::{self, LoadError, Settings},
    infra::{data_service::HttpDataService, error::InfraError, telemetry},
};
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("no boards to watch (use --board or `source.boards`)")]
    NoBoards,
    #[error("observers need a tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args
        .command
        .unwrap_or(config::Command::Watch(config::WatchArgs::default()))
    {
        config::Command::Watch(_) => run_watch(settings).await,
    }
}

async fn run_watch(settings: Settings) -> Result<(), AppError> {
    let boards = settings.source.boards.clone();
    if boards.is_empty() {
        return Err(AppError::NoBoards);
    }

    let cache_config = CacheConfig::from(&settings.cache);
    let manager = InvalidationManager::init(cache_config.clone());
    let service = Arc::new(HttpDataService::new(
        settings.source.base_url.clone(),
        settings.source.request_timeout,
        Arc::clone(&manager),
    )?);
    let query = Arc::new(QueryClient::new(
        Arc::clone(manager.store()),
        service as Arc<dyn PageSource>,
        &cache_config,
    ));

    let limit = settings.source.page_limit.get();
    for board in &boards {
        let key = CacheKey::page(board.clone(), 1, limit, None);
        match query.page(&key).await {
            Ok(read) => info!(
                collection = %board,
                items = read.entry.items.len(),
                total = read.entry.page_info.total,
                "Primed first page"
            ),
            Err(err) => warn!(
                collection = %board,
                error = %err,
                "Failed to prime first page, relying on polling"
            ),
        }
    }

    let mut subscriptions = Vec::with_capacity(boards.len());
    let mut badges = Vec::with_capacity(boards.len());
    let mut auto_refreshers = Vec::with_capacity(boards.len());
    for board in &boards {
        subscriptions.push(log_events(&manager, board.clone()));
        badges.push(NotificationBadge::attach(&manager, board.clone()));
        auto_refreshers.push(AutoRefresh::attach(
            &manager,
            board.clone(),
            Arc::clone(&query) as Arc<dyn Refresh>,
            cache_config.auto_refresh_min_interval(),
        )?);
    }

    let polling = PollingSafetyNet::spawn(
        Arc::clone(&query) as Arc<dyn Refresh>,
        boards.clone(),
        cache_config.poll_interval(),
    );

    info!(
        boards = boards.len(),
        base_url = %settings.source.base_url,
        poll_interval_secs = cache_config.poll_interval().as_secs(),
        "Watching boards"
    );

    let shutdown = tokio::signal::ctrl_c().await.map_err(InfraError::from);

    polling.stop();
    for (board, badge) in boards.iter().zip(&badges) {
        info!(collection = %board, created = badge.count(), "Unseen new posts");
    }
    drop(auto_refreshers);
    drop(badges);
    drop(subscriptions);
    manager.dispose();

    shutdown?;
    info!("Shut down");
    Ok(())
}
