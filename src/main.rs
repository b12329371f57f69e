use std::{process, time::Duration};

use cachet::{
    cache::HttpCache,
    config,
    infra::{
        error::InfraError,
        http::{self, ProxyState},
        proxy::ReverseProxy,
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
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

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), InfraError> {
    let upstream = ReverseProxy::new(
        settings.upstream.url.clone(),
        settings.cache.backend_timeout(),
        settings.cache.max_body_bytes,
    )?;
    let cache = HttpCache::new(settings.cache.clone(), Vec::new())
        .map_err(|err| InfraError::configuration(err.to_string()))?;

    let router = http::build_router(ProxyState { cache, upstream });
    let listener = tokio::net::TcpListener::bind(settings.server.addr).await?;

    info!(
        addr = %settings.server.addr,
        upstream = %settings.upstream.url,
        cache = %settings.cache.cache_name,
        "cachet listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal(settings.server.graceful_shutdown))
        .await?;

    info!("cachet stopped");
    Ok(())
}

/// Resolves on Ctrl-C. A second Ctrl-C or the grace period elapsing forces
/// the process down while connections are still draining.
async fn shutdown_signal(grace: Duration) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(grace_secs = grace.as_secs(), "shutdown requested, draining connections");

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(grace) => {
                warn!("grace period elapsed, exiting");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("second interrupt, exiting");
            }
        }
        process::exit(1);
    });
}
