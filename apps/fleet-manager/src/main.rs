use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use fleet_manager::config::AppConfig;
use fleet_manager::routes;
use fleet_manager::state::FleetState;
use fleet_manager::store::InMemoryInstanceConfigStore;
use fleet_manager::telemetry::init_tracing;
use fleet_manager::variants::VariantRegistry;
use panel_client::{ApiGateway, ConnectionLatch, Dispatcher, HttpTransport, SessionManager};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cfg = match AppConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&cfg.log_filter);

    match run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "fleet manager stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: AppConfig) -> anyhow::Result<()> {
    let settings = cfg.validate().context("configuration rejected")?;
    let transport = HttpTransport::new(&settings.panel_url, settings.request_timeout)
        .context("building panel transport")?;
    info!(
        panel = %settings.panel_url,
        user = %settings.credentials.username,
        two_factor = settings.credentials.otp.is_some(),
        elevated = settings.engine.elevated,
        poll_ms = settings.engine.poll_interval.as_millis() as u64,
        reconcile_secs = settings.engine.reconcile_interval.as_secs(),
        budget = settings.engine.message_budget,
        bind = %settings.bind_addr,
        build = env!("FLEET_BUILD_ID"),
        "starting fleet-manager"
    );

    let dispatcher = Dispatcher::new(
        Arc::new(transport),
        ConnectionLatch::new(),
        settings.retry.clone(),
    );
    let gateway = ApiGateway::new(SessionManager::new(dispatcher, settings.credentials.clone()));
    let state = FleetState::new(
        gateway,
        settings.engine.clone(),
        VariantRegistry::with_defaults(),
        InMemoryInstanceConfigStore::new(),
    );

    state.startup().await.context("startup failed")?;
    let mut reconcile = state.spawn_reconcile_loop();

    let app: Router = routes::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("binding {}", settings.bind_addr))?;
    let shutdown = state.shutdown_token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    let halted = state.shutdown_token();
    tokio::select! {
        _ = halted.cancelled() => {}
        joined = &mut reconcile => {
            if let Err(err) = joined {
                state
                    .halt_signal()
                    .trigger(format!("reconciliation task ended: {err}"));
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "failed to listen for ctrl-c");
            }
            info!("interrupt received; shutting down");
        }
    }

    let cause = state.halt_signal().cause();
    state.halt_signal().token().cancel();
    state.shutdown().await;
    reconcile.abort();
    match server.await {
        Ok(Err(err)) => warn!(error = %err, "admin server ended with error"),
        Err(err) => warn!(error = %err, "admin server task failed"),
        Ok(Ok(())) => {}
    }

    match cause {
        Some(cause) => Err(anyhow::anyhow!(cause)),
        None => Ok(()),
    }
}
