//! credbroker-broker - human-in-the-loop credential broker
//!
//! holds pairing codes and live sessions in memory, exposes the six-endpoint
//! HTTP surface agents talk to, and bridges approved requests to the
//! terminal operator and the vault driver.
//!
//! usage:
//!   credbroker-broker --mode remote --port 5000
//!   credbroker-broker --mode local                  # same-process, no HTTP

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use clap::Parser;
use credbroker_core::vault::mock::MockVaultDriver;
use credbroker_core::VaultOrchestrator;
use credbroker_broker::audit::AuditLog;
use credbroker_broker::config::{Args, BrokerConfig, Mode};
use credbroker_broker::dispatcher::{ApprovalDispatcher, TerminalPrompter};
use credbroker_broker::registry::{NullNotifier, PairingRegistry};
use credbroker_broker::router::{build_router, AppState};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config: BrokerConfig = args.into();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    if let Err(e) = PrometheusBuilder::new()
        .with_http_listener((config.bind, config.metrics_port))
        .install()
    {
        warn!(error = %e, "failed to install prometheus exporter, continuing without metrics");
    }

    // TODO: wire in the real vault driver once its subprocess contract is
    // finalized; the in-memory mock satisfies the same VaultDriver trait.
    let vault = MockVaultDriver::new(Vec::<u8>::new());
    let dispatcher = ApprovalDispatcher::new(TerminalPrompter, VaultOrchestrator::new(vault), config.approval_wait);

    let registry = PairingRegistry::new(NullNotifier, config.pairing_ttl, config.session_ttl);

    let audit = match &config.audit_log_path {
        Some(path) => match AuditLog::open(path) {
            Ok(log) => log,
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to open audit log");
                return ExitCode::from(2);
            }
        },
        None => AuditLog::disabled(),
    };

    let state = Arc::new(AppState {
        registry,
        dispatcher,
        audit,
        started_at: chrono::Utc::now(),
    });

    spawn_sweeper(state.clone(), config.sweep_interval);

    match config.mode {
        Mode::Local => {
            info!("running in local mode: no HTTP surface, agent and broker share this process");
            // local-mode callers embed `credbroker_broker::router::AppState`
            // directly and call registry/dispatcher methods in-process; this
            // binary just idles so the CLI invocation has observable behavior.
            tokio::signal::ctrl_c().await.ok();
            info!("interrupt received, shutting down");
            ExitCode::from(130)
        }
        Mode::Remote => run_remote(state, &config).await,
    }
}

async fn run_remote(state: Arc<AppState<TerminalPrompter, MockVaultDriver>>, config: &BrokerConfig) -> ExitCode {
    let router = build_router(state);
    let addr = std::net::SocketAddr::new(config.bind, config.port);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind broker listener");
            return ExitCode::from(2);
        }
    };
    info!(%addr, "credbroker-broker listening");

    let interrupted = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let serve = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(interrupted.clone()));
    match serve.await {
        Ok(()) if interrupted.load(std::sync::atomic::Ordering::SeqCst) => ExitCode::from(130),
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "broker server exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal(interrupted: Arc<std::sync::atomic::AtomicBool>) {
    tokio::signal::ctrl_c().await.ok();
    interrupted.store(true, std::sync::atomic::Ordering::SeqCst);
    info!("shutdown signal received");
}

fn spawn_sweeper<P, D>(state: Arc<AppState<P, D>>, interval: StdDuration)
where
    P: credbroker_broker::dispatcher::ApprovalPrompter + 'static,
    D: credbroker_core::VaultDriver + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            state.registry.sweep();
            metrics::gauge!("credbroker_active_sessions").set(state.registry.session_count() as f64);
        }
    });
}
