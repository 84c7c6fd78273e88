mod poller;
mod supervisor;

use dc_acme::AcmeAuthority;
use dc_api::{build_router, state::ApiState};
use dc_common::config::EnvConfig;
use dc_common::events::EventBus;
use dc_dns::{DnsVerifier, HickoryTxtLookup};
use dc_issuance::{IssuanceSettings, Orchestrator};
use dc_store::SqliteDomainStore;
use poller::Poller;
use signal_hook::consts::SIGHUP;
use signal_hook_tokio::Signals;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use supervisor::{RestartPolicy, spawn_supervised};
use tokio::sync::Notify;
use tokio_stream::StreamExt;
use tracing::info;

/// The listener comes back as soon as the port frees up
const API_RESTART: RestartPolicy =
    RestartPolicy::always(Duration::from_millis(100), Duration::from_secs(30));
/// Pending domains must keep moving however long the store or CA is unavailable
const POLLER_RESTART: RestartPolicy =
    RestartPolicy::always(Duration::from_secs(1), Duration::from_secs(60));
/// Interval polling still runs without the SIGHUP shortcut
const SIGHUP_RESTART: RestartPolicy =
    RestartPolicy::limited(3, Duration::from_secs(5), Duration::from_secs(30));

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,dnscert=debug")),
        )
        .init();

    info!("dnscert starting...");

    // .env values are written into the process environment, before any worker thread exists
    let env = EnvConfig::load(None);
    env.validate()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(env))
}

async fn run(env: EnvConfig) -> anyhow::Result<()> {
    info!("ACME directory: {}", env.directory_url());

    let events = Arc::new(EventBus::new());

    let db_path = env.prepare_database_path()?;
    let store = Arc::new(SqliteDomainStore::open(&db_path)?);
    info!("Domain records at {}", db_path.display());

    let ca = Arc::new(AcmeAuthority::new(env.directory_url())?);

    let lookup = Arc::new(HickoryTxtLookup::new(&env.dns_nameservers, env.dns_timeout()));
    let dns = DnsVerifier::new(lookup);

    let orchestrator = Arc::new(
        Orchestrator::new(ca, store, dns, IssuanceSettings::from(&env))
            .with_events(events.issuance.clone()),
    );

    // ── API ────────────────────────────────────────────────────────────

    let api_port = env.api_port;
    let router = build_router(ApiState {
        orchestrator: orchestrator.clone(),
        env: Arc::new(env.clone()),
    });

    spawn_supervised("api", API_RESTART, move || {
        let router = router.clone();
        async move {
            let addr: SocketAddr = format!("[::]:{}", api_port).parse()?;
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("API listening on {}", addr);
            axum::serve(listener, router).await?;
            Ok(())
        }
    });

    // ── Poll scheduler ─────────────────────────────────────────────────

    let wake = Arc::new(Notify::new());
    let poller = Arc::new(Poller::new(
        orchestrator,
        events.issuance.clone(),
        env.poll_interval(),
        wake.clone(),
    ));

    spawn_supervised("poller", POLLER_RESTART, move || {
        let poller = poller.clone();
        async move { poller.run().await }
    });

    // ── SIGHUP: poll now ───────────────────────────────────────────────

    spawn_supervised("sighup", SIGHUP_RESTART, move || {
        let wake = wake.clone();
        async move { handle_sighup(wake).await }
    });

    info!("dnscert started, polling every {}s", env.poll_interval_secs);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    Ok(())
}

async fn handle_sighup(wake: Arc<Notify>) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGHUP])?;

    while let Some(signal) = signals.next().await {
        if signal == SIGHUP {
            info!("Received SIGHUP, running a poll pass");
            wake.notify_one();
        }
    }

    Ok(())
}
