//! Resilience node.
//!
//! Runs the registry, instance health checks, the health monitor and the
//! admin API in one process.
//!
//! ```text
//!   ┌──────────────────────────── resilience-node ────────────────────────────┐
//!   │                                                                         │
//!   │  ┌─────────────┐   probes   ┌───────────────┐   select   ┌───────────┐  │
//!   │  │HealthChecker│──────────▶│   Registry    │◀──────────│LoadBalancer│  │
//!   │  └─────────────┘            │(memory/consul)│            └───────────┘  │
//!   │                             └───────────────┘                           │
//!   │  ┌─────────────────────── FaultToleranceManager ──────────────────────┐ │
//!   │  │ fallback → circuit breaker → retry → bulkhead → timeout → call      │ │
//!   │  │ failure detector · health monitor                                   │ │
//!   │  └─────────────────────────────────────────────────────────────────────┘ │
//!   │  ┌───────────┐                                                          │
//!   │  │ admin API │  /admin/status /admin/services /admin/resilience ...     │
//!   │  └───────────┘                                                          │
//!   └─────────────────────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;

use service_resilience::admin::{self, AdminState};
use service_resilience::config::{load_config, ResilienceConfig};
use service_resilience::discovery::Registration;
use service_resilience::lifecycle::{wait_for_signal, ResilienceContext, StartupError};
use service_resilience::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "resilience-node")]
#[command(about = "Service discovery and fault tolerance node", long_about = None)]
struct Args {
    /// TOML configuration file. Defaults are used when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Register this node under the given service name.
    #[arg(long)]
    service_name: Option<String>,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Health check path or URL for the self-registration.
    #[arg(long)]
    health_check_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ResilienceConfig::default(),
    };

    logging::init_logging(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "resilience-node starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let ctx = ResilienceContext::from_config(config)?;
    ctx.start();

    if ctx.config().admin.enabled {
        serve_admin(&ctx).await?;
    }

    if let Some(name) = &args.service_name {
        let mut registration = Registration::new(name.clone(), args.host.clone(), args.port);
        if let Some(url) = &args.health_check_url {
            registration = registration.with_health_check_url(url.clone());
        }
        ctx.discovery().register_self(registration).await?;
    }

    wait_for_signal().await;
    ctx.shutdown().await;
    Ok(())
}

async fn serve_admin(ctx: &ResilienceContext) -> Result<(), StartupError> {
    let address = ctx.config().admin.bind_address.clone();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|source| StartupError::Bind {
            address: address.clone(),
            source,
        })?;
    tracing::info!(address = %address, "Admin API listening");

    let app = admin::router(AdminState::from_context(ctx));
    let mut shutdown = ctx.shutdown_signal().subscribe();
    ctx.spawn_task(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Admin API stopped with error");
        }
    }));
    Ok(())
}
