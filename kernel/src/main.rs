//! Barrier kernel daemon: opens the database and runs the poller until shutdown.

use barrier_kernel::infrastructure::{audit, config::Settings, telemetry::TelemetryBuilder};
use barrier_kernel::BarrierKernel;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1);
    let config = Settings::load(config_path.as_deref())?;

    TelemetryBuilder::from_settings(&config.telemetry, env!("CARGO_PKG_VERSION"))?.init()?;

    info!("Barrier Kernel Starting...");
    audit::log_audit(&audit::AuditEvent::SystemStartup {
        component: "Kernel".into(),
    });

    let kernel = BarrierKernel::new(&config).await?;

    let token = CancellationToken::new();
    let poller = kernel.spawn_poller(&token);
    if poller.is_none() {
        info!("Barrier poller disabled");
    }

    info!("Barrier Kernel Initialized. Waiting for shutdown signal...");

    shutdown_signal().await;

    info!("Shutdown signal received, cleaning up...");
    token.cancel();
    if let Some(handle) = poller {
        if let Err(e) = handle.await {
            error!(error = %e, "Barrier poller task failed");
        }
    }
    kernel.pool().close().await;

    audit::log_audit(&audit::AuditEvent::SystemShutdown {
        reason: "Signal received".into(),
    });

    info!("Barrier Kernel Shutdown Complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
