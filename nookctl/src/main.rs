use clap::Parser;
use nookctl::{Application, Config, telemetry};

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

/// Print a one-shot report as JSON, returning whether it recorded any failures.
fn print_report<T: serde::Serialize>(report: &T, failures: usize) -> anyhow::Result<bool> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(failures == 0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before anything else that might build a TLS client
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Parse CLI args
    let args = nookctl::config::Args::parse();

    // Load configuration
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    // Initialize telemetry (tracing + optional OpenTelemetry)
    telemetry::init_telemetry(config.enable_otel_export)?;

    tracing::debug!("{:?}", args);

    let app = Application::new(config).await?;

    // One-shot maintenance modes run to completion and exit
    if args.bootstrap || args.bulk_sync {
        let ok = if args.bootstrap {
            let report = app.bootstrap().await?;
            print_report(&report, report.failed.len())?
        } else {
            let report = app.bulk_sync().await?;
            print_report(&report, report.failures.len())?
        };
        telemetry::shutdown_telemetry();
        if !ok {
            std::process::exit(1);
        }
        return Ok(());
    }

    // Run the application with graceful shutdown on SIGTERM/Ctrl+C
    let shutdown = shutdown_signal();
    app.serve(shutdown).await
}
