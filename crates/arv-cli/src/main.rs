use anyhow::{Context, Result};
use arv_sync::SyncRuntime;
use arv_web::AppState;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "arv")]
#[command(about = "App Store review sync service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API and the periodic sync until interrupted.
    Serve,
    /// Run a single reconciliation and exit.
    Sync,
    /// Track a new app and pull its recent reviews.
    AddApp { app_id: String },
    /// Print reviews from the last 48 hours for an app.
    Recent { app_id: String },
    /// List tracked apps.
    Apps,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await?,
        Commands::Sync => {
            let summary = arv_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} apps={} fetched={} merged={} failures={}",
                summary.run_id,
                summary.apps,
                summary.fetched_reviews,
                summary.merged_reviews,
                summary.failures.len()
            );
            for failure in &summary.failures {
                eprintln!(
                    "  {} failed during {:?}: {}",
                    failure.app_id, failure.stage, failure.message
                );
            }
        }
        Commands::AddApp { app_id } => {
            let runtime = SyncRuntime::from_env().await?;
            let app = runtime
                .service
                .add_app(&app_id)
                .await
                .with_context(|| format!("adding app {app_id}"))?;
            println!("tracking app {}", app.id());
        }
        Commands::Recent { app_id } => {
            let runtime = SyncRuntime::from_env().await?;
            let reviews = runtime
                .service
                .recent_reviews(&app_id)
                .await
                .with_context(|| format!("loading recent reviews for {app_id}"))?;
            println!("{}", serde_json::to_string_pretty(&reviews)?);
        }
        Commands::Apps => {
            let runtime = SyncRuntime::from_env().await?;
            let apps = runtime.service.apps().await.context("listing tracked apps")?;
            for app in apps {
                println!("{}", app.id());
            }
        }
    }

    Ok(())
}

async fn serve() -> Result<()> {
    let runtime = SyncRuntime::from_env().await?;
    if runtime.scheduler_enabled {
        runtime.scheduler.start();
    } else {
        info!("periodic sync disabled");
    }

    let port = arv_web::port_from_env();
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    let result = arv_web::serve(
        listener,
        AppState::new(runtime.service.clone()),
        wait_for_shutdown_signal(),
    )
    .await;

    runtime.scheduler.stop().await;
    result
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable; waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_json = std::env::var("ARV_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);

    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
