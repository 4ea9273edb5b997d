//! strata-vault binary entry point.
//!
//! Usage:
//! ```bash
//! strata-vault --config vault.toml
//! strata-vault --config vault.toml ban mallory --reason abuse
//! strata-vault --config vault.toml unban mallory
//! strata-vault --config vault.toml rotate-cert --reason "key compromise"
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use strata_vault_server::{http, storage, Config, VaultServer};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Authenticated, permissioned file storage server.
#[derive(Parser, Debug)]
#[command(name = "strata-vault")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults are used when it does not exist)
    #[arg(long, short, default_value = "vault.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the server (default)
    Serve,

    /// Ban a user and end their session
    Ban {
        /// Account to ban
        username: String,

        /// Short reason recorded with the ban
        #[arg(long, default_value = "banned by operator")]
        reason: String,

        /// Longer description
        #[arg(long)]
        description: Option<String>,
    },

    /// Lift a user's active ban
    Unban {
        /// Account to unban
        username: String,
    },

    /// Replace the server certificate and record a signed rollover
    RotateCert {
        /// Reason recorded with the rollover
        #[arg(long, default_value = "periodic rotation")]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    } else {
        Config::default()
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db = storage::connect(
        &config.database.path,
        config.database.total_connections() as u32,
    )
    .await
    .context("Failed to open database")?;
    let server = VaultServer::start(config, db)
        .await
        .context("Failed to start server")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => return serve(server).await,
        Commands::Ban {
            username,
            reason,
            description,
        } => {
            let banned = server
                .auth()
                .ban(&username, &reason, description.as_deref())
                .await
                .context("Ban failed")?;
            if banned {
                println!("Banned {username}");
            } else {
                println!("{username} is already banned");
            }
        }
        Commands::Unban { username } => {
            if server.auth().unban(&username).await.context("Unban failed")? {
                println!("Unbanned {username}");
            } else {
                println!("{username} has no active ban");
            }
        }
        Commands::RotateCert { reason } => {
            let record = server
                .rotate_certificate(&reason)
                .await
                .context("Certificate rotation failed")?;
            println!(
                "Rotated certificate {} (rollover valid until {})",
                record.old_fingerprint, record.valid_until
            );
        }
    }

    // Admin commands still start the background writers; drain them so
    // the activity entries they logged reach the database.
    let report = server.shutdown().await;
    if !report.is_clean() {
        tracing::warn!("Shutdown was not clean: {:?}", report);
    }
    Ok(())
}

async fn serve(server: Arc<VaultServer>) -> Result<()> {
    http::health::init_start_time();

    let listener = TcpListener::bind(&server.config().server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", server.config().server.bind_address))?;

    if server.config().http.enabled {
        let http_listener = TcpListener::bind(&server.config().http.bind_address)
            .await
            .with_context(|| format!("Failed to bind {}", server.config().http.bind_address))?;
        tracing::info!("HTTP endpoints on {}", http_listener.local_addr()?);
        let router = http::build_router(server.clone());
        let cancel = server.coordinator().connection_token();
        server.coordinator().spawn_background(async move {
            let result = axum::serve(http_listener, router)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!("HTTP server failed: {}", e);
            }
        });
    }

    let accept = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, draining connections");
    // Cancelling the connection token also stops the accept loop.
    let report = server.shutdown().await;
    tracing::info!("Drain finished: {:?}", report);
    accept.await.context("Accept loop panicked")??;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
