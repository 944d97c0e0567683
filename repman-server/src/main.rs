use anyhow::Result;
use clap::{Parser, Subcommand};
use repman::config::ManagerConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "repman", about = "Replication cluster manager for MariaDB and MySQL")]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the manager and serve the admin API.
    Run {
        /// Path to the TOML configuration.
        #[arg(short, long)]
        config: PathBuf,
        /// Overrides `manager.admin_addr` of the configuration.
        #[arg(long, env = "REPMAN_ADMIN_ADDR")]
        admin_addr: Option<SocketAddr>,
    },
    /// Validate a configuration and print it with defaults filled in.
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn init_tracing() {
    let format = tracing_subscriber::fmt::format()
        .with_target(false)
        .with_thread_names(true)
        .compact();
    tracing_subscriber::fmt()
        .event_format(format)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("repman=info")),
        )
        .init();
}

async fn run(config: ManagerConfig) -> Result<()> {
    let addr = config.manager.admin_addr;
    let manager = Arc::new(repman::Manager::start(config).await?);

    let admin_svc = repman::service::admin::new(manager.clone());
    let reflection_svc = repman::service::reflection::new()?;

    info!("admin api listening on {addr}");
    tonic::transport::Server::builder()
        .add_service(admin_svc)
        .add_service(reflection_svc)
        .serve_with_shutdown(addr, async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown requested");
        })
        .await?;

    manager.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match args.cmd {
        Cmd::Run { config, admin_addr } => {
            init_tracing();
            let mut config = ManagerConfig::load(&config)?;
            if let Some(addr) = admin_addr {
                config.manager.admin_addr = addr;
            }
            run(config).await
        }
        Cmd::CheckConfig { config } => {
            let config = ManagerConfig::load(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
