//! Hostrelay Agent Binary
//!
//! Runs a one-shot management directive or serves client sessions until a
//! termination signal arrives.

use anyhow::{Context, Result};
use clap::Parser;
use hostrelay_agent::cli::{redacted_args, AgentCli};
use hostrelay_agent::management::run_management;
use hostrelay_agent::AgentServer;
use tracing::{error, info, trace};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = match AgentCli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version print to stdout and succeed; any other CLI error exits 1
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    // Initialize tracing; stdout is reserved for command output
    let filter = match cli.log.as_deref() {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: AgentCli) -> Result<()> {
    trace!("Arguments: {:?}", redacted_args(std::env::args()));

    let config = cli.resolve().context("Failed to resolve configuration")?;
    config.dirs.ensure()?;

    if let Some(command) = &config.management {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        run_management(command, &config.dirs, &mut out)?;
        return Ok(());
    }

    if cli.connection_token.is_none() {
        println!("Connection token: {}", config.token.expose());
    }

    let server = AgentServer::bind(config).await?;
    let handle = server.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        handle.shutdown();
    });

    server.run().await?;
    info!("Agent exited");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received interrupt"),
                _ = term.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            error!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received interrupt");
}
