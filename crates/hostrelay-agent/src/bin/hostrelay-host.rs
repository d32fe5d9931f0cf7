//! Hostrelay Execution Host Binary
//!
//! Spawned by the agent, one per host key. Speaks the frame protocol over
//! stdin/stdout; logs go to stderr.

use hostrelay_agent::execution_host::HOST_KEY_ENV;
use hostrelay_agent::handlers::{
    EchoHandler, ExecHandler, ManagementHandler, ECHO_KIND, EXEC_KIND, MANAGEMENT_KIND,
};
use hostrelay_agent::worker::WorkerLoop;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let host_key = std::env::var(HOST_KEY_ENV).unwrap_or_default();
    info!("Starting execution host for '{}' (pid {})", host_key, std::process::id());

    let mut worker = WorkerLoop::new();
    worker.register_handler(MANAGEMENT_KIND, Arc::new(ManagementHandler::new(host_key))).await;
    worker.register_handler(ECHO_KIND, Arc::new(EchoHandler)).await;
    worker.register_handler(EXEC_KIND, Arc::new(ExecHandler)).await;

    let code = match worker.run().await {
        Ok(()) => 0,
        Err(e) => {
            error!("Execution host error: {:#}", e);
            1
        }
    };

    // Exit directly: a pending blocking stdin read would otherwise hold the runtime open
    std::process::exit(code);
}
