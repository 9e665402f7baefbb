//! Entry point for the local background service: binds the stream mux and,
//! for each `InformInit`, assembles a Handler/Writer/Sender pipeline for
//! that run (§4.11, §5). Configuration is environment-only; argument
//! parsing is an out-of-scope external collaborator (§9 Non-goals).

use runcore::config::ServiceConfig;
use runcore::error::RuncoreResult;

#[tokio::main]
async fn main() -> RuncoreResult<()> {
    tracing_subscriber::fmt::init();
    let config = ServiceConfig::builder().build().apply_env();
    runcore::service::run(config).await
}
