// ABOUTME: HTTP server entry point — wires the Engine into the Axum router and serves it.
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use claude_oauth_broker::{config::EngineConfig, logging, routes, Engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logging_config = logging::LoggingConfig::from_env();
    logging::init(&logging_config);

    let config = EngineConfig::from_env();
    let engine = Engine::new(config)?;

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8089".to_string());
    logging::log_startup_info(&logging_config, &bind_addr);

    let app = routes::router(engine.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }

    engine.shutdown().await;
    Ok(())
}
