// src/main.rs
//! AutoX script engine
//!
//! `autox-engine script.js ...` runs the given scripts and exits non-zero if
//! any of them fails. Without arguments the engine serves the IPC protocol
//! until interrupted.

use anyhow::{Context, Result};
use autox_engine::console::ConsoleEvent;
use autox_engine::ipc::IpcServer;
use autox_engine::observability::{init_metrics, init_tracing};
use autox_engine::{
    EngineController, ExecutionConfig, NoopListener, RuntimeConfig, ScriptRuntime, ScriptSource,
    TaskState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    info!("Starting AutoX engine v{}", autox_engine::VERSION);

    let config = RuntimeConfig::load().context("loading configuration")?;
    info!("Configuration loaded: {:?}", config);

    if config.server.metrics_port != 0 {
        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.metrics_port)
            .parse()
            .context("invalid metrics address")?;
        init_metrics(addr)?;
    }

    let runtime = Arc::new(ScriptRuntime::new(config.clone()));
    let controller = EngineController::new(runtime)?;

    let scripts: Vec<String> = std::env::args().skip(1).collect();
    if scripts.is_empty() {
        serve(controller, &config).await
    } else {
        run_scripts(controller, scripts).await
    }
}

async fn run_scripts(controller: EngineController, scripts: Vec<String>) -> Result<()> {
    let _printer = controller.runtime().console().subscribe_fn(|event| {
        if let ConsoleEvent::Log { entry } = event {
            println!("{}", entry.content);
        }
    });

    let mut failed = 0;
    for script in scripts {
        let task = controller.run_script(
            ScriptSource::from_file(&script),
            ExecutionConfig::default(),
            Arc::new(NoopListener),
        );
        let done = controller.wait(task.id).await?;
        match done.state {
            TaskState::Succeeded => info!("{} finished", script),
            state => {
                failed += 1;
                error!(
                    "{} {}: {}",
                    script,
                    state.as_str(),
                    done.error.as_deref().unwrap_or("no error recorded")
                );
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} script(s) did not succeed", failed);
    }
    Ok(())
}

async fn serve(controller: EngineController, config: &RuntimeConfig) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
        info!("Received shutdown signal, cleaning up...");
    };

    IpcServer::new(controller.clone())
        .serve_tcp(listener, shutdown)
        .await?;

    let stopped = controller.stop_all_scripts();
    info!("Stopped {} running scripts", stopped);
    controller.wait_all().await;
    info!("Server stopped gracefully");
    Ok(())
}
