//! `agent-gatewayd`: boots one gateway instance and serves the execution RPC
//! until shutdown.
//!
//! Startup order is fixed: tracing, configuration, sandbox gate, gateway,
//! listener. The sandbox gate terminates the process before anything else is
//! built when isolation cannot be verified.

use std::sync::Arc;

use agent_gateway::server;
use anyhow::Context;
use async_trait::async_trait;
use gateway_adapters::{
    BackendError, BackendRequest, BackendResult, BackendStream, ConversationBackend,
    SecretStoreBroker,
};
use gateway_config::ConfigLoader;
use gateway_kernel::Gateway;
use gateway_sandbox::SandboxGate;
use gateway_telemetry::init_tracing;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Backend placeholder used until an embedder attaches a real one.
struct DetachedBackend;

#[async_trait]
impl ConversationBackend for DetachedBackend {
    fn name(&self) -> &str {
        "detached"
    }

    async fn open(&self, _request: BackendRequest) -> BackendResult<BackendStream> {
        Err(BackendError::Configuration {
            reason: "no conversational backend attached to this process".into(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(None).context("failed to install tracing subscriber")?;

    let config = ConfigLoader::from_env()
        .load()
        .context("failed to load gateway configuration")?;
    let clearance = SandboxGate::new(&config.sandbox).enforce();

    let mut builder = Gateway::builder().backend(Arc::new(DetachedBackend));
    if config.secret_store.base_url.is_some() {
        let broker = SecretStoreBroker::new(&config.secret_store)
            .context("failed to configure secret store broker")?;
        builder = builder.broker(Arc::new(broker));
    } else {
        warn!("no secret store configured; approvals will be rejected");
    }
    let gateway = Arc::new(
        builder
            .build(&config, clearance)
            .context("failed to build gateway")?,
    );

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    let draining = Arc::clone(&gateway);
    server::serve(listener, Arc::clone(&gateway), async move {
        shutdown_signal().await;
        draining.destroy().await;
    })
    .await
    .context("execution rpc server failed")?;
    gateway.destroy().await;

    for record in gateway.health().snapshot() {
        info!(
            service = %record.service(),
            status = record.status().as_str(),
            failures = record.failure_count(),
            "final service health"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
