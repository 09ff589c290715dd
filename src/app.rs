//! src/app.rs
//!
//! Top-level wiring: brings up the gossip engine, cluster registry,
//! upstream manager, tunnel listener, and request router, and drives
//! graceful shutdown in the order the spec requires — stop accepting new
//! work, announce `left`, drain for the configured grace period, then
//! force close whatever remains.

use crate::config::Config;
use crate::domain::{KEY_STATUS, STATUS_ACTIVE};
use crate::error::{Error, Result};
use crate::gossip::GossipEngine;
use crate::registry::ClusterRegistry;
use crate::router::{self, RouterState};
use crate::tunnel::listener as tunnel_listener;
use crate::upstream::UpstreamManager;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub struct App {
    config: Config,
    shutdown: CancellationToken,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self { config, shutdown: CancellationToken::new() })
    }

    /// A handle callers can use to trigger shutdown from outside `run()`
    /// (e.g. a signal handler installed by the binary).
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let shutdown = self.shutdown;

        let (engine, gossip) = GossipEngine::bind(
            config.gossip_addr,
            config.gossip.clone(),
            std::time::Duration::from_secs(config.node_expiry_secs),
        )
        .await?;
        let gossip_join = tokio::spawn(engine.run(shutdown.clone()));

        if !config.join_addrs.is_empty() {
            if let Err(e) = gossip.join(config.join_addrs.clone()).await {
                tracing::warn!(addrs = ?config.join_addrs, error = %e, "failed to join cluster seeds");
            }
        }

        let registry = ClusterRegistry::spawn(gossip.clone(), shutdown.clone());
        registry
            .announce_local(config.proxy_addr, config.upstream_addr, STATUS_ACTIVE)
            .await?;
        tracing::info!(key = KEY_STATUS, status = STATUS_ACTIVE, "announced local node as active");

        let upstream = UpstreamManager::new(registry.clone(), config.rebalance.clone());
        upstream.spawn_rebalancer(shutdown.clone());

        let tls_acceptor = None; // TLS termination for the upstream listener is left to a front-end proxy; see DESIGN.md.
        let tunnel_shutdown = shutdown.clone();
        let tunnel_config = config.tunnel.clone();
        let tunnel_upstream = upstream.clone();
        let tunnel_addr = config.upstream_addr;
        let tunnel_join = tokio::spawn(async move {
            if let Err(e) = tunnel_listener::run(tunnel_addr, tls_acceptor, tunnel_config, tunnel_upstream, tunnel_shutdown).await {
                tracing::error!(error = %e, "upstream tunnel listener exited with error");
            }
        });

        let router_state = RouterState { upstream: upstream.clone(), registry: registry.clone(), config: config.router.clone() };
        let router_app = router::build(router_state);
        let proxy_listener = TcpListener::bind(config.proxy_addr).await.map_err(Error::Io)?;
        tracing::info!(addr = %config.proxy_addr, "downstream proxy listener started");
        let router_shutdown = shutdown.clone();
        let router_join = tokio::spawn(async move {
            axum::serve(proxy_listener, router_app)
                .with_graceful_shutdown(async move { router_shutdown.cancelled().await })
                .await
        });

        shutdown_on_signal(shutdown.clone());
        shutdown.cancelled().await;
        tracing::info!("shutdown requested, announcing departure");

        if let Err(e) = gossip.leave().await {
            tracing::warn!(error = %e, "failed to announce cluster departure");
        }

        let grace = std::time::Duration::from_secs(config.grace_period_secs);
        tracing::info!(?grace, "draining in-flight connections");
        tokio::time::sleep(grace).await;

        let _ = router_join.await;
        let _ = tunnel_join.await;
        gossip_join.await.map_err(Error::TaskJoin)?;

        Ok(())
    }
}

fn shutdown_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}
