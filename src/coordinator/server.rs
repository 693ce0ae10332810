//! Coordinator server
//!
//! Binds the node port (TCP), the HTTP API and the discovery responder
//! (UDP), then runs them with the health monitor until shutdown.

use crate::common::{local_ip, CoordinatorConfig, Result};
use crate::coordinator::discovery::{run_discovery, Advertised};
use crate::coordinator::health::run_health_monitor;
use crate::coordinator::http::{create_router, CoordState};
use crate::coordinator::session::{handle_connection, SessionSettings};
use crate::coordinator::state::Coordinator;
use futures_util::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

pub struct CoordinatorServer {
    config: CoordinatorConfig,
    coordinator: Arc<Coordinator>,
    node_listener: TcpListener,
    http_listener: TcpListener,
    discovery_socket: UdpSocket,
}

impl CoordinatorServer {
    /// Load persisted state from `config.data_dir` and bind every socket.
    pub async fn bind(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let coordinator = Arc::new(Coordinator::open(&config)?);
        Self::bind_with(config, coordinator).await
    }

    /// Bind around an existing coordinator.
    pub async fn bind_with(config: CoordinatorConfig, coordinator: Arc<Coordinator>) -> Result<Self> {
        let node_listener = TcpListener::bind(config.node_addr).await?;
        let http_listener = TcpListener::bind(config.http_addr).await?;
        let discovery_socket = UdpSocket::bind(config.discovery_addr).await?;
        discovery_socket.set_broadcast(true)?;

        Ok(Self {
            config,
            coordinator,
            node_listener,
            http_listener,
            discovery_socket,
        })
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    pub fn node_addr(&self) -> Result<SocketAddr> {
        Ok(self.node_listener.local_addr()?)
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(self.http_listener.local_addr()?)
    }

    pub fn discovery_addr(&self) -> Result<SocketAddr> {
        Ok(self.discovery_socket.local_addr()?)
    }

    /// Address handed to nodes through discovery
    fn advertised(&self) -> Result<Advertised> {
        let node_addr = self.node_addr()?;
        let ip = match self.config.advertise_ip {
            Some(ip) => ip,
            None if node_addr.ip().is_unspecified() => local_ip(),
            None => node_addr.ip(),
        };
        Ok(Advertised {
            ip: ip.to_string(),
            port: node_addr.port(),
        })
    }

    /// Run until ctrl-c.
    pub async fn serve(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutdown requested"),
                Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
            }
            let _ = shutdown_tx.send(true);
        });
        self.run(shutdown_rx).await
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let advertised = self.advertised()?;
        let settings = SessionSettings::from(&self.config);

        tracing::info!("starting coordinator");
        tracing::info!("  node port: {}", self.node_addr()?);
        tracing::info!("  HTTP API: {}", self.http_addr()?);
        tracing::info!("  discovery: {}", self.discovery_addr()?);
        tracing::info!("  advertised: {}:{}", advertised.ip, advertised.port);
        tracing::info!("  data dir: {}", self.config.data_dir.display());
        tracing::info!("  replicas: {}", self.config.replicas);

        let monitor = tokio::spawn(run_health_monitor(
            self.coordinator.clone(),
            self.config.heartbeat_interval(),
            self.config.heartbeat_timeout(),
            shutdown.clone(),
        ));

        let discovery = tokio::spawn(run_discovery(
            self.discovery_socket,
            self.coordinator.clone(),
            advertised.clone(),
            shutdown.clone(),
        ));

        let router = create_router(CoordState {
            coordinator: self.coordinator.clone(),
            advertised,
        });
        let http_listener = self.http_listener;
        let mut http_shutdown = shutdown.clone();
        let http = tokio::spawn(async move {
            let server = axum::serve(
                http_listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.wait_for(|stop| *stop).await;
            });
            if let Err(e) = server.await {
                tracing::error!(error = %e, "HTTP server error");
            }
        });

        tracing::info!("coordinator ready");

        loop {
            tokio::select! {
                accepted = self.node_listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        tokio::spawn(handle_connection(stream, peer, self.coordinator.clone(), settings));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for result in join_all([monitor, discovery, http]).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!("coordinator stopped");
        Ok(())
    }
}
