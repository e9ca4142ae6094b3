//! TCP accept loop: one spawned task per client connection.

use std::net::SocketAddr;
use std::sync::Arc;

use mangrove_common::{LogRing, ProxyConfig};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::backend::Backend;
use crate::commands::CommandTable;
use crate::connection::handle_connection;

/// The MongoDB wire protocol server.
pub struct ProxyServer {
    addr: SocketAddr,
    backend: Arc<dyn Backend>,
    table: Arc<CommandTable>,
    config: Arc<ProxyConfig>,
    log_ring: Arc<LogRing>,
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        backend: Arc<dyn Backend>,
        log_ring: Arc<LogRing>,
    ) -> anyhow::Result<Self> {
        let addr: SocketAddr = config.listener.addr.parse()?;
        Ok(ProxyServer {
            addr,
            backend,
            table: Arc::new(CommandTable::new()),
            config: Arc::new(config),
            log_ring,
        })
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("MongoDB wire protocol server listening on {}", self.addr);

        loop {
            let (mut socket, peer) = listener.accept().await?;
            debug!(peer = %peer, "new client connection");
            socket.set_nodelay(true).ok();

            let backend = self.backend.clone();
            let table = self.table.clone();
            let config = self.config.clone();
            let log_ring = self.log_ring.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(&mut socket, peer, backend, table, config, log_ring).await
                {
                    let text = e.to_string();
                    if text.contains("reset") || text.contains("broken pipe") {
                        debug!(peer = %peer, "client dropped: {text}");
                    } else {
                        error!(peer = %peer, "connection error: {text}");
                    }
                }
            });
        }
    }
}
