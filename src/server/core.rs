use log::{error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::middleware::logging::{log_connection, log_disconnection};
use crate::protocol::ConnectionHandler;
use crate::service::FileService;

/// How long shutdown waits for open connections before aborting them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Server {
    listener: TcpListener,
    service: Arc<FileService>,
    max_frame_bytes: usize,
    call_timeout: Option<Duration>,
    shutdown_grace: Duration,
}

impl Server {
    /// Binds the listener described by `config`.
    pub async fn bind(config: &ServerConfig, service: Arc<FileService>) -> io::Result<Self> {
        let addr = config
            .socket_addr()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let listener = TcpListener::bind(addr).await.inspect_err(|e| {
            error!("Failed to bind to {}: {}", addr, e);
        })?;
        info!("Server bound to {}", listener.local_addr()?);

        Ok(Self {
            listener,
            service,
            max_frame_bytes: config.server.max_frame_bytes,
            call_timeout: config.call_timeout(),
            shutdown_grace: SHUTDOWN_GRACE,
        })
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` fires, then cancels every call in
    /// flight and waits up to the grace period for connections to finish.
    pub async fn run(self, shutdown: CancellationToken) -> io::Result<()> {
        info!("Starting RAX file service on {}", self.listener.local_addr()?);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        // Spawn a task for each client so the accept loop doesn't block
                        connections.spawn(handle_connection(
                            stream,
                            peer,
                            Arc::clone(&self.service),
                            self.max_frame_bytes,
                            self.call_timeout,
                            shutdown.child_token(),
                        ));
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        info!(
            "Shutting down, waiting for {} connection(s)",
            connections.len()
        );
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} connection(s) still open after {:?}, aborting",
                connections.len(),
                self.shutdown_grace
            );
            connections.shutdown().await;
        }
        info!("Server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: Arc<FileService>,
    max_frame_bytes: usize,
    call_timeout: Option<Duration>,
    shutdown: CancellationToken,
) {
    log_connection(&peer);
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let (reader, writer) = stream.into_split();
    let handler = ConnectionHandler::new(
        peer,
        reader,
        writer,
        service,
        max_frame_bytes,
        call_timeout,
    );

    match handler.serve(shutdown).await {
        Ok(calls) => log_disconnection(&peer, calls),
        Err(e) => warn!("Connection {} ended with error: {}", peer, e),
    }
}
