/// Client-side TCP handling: listening, accepting and socket tuning
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Accepts client connections and bounds how many are open at once
#[derive(Clone)]
pub struct ConnectionManager {
    /// Maximum number of concurrent client connections
    max_connections: usize,
    slots: Arc<Semaphore>,
    keepalive: Option<Duration>,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            slots: Arc::new(Semaphore::new(max_connections)),
            keepalive: Some(Duration::from_secs(60)),
        }
    }

    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Create a TCP listener on the specified address
    pub async fn create_listener(&self, listen_addr: &str) -> Result<TcpListener, io::Error> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Listening on {}", listen_addr);
        Ok(listener)
    }

    /// Accept the next client connection
    pub async fn accept_connection(
        &self,
        listener: &TcpListener,
    ) -> Result<(TcpStream, SocketAddr), io::Error> {
        let (stream, addr) = listener.accept().await?;

        if let Err(e) = self.configure_client_stream(&stream) {
            warn!("Failed to configure client stream: {}", e);
        }

        debug!("Accepted connection from {}", addr);
        Ok((stream, addr))
    }

    /// Reserve a client slot, or `None` when the proxy is at capacity
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    pub fn active_connections(&self) -> usize {
        self.max_connections - self.slots.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    fn configure_client_stream(&self, stream: &TcpStream) -> Result<(), io::Error> {
        stream.set_nodelay(true)?;
        if let Some(idle) = self.keepalive {
            SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        Ok(())
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(10000)
    }
}
