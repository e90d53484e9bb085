//! Data-plane listener speaking the MySQL protocol to clients
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::{ProxySession, SessionContext, StatementError};
use crate::backend::QueryOutcome;
use crate::core::connection::ConnectionManager;
use crate::core::session::SessionManager;
use crate::error::{ErrorSeverity, RutaError, RutaResult};
use crate::protocol::handshake::{Greeting, HandshakeResponse};
use crate::protocol::response::{err_packet, ok_packet, write_outcome};
use crate::protocol::{Command, PacketReader, PacketWriter};
use crate::utils::Shutdown;

const ER_CON_COUNT_ERROR: u16 = 1040;
const ER_HANDSHAKE_ERROR: u16 = 1043;
const ER_UNKNOWN_COM_ERROR: u16 = 1047;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_addr: String,
    pub max_client_connections: usize,
    pub client_idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub tcp_keepalive: Option<Duration>,
    pub server_version: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6033".to_string(),
            max_client_connections: 1024,
            client_idle_timeout: Duration::from_secs(28800),
            handshake_timeout: Duration::from_secs(10),
            tcp_keepalive: Some(Duration::from_secs(60)),
            server_version: format!("8.0.34-ruta-{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

pub struct ProxyServer {
    ctx: Arc<SessionContext>,
    sessions: Arc<SessionManager>,
    connections: ConnectionManager,
    settings: ServerSettings,
}

impl ProxyServer {
    pub fn new(ctx: Arc<SessionContext>, sessions: Arc<SessionManager>, settings: ServerSettings) -> Self {
        Self {
            ctx,
            sessions,
            connections: ConnectionManager::new(settings.max_client_connections)
                .with_keepalive(settings.tcp_keepalive),
            settings,
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub async fn bind(&self) -> RutaResult<TcpListener> {
        Ok(self
            .connections
            .create_listener(&self.settings.listen_addr)
            .await?)
    }

    /// Accept clients until shutdown. Each client runs in its own task.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: Shutdown) -> RutaResult<()> {
        loop {
            tokio::select! {
                accepted = self.connections.accept_connection(&listener) => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept client connection");
                            continue;
                        }
                    };
                    match self.connections.try_reserve() {
                        Some(permit) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                let _permit = permit;
                                if let Err(e) = server.handle_client(stream, addr).await {
                                    debug!(client = %addr, error = %e, "Client connection ended with error");
                                }
                            });
                        }
                        None => {
                            warn!(
                                client = %addr,
                                max = self.connections.max_connections(),
                                "Rejecting client: too many connections"
                            );
                            tokio::spawn(reject(stream));
                        }
                    }
                }
                _ = shutdown.wait() => {
                    info!("Data-plane listener stopping");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Serve one client from greeting to disconnect
    pub async fn handle_client<S>(&self, stream: S, client_addr: SocketAddr) -> RutaResult<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PacketReader::new(read_half);
        let mut writer = PacketWriter::new(write_half);

        let session_id = self.sessions.open_session(client_addr).await;
        let result = self
            .serve(&mut reader, &mut writer, session_id, client_addr)
            .await;
        self.sessions.close_session(session_id).await;
        result
    }

    async fn serve<R, W>(
        &self,
        reader: &mut PacketReader<R>,
        writer: &mut PacketWriter<W>,
        session_id: u64,
        client_addr: SocketAddr,
    ) -> RutaResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let greeting = Greeting::new(session_id as u32, self.settings.server_version.clone());
        writer.set_seq(0);
        writer.write_packet(&greeting.encode());
        writer.flush().await?;

        let (seq, payload) = match tokio::time::timeout(self.settings.handshake_timeout, reader.read_packet()).await {
            Ok(Ok(Some(packet))) => packet,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(RutaError::timeout("client handshake")),
        };
        writer.set_seq(seq.wrapping_add(1));
        let handshake = match HandshakeResponse::parse(&payload) {
            Ok(handshake) => handshake,
            Err(e) => {
                writer.write_packet(&err_packet(ER_HANDSHAKE_ERROR, "08S01", "Bad handshake"));
                writer.flush().await?;
                return Err(e);
            }
        };
        self.sessions
            .set_user(session_id, handshake.username.clone())
            .await;

        let mut session = ProxySession::new(Arc::clone(&self.ctx));
        if let Some(database) = &handshake.database {
            if let Err(e) = session.init_db(database).await {
                send_error(writer, &e).await?;
                session.close().await;
                return Ok(());
            }
        }
        writer.write_packet(&ok_packet(0, 0, session.status_flags(), ""));
        writer.flush().await?;
        info!(
            session = session_id,
            client = %client_addr,
            user = %handshake.username,
            database = ?handshake.database,
            "Client connected"
        );

        let result = self.command_loop(reader, writer, &mut session, session_id).await;
        session.close().await;
        debug!(session = session_id, client = %client_addr, "Client disconnected");
        result
    }

    async fn command_loop<R, W>(
        &self,
        reader: &mut PacketReader<R>,
        writer: &mut PacketWriter<W>,
        session: &mut ProxySession,
        session_id: u64,
    ) -> RutaResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let (seq, payload) =
                match tokio::time::timeout(self.settings.client_idle_timeout, reader.read_packet()).await {
                    Ok(Ok(Some(packet))) => packet,
                    Ok(Ok(None)) => return Ok(()),
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        info!(session = session_id, "Closing idle client connection");
                        return Ok(());
                    }
                };
            writer.set_seq(seq.wrapping_add(1));
            let (&command, body) = payload
                .split_first()
                .ok_or_else(|| RutaError::protocol("empty command packet"))?;

            match Command::from(command) {
                Command::Quit => return Ok(()),
                Command::Ping => {
                    writer.write_packet(&ok_packet(0, 0, session.status_flags(), ""));
                    writer.flush().await?;
                }
                Command::InitDb => {
                    let schema = String::from_utf8_lossy(body).into_owned();
                    let result = session.init_db(&schema).await;
                    let seen = activity(session);
                    self.touch(session_id, seen).await;
                    respond(writer, result, session.status_flags()).await?;
                }
                Command::Query => {
                    let sql = String::from_utf8_lossy(body).into_owned();
                    let result = tokio::select! {
                        result = session.execute(&sql) => Some(result),
                        _ = reader.wait_for_disconnect() => None,
                    };
                    match result {
                        Some(result) => {
                            let seen = activity(session);
                            self.touch(session_id, seen).await;
                            respond(writer, result, session.status_flags()).await?
                        }
                        None => {
                            info!(session = session_id, "Client disconnected mid-statement");
                            return Ok(());
                        }
                    }
                }
                Command::ResetConnection => {
                    session.reset().await;
                    let seen = activity(session);
                    self.touch(session_id, seen).await;
                    writer.write_packet(&ok_packet(0, 0, session.status_flags(), ""));
                    writer.flush().await?;
                }
                Command::Unsupported(byte) => {
                    debug!(session = session_id, command = byte, "Unsupported command");
                    writer.write_packet(&err_packet(ER_UNKNOWN_COM_ERROR, "08S01", "Unknown command"));
                    writer.flush().await?;
                }
            }
        }
    }

    async fn touch(&self, session_id: u64, (backend, in_transaction): (Option<String>, bool)) {
        self.sessions.touch(session_id, backend, in_transaction).await;
    }
}

/// Owned snapshot of what the session manager tracks. `ProxySession` is not
/// `Sync`, so a shared borrow of it must not live across an await.
fn activity(session: &ProxySession) -> (Option<String>, bool) {
    (session.last_backend().map(str::to_string), session.in_transaction())
}

async fn respond<W: AsyncWrite + Unpin>(
    writer: &mut PacketWriter<W>,
    result: Result<QueryOutcome, StatementError>,
    status: u16,
) -> RutaResult<()> {
    match result {
        Ok(outcome) => write_outcome(writer, &outcome, status).await,
        Err(e) => send_error(writer, &e).await,
    }
}

async fn send_error<W: AsyncWrite + Unpin>(writer: &mut PacketWriter<W>, error: &StatementError) -> RutaResult<()> {
    match error.error().severity() {
        ErrorSeverity::Info => debug!(error = %error, "Statement failed"),
        _ => warn!(error = %error, retryable = error.is_retryable(), "Statement failed"),
    }
    let (code, sql_state, message) = error.to_mysql_error();
    writer.write_packet(&err_packet(code, &sql_state, &message));
    writer.flush().await
}

async fn reject(stream: tokio::net::TcpStream) {
    let mut writer = PacketWriter::new(stream);
    writer.write_packet(&err_packet(ER_CON_COUNT_ERROR, "08004", "Too many connections"));
    let _ = writer.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{demo_registry, demo_rules, MockConnector};
    use crate::core::registry::BackendRegistry;
    use crate::core::{HealthState, HealthStatus};
    use crate::pool::{ConnectionPoolManager, PoolSettings};
    use crate::protocol::capabilities::*;
    use crate::proxy::SessionSettings;
    use crate::routing::balancer::Selection;
    use crate::routing::Router;
    use bytes::Bytes;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    async fn server(settings: ServerSettings) -> (Arc<ProxyServer>, Arc<BackendRegistry>, Arc<SessionManager>) {
        let registry = demo_registry().await;
        let connector = MockConnector::new();
        let ctx = Arc::new(SessionContext {
            router: Arc::new(Router::new(
                Arc::clone(&registry),
                Arc::new(demo_rules()),
                Selection::WeightedRoundRobin,
            )),
            pools: Arc::new(ConnectionPoolManager::new(
                Arc::clone(&registry),
                Arc::new(connector),
                PoolSettings::default(),
            )),
            registry: Arc::clone(&registry),
            settings: SessionSettings::default(),
        });
        let sessions = Arc::new(SessionManager::new());
        let server = Arc::new(ProxyServer::new(ctx, Arc::clone(&sessions), settings));
        (server, registry, sessions)
    }

    struct Client {
        reader: PacketReader<ReadHalf<DuplexStream>>,
        writer: PacketWriter<WriteHalf<DuplexStream>>,
    }

    impl Client {
        async fn send(&mut self, seq: u8, payload: &[u8]) {
            self.writer.set_seq(seq);
            self.writer.write_packet(payload);
            self.writer.flush().await.unwrap();
        }

        async fn recv(&mut self) -> (u8, Bytes) {
            self.reader.read_packet().await.unwrap().unwrap()
        }

        async fn query(&mut self, sql: &str) -> Bytes {
            let mut payload = vec![0x03];
            payload.extend_from_slice(sql.as_bytes());
            self.send(0, &payload).await;
            self.recv().await.1
        }
    }

    fn handshake_response(database: Option<&str>) -> Vec<u8> {
        let mut caps = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        if database.is_some() {
            caps |= CLIENT_CONNECT_WITH_DB;
        }
        let mut payload = caps.to_le_bytes().to_vec();
        payload.extend_from_slice(&(1u32 << 24).to_le_bytes());
        payload.push(45);
        payload.extend_from_slice(&[0; 23]);
        payload.extend_from_slice(b"root\0");
        payload.push(0);
        if let Some(db) = database {
            payload.extend_from_slice(db.as_bytes());
            payload.push(0);
        }
        payload.extend_from_slice(b"mysql_native_password\0");
        payload
    }

    async fn connect(server: &Arc<ProxyServer>, database: Option<&str>) -> (Client, tokio::task::JoinHandle<RutaResult<()>>) {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let task = {
            let server = Arc::clone(server);
            tokio::spawn(async move { server.handle_client(server_side, addr).await })
        };
        let (read_half, write_half) = tokio::io::split(client_side);
        let mut client = Client {
            reader: PacketReader::new(read_half),
            writer: PacketWriter::new(write_half),
        };

        let (seq, greeting) = client.recv().await;
        assert_eq!(seq, 0);
        assert_eq!(greeting[0], 10);
        client.send(1, &handshake_response(database)).await;
        (client, task)
    }

    #[tokio::test]
    async fn test_handshake_and_query() {
        let (server, _, sessions) = server(ServerSettings::default()).await;
        let (mut client, task) = connect(&server, None).await;
        let (seq, ok) = client.recv().await;
        assert_eq!((seq, ok[0]), (2, 0x00));
        assert_eq!(sessions.session_count().await, 1);

        let count = client.query("SELECT * FROM users").await;
        assert_eq!(&count[..], &[1]);
        let (_, definition) = client.recv().await;
        assert!(definition.starts_with(b"\x03def"));
        let (_, eof) = client.recv().await;
        assert_eq!(eof[0], 0xFE);
        let (_, row) = client.recv().await;
        let value = &row[1..];
        assert!(value == b"reader-1" || value == b"reader-2");
        let (_, eof) = client.recv().await;
        assert_eq!(eof[0], 0xFE);

        let ok = client.query("INSERT INTO users (name) VALUES ('a')").await;
        assert_eq!(&ok[..3], &[0x00, 1, 0]);

        client.send(0, &[0x0e]).await;
        assert_eq!(client.recv().await.1[0], 0x00);

        client.send(0, &[0x01]).await;
        task.await.unwrap().unwrap();
        assert_eq!(sessions.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_error_packets() {
        let (server, registry, _) = server(ServerSettings::default()).await;
        let (mut client, task) = connect(&server, None).await;
        client.recv().await;

        client.send(0, &[0x16]).await;
        let err = client.recv().await.1;
        assert_eq!(err[0], 0xFF);
        assert_eq!(u16::from_le_bytes([err[1], err[2]]), 1047);

        registry
            .update_health("writer", HealthState::initial("writer").with_status(HealthStatus::Offline))
            .await;
        let err = client.query("DELETE FROM users").await;
        assert_eq!(u16::from_le_bytes([err[1], err[2]]), 9001);

        let err = client.query("SELECT trigger_sql_error").await;
        assert_eq!(u16::from_le_bytes([err[1], err[2]]), 1064);
        assert_eq!(&err[3..9], b"#42000");

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_with_database_and_transaction_status() {
        let (server, _, sessions) = server(ServerSettings::default()).await;
        let (mut client, task) = connect(&server, Some("testdb")).await;
        client.recv().await;

        let ok = client.query("BEGIN").await;
        // status flags follow affected rows and last insert id
        assert_eq!(u16::from_le_bytes([ok[3], ok[4]]) & 0x0001, 0x0001);
        let listed = sessions.sessions().await;
        assert!(listed[0].in_transaction);
        assert_eq!(listed[0].user.as_deref(), Some("root"));
        assert_eq!(listed[0].last_backend.as_deref(), Some("writer"));

        client.send(0, &[0x1f]).await;
        let ok = client.recv().await.1;
        assert_eq!(u16::from_le_bytes([ok[3], ok[4]]) & 0x0001, 0);

        client.send(0, &[0x01]).await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_with_database_while_writer_offline() {
        let (server, registry, _) = server(ServerSettings::default()).await;
        registry
            .update_health("writer", HealthState::initial("writer").with_status(HealthStatus::Offline))
            .await;

        let (mut client, task) = connect(&server, Some("testdb")).await;
        let (seq, ok) = client.recv().await;
        assert_eq!((seq, ok[0]), (2, 0x00));

        let count = client.query("SELECT * FROM users").await;
        assert_eq!(&count[..], &[1]);
        for _ in 0..4 {
            client.recv().await;
        }

        let err = client.query("DELETE FROM users").await;
        assert_eq!(u16::from_le_bytes([err[1], err[2]]), 9001);

        client.send(0, &[0x01]).await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_client_is_disconnected() {
        let settings = ServerSettings {
            client_idle_timeout: Duration::from_millis(50),
            ..ServerSettings::default()
        };
        let (server, _, _) = server(settings).await;
        let (mut client, task) = connect(&server, None).await;
        client.recv().await;

        assert!(client.reader.read_packet().await.unwrap().is_none());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_max_client_connections() {
        let settings = ServerSettings {
            listen_addr: "127.0.0.1:0".to_string(),
            max_client_connections: 1,
            ..ServerSettings::default()
        };
        let (server, _, _) = server(settings).await;
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let run = tokio::spawn(Arc::clone(&server).run(listener, shutdown.clone()));

        let first = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut first = PacketReader::new(first);
        let (_, greeting) = first.read_packet().await.unwrap().unwrap();
        assert_eq!(greeting[0], 10);

        let second = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut second = PacketReader::new(second);
        let (_, err) = second.read_packet().await.unwrap().unwrap();
        assert_eq!(err[0], 0xFF);
        assert_eq!(u16::from_le_bytes([err[1], err[2]]), 1040);

        shutdown.trigger();
        run.await.unwrap().unwrap();
    }
}
