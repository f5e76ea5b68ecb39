//! TCP server for handling echo connections.
//!
//! Owns the listening socket, accepts connections until cancelled, and
//! runs one echo handler per connection.

use crate::config::Config;
use crate::protocols::echo::EchoHandler;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    handler: EchoHandler,
    /// Connection handlers and their announcers.
    tasks: TaskTracker,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let tasks = TaskTracker::new();
        let handler = EchoHandler::new(&config, tasks.clone());
        Server {
            config,
            handler,
            tasks,
        }
    }

    /// Bind the listener and accept connections until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener, cancel).await
    }

    /// Bind the listening socket on the configured interface and port.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let listen = self.config.listen_addr();
        let addr: SocketAddr = listen
            .parse()
            .map_err(|_| ServerError::InvalidAddress(listen.clone()))?;

        let listener = create_listener(addr).map_err(|e| ServerError::Bind(addr, e))?;
        TcpListener::from_std(listener).map_err(|e| ServerError::Bind(addr, e))
    }

    /// Accept connections on `listener` until `cancel` fires, then wait for
    /// every spawned handler to finish.
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        match listener.local_addr() {
            Ok(addr) => info!(listen_addr = %addr, "listener established"),
            Err(e) => warn!(error = %e, "listener established, local address unknown"),
        }

        let handlers = &self.tasks;
        let mut conn_num: u64 = 0;

        loop {
            debug!(next_conn_num = conn_num + 1, "waiting for connection");

            // Dropping the accept future on cancellation stands in for
            // force-closing the socket under a blocked accept.
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, client_addr)) => {
                    conn_num += 1;
                    let span = info_span!("connection", conn_num, %client_addr);
                    span.in_scope(|| info!("accepted client connection"));

                    let handler = self.handler.clone();
                    let cancel = cancel.child_token();
                    handlers.spawn(
                        async move {
                            match handler.run(stream, cancel).await {
                                Ok(exit) => debug!(?exit, "echoer finished"),
                                Err(e) => error!(error = %e, "echoer exited with error"),
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    error!(error = %e, "error while accepting client connection");

                    if !pause_after_accept_error(self.config.accept_backoff, &cancel).await {
                        break;
                    }
                }
            }
        }

        drop(listener);
        info!(active = handlers.len(), "listener closed, waiting for connections");

        handlers.close();
        handlers.wait().await;
        info!(accepted = conn_num, "server stopped");
        Ok(())
    }
}

/// Wait out `backoff` after a failed accept.
///
/// Returns `false` if cancellation fired first and the loop should stop.
async fn pause_after_accept_error(backoff: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if backoff.is_zero() {
        return true;
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = time::sleep(backoff) => true,
    }
}

/// Create a non-blocking listening socket with `SO_REUSEADDR`.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

/// Server errors
#[derive(Debug)]
pub enum ServerError {
    InvalidAddress(String),
    Bind(SocketAddr, io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::InvalidAddress(addr) => write!(f, "Invalid listen address '{addr}'"),
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {addr}: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::InvalidAddress(_) => None,
            ServerError::Bind(_, e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::echo::announcer::ALIVE_MESSAGE;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            announce_alive: false,
            announce_interval: Duration::from_secs(5),
            read_deadline: Duration::from_millis(100),
            buffer_size: 1024 * 1024,
            accept_backoff: Duration::from_millis(50),
            log_level: "warn".to_string(),
            verbosity: 0,
        }
    }

    fn start(
        config: Config,
    ) -> (SocketAddr, CancellationToken, JoinHandle<Result<(), ServerError>>) {
        let server = Server::new(config);
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { server.serve(listener, token).await });
        (addr, cancel, task)
    }

    async fn stop(cancel: CancellationToken, task: JoinHandle<Result<(), ServerError>>) {
        cancel.cancel();
        let result = time::timeout(Duration::from_secs(2), task)
            .await
            .expect("server did not stop")
            .unwrap();
        tokio_test::assert_ok!(result);
    }

    #[tokio::test]
    async fn test_hello_world_round_trip() {
        let (addr, cancel, task) = start(test_config());
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut buf = [0u8; 5];
        client.write_all(b"hello").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        client.write_all(b"world").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        stop(cancel, task).await;
    }

    #[tokio::test]
    async fn test_echo_identity_larger_than_buffer() {
        let mut config = test_config();
        config.buffer_size = 4096;
        let (addr, cancel, task) = start(config);

        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = client.into_split();

        let sent = payload.clone();
        let write_task = tokio::spawn(async move {
            writer.write_all(&sent).await.unwrap();
            writer
        });

        let mut received = vec![0u8; payload.len()];
        time::timeout(Duration::from_secs(5), reader.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, payload);

        drop(write_task.await.unwrap());
        stop(cancel, task).await;
    }

    #[tokio::test]
    async fn test_empty_input_keeps_connection_open() {
        let (addr, cancel, task) = start(test_config());
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"").await.unwrap();
        let mut buf = [0u8; 1];
        let nothing = time::timeout(Duration::from_millis(300), client.read(&mut buf)).await;
        assert!(nothing.is_err(), "no bytes should be echoed");

        client.write_all(b"x").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");

        stop(cancel, task).await;
    }

    #[tokio::test]
    async fn test_graceful_shutdown_without_clients() {
        let (_addr, cancel, task) = start(test_config());
        time::sleep(Duration::from_millis(20)).await;
        stop(cancel, task).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_connections() {
        let (addr, cancel, task) = start(test_config());
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut buf = [0u8; 4];
        client.write_all(b"ping").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();

        stop(cancel, task).await;

        let read = time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_clients_are_isolated() {
        let (addr, cancel, task) = start(test_config());

        let clients: Vec<_> = (0..4)
            .map(|i| {
                tokio::spawn(async move {
                    let mut client = TcpStream::connect(addr).await.unwrap();
                    let message = format!("client-{i}-").repeat(100).into_bytes();
                    for _ in 0..5 {
                        client.write_all(&message).await.unwrap();
                        let mut received = vec![0u8; message.len()];
                        client.read_exact(&mut received).await.unwrap();
                        assert_eq!(received, message);
                    }
                })
            })
            .collect();

        for client in clients {
            time::timeout(Duration::from_secs(5), client)
                .await
                .unwrap()
                .unwrap();
        }

        stop(cancel, task).await;
    }

    #[tokio::test]
    async fn test_alive_announcement() {
        let mut config = test_config();
        config.announce_alive = true;
        config.announce_interval = Duration::from_millis(100);
        let (addr, cancel, task) = start(config);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 6];
        time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, ALIVE_MESSAGE);

        stop(cancel, task).await;
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config();
        config.port = occupied.local_addr().unwrap().port();

        let result = Server::new(config).run(CancellationToken::new()).await;
        assert!(matches!(result, Err(ServerError::Bind(_, _))));
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let mut config = test_config();
        config.host = "not-an-address".to_string();

        let result = Server::new(config).run(CancellationToken::new()).await;
        assert!(matches!(result, Err(ServerError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_accept_backoff_waits_then_resumes() {
        let cancel = CancellationToken::new();
        let started = Instant::now();
        assert!(pause_after_accept_error(Duration::from_millis(50), &cancel).await);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_accept_backoff_zero_resumes_immediately() {
        let cancel = CancellationToken::new();
        let resumed = time::timeout(
            Duration::from_millis(100),
            pause_after_accept_error(Duration::ZERO, &cancel),
        )
        .await;
        assert!(tokio_test::assert_ok!(resumed));
    }

    #[tokio::test]
    async fn test_accept_backoff_interrupted_by_cancellation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let resumed = time::timeout(
            Duration::from_secs(1),
            pause_after_accept_error(Duration::from_secs(60), &cancel),
        )
        .await;
        assert!(!tokio_test::assert_ok!(resumed));

        // Already cancelled: stop without waiting
        assert!(!pause_after_accept_error(Duration::ZERO, &cancel).await);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_announcers() {
        let mut config = test_config();
        config.announce_alive = true;
        config.announce_interval = Duration::from_secs(60);
        let server = Server::new(config);
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let serving = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                server.serve(listener, cancel).await.unwrap();
                server
            }
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 2];
        client.write_all(b"hi").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();

        cancel.cancel();
        let server = time::timeout(Duration::from_secs(2), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(server.tasks.is_empty());
    }
}
