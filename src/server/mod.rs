//! Single-client TCP frame server
//!
//! Every cycle writes the 5-byte `READY` marker followed by one raw frame,
//! then asks the capture side for a newer frame. There is no length prefix;
//! clients know the frame size from the configured geometry.

mod stats;

pub use stats::{ServerCounters, ServerStats};

use crate::handoff::{FrameHandoff, ProducerStatus};
use crate::pool::FrameLease;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, warn};

/// Sent before every frame
pub const READY_MARKER: &[u8; 5] = b"READY";

/// Sent once before closing a client when no frame can be delivered
pub const ERROR_MARKER: &[u8; 5] = b"ERROR";

/// One client at a time; further connections wait in the kernel
const LISTEN_BACKLOG: u32 = 1;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid listen address: {0}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration for the frame server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,

    /// Resend the current frame when no newer one has been published
    pub repeat_frames: bool,

    /// How long a client waits for a frame before it gets the error marker
    pub frame_wait_timeout: Duration,

    /// Pause after a failed accept
    pub accept_backoff: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5000,
            repeat_frames: true,
            frame_wait_timeout: Duration::from_secs(5),
            accept_backoff: Duration::from_millis(100),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        let addr = format!("{}:{}", self.bind_address, self.port);
        addr.parse()
            .map_err(|e| ServerError::InvalidAddress(format!("{}: {}", addr, e)))
    }
}

/// Accept loop serving one client at a time
pub struct StreamingServer {
    config: ServerConfig,
    listener: TcpListener,
    handoff: Arc<FrameHandoff>,
    counters: Arc<ServerCounters>,
}

impl StreamingServer {
    /// Binds and listens. Failure here is fatal to the server.
    pub async fn bind(config: ServerConfig, handoff: Arc<FrameHandoff>) -> Result<Self, ServerError> {
        let addr = config.socket_addr()?;
        let listener = listen(addr).map_err(|source| ServerError::Bind { addr, source })?;

        info!(
            addr = %listener.local_addr()?,
            repeat_frames = config.repeat_frames,
            "Frame server listening"
        );

        Ok(Self {
            config,
            listener,
            handoff,
            counters: Arc::new(ServerCounters::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn counters(&self) -> Arc<ServerCounters> {
        Arc::clone(&self.counters)
    }

    pub fn stats(&self) -> ServerStats {
        self.counters.snapshot()
    }

    /// Serves clients forever. Only returns if the task is cancelled.
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(self.config.accept_backoff).await;
                    continue;
                }
            };

            let session = ClientSession::new(
                stream,
                peer,
                Arc::clone(&self.handoff),
                self.config.clone(),
                Arc::clone(&self.counters),
            );
            ServerCounters::add(&self.counters.clients_served, 1);
            info!(peer = %session.peer(), "Client connected");

            match session.run().await {
                SessionEnd::Disconnected { frames, error } => {
                    ServerCounters::add(&self.counters.disconnects, 1);
                    info!(peer = %peer, frames, error = %error, "Client disconnected");
                }
                SessionEnd::ProducerDown { frames } => {
                    warn!(
                        peer = %peer,
                        frames,
                        status = %self.handoff.status(),
                        "No frame available, closed client with error marker"
                    );
                }
            }
        }
    }

    /// Serves clients until `shutdown` resolves. An active session is
    /// dropped, which releases its frame.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown => {
                info!("Frame server shutting down");
                Ok(())
            }
        }
    }
}

fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// How a client session finished
#[derive(Debug)]
pub enum SessionEnd {
    /// A write failed; the peer is gone
    Disconnected { frames: u64, error: io::Error },

    /// No frame could be delivered; the error marker was sent
    ProducerDown { frames: u64 },
}

/// Streams frames to one connected client
pub struct ClientSession {
    stream: TcpStream,
    peer: SocketAddr,
    handoff: Arc<FrameHandoff>,
    config: ServerConfig,
    counters: Arc<ServerCounters>,
    frames: u64,
}

impl ClientSession {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        handoff: Arc<FrameHandoff>,
        config: ServerConfig,
        counters: Arc<ServerCounters>,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Unable to set TCP_NODELAY");
        }

        Self {
            stream,
            peer,
            handoff,
            config,
            counters,
            frames: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn run(mut self) -> SessionEnd {
        let mut current: Option<FrameLease> = None;

        // Ask for a fresh frame right away in case the last client left
        // without requesting one
        self.handoff.request();

        loop {
            let lease = match self.next_frame(current.take()).await {
                Some(lease) => lease,
                None => return self.close_with_error().await,
            };

            if let Err(error) = self.send_frame(&lease).await {
                return SessionEnd::Disconnected {
                    frames: self.frames,
                    error,
                };
            }

            self.handoff.request();
            current = Some(lease);
        }
    }

    /// Picks the frame for the next cycle. A newly published frame replaces
    /// the previous one, whose lease is dropped before the new one is taken.
    async fn next_frame(&self, mut current: Option<FrameLease>) -> Option<FrameLease> {
        if self.handoff.take_into(&mut current) {
            return current;
        }

        if self.config.repeat_frames
            && self.handoff.status() != ProducerStatus::Failed
            && current.is_some()
        {
            return current;
        }

        drop(current);
        self.handoff.wait_frame(self.config.frame_wait_timeout).await
    }

    async fn send_frame(&mut self, lease: &FrameLease) -> io::Result<()> {
        self.stream.write_all(READY_MARKER).await?;
        self.stream.write_all(lease.as_slice()).await?;

        self.frames += 1;
        ServerCounters::add(&self.counters.frames_sent, 1);
        ServerCounters::add(
            &self.counters.bytes_sent,
            (READY_MARKER.len() + lease.len()) as u64,
        );
        Ok(())
    }

    async fn close_with_error(mut self) -> SessionEnd {
        match self.stream.write_all(ERROR_MARKER).await {
            Ok(()) => {
                ServerCounters::add(&self.counters.error_markers_sent, 1);
                ServerCounters::add(&self.counters.bytes_sent, ERROR_MARKER.len() as u64);
            }
            Err(e) => debug!(peer = %self.peer, error = %e, "Unable to send error marker"),
        }
        if let Err(e) = self.stream.shutdown().await {
            error!(peer = %self.peer, error = %e, "Socket shutdown failed");
        }
        SessionEnd::ProducerDown { frames: self.frames }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CameraDriver, TestPatternDriver};
    use crate::format::{FrameGeometry, PixelFormat};
    use crate::pool::{BufferPool, BufferState};
    use tokio::io::AsyncReadExt;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            frame_wait_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    struct Source {
        pool: BufferPool,
        driver: TestPatternDriver,
        geometry: FrameGeometry,
    }

    impl Source {
        fn new(width: u32, height: u32) -> Self {
            let geometry = FrameGeometry::new(width, height, PixelFormat::Bgr565).unwrap();
            let mut driver = TestPatternDriver::new(1000);
            driver.set_format(&geometry).unwrap();
            let mut pool = BufferPool::preallocate(3, geometry.frame_size(), 64).unwrap();
            pool.prime(&mut driver).unwrap();
            driver.stream_start().unwrap();
            Self { pool, driver, geometry }
        }

        fn lease(&mut self) -> FrameLease {
            let buffer = self.pool.dequeue(&mut self.driver, Duration::from_secs(1)).unwrap();
            self.pool.hand_off(buffer).unwrap()
        }
    }

    async fn read_cycle(stream: &mut TcpStream, frame_size: usize) -> Vec<u8> {
        let mut marker = [0u8; 5];
        stream.read_exact(&mut marker).await.unwrap();
        assert_eq!(&marker, READY_MARKER);
        let mut frame = vec![0u8; frame_size];
        stream.read_exact(&mut frame).await.unwrap();
        frame
    }

    #[test]
    fn test_socket_addr() {
        let config = ServerConfig::default();
        assert_eq!(config.socket_addr().unwrap(), "0.0.0.0:5000".parse().unwrap());

        let bad = ServerConfig {
            bind_address: "not an address".to_string(),
            ..Default::default()
        };
        assert!(matches!(bad.socket_addr(), Err(ServerError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();

        let config = ServerConfig { port, ..test_config() };
        let result = StreamingServer::bind(config, Arc::new(FrameHandoff::new())).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_streams_ready_and_frame() {
        let mut source = Source::new(240, 240);
        let frame_size = source.geometry.frame_size();
        assert_eq!(frame_size, 115_200);

        let handoff = Arc::new(FrameHandoff::new());
        let lease = source.lease();
        let expected = lease.as_slice().to_vec();
        assert!(handoff.take_request());
        handoff.publish(lease);

        let server = StreamingServer::bind(test_config(), Arc::clone(&handoff)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let counters = server.counters();
        let task = tokio::spawn(server.run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        for _ in 0..3 {
            assert_eq!(read_cycle(&mut client, frame_size).await, expected);
        }
        assert!(handoff.is_requested());
        assert!(counters.snapshot().frames_sent >= 3);

        task.abort();
    }

    #[tokio::test]
    async fn test_newer_frame_replaces_current() {
        let mut source = Source::new(16, 16);
        let frame_size = source.geometry.frame_size();
        let handoff = Arc::new(FrameHandoff::new());
        handoff.publish(source.lease());

        let server = StreamingServer::bind(test_config(), Arc::clone(&handoff)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let first = read_cycle(&mut client, frame_size).await;

        // The test pattern scrolls, so consecutive frames differ
        let second = source.lease();
        let expected = second.as_slice().to_vec();
        assert_ne!(first, expected);
        handoff.publish(second);

        let mut seen = false;
        for _ in 0..100 {
            if read_cycle(&mut client, frame_size).await == expected {
                seen = true;
                break;
            }
        }
        assert!(seen);

        // The server now holds the newer frame; the older one went back to the pool
        assert_eq!(source.pool.count(BufferState::HandedOff), 1);

        task.abort();
    }

    #[tokio::test]
    async fn test_session_releases_current_before_taking_newer() {
        let mut source = Source::new(8, 8);
        let handoff = Arc::new(FrameHandoff::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());

        let session = ClientSession::new(
            stream,
            peer,
            Arc::clone(&handoff),
            test_config(),
            Arc::new(ServerCounters::default()),
        );
        assert_eq!(session.peer(), peer);

        handoff.publish(source.lease());
        let current = session.next_frame(None).await.unwrap();
        let current_index = current.index();

        // Nothing newer: the current frame is repeated
        let current = session.next_frame(Some(current)).await.unwrap();
        assert_eq!(current.index(), current_index);

        handoff.publish(source.lease());
        assert_eq!(source.pool.count(BufferState::HandedOff), 2);
        let newer = session.next_frame(Some(current)).await.unwrap();
        assert_ne!(newer.index(), current_index);
        assert_eq!(source.pool.states()[current_index], BufferState::Free);
        assert_eq!(source.pool.count(BufferState::HandedOff), 1);
    }

    #[tokio::test]
    async fn test_error_marker_when_producer_failed() {
        let handoff = Arc::new(FrameHandoff::new());
        handoff.set_status(ProducerStatus::Failed);

        let server = StreamingServer::bind(test_config(), Arc::clone(&handoff)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let counters = server.counters();
        let task = tokio::spawn(server.run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, ERROR_MARKER);
        assert_eq!(counters.snapshot().error_markers_sent, 1);

        task.abort();
    }

    #[tokio::test]
    async fn test_error_marker_when_no_frame_arrives() {
        let handoff = Arc::new(FrameHandoff::new());
        let server = StreamingServer::bind(test_config(), Arc::clone(&handoff)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, ERROR_MARKER);

        task.abort();
    }

    #[tokio::test]
    async fn test_serves_next_client_after_disconnect() {
        let mut source = Source::new(8, 8);
        let frame_size = source.geometry.frame_size();
        let handoff = Arc::new(FrameHandoff::new());
        handoff.publish(source.lease());

        let server = StreamingServer::bind(test_config(), Arc::clone(&handoff)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let counters = server.counters();
        let task = tokio::spawn(server.run());

        {
            let mut first = TcpStream::connect(addr).await.unwrap();
            read_cycle(&mut first, frame_size).await;
        }

        // Wait for the first session to notice, otherwise it could take the
        // frame meant for the second client
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while counters.snapshot().disconnects == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(source.pool.count(BufferState::HandedOff), 0);
        handoff.publish(source.lease());

        let mut second = TcpStream::connect(addr).await.unwrap();
        let frame = read_cycle(&mut second, frame_size).await;
        assert_eq!(frame.len(), frame_size);

        let stats = counters.snapshot();
        assert_eq!(stats.clients_served, 2);
        assert_eq!(stats.disconnects, 1);

        task.abort();
    }

    #[tokio::test]
    async fn test_run_until_releases_frame() {
        let mut source = Source::new(8, 8);
        let frame_size = source.geometry.frame_size();
        let handoff = Arc::new(FrameHandoff::new());
        handoff.publish(source.lease());

        let server = StreamingServer::bind(test_config(), Arc::clone(&handoff)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));

        let mut client = TcpStream::connect(addr).await.unwrap();
        read_cycle(&mut client, frame_size).await;

        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
        assert_eq!(source.pool.count(BufferState::HandedOff), 0);
    }
}
