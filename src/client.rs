//! Receiver for the frame server's wire format

use crate::format::{to_rgb888, FormatError, FrameGeometry};
use crate::server::{ERROR_MARKER, READY_MARKER};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("unexpected marker {0:?}")]
    UnexpectedMarker([u8; 5]),

    #[error("server reported that no frame is available")]
    ServerError,

    #[error("connection closed by server")]
    Closed,

    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("frame conversion failed: {0}")]
    Format(#[from] FormatError),
}

/// Reads `READY` + frame cycles from a server
#[derive(Debug)]
pub struct FrameClient {
    stream: TcpStream,
    geometry: FrameGeometry,
    frames: u64,
}

impl FrameClient {
    /// Connects to `addr`; `geometry` must match what the server streams
    pub async fn connect(addr: &str, geometry: FrameGeometry) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(|source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        info!(addr = %addr, geometry = %geometry, "Connected to frame server");
        Ok(Self::from_stream(stream, geometry))
    }

    pub fn from_stream(stream: TcpStream, geometry: FrameGeometry) -> Self {
        Self {
            stream,
            geometry,
            frames: 0,
        }
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn frame_size(&self) -> usize {
        self.geometry.frame_size()
    }

    pub fn frames_received(&self) -> u64 {
        self.frames
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.stream.peer_addr()?)
    }

    /// Reads one marker and the frame that follows it
    pub async fn recv_frame(&mut self) -> Result<Bytes, ClientError> {
        let mut marker = [0u8; 5];
        read_exact_or_closed(&mut self.stream, &mut marker).await?;

        if &marker == ERROR_MARKER {
            return Err(ClientError::ServerError);
        }
        if &marker != READY_MARKER {
            return Err(ClientError::UnexpectedMarker(marker));
        }

        let mut frame = BytesMut::zeroed(self.frame_size());
        read_exact_or_closed(&mut self.stream, &mut frame).await?;

        self.frames += 1;
        debug!(frame = self.frames, len = frame.len(), "Frame received");
        Ok(frame.freeze())
    }

    pub async fn recv_frame_timeout(&mut self, wait: Duration) -> Result<Bytes, ClientError> {
        tokio::time::timeout(wait, self.recv_frame())
            .await
            .map_err(|_| ClientError::Timeout(wait))?
    }

    /// Receives one frame and converts it to packed RGB888
    pub async fn recv_rgb(&mut self) -> Result<Vec<u8>, ClientError> {
        let frame = self.recv_frame().await?;
        let mut rgb = vec![0u8; self.geometry.width as usize * self.geometry.height as usize * 3];
        to_rgb888(&self.geometry, &frame, &mut rgb)?;
        Ok(rgb)
    }
}

async fn read_exact_or_closed(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), ClientError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ClientError::Closed),
        Err(e) => Err(ClientError::Io(e)),
    }
}
