//! Transport boundary and TCP implementation
//!
//! The overlay only needs framed, bidirectional byte streams keyed by remote
//! address. [`TcpTransport`] provides them over TCP with a length-prefixed
//! codec; connection activity is reported as [`TransportEvent`]s.

use crate::network::message::{MAGIC, MAX_FRAME_SIZE};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Frames buffered per connection before `send` applies backpressure
pub const WRITE_QUEUE_DEPTH: usize = 100;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("No connection to {0}")]
    NotConnected(SocketAddr),
    #[error("Connection to {0} closed")]
    Closed(SocketAddr),
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Reject frames the codec would refuse, before they reach a writer
pub fn check_frame_size(bytes: &Bytes) -> Result<(), TransportError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Which side opened a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Connection activity reported by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A remote peer connected to our listener
    Accepted { addr: SocketAddr },
    /// A complete frame arrived
    Message { addr: SocketAddr, bytes: Bytes },
    /// The remote side went away
    Disconnected { addr: SocketAddr },
}

/// Framed, connection-oriented transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start accepting connections; returns the bound address
    async fn listen(&self, port: u16) -> Result<SocketAddr, TransportError>;

    /// Open an outbound connection; returns the key for it
    async fn connect_to(&self, host: &str, port: u16) -> Result<SocketAddr, TransportError>;

    /// Queue one frame on a connection. Frames over `MAX_FRAME_SIZE` are
    /// refused and leave the connection usable.
    async fn send(&self, addr: SocketAddr, bytes: Bytes) -> Result<(), TransportError>;

    /// Close one connection. No `Disconnected` event is emitted locally.
    async fn close(&self, addr: SocketAddr);

    /// Stop listening and close every connection
    async fn shutdown(&self);
}

// ===== Codec =====

/// Length-prefixed frame codec: magic (4) + length (4) + payload
pub struct FrameCodec;

impl Encoder<Bytes> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Frame too large: {} bytes", item.len()),
            ));
        }

        dst.reserve(8 + item.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 8 {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Invalid magic bytes",
            ));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Frame too large: {} bytes", len),
            ));
        }

        if src.len() < 8 + len {
            src.reserve(8 + len - src.len());
            return Ok(None);
        }

        src.advance(8);
        Ok(Some(src.split_to(len).freeze()))
    }
}

// ===== TCP =====

struct ConnectionHandle {
    tx: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ConnectionHandle {
    fn abort(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

type ConnectionMap = Arc<RwLock<HashMap<SocketAddr, ConnectionHandle>>>;

/// TCP transport
pub struct TcpTransport {
    events: mpsc::Sender<TransportEvent>,
    connections: ConnectionMap,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Create a transport reporting into `events`
    pub fn new(events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            events,
            connections: Arc::new(RwLock::new(HashMap::new())),
            listener: Mutex::new(None),
        }
    }

    /// Number of open connections
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

/// Split a stream into a writer task and a reader task
async fn attach(
    stream: TcpStream,
    addr: SocketAddr,
    connections: ConnectionMap,
    events: mpsc::Sender<TransportEvent>,
) {
    let framed = Framed::new(stream, FrameCodec);
    let (mut sink, mut stream) = framed.split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);

    // Hold the map lock until both tasks are registered so the reader's
    // cleanup cannot run before the insert
    let mut map = connections.write().await;

    let writer_connections = connections.clone();
    let writer_events = events.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                log::warn!("Error writing to {}: {}", addr, e);
                if let Some(handle) = writer_connections.write().await.remove(&addr) {
                    handle.reader.abort();
                    let _ = writer_events.send(TransportEvent::Disconnected { addr }).await;
                }
                break;
            }
        }
    });

    let reader_connections = connections.clone();
    let reader = tokio::spawn(async move {
        loop {
            match stream.next().await {
                Some(Ok(bytes)) => {
                    if events.send(TransportEvent::Message { addr, bytes }).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Error reading from {}: {}", addr, e);
                    break;
                }
                None => {
                    log::debug!("Connection {} closed by remote", addr);
                    break;
                }
            }
        }

        if let Some(handle) = reader_connections.write().await.remove(&addr) {
            handle.writer.abort();
            let _ = events.send(TransportEvent::Disconnected { addr }).await;
        }
    });

    if let Some(old) = map.insert(addr, ConnectionHandle { tx, reader, writer }) {
        old.abort();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, port: u16) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local = listener.local_addr()?;
        log::info!("Listening on {}", local);

        let connections = self.connections.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        log::info!("Incoming connection from {}", addr);
                        if events.send(TransportEvent::Accepted { addr }).await.is_err() {
                            break;
                        }
                        attach(stream, addr, connections.clone(), events.clone()).await;
                    }
                    Err(e) => {
                        log::error!("Accept error: {}", e);
                    }
                }
            }
        });

        if let Some(old) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task)
        {
            old.abort();
        }

        Ok(local)
    }

    async fn connect_to(&self, host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?;
        let addr = stream.peer_addr()?;

        attach(stream, addr, self.connections.clone(), self.events.clone()).await;
        Ok(addr)
    }

    async fn send(&self, addr: SocketAddr, bytes: Bytes) -> Result<(), TransportError> {
        check_frame_size(&bytes)?;
        let tx = self
            .connections
            .read()
            .await
            .get(&addr)
            .map(|handle| handle.tx.clone())
            .ok_or(TransportError::NotConnected(addr))?;

        tx.send(bytes).await.map_err(|_| TransportError::Closed(addr))
    }

    async fn close(&self, addr: SocketAddr) {
        if let Some(handle) = self.connections.write().await.remove(&addr) {
            log::debug!("Closing connection {}", addr);
            handle.abort();
        }
    }

    async fn shutdown(&self) {
        if let Some(task) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }

        let mut connections = self.connections.write().await;
        for (_, handle) in connections.drain() {
            handle.abort();
        }
    }
}
