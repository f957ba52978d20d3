//! Stream transports (TCP or any `AsyncRead + AsyncWrite`).
//!
//! The read half runs a `FramedRead` with [`FrameCodec`] and pushes every
//! complete payload into the connection's delivery queue. The write half is
//! owned by a writer task fed through an unbounded channel.

use crate::config::TransportConfig;
use crate::core::codec::FrameCodec;
use crate::error::Result;
use crate::transport::connection::{
    Connection, DisconnectReason, Outbound, TransportKind, WeakConnection,
};
use crate::utils::metrics::global_metrics;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

impl Connection {
    /// Wrap an established byte stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_stream<S>(stream: S, config: &TransportConfig) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        spawn_stream(stream, None, None, config)
    }

    /// Wrap an accepted or connected TCP stream
    pub fn from_tcp(stream: TcpStream, config: &TransportConfig) -> Connection {
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        spawn_stream(stream, local, peer, config)
    }

    /// Connect to a TCP endpoint
    #[instrument(skip(addr, config))]
    pub async fn connect_tcp<A: ToSocketAddrs>(
        addr: A,
        config: &TransportConfig,
    ) -> Result<Connection> {
        let stream = TcpStream::connect(addr).await?;
        let connection = Connection::from_tcp(stream, config);
        debug!(connection = %connection.id(), peer = ?connection.peer_addr(), "Connected");
        Ok(connection)
    }
}

fn spawn_stream<S>(
    stream: S,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    config: &TransportConfig,
) -> Connection
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let parts = Connection::new_parts(TransportKind::Stream, local, peer, config);
    let (read_half, write_half) = tokio::io::split(stream);
    let codec = FrameCodec::new(config.max_frame_size);

    tokio::spawn(read_loop(
        parts.connection.downgrade(),
        parts.connection.cancel_token(),
        FramedRead::new(read_half, codec.clone()),
    ));
    tokio::spawn(write_loop(
        parts.connection.downgrade(),
        FramedWrite::new(write_half, codec),
        parts.outbound,
    ));

    parts.connection
}

async fn read_loop<R>(
    connection: WeakConnection,
    cancel: CancellationToken,
    mut frames: FramedRead<R, FrameCodec>,
) where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            next = frames.next() => match next {
                Some(Ok(payload)) => match connection.upgrade() {
                    Some(connection) => connection.push_incoming(payload),
                    None => return,
                },
                Some(Err(e)) => break DisconnectReason::from_error(&e),
                None => break DisconnectReason::PeerClosed,
            },
        }
    };
    if let Some(connection) = connection.upgrade() {
        connection.shutdown(reason);
    }
}

async fn write_loop<W>(
    connection: WeakConnection,
    mut sink: FramedWrite<W, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = outbound.recv().await {
        match command {
            Outbound::Frame(payload) => {
                let len = payload.len() as u64;
                if let Err(e) = sink.send(payload).await {
                    warn!(error = %e, "Stream write failed");
                    if let Some(connection) = connection.upgrade() {
                        connection.shutdown(DisconnectReason::from_error(&e));
                    }
                    return;
                }
                global_metrics().message_sent(len);
            }
            // Stream connections reject send_to before it is queued
            Outbound::FrameTo(..) => {}
            Outbound::Shutdown => break,
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Error while closing stream");
    }
}
