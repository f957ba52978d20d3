//! Datagram transport (UDP).
//!
//! One message per datagram; datagrams are never packed. A connection is
//! bound to one remote endpoint, and datagrams arriving from any other
//! endpoint are dropped. Zero-length datagrams are ignored.
//!
//! The connection's read loop owns the receive side of its socket; two
//! connections reading the same socket would steal each other's datagrams.

use crate::config::TransportConfig;
use crate::error::Result;
use crate::transport::connection::{
    Connection, DisconnectReason, Outbound, TransportKind, WeakConnection,
};
use crate::utils::metrics::global_metrics;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

impl Connection {
    /// Wrap a UDP socket, treating `remote` as the only valid peer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_datagram(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        config: &TransportConfig,
    ) -> Connection {
        let local = socket.local_addr().ok();
        let parts = Connection::new_parts(TransportKind::Datagram, local, Some(remote), config);

        tokio::spawn(read_loop(
            parts.connection.downgrade(),
            parts.connection.cancel_token(),
            socket.clone(),
            remote,
            config.datagram_buffer_size,
        ));
        tokio::spawn(write_loop(
            parts.connection.downgrade(),
            socket,
            remote,
            parts.outbound,
        ));

        parts.connection
    }

    /// Bind a UDP socket on `local` and exchange datagrams with `remote`
    #[instrument(skip(config))]
    pub async fn connect_udp(
        local: SocketAddr,
        remote: SocketAddr,
        config: &TransportConfig,
    ) -> Result<Connection> {
        let socket = UdpSocket::bind(local).await?;
        Ok(Connection::from_datagram(Arc::new(socket), remote, config))
    }
}

async fn read_loop(
    connection: WeakConnection,
    cancel: CancellationToken,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok((0, _)) => continue,
                Ok((len, from)) if from != remote => {
                    trace!(%from, len, "Dropping datagram from foreign endpoint");
                }
                Ok((len, _)) => match connection.upgrade() {
                    Some(connection) => connection.push_incoming(Bytes::copy_from_slice(&buf[..len])),
                    None => return,
                },
                Err(e) => break DisconnectReason::Transport(e.to_string()),
            },
        }
    };
    if let Some(connection) = connection.upgrade() {
        connection.shutdown(reason);
    }
}

async fn write_loop(
    connection: WeakConnection,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(command) = outbound.recv().await {
        let (payload, target) = match command {
            Outbound::Frame(payload) => (payload, remote),
            Outbound::FrameTo(payload, target) => (payload, target),
            Outbound::Shutdown => break,
        };
        match socket.send_to(&payload, target).await {
            Ok(_) => global_metrics().message_sent(payload.len() as u64),
            Err(e) => {
                // Datagram delivery is best-effort; a failed send is not fatal
                global_metrics().connection_error();
                let id = connection.upgrade().map(|c| c.id());
                warn!(connection = ?id, %target, error = %e, "Datagram send failed");
            }
        }
    }
    debug!("Datagram writer stopped");
}
