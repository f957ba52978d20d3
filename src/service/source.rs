use crate::config::TransportConfig;
use crate::error::Result;
use crate::service::server::Server;
use crate::transport::Connection;
use futures::future::BoxFuture;
use futures::StreamExt;
use std::net::SocketAddr;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Produces new connections for a [`Server`].
///
/// `run` hands every accepted connection to [`Server::accept`] and returns
/// once `shutdown` is cancelled or the source is exhausted.
pub trait ConnectionSource: Send + 'static {
    fn run(
        self: Box<Self>,
        server: Server,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, Result<()>>;
}

/// Accept loop over a bound TCP listener
pub struct TcpSource {
    listener: TcpListener,
    config: TransportConfig,
}

impl TcpSource {
    #[instrument(skip(addr, config))]
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: TransportConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, config))
    }

    pub fn from_listener(listener: TcpListener, config: TransportConfig) -> Self {
        Self { listener, config }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

impl ConnectionSource for TcpSource {
    fn run(
        self: Box<Self>,
        server: Server,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, Result<()>> {
        let TcpSource { listener, config } = *self;
        Box::pin(async move {
            let address = listener.local_addr()?;
            info!(%address, "Listening");
            let mut incoming = TcpListenerStream::new(listener);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(%address, "Listener stopped");
                        break;
                    }
                    next = incoming.next() => match next {
                        Some(Ok(stream)) => {
                            let connection = Connection::from_tcp(stream, &config);
                            if let Err(e) = server.accept(connection) {
                                debug!(%address, error = %e, "Connection rejected");
                            }
                        }
                        Some(Err(e)) => {
                            error!(%address, error = %e, "Error accepting connection");
                        }
                        None => break,
                    }
                }
            }
            Ok(())
        })
    }
}

/// Connections pushed in through a channel.
///
/// Useful for transports the crate does not listen on itself, and for
/// feeding in-memory connections to a server in tests.
pub struct ChannelSource {
    rx: mpsc::Receiver<Connection>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<Connection>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

impl ConnectionSource for ChannelSource {
    fn run(
        self: Box<Self>,
        server: Server,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, Result<()>> {
        let mut rx = self.rx;
        Box::pin(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(connection) => {
                            if let Err(e) = server.accept(connection) {
                                debug!(error = %e, "Connection rejected");
                            }
                        }
                        None => break,
                    }
                }
            }
            Ok(())
        })
    }
}
