//! Connection establishment for the match data channel
//!
//! The connecting side dials with a short per-attempt timeout and retries
//! transient failures at a fixed delay until an overall deadline. The
//! accepting side binds, takes exactly one connection and closes the listener.
//! Both sides race their work against cancellation and the deadline, and
//! every exit path drops the socket.
//!
//! Nagle's algorithm stays enabled on both ends: PSI engines write many small
//! records and rely on coalescing.

mod connection;

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use connection::Connection;

use crate::config::ConnectConfig;
use crate::error::ErrorKind;
use crate::retry::{retry_until, RetryError};
use crate::tls::{server_name_for_endpoint, trust_error_in};

/// Transport failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// Endpoint is not a usable `host:port`
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),

    /// One dial attempt ran out of time
    #[error("dial to {endpoint} timed out after {timeout:?}")]
    DialTimeout {
        /// Dialed endpoint
        endpoint: String,
        /// Per-attempt timeout
        timeout: Duration,
    },

    /// Dial refused or unreachable
    #[error("failed to dial {endpoint}: {source}")]
    Dial {
        /// Dialed endpoint
        endpoint: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// Socket option could not be applied
    #[error("failed to configure socket: {0}")]
    Socket(#[source] std::io::Error),

    /// Listener could not bind
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Requested bind address
        address: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// Listener failed while accepting
    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    /// TLS handshake failed
    #[error("TLS handshake with {peer} failed: {source}")]
    Handshake {
        /// Remote endpoint or address
        peer: String,
        /// rustls error wrapped by the stream
        #[source]
        source: std::io::Error,
    },

    /// TLS handshake ran out of time
    #[error("TLS handshake with {peer} timed out after {timeout:?}")]
    HandshakeTimeout {
        /// Remote endpoint or address
        peer: String,
        /// Handshake timeout
        timeout: Duration,
    },

    /// Caller cancelled the operation
    #[error("connection attempt cancelled")]
    Cancelled,

    /// Overall deadline elapsed
    #[error("could not connect to {endpoint} within {timeout:?} ({attempts} attempts)")]
    DeadlineExceeded {
        /// Endpoint or bind address
        endpoint: String,
        /// Overall deadline
        timeout: Duration,
        /// Attempts made
        attempts: u32,
        /// Most recent transient failure
        last_error: Option<Box<TransportError>>,
    },
}

impl TransportError {
    /// Whether another attempt may succeed.
    ///
    /// Handshakes rejected for a trust reason are final: the peer will present
    /// the same certificate again.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::DialTimeout { .. }
            | TransportError::Dial { .. }
            | TransportError::HandshakeTimeout { .. } => true,
            TransportError::Handshake { source, .. } => trust_error_in(source).is_none(),
            _ => false,
        }
    }

    /// Failure category
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::InvalidEndpoint(_) => ErrorKind::Configuration,
            TransportError::Handshake { source, .. } if trust_error_in(source).is_some() => {
                ErrorKind::Trust
            }
            _ => ErrorKind::Transport,
        }
    }
}

/// Establishes data channel connections on either side of a match
#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    config: ConnectConfig,
}

impl ConnectionManager {
    /// Manager with the given timeouts
    pub fn new(config: ConnectConfig) -> Self {
        Self { config }
    }

    /// Timeouts in use
    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    /// Dial `endpoint` and complete a TLS client handshake.
    ///
    /// SNI is the endpoint host. Dial timeouts, refusals and handshake
    /// failures are retried after `retry_delay` until `overall_timeout`.
    pub async fn connect(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        tls: Arc<ClientConfig>,
    ) -> Result<Connection, TransportError> {
        let server_name = server_name_for_endpoint(endpoint)
            .map_err(|_| TransportError::InvalidEndpoint(endpoint.to_string()))?;
        let connector = TlsConnector::from(tls);
        let deadline = Instant::now() + self.config.overall_timeout;

        info!(endpoint = %endpoint, "Connecting to partner");

        let result = retry_until(
            self.config.retry_delay,
            deadline,
            cancel,
            "connect",
            TransportError::is_transient,
            || self.connect_once(&connector, endpoint, server_name.clone()),
        )
        .await;

        match result {
            Ok(conn) => {
                info!(endpoint = %endpoint, peer = %conn.peer_addr(), "Connected to partner");
                Ok(conn)
            }
            Err(RetryError::Failed(e)) => Err(e),
            Err(RetryError::Cancelled) => Err(TransportError::Cancelled),
            Err(RetryError::DeadlineExceeded {
                attempts,
                last_error,
            }) => Err(TransportError::DeadlineExceeded {
                endpoint: endpoint.to_string(),
                timeout: self.config.overall_timeout,
                attempts,
                last_error: last_error.map(Box::new),
            }),
        }
    }

    async fn connect_once(
        &self,
        connector: &TlsConnector,
        endpoint: &str,
        server_name: ServerName<'static>,
    ) -> Result<Connection, TransportError> {
        let tcp = match timeout(self.config.dial_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(source)) => {
                return Err(TransportError::Dial {
                    endpoint: endpoint.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(TransportError::DialTimeout {
                    endpoint: endpoint.to_string(),
                    timeout: self.config.dial_timeout,
                })
            }
        };
        tcp.set_nodelay(false).map_err(TransportError::Socket)?;
        let peer_addr = tcp.peer_addr().map_err(TransportError::Socket)?;

        debug!(endpoint = %endpoint, "TCP connected, starting TLS handshake");

        let stream = timeout(
            self.config.handshake_timeout,
            connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| TransportError::HandshakeTimeout {
            peer: endpoint.to_string(),
            timeout: self.config.handshake_timeout,
        })?
        .map_err(|source| TransportError::Handshake {
            peer: endpoint.to_string(),
            source,
        })?;

        Ok(Connection::new(TlsStream::Client(stream), peer_addr))
    }

    /// Bind `bind_address` and accept one TLS connection
    pub async fn accept(
        &self,
        cancel: &CancellationToken,
        bind_address: &str,
        tls: Arc<ServerConfig>,
    ) -> Result<Connection, TransportError> {
        let listener =
            TcpListener::bind(bind_address)
                .await
                .map_err(|source| TransportError::Bind {
                    address: bind_address.to_string(),
                    source,
                })?;
        self.accept_on(cancel, listener, tls).await
    }

    /// Accept one TLS connection on an already bound listener.
    ///
    /// The listener is consumed and closed when this returns.
    pub async fn accept_on(
        &self,
        cancel: &CancellationToken,
        listener: TcpListener,
        tls: Arc<ServerConfig>,
    ) -> Result<Connection, TransportError> {
        let acceptor = TlsAcceptor::from(tls);
        let deadline = Instant::now() + self.config.overall_timeout;
        let local = listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();

        info!(address = %local, "Waiting for partner connection");

        let accept_one = async {
            let (tcp, peer_addr) = listener.accept().await.map_err(TransportError::Accept)?;
            tcp.set_nodelay(false).map_err(TransportError::Socket)?;

            debug!(peer = %peer_addr, "TCP accepted, starting TLS handshake");

            let stream = timeout(self.config.handshake_timeout, acceptor.accept(tcp))
                .await
                .map_err(|_| TransportError::HandshakeTimeout {
                    peer: peer_addr.to_string(),
                    timeout: self.config.handshake_timeout,
                })?
                .map_err(|source| TransportError::Handshake {
                    peer: peer_addr.to_string(),
                    source,
                })?;

            Ok::<_, TransportError>(Connection::new(TlsStream::Server(stream), peer_addr))
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(TransportError::DeadlineExceeded {
                endpoint: local.clone(),
                timeout: self.config.overall_timeout,
                attempts: 0,
                last_error: None,
            }),
            result = accept_one => result,
        };

        match &result {
            Ok(conn) => info!(peer = %conn.peer_addr(), "Partner connected"),
            Err(e) => warn!(address = %local, error = %e, "Accepting partner connection failed"),
        }
        result
    }
}
