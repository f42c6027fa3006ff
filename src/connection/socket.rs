//! Socket establishment and the frame read pump.
//!
//! Owns everything below the protocol state machine: service URL parsing,
//! DNS resolution with endpoint iteration, socket options, the optional
//! TLS handshake, and the growable-buffer frame reader.

use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use rustls::pki_types::ServerName;

use crate::auth::Authenticator;
use crate::config::ClientConfiguration;
use crate::connection::tls::build_tls_connector;
use crate::connection::max_message_size;
use crate::constants::{
    DEFAULT_BROKER_PORT, DEFAULT_BROKER_TLS_PORT, DEFAULT_READ_BUFFER_SIZE, SCHEME_PLAIN,
    SCHEME_TLS, TCP_KEEP_ALIVE_IDLE_SECS, TCP_KEEP_ALIVE_INTERVAL_SECS, TCP_KEEP_ALIVE_PROBES,
};
use crate::error::{Error, Result};

/// Byte stream to the broker, plain or TLS.
pub(crate) trait BrokerIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> BrokerIo for T {}

pub(crate) type BrokerStream = Box<dyn BrokerIo>;

/// A parsed `pulsar://` or `pulsar+ssl://` service URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUrl {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl ServiceUrl {
    /// Parse a service URL. Unknown schemes fail immediately with
    /// [`Error::ConnectError`].
    pub fn parse(url: &str) -> Result<ServiceUrl> {
        let (tls, rest) = if let Some(rest) = url.strip_prefix(concat_scheme(SCHEME_TLS).as_str())
        {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix(concat_scheme(SCHEME_PLAIN).as_str()) {
            (false, rest)
        } else {
            tracing::error!(url, "Invalid service URL scheme, expected pulsar:// or pulsar+ssl://");
            return Err(Error::ConnectError);
        };

        let authority = rest.split('/').next().unwrap_or("");
        if authority.is_empty() {
            tracing::error!(url, "Service URL has no host");
            return Err(Error::ConnectError);
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u16>().map_err(|_| {
                    tracing::error!(url, "Invalid port in service URL");
                    Error::ConnectError
                })?;
                (host.to_string(), port)
            }
            None => {
                let default_port = if tls {
                    DEFAULT_BROKER_TLS_PORT
                } else {
                    DEFAULT_BROKER_PORT
                };
                (authority.to_string(), default_port)
            }
        };

        if host.is_empty() {
            tracing::error!(url, "Service URL has no host");
            return Err(Error::ConnectError);
        }

        Ok(ServiceUrl { host, port, tls })
    }
}

fn concat_scheme(scheme: &str) -> String {
    format!("{}://", scheme)
}

/// Establish the transport to `physical_address`: resolve, connect, apply
/// socket options and run the TLS handshake when required.
///
/// Returns the stream plus the `[local -> remote]` label used in log
/// lines. Endpoint exhaustion at the TCP level surfaces as
/// [`Error::Retryable`]; invalid URLs and resolution failures as
/// [`Error::ConnectError`].
pub(crate) async fn connect_socket(
    physical_address: &str,
    config: &ClientConfiguration,
    auth: &dyn Authenticator,
) -> Result<(BrokerStream, String)> {
    let service_url = ServiceUrl::parse(physical_address)?;
    let use_tls = service_url.tls || config.use_tls;

    let addrs: Vec<SocketAddr> =
        tokio::net::lookup_host((service_url.host.as_str(), service_url.port))
            .await
            .map_err(|error| {
                tracing::error!(host = %service_url.host, %error, "Resolve error");
                Error::ConnectError
            })?
            .collect();

    if addrs.is_empty() {
        tracing::warn!(host = %service_url.host, "No IP address found");
        return Err(Error::ConnectError);
    }

    let mut stream = None;
    for addr in &addrs {
        tracing::debug!(endpoint = %addr, "Connecting to broker endpoint");
        match TcpStream::connect(addr).await {
            Ok(connected) => {
                stream = Some(connected);
                break;
            }
            Err(error) => {
                tracing::warn!(endpoint = %addr, %error, "Failed to establish connection");
            }
        }
    }
    // Every resolved endpoint failed at the TCP level: worth retrying.
    let stream = stream.ok_or(Error::Retryable)?;

    apply_socket_options(&stream);

    let cnx_string = match (stream.local_addr(), stream.peer_addr()) {
        (Ok(local), Ok(peer)) => format!("[{} -> {}] ", local, peer),
        _ => format!("[<unknown> -> {}] ", physical_address),
    };

    if use_tls {
        let connector = build_tls_connector(config, auth)?;
        let server_name = ServerName::try_from(service_url.host.clone()).map_err(|_| {
            tracing::error!(host = %service_url.host, "Invalid TLS server name");
            Error::ConnectError
        })?;
        let tls_stream = connector.connect(server_name, stream).await.map_err(|error| {
            tracing::error!(%error, "TLS handshake failed");
            Error::ConnectError
        })?;
        Ok((Box::new(tls_stream), cnx_string))
    } else {
        Ok((Box::new(stream), cnx_string))
    }
}

fn apply_socket_options(stream: &TcpStream) {
    if let Err(error) = stream.set_nodelay(true) {
        tracing::warn!(%error, "Socket failed to set TCP_NODELAY");
    }

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEP_ALIVE_IDLE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEP_ALIVE_INTERVAL_SECS))
        .with_retries(TCP_KEEP_ALIVE_PROBES);
    let sock = SockRef::from(stream);
    if let Err(error) = sock.set_tcp_keepalive(&keepalive) {
        tracing::debug!(%error, "Socket failed to set TCP keepalive options");
    }
}

/// Reassembles length-prefixed frames from a byte stream.
///
/// Reads land in a growable buffer that starts at 64 KiB; when a frame
/// does not fit, the buffer grows to `max(64 KiB, frame size + 4)`.
/// Returns frames without their size prefix.
pub(crate) struct FrameReader {
    buffer: BytesMut,
}

impl FrameReader {
    pub(crate) fn new() -> Self {
        FrameReader {
            buffer: BytesMut::with_capacity(DEFAULT_READ_BUFFER_SIZE),
        }
    }

    /// Read until one complete frame is available.
    ///
    /// `Ok(None)` is a clean end of stream at a frame boundary; an EOF
    /// mid-frame is [`Error::Disconnected`].
    pub(crate) async fn next_frame<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if self.buffer.len() >= 4 {
                let total_size =
                    u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                        as usize;

                // A frame far beyond the negotiated limit means the stream
                // is corrupt.
                let sanity_limit = max_message_size() as usize + DEFAULT_READ_BUFFER_SIZE;
                if total_size > sanity_limit {
                    tracing::error!(total_size, sanity_limit, "Oversized frame");
                    return Err(Error::MalformedFrame);
                }

                if self.buffer.len() >= 4 + total_size {
                    self.buffer.advance(4);
                    return Ok(Some(self.buffer.split_to(total_size).freeze()));
                }

                let needed = 4 + total_size - self.buffer.len();
                self.buffer.reserve(needed.max(DEFAULT_READ_BUFFER_SIZE));
            } else if self.buffer.capacity() - self.buffer.len() < 4 {
                // Fewer than 4 bytes of the next frame at the buffer tail;
                // make room to read the rest of the size prefix.
                self.buffer.reserve(DEFAULT_READ_BUFFER_SIZE);
            }

            let read = reader
                .read_buf(&mut self.buffer)
                .await
                .map_err(|_| Error::Disconnected)?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                tracing::debug!(
                    pending_bytes = self.buffer.len(),
                    "Server closed the connection mid-frame"
                );
                return Err(Error::Disconnected);
            }
        }
    }
}
