//! HTTP exchange layer
//!
//! One instance per session. The connection is established by hand so the
//! socket can be handed to the protect hook before connect: resolve the
//! endpoint out-of-tunnel, create an unconnected socket, protect it,
//! connect with a timeout, then (fronted mode) wrap it in TLS with the SNI
//! set to the fronting domain, and drive HTTP/1 over it with hyper's
//! connection-level client. The connection is reused across polls; any
//! failed exchange tears it down so the retry dials fresh.
//!
//! Every exchange runs under a hard deadline so a hung relay cannot stall
//! the session past `MEEK_SERVER_TIMEOUT`, independent of the individual
//! connect/read timeouts.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{CONTENT_TYPE, COOKIE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_rustls::TlsConnector;

use crate::config::MeekConfig;
use crate::dns::DnsResolver;
use crate::protect::{RawSocketHandle, SocketProtector};
use crate::{MeekError, MeekResult};

/// Connect / request / read budget for each relay exchange.
pub(crate) const MEEK_SERVER_TIMEOUT: Duration = Duration::from_millis(20_000);

const HTTP_POST_CONTENT_TYPE: &str = "application/octet-stream";

/// Per-session HTTP state.
pub(crate) struct SessionTransport {
    config: Arc<MeekConfig>,
    protector: Arc<dyn SocketProtector>,
    resolver: Arc<dyn DnsResolver>,
    tls: Option<TlsConnector>,
    sender: Option<SendRequest<Full<Bytes>>>,
}

impl SessionTransport {
    pub(crate) fn new(
        config: Arc<MeekConfig>,
        protector: Arc<dyn SocketProtector>,
        resolver: Arc<dyn DnsResolver>,
    ) -> Self {
        let tls = config.is_fronted().then(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            TlsConnector::from(Arc::new(tls_config))
        });

        Self {
            config,
            protector,
            resolver,
            tls,
            sender: None,
        }
    }

    /// POST `payload` to the relay and stream the response body into
    /// `local`. Returns the number of downstream bytes written.
    ///
    /// Any error leaves the transport disconnected, so a retry starts from
    /// a fresh connection. A [`MeekError::LocalIo`] means downstream bytes
    /// were already delivered; the caller must not retry after it.
    pub(crate) async fn exchange<W>(
        &mut self,
        cookie: &str,
        payload: &[u8],
        local: &mut W,
    ) -> MeekResult<u64>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let deadline = Instant::now() + MEEK_SERVER_TIMEOUT;
        let result = self.exchange_inner(cookie, payload, local, deadline).await;
        if result.is_err() {
            self.sender = None;
        }
        result
    }

    async fn exchange_inner<W>(
        &mut self,
        cookie: &str,
        payload: &[u8],
        local: &mut W,
        deadline: Instant,
    ) -> MeekResult<u64>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        timeout_at(deadline, self.ensure_connected())
            .await
            .map_err(|_| MeekError::Timeout)??;

        let request = Request::builder()
            .method(Method::POST)
            .uri("/")
            .header(HOST, self.config.host_header())
            .header(CONTENT_TYPE, HTTP_POST_CONTENT_TYPE)
            .header(COOKIE, cookie)
            .body(Full::new(Bytes::copy_from_slice(payload)))
            .map_err(|e| MeekError::Http(e.to_string()))?;

        let sender = self
            .sender
            .as_mut()
            .ok_or_else(|| MeekError::Http("connection not established".to_string()))?;

        timeout_at(deadline, sender.ready())
            .await
            .map_err(|_| MeekError::Timeout)?
            .map_err(|e| MeekError::Http(e.to_string()))?;

        let response = timeout_at(deadline, sender.send_request(request))
            .await
            .map_err(|_| MeekError::Timeout)?
            .map_err(|e| MeekError::Http(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(MeekError::HttpStatus(response.status().as_u16()));
        }

        // Stream the body to the local socket as it arrives, still under the
        // exchange deadline so a relay dribbling bytes cannot keep one
        // request alive forever. Local writes are only bounded by TCP
        // back-pressure.
        let mut received: u64 = 0;
        let mut body = response.into_body();
        while let Some(frame) = timeout_at(deadline, body.frame())
            .await
            .map_err(|_| MeekError::Timeout)?
        {
            let frame = frame.map_err(|e| MeekError::Http(e.to_string()))?;
            if let Ok(data) = frame.into_data() {
                if !data.is_empty() {
                    local
                        .write_all(&data)
                        .await
                        .map_err(|e| MeekError::LocalIo(e.to_string()))?;
                    received += data.len() as u64;
                }
            }
        }

        Ok(received)
    }

    /// Dial the relay if there is no live connection to reuse.
    async fn ensure_connected(&mut self) -> MeekResult<()> {
        if let Some(sender) = &self.sender {
            if !sender.is_closed() {
                return Ok(());
            }
        }
        self.sender = None;

        let (host, port) = self.config.endpoint();
        let addrs = self.resolver.resolve(host).await?;
        let addr = addrs
            .first()
            .copied()
            .ok_or_else(|| MeekError::Dns(format!("no addresses for '{}'", host)))?;
        let tcp = self.connect_protected(SocketAddr::new(addr, port)).await?;

        let sender = match &self.tls {
            Some(connector) => {
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|_| MeekError::Tls(format!("invalid server name '{}'", host)))?;
                let tls_stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| MeekError::Tls(e.to_string()))?;
                spawn_http1(TokioIo::new(tls_stream)).await?
            }
            None => spawn_http1(TokioIo::new(tcp)).await?,
        };

        log::debug!("Meek: connected to {}", self.config.url());
        self.sender = Some(sender);
        Ok(())
    }

    /// Create an unconnected socket, run it through the protect hook, then
    /// connect with a timeout.
    async fn connect_protected(&self, addr: SocketAddr) -> MeekResult<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if !self.protector.protect(raw_handle(&socket)) {
            return Err(MeekError::Connect(format!(
                "socket protection refused for {}",
                addr
            )));
        }

        let stream = timeout(MEEK_SERVER_TIMEOUT, socket.connect(addr))
            .await
            .map_err(|_| MeekError::Timeout)?
            .map_err(|e| MeekError::Connect(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// HTTP/1 handshake plus a background task driving the connection.
async fn spawn_http1<T>(io: T) -> MeekResult<SendRequest<Full<Bytes>>>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(io)
        .await
        .map_err(|e| MeekError::Http(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            log::debug!("Meek: relay connection closed: {}", e);
        }
    });
    Ok(sender)
}

#[cfg(unix)]
fn raw_handle(socket: &TcpSocket) -> RawSocketHandle {
    use std::os::fd::AsRawFd;
    socket.as_raw_fd()
}

#[cfg(windows)]
fn raw_handle(socket: &TcpSocket) -> RawSocketHandle {
    use std::os::windows::io::AsRawSocket;
    socket.as_raw_socket()
}
