//! DNS-over-HTTPS (RFC 8484) as a stream.
//!
//! The lookup engine talks to every stream-oriented transport the same way:
//! write a 2-byte big-endian length followed by the query, then read a
//! 2-byte length followed by the response. [`DohStream`] keeps that contract
//! for DoH. Writes are buffered; the first read strips the length prefix,
//! POSTs the raw message, and re-frames the response body with a prefix.

use crate::dial::{Dial, Network};
use crate::error::{DnsError, DnsResult};
use crate::tls::{self, ALPN_HTTP1};
use bytes::{Buf, Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use url::{Host, Position, Url};

/// Media type for wire-format DNS messages.
pub const DNS_MESSAGE: &str = "application/dns-message";

type Exchange = Pin<Box<dyn Future<Output = DnsResult<Bytes>> + Send>>;

/// Issues single DoH POST requests over the injected dialer.
#[derive(Clone)]
pub struct DohClient {
    url: Arc<Url>,
    dial: Arc<dyn Dial>,
    tls: Arc<ClientConfig>,
}

impl DohClient {
    /// Create a client for `url`. No connection is made until [`post`](Self::post).
    ///
    /// `https` URLs are wrapped in TLS; plain `http` is accepted for testing
    /// against local servers.
    pub fn new(url: Url, dial: Arc<dyn Dial>) -> DnsResult<Self> {
        match url.scheme() {
            "https" | "http" => {}
            other => {
                return Err(DnsError::Config(format!(
                    "unsupported DoH scheme '{}'",
                    other
                )))
            }
        }
        if url.host().is_none() {
            return Err(DnsError::Config(format!("missing host in '{}'", url)));
        }
        Ok(Self {
            url: Arc::new(url),
            dial,
            tls: tls::client_config(&[ALPN_HTTP1]),
        })
    }

    /// Address handed to the dialer (`host:port`).
    pub fn dial_address(&self) -> String {
        let port = self.url.port_or_known_default().unwrap_or(443);
        match self.url.host() {
            Some(Host::Ipv6(ip)) => format!("[{}]:{}", ip, port),
            Some(host) => format!("{}:{}", host, port),
            None => format!(":{}", port),
        }
    }

    /// POST one raw DNS message and return the raw response body.
    pub async fn post(&self, query: Bytes) -> DnsResult<Bytes> {
        let address = self.dial_address();
        log::debug!("DoH query ({} bytes) to {} via {}", query.len(), self.url, address);

        let stream = self.dial.dial(Network::Tcp, &address).await?;
        if self.url.scheme() == "https" {
            let server_name = match self.url.host() {
                Some(Host::Domain(domain)) => domain.to_string(),
                Some(Host::Ipv4(ip)) => ip.to_string(),
                Some(Host::Ipv6(ip)) => ip.to_string(),
                None => String::new(),
            };
            let stream = tls::connect(stream, &server_name, self.tls.clone()).await?;
            self.send(stream, query).await
        } else {
            self.send(stream, query).await
        }
    }

    async fn send<S>(&self, stream: S, query: Bytes) -> DnsResult<Bytes>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| DnsError::Http(format!("handshake failed: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                log::debug!("DoH connection closed: {}", e);
            }
        });

        let path = &self.url[Position::BeforePath..Position::AfterQuery];
        let authority = &self.url[Position::BeforeHost..Position::AfterPort];
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(HOST, authority)
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(Full::new(query))
            .map_err(|e| DnsError::Http(format!("invalid request: {}", e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| DnsError::Http(format!("request failed: {}", e)))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| DnsError::Http(format!("reading body failed: {}", e)))?
            .to_bytes();

        if status != StatusCode::OK {
            return Err(DnsError::DohStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body)
    }
}

/// One DoH exchange presented as a length-prefixed DNS stream.
pub struct DohStream {
    client: DohClient,
    query: BytesMut,
    response: Bytes,
    pending: Option<Exchange>,
    sent: bool,
}

impl DohStream {
    pub fn new(client: DohClient) -> Self {
        Self {
            client,
            query: BytesMut::new(),
            response: Bytes::new(),
            pending: None,
            sent: false,
        }
    }
}

/// Prefix `body` with its length as a big-endian u16.
fn frame(body: &[u8]) -> DnsResult<Bytes> {
    let len = u16::try_from(body.len()).map_err(|_| {
        DnsError::Message(format!("DoH response too large: {} bytes", body.len()))
    })?;
    let mut framed = BytesMut::with_capacity(body.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(body);
    Ok(framed.freeze())
}

impl AsyncRead for DohStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.response.is_empty() {
                let n = buf.remaining().min(this.response.len());
                buf.put_slice(&this.response[..n]);
                this.response.advance(n);
                return Poll::Ready(Ok(()));
            }

            if let Some(pending) = this.pending.as_mut() {
                let result = ready!(pending.as_mut().poll(cx));
                this.pending = None;
                match result.and_then(|body| frame(&body)) {
                    Ok(framed) => {
                        this.response = framed;
                        continue;
                    }
                    Err(e) => return Poll::Ready(Err(e.into_io())),
                }
            }

            // Nothing buffered beyond a bare length header, or the single
            // exchange already happened: report EOF.
            if this.sent || this.query.len() <= 2 {
                return Poll::Ready(Ok(()));
            }

            let mut query = this.query.split().freeze();
            query.advance(2);
            this.sent = true;
            let client = this.client.clone();
            this.pending = Some(Box::pin(async move { client.post(query).await }));
        }
    }
}

impl AsyncWrite for DohStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().query.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
