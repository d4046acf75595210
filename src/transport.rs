//! The connection-pooled HTTP/1.1 transport: dialing, TLS, the idle-connection
//! pool, and per-phase timeouts. This is the core of the fetch engine.
//!
//! A [`PersistConn`] is checked out of the pool exclusively for the duration
//! of one request/response cycle — the pool never hands the same connection
//! to two callers at once — so `write_request`/`read_response` can run
//! directly on the owned stream without a background read-loop task or an
//! internal request/response channel. The `broken` flag and use-count are
//! still tracked so the pool can make correct reuse decisions once the
//! connection comes back.

use crate::connection::Connection;
use crate::errors::TransportError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Per-request knobs handed to the transport by the fetch orchestrator.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub read_limit: u64,
    pub keepalive_timeout: Duration,
    pub insecure_skip_verify: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            read_limit: 10 * 1024 * 1024,
            keepalive_timeout: Duration::from_secs(120),
            insecure_skip_verify: false,
        }
    }
}

/// Per-request timing and provenance, filled in as the fetch progresses and
/// copied verbatim into the final JSON report.
#[derive(Debug, Clone, Default)]
pub struct RequestStat {
    pub remote_addr: Option<SocketAddr>,
    pub connection_age: Duration,
    pub connection_use: u32,
    pub resolve_time: Duration,
    pub connect_time: Duration,
    pub write_time: Duration,
    pub read_header_time: Duration,
    pub read_body_time: Duration,
    pub total_time: Duration,
}

/// An HTTP response as read off the wire: status line plus headers plus
/// whatever body bytes were collected (bounded by `read_limit`).
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
    pub close_requested: bool,
    pub header_time: Duration,
    pub body_time: Duration,
}

/// `scheme|host:port`, the idle-pool cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectMethod {
    pub scheme: String,
    pub addr: String,
}

impl ConnectMethod {
    pub fn from_url(url: &url::Url) -> Result<Self, TransportError> {
        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme {scheme:?}"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidUrl("missing host".into()))?;
        if host.is_empty() {
            return Err(TransportError::InvalidUrl("empty host".into()));
        }
        let port = url.port().unwrap_or(if scheme == "https" { 443 } else { 80 });
        Ok(Self {
            scheme,
            addr: format!("{host}:{port}"),
        })
    }

    pub fn key(&self) -> String {
        format!("{}|{}", self.scheme, self.addr)
    }

    pub fn host(&self) -> &str {
        self.addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.addr)
    }
}

/// A pooled connection, checked out exclusively while in use.
pub struct PersistConn {
    pub cache_key: String,
    conn: Connection,
    created: Instant,
    last_used: Instant,
    use_count: u32,
    broken: AtomicBool,
}

impl PersistConn {
    fn new(cache_key: String, conn: Connection) -> Self {
        let now = Instant::now();
        Self {
            cache_key,
            conn,
            created: now,
            last_used: now,
            use_count: 0,
            broken: AtomicBool::new(false),
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub async fn write_request(
        &mut self,
        request_bytes: &[u8],
        options: &RequestOptions,
    ) -> Result<(), TransportError> {
        self.last_used = Instant::now();
        let write = self.conn.write_all(request_bytes);
        let result = if options.write_timeout.is_zero() {
            write.await.map_err(TransportError::Write)
        } else {
            match tokio::time::timeout(options.write_timeout, write).await {
                Ok(r) => r.map_err(TransportError::Write),
                Err(_) => Err(TransportError::WriteTimeout),
            }
        };
        if result.is_ok() {
            if let Err(e) = self.conn.flush().await {
                self.mark_broken();
                return Err(TransportError::Write(e));
            }
        } else {
            self.mark_broken();
        }
        result
    }

    pub async fn read_response(
        &mut self,
        options: &RequestOptions,
    ) -> Result<RawResponse, TransportError> {
        let read = read_http_response(&mut self.conn, options.read_limit);
        let result = if options.read_timeout.is_zero() {
            read.await
        } else {
            match tokio::time::timeout(options.read_timeout, read).await {
                Ok(r) => r,
                Err(_) => Err(TransportError::ReadHeaderTimeout),
            }
        };
        self.use_count += 1;
        if result.is_err() {
            self.mark_broken();
        } else if let Ok(resp) = &result {
            if resp.close_requested {
                self.mark_broken();
            }
        }
        result
    }

    pub fn stat_on_checkout(&self, stat: &mut RequestStat) {
        stat.remote_addr = self.conn.peer_addr().ok();
        stat.connection_age = self.created.elapsed();
        stat.connection_use = self.use_count + 1;
    }
}

/// Dials new connections and pools idle ones, keyed by `scheme|host:port`.
pub struct Transport {
    idle: Mutex<HashMap<String, Vec<PersistConn>>>,
    max_idle_conns_per_host: i32,
    resolver: Arc<crate::dns::Resolver>,
    tls_connector: tokio_rustls::TlsConnector,
}

impl Transport {
    pub fn new(
        resolver: Arc<crate::dns::Resolver>,
        max_idle_conns_per_host: i32,
        insecure_skip_verify: bool,
    ) -> Self {
        let config = build_tls_config(insecure_skip_verify);
        let tls_connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle_conns_per_host,
            resolver,
            tls_connector,
        }
    }

    /// Obtains a connection for `method`, preferring a pooled idle one.
    pub async fn get_conn(
        &self,
        method: &ConnectMethod,
        options: &RequestOptions,
        stat: &mut RequestStat,
    ) -> Result<PersistConn, TransportError> {
        if let Some(conn) = self.take_idle(&method.key()).await {
            conn.stat_on_checkout(stat);
            return Ok(conn);
        }

        let connect_start = Instant::now();
        let (addrs, resolve_time) = self
            .resolver
            .resolve(method.host())
            .await
            .map_err(TransportError::Dns)?;
        stat.resolve_time = resolve_time;

        let ip = addrs
            .first()
            .ok_or_else(|| TransportError::Dns(format!("no addresses for {}", method.host())))?;
        let port = method
            .addr
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse::<u16>().ok())
            .unwrap_or(80);
        let socket_addr = SocketAddr::new(*ip, port);

        let tcp = dial_tcp(socket_addr, options.connect_timeout).await?;
        tune_socket(&tcp);
        stat.remote_addr = tcp.peer_addr().ok();

        let conn = if method.scheme == "https" {
            self.handshake_tls(tcp, method.host()).await?
        } else {
            Connection::Tcp(tcp)
        };
        stat.connect_time = connect_start.elapsed();
        stat.connection_age = Duration::ZERO;
        stat.connection_use = 1;

        Ok(PersistConn::new(method.key(), conn))
    }

    async fn handshake_tls(
        &self,
        tcp: TcpStream,
        host: &str,
    ) -> Result<Connection, TransportError> {
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| TransportError::Tls(format!("invalid server name {host:?}: {e}")))?;
        let stream = self
            .tls_connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(Connection::Tls(Box::new(stream)))
    }

    async fn take_idle(&self, key: &str) -> Option<PersistConn> {
        let mut idle = self.idle.lock().await;
        let list = idle.get_mut(key)?;
        while let Some(conn) = list.pop() {
            if !conn.is_broken() {
                if list.is_empty() {
                    idle.remove(key);
                }
                return Some(conn);
            }
        }
        idle.remove(key);
        None
    }

    /// Offers `conn` back to the idle pool; closes it if the pool is full,
    /// disabled (`max_idle_conns_per_host < 0`), or the connection is broken.
    pub async fn put_idle(&self, conn: PersistConn) {
        if conn.is_broken() || self.max_idle_conns_per_host < 0 {
            return;
        }
        let mut idle = self.idle.lock().await;
        let list = idle.entry(conn.cache_key.clone()).or_default();
        if list.len() >= self.max_idle_conns_per_host as usize {
            return;
        }
        list.push(conn);
    }

    /// Closes idle connections whose idle time exceeds their configured
    /// keepalive timeout, or all of them if `force` is set.
    pub async fn close_idle(&self, keepalive_timeout: Duration, force: bool) {
        let mut idle = self.idle.lock().await;
        if force {
            idle.clear();
            return;
        }
        for list in idle.values_mut() {
            list.retain(|c| c.last_used.elapsed() <= keepalive_timeout);
        }
        idle.retain(|_, list| !list.is_empty());
    }
}

async fn dial_tcp(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream, TransportError> {
    if connect_timeout.is_zero() {
        return TcpStream::connect(addr).await.map_err(TransportError::Connect);
    }
    match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TransportError::Connect(e)),
        Err(_) => Err(TransportError::ConnectTimeout(connect_timeout)),
    }
}

fn tune_socket(stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);
    let _ = sock_ref.set_nodelay(true);
    let _ = sock_ref.set_keepalive(true);
    let _ = sock_ref.set_linger(Some(Duration::ZERO));
}

/// Reads a full HTTP/1.1 response (status line, headers, body) off `conn`,
/// enforcing `read_limit` across the whole response including headers.
async fn read_http_response(
    conn: &mut Connection,
    read_limit: u64,
) -> Result<RawResponse, TransportError> {
    let header_start = Instant::now();
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_double_crlf(&buf) {
            break pos;
        }
        if read_limit != 0 && buf.len() as u64 >= read_limit {
            return Err(TransportError::ReadLimitExceeded(read_limit));
        }
        let n = conn
            .read(&mut chunk)
            .await
            .map_err(TransportError::ReadHeader)?;
        if n == 0 {
            return Err(TransportError::ReadHeader(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before headers were complete",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let header_bytes = &buf[..header_end];
    let mut leftover = buf[header_end + 4..].to_vec();

    let header_text = String::from_utf8_lossy(header_bytes);
    let mut lines = header_text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let (status_code, status_text) = parse_status_line(status_line)?;

    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers
                .entry(name.trim().to_string())
                .or_default()
                .push(value.trim().to_string());
        }
    }

    let close_requested = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("connection"))
        .map(|(_, v)| v.iter().any(|s| s.eq_ignore_ascii_case("close")))
        .unwrap_or(false);

    let remaining_budget = if read_limit == 0 {
        u64::MAX
    } else {
        read_limit.saturating_sub(header_end as u64)
    };

    let is_chunked = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("transfer-encoding"))
        .map(|(_, v)| v.iter().any(|s| s.eq_ignore_ascii_case("chunked")))
        .unwrap_or(false);

    let content_length: Option<u64> = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.first())
        .and_then(|s| s.parse().ok());

    let header_time = header_start.elapsed();
    let body_start = Instant::now();

    let body = if is_chunked {
        read_chunked_body(conn, &mut leftover, remaining_budget).await?
    } else if let Some(len) = content_length {
        read_fixed_body(conn, &mut leftover, len, remaining_budget).await?
    } else if status_code == 204 || status_code == 304 || status_code / 100 == 1 {
        Vec::new()
    } else {
        read_until_close(conn, &mut leftover, remaining_budget).await?
    };
    let body_time = body_start.elapsed();

    Ok(RawResponse {
        status_code,
        status_text,
        headers,
        body,
        close_requested,
        header_time,
        body_time,
    })
}

fn parse_status_line(line: &str) -> Result<(u16, String), TransportError> {
    let mut parts = line.splitn(3, ' ');
    let _version = parts.next().unwrap_or_default();
    let code = parts
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| {
            TransportError::ReadHeader(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("malformed status line {line:?}"),
            ))
        })?;
    let reason = parts.next().unwrap_or("").to_string();
    Ok((code, reason))
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Reads exactly `total_len` bytes off the wire (so the stream stays aligned
/// for a later request on the same connection) but keeps only the first
/// `cap` of them in the returned body, discarding the rest.
async fn read_fixed_body(
    conn: &mut Connection,
    leftover: &mut Vec<u8>,
    total_len: u64,
    cap: u64,
) -> Result<Vec<u8>, TransportError> {
    let mut pending = std::mem::take(leftover);
    pending.truncate(total_len as usize);
    let keep = (cap.min(total_len)) as usize;
    let mut body: Vec<u8> = pending.iter().take(keep).copied().collect();
    let mut read_so_far = pending.len() as u64;

    let mut chunk = [0u8; 8192];
    while read_so_far < total_len {
        let want = (total_len - read_so_far).min(chunk.len() as u64) as usize;
        let n = conn
            .read(&mut chunk[..want])
            .await
            .map_err(TransportError::ReadBody)?;
        if n == 0 {
            break;
        }
        if (body.len() as u64) < cap {
            let take = (cap - body.len() as u64).min(n as u64) as usize;
            body.extend_from_slice(&chunk[..take]);
        }
        read_so_far += n as u64;
    }
    Ok(body)
}

async fn read_until_close(
    conn: &mut Connection,
    leftover: &mut Vec<u8>,
    limit: u64,
) -> Result<Vec<u8>, TransportError> {
    let mut body = std::mem::take(leftover);
    let mut chunk = [0u8; 8192];
    loop {
        if body.len() as u64 >= limit {
            body.truncate(limit as usize);
            break;
        }
        let n = conn.read(&mut chunk).await.map_err(TransportError::ReadBody)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok(body)
}

async fn read_chunked_body(
    conn: &mut Connection,
    leftover: &mut Vec<u8>,
    limit: u64,
) -> Result<Vec<u8>, TransportError> {
    let mut pending = std::mem::take(leftover);
    let mut body = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        while find_crlf(&pending).is_none() {
            let n = conn.read(&mut chunk).await.map_err(TransportError::ReadBody)?;
            if n == 0 {
                return Err(TransportError::ReadBody(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid chunk-size",
                )));
            }
            pending.extend_from_slice(&chunk[..n]);
        }
        let pos = find_crlf(&pending).unwrap();
        let size_line = String::from_utf8_lossy(&pending[..pos]).trim().to_string();
        let size = u64::from_str_radix(size_line.split(';').next().unwrap_or("0"), 16)
            .map_err(|_| {
                TransportError::ReadBody(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("bad chunk size {size_line:?}"),
                ))
            })?;
        pending.drain(..pos + 2);

        if size == 0 {
            // trailer section, terminated by a bare CRLF (the common case
            // with no trailer headers) or a full header block + blank line.
            loop {
                if pending.starts_with(b"\r\n") {
                    break;
                }
                if find_double_crlf(&pending).is_some() {
                    break;
                }
                let n = conn.read(&mut chunk).await.map_err(TransportError::ReadBody)?;
                if n == 0 {
                    break;
                }
                pending.extend_from_slice(&chunk[..n]);
            }
            break;
        }

        while (pending.len() as u64) < size + 2 {
            let n = conn.read(&mut chunk).await.map_err(TransportError::ReadBody)?;
            if n == 0 {
                return Err(TransportError::ReadBody(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid chunk body",
                )));
            }
            pending.extend_from_slice(&chunk[..n]);
        }
        let take = (size as usize).min((limit as usize).saturating_sub(body.len()));
        body.extend_from_slice(&pending[..take]);
        pending.drain(..size as usize + 2);
    }
    Ok(body)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn build_tls_config(insecure_skip_verify: bool) -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("ring provider supports the default protocol versions");

    let mut config = builder.with_root_certificates(roots).with_no_client_auth();
    if insecure_skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerify));
    }
    config
}

/// Accepts any server certificate. Only reachable via `--insecure-skip-verify`.
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
