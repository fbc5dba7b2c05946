use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_queue::ArrayQueue;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{UpstreamConfig, UpstreamMode};

trait PooledStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> PooledStream for T {}

type TcpConn = Box<dyn PooledStream>;

/// Reservoir of upstream streams, plain TCP or TLS depending on the
/// configured mode. Same contract as the UDP pool: pop-or-dial on get,
/// drop on overflow at return time.
pub struct TcpPool {
    conns: ArrayQueue<TcpConn>,
    addresses: Vec<String>,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    timeout: Duration,
    keep_alive: Duration,
    buffer_size: usize,
    max_attempts: usize,
}

impl TcpPool {
    pub fn from_config(upstream: &UpstreamConfig) -> Result<Self> {
        let tls = if upstream.mode == UpstreamMode::Dot {
            let host = if upstream.domain.is_empty() {
                upstream
                    .addresses
                    .first()
                    .map(|a| sni_host(a).to_string())
                    .unwrap_or_default()
            } else {
                upstream.domain.clone()
            };
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| anyhow!("invalid sni host: {host}"))?;
            let connector = TlsConnector::from(Arc::new(tls_client_config(
                upstream.skip_tls_verify,
            )));
            Some((connector, server_name))
        } else {
            None
        };

        Ok(Self {
            conns: ArrayQueue::new(upstream.pool_size.max(1)),
            addresses: upstream.addresses.clone(),
            tls,
            timeout: Duration::from_secs(upstream.timeout),
            keep_alive: Duration::from_secs(upstream.keep_alive),
            buffer_size: upstream.buffer_size,
            max_attempts: upstream.max_attempts,
        })
    }

    async fn dial(&self, addr: &str) -> Result<TcpConn> {
        let stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("connect timed out: {addr}"))?
            .with_context(|| format!("connect upstream: {addr}"))?;

        self.tune(&stream);

        match &self.tls {
            Some((connector, server_name)) => {
                let tls_stream = timeout(
                    self.timeout,
                    connector.connect(server_name.clone(), stream),
                )
                .await
                .map_err(|_| anyhow!("tls handshake timed out: {addr}"))?
                .with_context(|| format!("tls handshake: {addr}"))?;
                Ok(Box::new(tls_stream))
            }
            None => Ok(Box::new(stream)),
        }
    }

    /// Stream tuning on every fresh dial, before first use. Failures
    /// are ignored; the defaults still work.
    fn tune(&self, stream: &TcpStream) {
        let sock = SockRef::from(stream);
        sock.set_nodelay(true).ok();
        sock.set_tcp_keepalive(
            &TcpKeepalive::new()
                .with_time(self.keep_alive)
                .with_interval(self.keep_alive),
        )
        .ok();
        sock.set_recv_buffer_size(self.buffer_size).ok();
        sock.set_send_buffer_size(self.buffer_size).ok();
    }

    async fn new_conn(&self) -> Result<TcpConn> {
        let mut last_err = None;
        for addr in &self.addresses {
            match self.dial(addr).await {
                Ok(conn) => return Ok(conn),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no upstream addresses configured")))
            .context("failed to dial dns upstreams")
    }

    async fn get(&self) -> Result<(TcpConn, bool)> {
        match self.conns.pop() {
            Some(conn) => Ok((conn, true)),
            None => Ok((self.new_conn().await?, false)),
        }
    }

    fn put(&self, conn: TcpConn) {
        let _ = self.conns.push(conn);
    }

    /// Length-prefixed exchange with bounded retries. A reused stream
    /// the remote already half-closed shows up as the first write or
    /// read failing; that retry is free. Fresh-stream failures consume
    /// an attempt.
    pub async fn forward(&self, msg: &Message) -> Result<Message> {
        let wire = msg.to_bytes().context("encode query")?;
        if wire.len() > usize::from(u16::MAX) {
            bail!("query too large for tcp framing: {} bytes", wire.len());
        }
        let mut frame = Vec::with_capacity(2 + wire.len());
        frame.extend_from_slice(&(wire.len() as u16).to_be_bytes());
        frame.extend_from_slice(&wire);

        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;
        let mut last_err: Option<anyhow::Error> = None;

        while attempts < max_attempts {
            let deadline = Instant::now() + self.timeout;
            let (mut conn, reused) = self.get().await?;

            match self.exchange(&mut conn, &frame, deadline).await {
                Ok(resp) => {
                    self.put(conn);
                    return Ok(resp);
                }
                Err(err) => {
                    drop(conn);
                    if reused {
                        debug!(target = "tcp", error = %err, "stale pooled stream, retrying");
                        continue;
                    }
                    last_err = Some(err);
                    attempts += 1;
                }
            }
        }

        bail!(
            "upstream failed after {attempts} attempts: {}",
            last_err.map_or_else(|| "no cause".to_string(), |e| e.to_string())
        )
    }

    async fn exchange(
        &self,
        conn: &mut TcpConn,
        frame: &[u8],
        deadline: Instant,
    ) -> Result<Message> {
        timeout_at(deadline, conn.write_all(frame))
            .await
            .map_err(|_| anyhow!("write timed out"))?
            .context("write query")?;

        let mut len_buf = [0u8; 2];
        timeout_at(deadline, conn.read_exact(&mut len_buf))
            .await
            .map_err(|_| anyhow!("read timed out"))?
            .context("read response length")?;

        let resp_len = usize::from(u16::from_be_bytes(len_buf));
        let mut body = vec![0u8; resp_len];
        timeout_at(deadline, conn.read_exact(&mut body))
            .await
            .map_err(|_| anyhow!("read timed out"))?
            .context("read response body")?;

        Message::from_bytes(&body).context("unpack response")
    }
}

fn tls_client_config(skip_verify: bool) -> ClientConfig {
    // reqwest may pull in a second rustls crypto backend; pin ours
    let _ = rustls::crypto::ring::default_provider().install_default();

    if skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

/// Host part of `host:port`, bracket-aware for IPv6 literals.
fn sni_host(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match addr.rfind(':') {
        Some(idx)
            if !addr[idx + 1..].is_empty()
                && addr[idx + 1..].chars().all(|c| c.is_ascii_digit()) =>
        {
            &addr[..idx]
        }
        _ => addr,
    }
}

/// Accepts any upstream certificate. Only reachable through
/// `upstream.skip_tls_verify`.
#[derive(Debug)]
struct InsecureServerCertVerifier;

impl ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
