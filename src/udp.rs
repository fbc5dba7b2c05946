use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_queue::ArrayQueue;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

const MIN_RECV_BUFFER: usize = 512;

/// Reservoir of connected UDP sockets to the default upstreams.
/// Sockets taken and not returned simply drain the reservoir; returns
/// over capacity are dropped (closing the socket).
pub struct UdpPool {
    conns: ArrayQueue<UdpSocket>,
    addresses: Vec<String>,
    timeout: Duration,
    buffer_size: usize,
    max_attempts: usize,
}

impl UdpPool {
    pub fn new(
        size: usize,
        addresses: Vec<String>,
        timeout: Duration,
        buffer_size: usize,
        max_attempts: usize,
    ) -> Self {
        Self {
            conns: ArrayQueue::new(size.max(1)),
            addresses,
            timeout,
            buffer_size,
            max_attempts,
        }
    }

    /// Connects a fresh socket to one upstream address.
    async fn dial(&self, addr: &str) -> Result<UdpSocket> {
        let remote: SocketAddr = tokio::net::lookup_host(addr)
            .await
            .with_context(|| format!("resolve upstream address: {addr}"))?
            .next()
            .ok_or_else(|| anyhow!("no address for upstream: {addr}"))?;

        let bind: SocketAddr = if remote.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };

        let socket = UdpSocket::bind(bind).await.context("bind udp socket")?;
        socket
            .connect(remote)
            .await
            .with_context(|| format!("connect udp socket: {addr}"))?;
        Ok(socket)
    }

    /// First dialable upstream, in configured order.
    async fn new_conn(&self) -> Result<UdpSocket> {
        let mut last_err = None;
        for addr in &self.addresses {
            match self.dial(addr).await {
                Ok(socket) => return Ok(socket),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no upstream addresses configured")))
            .context("failed to dial dns upstreams")
    }

    /// Idle socket when one is queued (`reused = true`), else a fresh
    /// dial (`reused = false`).
    async fn get(&self) -> Result<(UdpSocket, bool)> {
        match self.conns.pop() {
            Some(socket) => Ok((socket, true)),
            None => Ok((self.new_conn().await?, false)),
        }
    }

    fn put(&self, socket: UdpSocket) {
        // push failure means the queue is full; the socket closes on drop
        let _ = self.conns.push(socket);
    }

    /// One query/response exchange with bounded retries. Non-empty
    /// `overrides` bypass the pool: each attempt dials
    /// `overrides[attempt % len]` directly and the socket is single
    /// shot. A reused pool socket that fails is replaced without
    /// consuming an attempt; fresh-socket failures count.
    pub async fn forward(&self, msg: &Message, overrides: &[String]) -> Result<Message> {
        let wire = msg.to_bytes().context("encode query")?;
        let max_attempts = self.max_attempts.max(1);

        let mut attempts = 0;
        let mut last_err: Option<anyhow::Error> = None;

        while attempts < max_attempts {
            let deadline = Instant::now() + self.timeout;

            let (socket, reused) = if overrides.is_empty() {
                self.get().await?
            } else {
                let addr = &overrides[attempts % overrides.len()];
                match self.dial(addr).await {
                    Ok(socket) => (socket, false),
                    Err(err) => {
                        last_err = Some(err);
                        attempts += 1;
                        continue;
                    }
                }
            };

            let sent = match timeout_at(deadline, socket.send(&wire)).await {
                Ok(Ok(_)) => true,
                Ok(Err(err)) => {
                    last_err = Some(err.into());
                    false
                }
                Err(_) => {
                    last_err = Some(anyhow!("send timed out"));
                    false
                }
            };
            if !sent {
                drop(socket);
                if reused {
                    debug!(target = "udp", "stale pooled socket on send, retrying");
                    continue;
                }
                attempts += 1;
                continue;
            }

            let mut buf = vec![0u8; self.buffer_size.max(MIN_RECV_BUFFER)];
            let parsed = match timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => Message::from_bytes(&buf[..len]).context("unpack response"),
                Ok(Err(err)) => Err(anyhow::Error::from(err)),
                Err(_) => Err(anyhow!("recv timed out")),
            };

            match parsed {
                Ok(resp) => {
                    if overrides.is_empty() {
                        self.put(socket);
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    drop(socket);
                    if reused {
                        debug!(target = "udp", error = %err, "stale pooled socket on recv, retrying");
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
}
