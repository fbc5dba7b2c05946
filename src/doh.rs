use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam_queue::ArrayQueue;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::debug;

use crate::config::UpstreamConfig;

const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// HTTP/2 frame overhead slack on top of the configured buffer size.
const BUFFER_SLACK: usize = 1024;

/// DNS-over-HTTPS forwarder: POSTs wire-format queries to each
/// configured URL in order until one answers.
pub struct DohClient {
    client: reqwest::Client,
    urls: Vec<String>,
    buffers: Arc<BufferPool>,
}

impl DohClient {
    pub fn from_config(upstream: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(upstream.timeout))
            .pool_idle_timeout(Duration::from_secs(upstream.keep_alive))
            .pool_max_idle_per_host(upstream.doh.idle.max_per_host)
            .danger_accept_invalid_certs(upstream.skip_tls_verify)
            .build()
            .context("build doh client")?;

        let urls = upstream
            .addresses
            .iter()
            .map(|addr| format!("https://{addr}{}", upstream.doh.query_path))
            .collect();

        Ok(Self {
            client,
            urls,
            buffers: Arc::new(BufferPool::new(
                upstream.doh.idle.max_conn.max(1),
                upstream.buffer_size + BUFFER_SLACK,
            )),
        })
    }

    pub async fn forward(&self, msg: &Message) -> Result<Message> {
        let wire = msg.to_bytes().context("encode query")?;
        let mut last_err: Option<anyhow::Error> = None;

        for url in &self.urls {
            match self.post(url, wire.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    debug!(target = "doh", url = %url, error = %err, "doh upstream failed");
                    last_err = Some(err);
                }
            }
        }

        bail!(
            "all doh upstreams failed: {}",
            last_err.map_or_else(|| "no urls configured".to_string(), |e| e.to_string())
        )
    }

    async fn post(&self, url: &str, wire: Vec<u8>) -> Result<Message> {
        let mut resp = self
            .client
            .post(url)
            .header(CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
            .header(ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
            .body(wire)
            .send()
            .await
            .with_context(|| format!("doh request: {url}"))?;

        if resp.status() != StatusCode::OK {
            bail!("doh upstream {url} returned {}", resp.status());
        }

        // the buffer goes back to the pool when the guard drops, on
        // every exit path below
        let mut buf = self.buffers.get();
        while let Some(chunk) = resp.chunk().await.context("read doh body")? {
            buf.extend_from_slice(&chunk);
        }

        Message::from_bytes(&buf).context("unpack doh response")
    }

    #[cfg(test)]
    fn urls(&self) -> &[String] {
        &self.urls
    }
}

/// Free list of response buffers shared by all in-flight DoH
/// exchanges. Empty pool allocates, full pool drops.
struct BufferPool {
    pool: ArrayQueue<Vec<u8>>,
    buf_capacity: usize,
}

impl BufferPool {
    fn new(capacity: usize, buf_capacity: usize) -> Self {
        Self {
            pool: ArrayQueue::new(capacity),
            buf_capacity,
        }
    }

    fn get(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .pool
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buf_capacity));
        PooledBuf {
            pool: Arc::clone(self),
            buf: Some(buf),
        }
    }
}

struct PooledBuf {
    pool: Arc<BufferPool>,
    buf: Option<Vec<u8>>,
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            let _ = self.pool.pool.push(buf);
        }
    }
}
