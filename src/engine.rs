use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::RecordType;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::bogus::scrub_answers;
use crate::cache::{CacheKey, DnsCache};
use crate::config::{Config, UpstreamMode};
use crate::doh::DohClient;
use crate::edns::EcsInjector;
use crate::forwarder::ForwarderResolver;
use crate::local::LocalResolver;
use crate::tcp::TcpPool;
use crate::udp::UdpPool;

/// Immutable bundle of everything a request needs: tunables, resolver
/// data and live pools. Requests load it once and never observe a
/// half-applied reload; the supervisor publishes a fresh snapshot and
/// retires the old one atomically.
pub struct Snapshot {
    pub compress: bool,
    pub mode: UpstreamMode,
    pub cache: Arc<DnsCache>,
    pub local: LocalResolver,
    pub forwarder: ForwarderResolver,
    pub ecs: Option<EcsInjector>,
    pub udp_pool: UdpPool,
    pub tcp_pool: Option<TcpPool>,
    pub doh: Option<DohClient>,
    pub bogus_ips: Vec<IpAddr>,
}

impl Snapshot {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        if cfg.upstream.addresses.is_empty() {
            anyhow::bail!("no valid upstream addresses configured");
        }

        let timeout = std::time::Duration::from_secs(cfg.upstream.timeout);

        // forwarder rules always dispatch over UDP, so the UDP pool
        // exists in every mode
        let udp_pool = UdpPool::new(
            cfg.upstream.pool_size,
            cfg.upstream.addresses.clone(),
            timeout,
            cfg.upstream.buffer_size,
            cfg.upstream.max_attempts,
        );

        let tcp_pool = match cfg.upstream.mode {
            UpstreamMode::Tcp | UpstreamMode::Dot => Some(TcpPool::from_config(&cfg.upstream)?),
            _ => None,
        };

        let doh = match cfg.upstream.mode {
            UpstreamMode::Doh => Some(DohClient::from_config(&cfg.upstream)?),
            _ => None,
        };

        let bogus_ips = if cfg.bogus_nxdomain.enable {
            cfg.bogus_nxdomain
                .ips
                .iter()
                .filter_map(|raw| match raw.parse::<IpAddr>() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        warn!(target = "config", ip = %raw, "skipping invalid bogus ip");
                        None
                    }
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            compress: cfg.server.compress,
            mode: cfg.upstream.mode,
            cache: Arc::new(DnsCache::new(
                cfg.cache.size,
                cfg.cache.shards,
                cfg.cache.min_ttl,
                cfg.cache.neg_ttl,
            )),
            local: LocalResolver::new(&cfg.local, cfg.cache.min_ttl as u32),
            forwarder: ForwarderResolver::new(&cfg.forwarder),
            ecs: cfg.edns.enable.then(|| EcsInjector::new(&cfg.edns)),
            udp_pool,
            tcp_pool,
            doh,
            bogus_ips,
        })
    }
}

type Waiters = Vec<oneshot::Sender<Result<Message, String>>>;

#[derive(Clone)]
pub struct Engine {
    snapshot: Arc<ArcSwap<Snapshot>>,
    inflight: Arc<DashMap<u64, Waiters>>,
}

impl Engine {
    pub fn new(snapshot: Arc<ArcSwap<Snapshot>>) -> Self {
        Self {
            snapshot,
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Answers one client packet. The returned bytes are always a
    /// well-formed response (SERVFAIL on total upstream failure); an
    /// error means the packet was not a DNS query and should be
    /// dropped.
    pub async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> Result<Bytes> {
        let req = Message::from_bytes(packet).context("parse request")?;
        let snap = self.snapshot.load_full();
        let start = std::time::Instant::now();

        let qname = req
            .queries()
            .first()
            .map(|q| q.name().to_lowercase().to_string())
            .unwrap_or_default();
        let qtype = req
            .queries()
            .first()
            .map(|q| q.query_type())
            .unwrap_or(RecordType::A);

        if let Some(q) = req.queries().first() {
            if let Some(mut resp) = snap.local.resolve(q) {
                info!(
                    event = "dns_response",
                    source = "local",
                    qname = %qname,
                    qtype = ?qtype,
                    client_ip = %peer.ip(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "local answer"
                );
                return shape_reply(&mut resp, &req, snap.compress);
            }
        }

        if let Some(mut resp) = snap.cache.get(&req) {
            info!(
                event = "dns_response",
                source = "cache",
                qname = %qname,
                qtype = ?qtype,
                rcode = ?resp.response_code(),
                client_ip = %peer.ip(),
                latency_ms = start.elapsed().as_millis() as u64,
                "cache hit"
            );
            return shape_reply(&mut resp, &req, snap.compress);
        }

        let mut outbound = req.clone();
        if let Some(ecs) = &snap.ecs {
            ecs.add_ecs(&mut outbound, peer.ip());
        }

        match self.resolve_upstream(&snap, &outbound, &qname).await {
            Ok(mut resp) => {
                info!(
                    event = "dns_response",
                    source = "upstream",
                    qname = %qname,
                    qtype = ?qtype,
                    rcode = ?resp.response_code(),
                    client_ip = %peer.ip(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    cache = snap.cache.enabled(),
                    "forwarded"
                );
                shape_reply(&mut resp, &req, snap.compress)
            }
            Err(err) => {
                warn!(
                    event = "dns_response",
                    qname = %qname,
                    qtype = ?qtype,
                    client_ip = %peer.ip(),
                    error = %err,
                    "upstream failed"
                );
                servfail_reply(&req, snap.compress)
            }
        }
    }

    /// Upstream fetch with single-flight collapsing: identical
    /// concurrent questions ride one exchange. The leader scrubs and
    /// caches before waking the waiters, so every copy is final.
    async fn resolve_upstream(
        &self,
        snap: &Arc<Snapshot>,
        outbound: &Message,
        qname: &str,
    ) -> Result<Message> {
        let Some(hash) = CacheKey::from_message(outbound).map(|k| k.hash64()) else {
            // no question section, nothing to collapse on
            return self.fetch(snap, outbound, qname).await;
        };

        let rx = {
            use dashmap::mapref::entry::Entry;
            match self.inflight.entry(hash) {
                Entry::Occupied(mut entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.get_mut().push(tx);
                    Some(rx)
                }
                Entry::Vacant(entry) => {
                    entry.insert(Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = rx {
            return match rx.await {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(err)) => Err(anyhow::anyhow!("{err}")),
                // leader dropped without answering; try it ourselves
                Err(_) => self.fetch(snap, outbound, qname).await,
            };
        }

        let mut guard = InflightGuard {
            inflight: Arc::clone(&self.inflight),
            hash,
            armed: true,
        };
        let result = self.fetch(snap, outbound, qname).await;

        let waiters = guard.disarm();
        for tx in waiters {
            let _ = tx.send(match &result {
                Ok(resp) => Ok(resp.clone()),
                Err(err) => Err(err.to_string()),
            });
        }

        result
    }

    /// One real upstream exchange plus the response post-processing
    /// shared by every delivery path.
    async fn fetch(&self, snap: &Snapshot, outbound: &Message, qname: &str) -> Result<Message> {
        let mut resp = self.forward(snap, outbound, qname).await?;

        if !snap.bogus_ips.is_empty() {
            scrub_answers(&mut resp, &snap.bogus_ips);
        }
        snap.cache.set(&resp);

        Ok(resp)
    }

    async fn forward(&self, snap: &Snapshot, outbound: &Message, qname: &str) -> Result<Message> {
        if !qname.is_empty() {
            if let Some(targets) = snap.forwarder.get_upstream(qname) {
                // rules dispatch over UDP regardless of the default mode
                return snap.udp_pool.forward(outbound, targets).await;
            }
        }

        match snap.mode {
            UpstreamMode::Doh => {
                snap.doh
                    .as_ref()
                    .context("doh client not initialized")?
                    .forward(outbound)
                    .await
            }
            UpstreamMode::Tcp | UpstreamMode::Dot => {
                snap.tcp_pool
                    .as_ref()
                    .context("tcp pool not initialized")?
                    .forward(outbound)
                    .await
            }
            UpstreamMode::Udp => snap.udp_pool.forward(outbound, &[]).await,
        }
    }
}

/// Removes the in-flight entry if the leader unwinds before
/// delivering, so waiters fail over to their own fetch instead of
/// hanging.
struct InflightGuard {
    inflight: Arc<DashMap<u64, Waiters>>,
    hash: u64,
    armed: bool,
}

impl InflightGuard {
    fn disarm(&mut self) -> Waiters {
        self.armed = false;
        self.inflight
            .remove(&self.hash)
            .map(|(_, w)| w)
            .unwrap_or_default()
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inflight.remove(&self.hash);
        }
    }
}

/// Rewrites a resolved message into the reply for this client: the
/// client's ID and question, response bit set, RD echoed. RCODE and
/// answers are preserved.
fn shape_reply(resp: &mut Message, req: &Message, compress: bool) -> Result<Bytes> {
    resp.set_id(req.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(req.op_code());
    resp.set_recursion_desired(req.recursion_desired());
    *resp.queries_mut() = req.queries().to_vec();
    encode_reply(resp, compress)
}

/// SERVFAIL built from the client's query; the client always gets an
/// answer, never a silent drop.
fn servfail_reply(req: &Message, compress: bool) -> Result<Bytes> {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(req.op_code());
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::ServFail);
    *msg.queries_mut() = req.queries().to_vec();
    encode_reply(&msg, compress)
}

fn encode_reply(msg: &Message, compress: bool) -> Result<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        if !compress {
            encoder.set_canonical_names(true);
        }
        msg.emit(&mut encoder).context("encode response")?;
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForwarderRule, StaticRecord};
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record};
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::UdpSocket;

    fn query_bytes(id: u16, name: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_recursion_desired(true);
        let mut q = Query::new();
        q.set_name(Name::from_str(name).expect("name"));
        q.set_query_type(RecordType::A);
        q.set_query_class(DNSClass::IN);
        msg.add_query(q);
        msg.to_bytes().expect("encode")
    }

    fn client_addr() -> SocketAddr {
        "192.0.2.10:5000".parse().unwrap()
    }

    struct Upstream {
        addr: SocketAddr,
        requests: Arc<AtomicUsize>,
    }

    /// UDP upstream answering with a fixed rcode/answer after an
    /// optional delay, counting the exchanges it served.
    async fn spawn_upstream(
        answer: Option<Ipv4Addr>,
        rcode: ResponseCode,
        delay_ms: u64,
    ) -> Upstream {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("bind"));
        let addr = socket.local_addr().expect("local addr");
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let Ok(req) = Message::from_bytes(&buf[..len]) else {
                    continue;
                };
                if delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
                let mut resp = Message::new();
                resp.set_id(req.id());
                resp.set_message_type(MessageType::Response);
                resp.set_response_code(rcode);
                if let Some(q) = req.queries().first() {
                    resp.add_query(q.clone());
                    if let Some(ip) = answer {
                        resp.add_answer(Record::from_rdata(
                            q.name().clone(),
                            300,
                            RData::A(A(ip)),
                        ));
                    }
                }
                let Ok(wire) = resp.to_bytes() else { continue };
                let _ = socket.send_to(&wire, peer).await;
            }
        });
        Upstream { addr, requests }
    }

    fn engine_for(cfg: &Config) -> Engine {
        let snapshot = Snapshot::from_config(cfg).expect("snapshot");
        Engine::new(Arc::new(ArcSwap::from_pointee(snapshot)))
    }

    fn base_config(upstream_addr: &str) -> Config {
        let mut cfg = Config::default();
        cfg.upstream.addresses = vec![upstream_addr.to_string()];
        cfg.upstream.timeout = 1;
        cfg.upstream.max_attempts = 2;
        cfg.cache.min_ttl = 60;
        cfg.cache.neg_ttl = 1;
        cfg
    }

    #[tokio::test]
    async fn local_record_answers_authoritatively() {
        let mut cfg = base_config("127.0.0.1:1");
        cfg.local.enable = true;
        cfg.local.static_records = vec![StaticRecord {
            domain: "example.com".to_string(),
            ip: "10.0.0.1".to_string(),
        }];
        let engine = engine_for(&cfg);

        let bytes = engine
            .handle_packet(&query_bytes(7, "example.com."), client_addr())
            .await
            .expect("reply");
        let resp = Message::from_bytes(&bytes).expect("parse");

        assert_eq!(resp.id(), 7);
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert!(resp.authoritative());
        assert_eq!(resp.queries().len(), 1);
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(resp.answers()[0].ttl(), 60);
        match resp.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, Ipv4Addr::new(10, 0, 0, 1)),
            other => panic!("unexpected rdata: {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_query_is_served_from_cache() {
        let upstream =
            spawn_upstream(Some(Ipv4Addr::new(1, 2, 3, 4)), ResponseCode::NoError, 0).await;
        let engine = engine_for(&base_config(&upstream.addr.to_string()));

        let first = engine
            .handle_packet(&query_bytes(1, "foo.test."), client_addr())
            .await
            .expect("reply");
        let second = engine
            .handle_packet(&query_bytes(2, "foo.test."), client_addr())
            .await
            .expect("reply");

        assert_eq!(upstream.requests.load(Ordering::SeqCst), 1);

        let first = Message::from_bytes(&first).expect("parse");
        let second = Message::from_bytes(&second).expect("parse");
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert_eq!(first.answers().len(), 1);
        assert_eq!(second.answers().len(), 1);
    }

    #[tokio::test]
    async fn nxdomain_survives_caching_and_shaping() {
        let upstream = spawn_upstream(None, ResponseCode::NXDomain, 0).await;
        let engine = engine_for(&base_config(&upstream.addr.to_string()));

        let first = engine
            .handle_packet(&query_bytes(1, "gone.test."), client_addr())
            .await
            .expect("reply");
        let second = engine
            .handle_packet(&query_bytes(2, "gone.test."), client_addr())
            .await
            .expect("reply");

        // negative entry served the repeat
        assert_eq!(upstream.requests.load(Ordering::SeqCst), 1);
        assert_eq!(
            Message::from_bytes(&first).expect("parse").response_code(),
            ResponseCode::NXDomain
        );
        assert_eq!(
            Message::from_bytes(&second).expect("parse").response_code(),
            ResponseCode::NXDomain
        );
    }

    #[tokio::test]
    async fn total_upstream_failure_maps_to_servfail() {
        let engine = engine_for(&base_config("127.0.0.1:1"));

        let bytes = engine
            .handle_packet(&query_bytes(9, "down.test."), client_addr())
            .await
            .expect("reply");
        let resp = Message::from_bytes(&bytes).expect("parse");

        assert_eq!(resp.id(), 9);
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
        assert_eq!(resp.queries().len(), 1);
        assert_eq!(resp.queries()[0].name().to_string(), "down.test.");
    }

    #[tokio::test]
    async fn forwarder_rule_overrides_default_upstreams() {
        let default_upstream =
            spawn_upstream(Some(Ipv4Addr::new(1, 1, 1, 1)), ResponseCode::NoError, 0).await;
        let rule_upstream =
            spawn_upstream(Some(Ipv4Addr::new(10, 9, 9, 9)), ResponseCode::NoError, 0).await;

        let mut cfg = base_config(&default_upstream.addr.to_string());
        cfg.forwarder.enable = true;
        cfg.forwarder.rules = vec![ForwarderRule {
            domain: "corp.example".to_string(),
            upstreams: vec![rule_upstream.addr.to_string()],
        }];
        let engine = engine_for(&cfg);

        let ruled = engine
            .handle_packet(&query_bytes(1, "host.corp.example."), client_addr())
            .await
            .expect("reply");
        let ruled = Message::from_bytes(&ruled).expect("parse");
        match ruled.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, Ipv4Addr::new(10, 9, 9, 9)),
            other => panic!("unexpected rdata: {other:?}"),
        }

        let defaulted = engine
            .handle_packet(&query_bytes(2, "host.other.example."), client_addr())
            .await
            .expect("reply");
        let defaulted = Message::from_bytes(&defaulted).expect("parse");
        match defaulted.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, Ipv4Addr::new(1, 1, 1, 1)),
            other => panic!("unexpected rdata: {other:?}"),
        }

        assert_eq!(default_upstream.requests.load(Ordering::SeqCst), 1);
        assert_eq!(rule_upstream.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bogus_answers_are_scrubbed_before_caching() {
        let sentinel = Ipv4Addr::new(93, 184, 216, 34);
        let upstream = spawn_upstream(Some(sentinel), ResponseCode::NoError, 0).await;

        let mut cfg = base_config(&upstream.addr.to_string());
        cfg.bogus_nxdomain.enable = true;
        cfg.bogus_nxdomain.ips = vec![sentinel.to_string(), "not-an-ip".to_string()];
        let engine = engine_for(&cfg);

        for id in [1u16, 2] {
            let bytes = engine
                .handle_packet(&query_bytes(id, "portal.test."), client_addr())
                .await
                .expect("reply");
            let resp = Message::from_bytes(&bytes).expect("parse");
            match resp.answers()[0].data() {
                Some(RData::A(a)) => assert_eq!(a.0, Ipv4Addr::UNSPECIFIED),
                other => panic!("unexpected rdata: {other:?}"),
            }
        }
        // the second answer came from cache, already scrubbed
        assert_eq!(upstream.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_identical_queries_share_one_exchange() {
        let upstream =
            spawn_upstream(Some(Ipv4Addr::new(4, 4, 4, 4)), ResponseCode::NoError, 200).await;
        let engine = engine_for(&base_config(&upstream.addr.to_string()));

        let ids = [21u16, 22, 23, 24];
        let packets: Vec<Vec<u8>> = ids.iter().map(|id| query_bytes(*id, "dup.test.")).collect();
        let replies = futures::future::join_all(
            packets
                .iter()
                .map(|bytes| engine.handle_packet(bytes, client_addr())),
        )
        .await;

        assert_eq!(upstream.requests.load(Ordering::SeqCst), 1);
        for (id, reply) in ids.iter().zip(replies) {
            let resp = Message::from_bytes(&reply.expect("reply")).expect("parse");
            assert_eq!(resp.id(), *id);
            assert_eq!(resp.answers().len(), 1);
        }
    }

    #[tokio::test]
    async fn unparseable_packet_is_an_error() {
        let engine = engine_for(&base_config("127.0.0.1:1"));
        assert!(engine
            .handle_packet(&[0x01, 0x02], client_addr())
            .await
            .is_err());
    }

    #[test]
    fn snapshot_requires_upstream_addresses() {
        let cfg = Config::default();
        assert!(Snapshot::from_config(&cfg).is_err());
    }
}
