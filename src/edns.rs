use std::net::IpAddr;

use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};

use crate::config::EdnsConfig;

/// Stamps outbound queries with an EDNS Client Subnet option so
/// geo-aware upstreams see (a prefix of) the real client address
/// instead of this proxy.
pub struct EcsInjector {
    v4_prefix: u8,
    v6_prefix: u8,
}

impl EcsInjector {
    pub fn new(cfg: &EdnsConfig) -> Self {
        Self {
            v4_prefix: cfg.ipv4_mask.min(32),
            v6_prefix: cfg.ipv6_mask.min(128),
        }
    }

    /// Adds a client-subnet option for `client`. A query that already
    /// carries one is left untouched, byte for byte. Best effort; this
    /// never fails.
    pub fn add_ecs(&self, msg: &mut Message, client: IpAddr) {
        if let Some(edns) = msg.extensions() {
            if edns.options().get(EdnsCode::Subnet).is_some() {
                return;
            }
        }

        let payload = self.subnet_payload(client);
        let mut edns = msg.extensions().clone().unwrap_or_else(Edns::new);
        edns.options_mut()
            .insert(EdnsOption::Unknown(u16::from(EdnsCode::Subnet), payload));
        msg.set_edns(edns);
    }

    /// RFC 7871 option data: FAMILY | SOURCE PREFIX | SCOPE PREFIX |
    /// ADDRESS truncated to the prefix and masked.
    fn subnet_payload(&self, client: IpAddr) -> Vec<u8> {
        let (family, prefix, octets): (u16, u8, Vec<u8>) = match client {
            IpAddr::V4(v4) => (1, self.v4_prefix, v4.octets().to_vec()),
            IpAddr::V6(v6) => (2, self.v6_prefix, v6.octets().to_vec()),
        };

        let addr_len = usize::from(prefix).div_ceil(8);
        let mut addr = octets[..addr_len].to_vec();
        if prefix % 8 != 0 {
            if let Some(last) = addr.last_mut() {
                *last &= 0xFF << (8 - prefix % 8);
            }
        }

        let mut payload = Vec::with_capacity(4 + addr.len());
        payload.extend_from_slice(&family.to_be_bytes());
        payload.push(prefix);
        payload.push(0);
        payload.extend_from_slice(&addr);
        payload
    }
}
