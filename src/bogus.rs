use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hickory_proto::op::Message;
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record};

/// Counter for captive portals that answer every miss with a sentinel
/// address: when any A/AAAA answer matches the denylist, every address
/// answer is blanked (`0.0.0.0` / `::`) so clients treat the name as
/// unreachable instead of following the portal.
pub fn scrub_answers(resp: &mut Message, denylist: &[IpAddr]) {
    if denylist.is_empty() {
        return;
    }

    let has_bogus = resp.answers().iter().any(|rec| match rec.data() {
        Some(RData::A(a)) => denylist.contains(&IpAddr::V4(a.0)),
        Some(RData::AAAA(aaaa)) => denylist.contains(&IpAddr::V6(aaaa.0)),
        _ => false,
    });

    if !has_bogus {
        return;
    }

    for rec in resp.answers_mut() {
        let replacement = match rec.data() {
            Some(RData::A(_)) => Some(RData::A(A(Ipv4Addr::UNSPECIFIED))),
            Some(RData::AAAA(_)) => Some(RData::AAAA(AAAA(Ipv6Addr::UNSPECIFIED))),
            _ => None,
        };
        if let Some(rdata) = replacement {
            *rec = Record::from_rdata(rec.name().clone(), rec.ttl(), rdata);
        }
    }
}
