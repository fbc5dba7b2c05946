use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::Path;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::config::LocalConfig;

/// Static answers from configuration and the OS hosts file. A name
/// starting with `*.` lands in the wildcard map with the prefix
/// stripped, so `*.lan` covers every label under `lan`.
pub struct LocalResolver {
    records: FxHashMap<String, Vec<IpAddr>>,
    wildcards: FxHashMap<String, Vec<IpAddr>>,
    min_ttl: u32,
}

impl LocalResolver {
    pub fn new(cfg: &LocalConfig, min_ttl: u32) -> Self {
        let mut resolver = Self {
            records: FxHashMap::default(),
            wildcards: FxHashMap::default(),
            min_ttl,
        };

        if !cfg.enable {
            return resolver;
        }

        if cfg.use_hosts_file {
            resolver.load_hosts_file(hosts_path());
        }

        for rec in &cfg.static_records {
            resolver.add_record(&rec.domain, &rec.ip);
        }

        resolver
    }

    pub fn record_count(&self) -> usize {
        self.records.len() + self.wildcards.len()
    }

    fn load_hosts_file(&mut self, path: &Path) {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(err) => {
                debug!(target = "local", path = %path.display(), error = %err, "hosts file unavailable");
                return;
            }
        };
        self.load_hosts(BufReader::new(file));
    }

    /// Parses `<IP> <name>[ <name>...]` lines; comments, blanks and
    /// unparsable IPs are skipped.
    fn load_hosts<R: BufRead>(&mut self, reader: R) {
        for line in reader.lines().map_while(Result::ok) {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let Some(ip_field) = fields.next() else {
                continue;
            };
            let Ok(ip) = ip_field.parse::<IpAddr>() else {
                continue;
            };

            for name in fields {
                self.add_record_ip(name, ip);
            }
        }
    }

    fn add_record(&mut self, domain: &str, ip: &str) {
        let Ok(ip) = ip.parse::<IpAddr>() else {
            debug!(target = "local", domain, ip, "skipping record with invalid ip");
            return;
        };
        self.add_record_ip(domain, ip);
    }

    fn add_record_ip(&mut self, domain: &str, ip: IpAddr) {
        let name = fqdn(domain);
        if let Some(stripped) = name.strip_prefix("*.") {
            self.wildcards
                .entry(stripped.to_string())
                .or_default()
                .push(ip);
        } else {
            self.records.entry(name).or_default().push(ip);
        }
    }

    /// Answers the first question from the static maps, exact before
    /// wildcard (longest suffix wins). `None` falls through to the
    /// next strategy.
    pub fn resolve(&self, query: &Query) -> Option<Message> {
        let qname = query.name().to_lowercase().to_string();

        let ips = match self.records.get(&qname) {
            Some(ips) => ips,
            None => {
                let mut best: Option<(&String, &Vec<IpAddr>)> = None;
                for (domain, ips) in &self.wildcards {
                    if qname == *domain || qname.ends_with(&format!(".{domain}")) {
                        if best.map_or(true, |(b, _)| domain.len() > b.len()) {
                            best = Some((domain, ips));
                        }
                    }
                }
                best.map(|(_, ips)| ips)?
            }
        };

        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.set_authoritative(true);
        msg.add_query(query.clone());

        for ip in ips {
            let rdata = match (ip, query.query_type()) {
                (IpAddr::V4(v4), RecordType::A) => RData::A(A(*v4)),
                (IpAddr::V6(v6), RecordType::AAAA) => RData::AAAA(AAAA(*v6)),
                _ => continue,
            };
            msg.add_answer(Record::from_rdata(
                query.name().clone(),
                self.min_ttl,
                rdata,
            ));
        }

        Some(msg)
    }
}

#[cfg(windows)]
fn hosts_path() -> &'static Path {
    Path::new("C:\\Windows\\System32\\drivers\\etc\\hosts")
}

#[cfg(not(windows))]
fn hosts_path() -> &'static Path {
    Path::new("/etc/hosts")
}

/// Lowercase with a guaranteed trailing dot.
pub fn fqdn(name: &str) -> String {
    let mut out = name.to_ascii_lowercase();
    if !out.ends_with('.') {
        out.push('.');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticRecord;
    use hickory_proto::rr::{DNSClass, Name};
    use std::io::Cursor;
    use std::str::FromStr;

    fn config(records: &[(&str, &str)]) -> LocalConfig {
        LocalConfig {
            enable: true,
            use_hosts_file: false,
            include_files: Vec::new(),
            static_records: records
                .iter()
                .map(|(domain, ip)| StaticRecord {
                    domain: domain.to_string(),
                    ip: ip.to_string(),
                })
                .collect(),
        }
    }

    fn query(name: &str, qtype: RecordType) -> Query {
        let mut q = Query::new();
        q.set_name(Name::from_str(name).expect("name"));
        q.set_query_type(qtype);
        q.set_query_class(DNSClass::IN);
        q
    }

    #[test]
    fn exact_match_answers_by_query_type() {
        let resolver = LocalResolver::new(
            &config(&[("example.com", "10.0.0.1"), ("example.com", "2001:db8::1")]),
            60,
        );

        let v4 = resolver
            .resolve(&query("example.com.", RecordType::A))
            .expect("answer");
        assert!(v4.authoritative());
        assert_eq!(v4.answers().len(), 1);
        assert_eq!(v4.answers()[0].ttl(), 60);
        match v4.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0.to_string(), "10.0.0.1"),
            other => panic!("unexpected rdata: {other:?}"),
        }

        let v6 = resolver
            .resolve(&query("example.com.", RecordType::AAAA))
            .expect("answer");
        assert_eq!(v6.answers().len(), 1);
        match v6.answers()[0].data() {
            Some(RData::AAAA(aaaa)) => assert_eq!(aaaa.0.to_string(), "2001:db8::1"),
            other => panic!("unexpected rdata: {other:?}"),
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let resolver = LocalResolver::new(&config(&[("Example.COM", "10.0.0.1")]), 60);
        let resp = resolver
            .resolve(&query("EXAMPLE.com.", RecordType::A))
            .expect("answer");
        assert_eq!(resp.answers().len(), 1);
    }

    #[test]
    fn wildcard_matches_subdomains_with_longest_suffix() {
        let resolver = LocalResolver::new(
            &config(&[("*.lan", "10.0.0.1"), ("*.dev.lan", "10.0.0.2")]),
            60,
        );

        let generic = resolver
            .resolve(&query("printer.lan.", RecordType::A))
            .expect("answer");
        match generic.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0.to_string(), "10.0.0.1"),
            other => panic!("unexpected rdata: {other:?}"),
        }

        let deeper = resolver
            .resolve(&query("box.dev.lan.", RecordType::A))
            .expect("answer");
        match deeper.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0.to_string(), "10.0.0.2"),
            other => panic!("unexpected rdata: {other:?}"),
        }

        // the wildcard also covers the bare domain
        assert!(resolver.resolve(&query("lan.", RecordType::A)).is_some());
        // but not a name that merely shares the suffix string
        assert!(resolver.resolve(&query("wlan.", RecordType::A)).is_none());
    }

    #[test]
    fn miss_and_disabled_return_none() {
        let resolver = LocalResolver::new(&config(&[("example.com", "10.0.0.1")]), 60);
        assert!(resolver.resolve(&query("other.com.", RecordType::A)).is_none());

        let disabled = LocalResolver::new(
            &LocalConfig {
                enable: false,
                use_hosts_file: false,
                include_files: Vec::new(),
                static_records: vec![StaticRecord {
                    domain: "example.com".to_string(),
                    ip: "10.0.0.1".to_string(),
                }],
            },
            60,
        );
        assert_eq!(disabled.record_count(), 0);
        assert!(disabled.resolve(&query("example.com.", RecordType::A)).is_none());
    }

    #[test]
    fn invalid_static_ip_is_skipped() {
        let resolver = LocalResolver::new(&config(&[("bad.test", "not-an-ip")]), 60);
        assert!(resolver.resolve(&query("bad.test.", RecordType::A)).is_none());
    }

    #[test]
    fn hosts_parser_skips_comments_blanks_and_garbage() {
        let hosts = "
# local machines
127.0.0.1  localhost localhost.localdomain

10.1.2.3   nas.lan
nonsense   broken.lan
::1        six.lan
10.9.9.9   *.guest.lan
";
        let mut resolver = LocalResolver::new(&config(&[]), 30);
        resolver.load_hosts(Cursor::new(hosts));

        let nas = resolver
            .resolve(&query("nas.lan.", RecordType::A))
            .expect("answer");
        assert_eq!(nas.answers().len(), 1);
        assert_eq!(nas.answers()[0].ttl(), 30);

        // two names on the localhost line
        assert!(resolver
            .resolve(&query("localhost.localdomain.", RecordType::A))
            .is_some());

        let six = resolver
            .resolve(&query("six.lan.", RecordType::AAAA))
            .expect("answer");
        assert_eq!(six.answers().len(), 1);

        assert!(resolver.resolve(&query("broken.lan.", RecordType::A)).is_none());

        // wildcard line from the hosts file
        assert!(resolver
            .resolve(&query("phone.guest.lan.", RecordType::A))
            .is_some());
    }

    #[test]
    fn type_mismatch_yields_empty_authoritative_answer() {
        let resolver = LocalResolver::new(&config(&[("v4only.test", "10.0.0.1")]), 60);
        let resp = resolver
            .resolve(&query("v4only.test.", RecordType::AAAA))
            .expect("name exists");
        assert!(resp.authoritative());
        assert!(resp.answers().is_empty());
    }
}
