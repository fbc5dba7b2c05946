use rustc_hash::FxHashMap;

use crate::config::ForwarderConfig;
use crate::local::fqdn;

/// Routes query names to dedicated upstreams by longest-suffix match,
/// the usual zone-delegation rule. Rule counts in this class of tool
/// stay small, so a linear scan over the table is fine.
pub struct ForwarderResolver {
    rules: FxHashMap<String, Vec<String>>,
}

impl ForwarderResolver {
    pub fn new(cfg: &ForwarderConfig) -> Self {
        let mut rules = FxHashMap::default();

        if cfg.enable {
            for rule in &cfg.rules {
                rules.insert(fqdn(&rule.domain), rule.upstreams.clone());
            }
        }

        Self { rules }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Upstreams of the longest rule domain that is the query name or
    /// one of its parent suffixes. `None` means fall through to the
    /// default transport, not an empty deny.
    pub fn get_upstream(&self, qname: &str) -> Option<&[String]> {
        let mut best: Option<(&String, &Vec<String>)> = None;

        for (domain, upstreams) in &self.rules {
            if qname == *domain || qname.ends_with(&format!(".{domain}")) {
                if best.map_or(true, |(b, _)| domain.len() > b.len()) {
                    best = Some((domain, upstreams));
                }
            }
        }

        best.map(|(_, upstreams)| upstreams.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwarderRule;

    fn resolver(rules: &[(&str, &[&str])]) -> ForwarderResolver {
        ForwarderResolver::new(&ForwarderConfig {
            enable: true,
            include_files: Vec::new(),
            rules: rules
                .iter()
                .map(|(domain, upstreams)| ForwarderRule {
                    domain: domain.to_string(),
                    upstreams: upstreams.iter().map(|u| u.to_string()).collect(),
                })
                .collect(),
        })
    }

    #[test]
    fn suffix_and_exact_matches_resolve() {
        let fwd = resolver(&[("corp.example", &["10.9.9.9:53"])]);

        assert_eq!(
            fwd.get_upstream("host.corp.example."),
            Some(&["10.9.9.9:53".to_string()][..])
        );
        assert_eq!(
            fwd.get_upstream("corp.example."),
            Some(&["10.9.9.9:53".to_string()][..])
        );
        assert!(fwd.get_upstream("host.other.example.").is_none());
        // shared suffix text without a label boundary is not a match
        assert!(fwd.get_upstream("notcorp.example.").is_none());
    }

    #[test]
    fn longest_suffix_wins() {
        let fwd = resolver(&[
            ("example", &["1.1.1.1:53"]),
            ("corp.example", &["10.9.9.9:53"]),
        ]);

        assert_eq!(
            fwd.get_upstream("a.corp.example."),
            Some(&["10.9.9.9:53".to_string()][..])
        );
        assert_eq!(
            fwd.get_upstream("a.example."),
            Some(&["1.1.1.1:53".to_string()][..])
        );
    }

    #[test]
    fn rule_domains_are_normalized_to_fqdn() {
        let fwd = resolver(&[("Corp.Example", &["10.9.9.9:53"])]);
        assert!(fwd.get_upstream("box.corp.example.").is_some());
    }

    #[test]
    fn disabled_config_loads_no_rules() {
        let fwd = ForwarderResolver::new(&ForwarderConfig {
            enable: false,
            include_files: Vec::new(),
            rules: vec![ForwarderRule {
                domain: "corp.example".to_string(),
                upstreams: vec!["10.9.9.9:53".to_string()],
            }],
        });
        assert_eq!(fwd.rule_count(), 0);
        assert!(fwd.get_upstream("host.corp.example.").is_none());
    }
}
