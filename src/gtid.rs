//! MariaDB GTID arithmetic.
//!
//! A GTID position is a comma-separated list of `domain-server-sequence`
//! triples, at most one triple per replication domain. Lag is measured
//! per domain and summed; domains the consumer has never seen do not
//! count towards lag.

use std::collections::HashMap;

/// Parses a GTID position string into a domain -> sequence map, keeping
/// the maximum sequence when a domain repeats. Malformed triples are
/// skipped.
pub fn parse(gtid: &str) -> HashMap<u64, u64> {
    let mut domains = HashMap::new();
    for triple in gtid.split(',') {
        let triple = triple.trim();
        if triple.is_empty() {
            continue;
        }
        let mut parts = triple.splitn(3, '-');
        let domain = parts.next().and_then(|p| p.parse::<u64>().ok());
        let _server = parts.next().and_then(|p| p.parse::<u64>().ok());
        let seq = parts.next().and_then(|p| p.parse::<u64>().ok());
        if let (Some(domain), Some(seq)) = (domain, seq) {
            let entry = domains.entry(domain).or_insert(0);
            if seq > *entry {
                *entry = seq;
            }
        }
    }
    domains
}

/// Total lag of `consumer` behind `server`: for every domain the consumer
/// has seen, how many sequences the server is ahead, clamped at zero.
/// Absent positions on either side mean no measurable lag.
pub fn diff(consumer: Option<&str>, server: Option<&str>) -> u64 {
    let (consumer, server) = match (consumer, server) {
        (Some(c), Some(s)) => (parse(c), parse(s)),
        _ => return 0,
    };

    let mut lag = 0;
    for (domain, consumer_seq) in &consumer {
        if let Some(server_seq) = server.get(domain) {
            lag += server_seq.saturating_sub(*consumer_seq);
        }
    }
    lag
}
