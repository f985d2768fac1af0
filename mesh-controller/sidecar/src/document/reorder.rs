use super::{outbound::OutboundTrafficMatch, route::cmp_specificity, PolicyDocument};
use fsm_mesh_controller_core::IpNet;
use std::cmp::Ordering;

impl PolicyDocument {
    /// Sorts routes from most to least specific and, among outbound matches sharing a port,
    /// puts matches without destination ranges first, then those with the widest ranges.
    pub(crate) fn reorder(&mut self) {
        if let Some(inbound) = self.inbound.as_mut() {
            for tm in inbound.traffic_matches.values_mut() {
                for rules in tm.http_service_route_rules.values_mut() {
                    rules
                        .route_rules
                        .sort_by(|a, b| cmp_specificity(&a.rule.matches, &b.rule.matches));
                }
            }
        }
        if let Some(outbound) = self.outbound.as_mut() {
            outbound.sort_traffic_matches();
            for tm in outbound.traffic_matches.values_mut().flatten() {
                for rules in tm.http_service_route_rules.values_mut() {
                    rules
                        .route_rules
                        .sort_by(|a, b| cmp_specificity(&a.matches, &b.matches));
                }
            }
        }
    }
}

pub(super) fn cmp_destinations(a: &OutboundTrafficMatch, b: &OutboundTrafficMatch) -> Ordering {
    match (
        a.destination_ip_ranges.is_empty(),
        b.destination_ip_ranges.is_empty(),
    ) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => {}
    }
    let (a, b) = (descending_nets(a), descending_nets(b));
    for (x, y) in a.iter().zip(&b) {
        match y.cmp(x) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    b.len().cmp(&a.len())
}

fn descending_nets(tm: &OutboundTrafficMatch) -> Vec<IpNet> {
    let mut nets = tm
        .destination_ip_ranges
        .keys()
        .filter_map(|r| r.parse::<IpNet>().ok())
        .collect::<Vec<_>>();
    nets.sort_by(|a, b| b.cmp(a));
    nets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tm(ranges: &[&str]) -> OutboundTrafficMatch {
        let mut tm = OutboundTrafficMatch::default();
        for r in ranges {
            tm.add_destination_ip_range(r.to_string(), None);
        }
        tm
    }

    #[test]
    fn matches_without_ranges_come_first() {
        let mut matches = vec![
            tm(&["10.0.0.1/32"]),
            tm(&[]),
            tm(&["10.0.0.9/32"]),
            tm(&["10.0.0.1/32", "10.0.0.2/32"]),
        ];
        matches.sort_by(cmp_destinations);
        let ranges = matches
            .iter()
            .map(|m| m.destination_ip_ranges.keys().cloned().collect::<Vec<_>>())
            .collect::<Vec<_>>();
        assert_eq!(
            ranges,
            vec![
                vec![],
                vec!["10.0.0.9/32".to_string()],
                vec!["10.0.0.1/32".to_string(), "10.0.0.2/32".to_string()],
                vec!["10.0.0.1/32".to_string()],
            ]
        );
    }
}
