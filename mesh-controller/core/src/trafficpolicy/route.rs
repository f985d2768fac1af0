use super::{HttpRateLimit, RetryPolicy};
use crate::{
    constants::{REGEX_MATCH_ALL, WILDCARD_HTTP_METHOD},
    WeightedCluster,
};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathMatchType {
    #[default]
    Regex,
    Exact,
    Prefix,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HttpRouteMatch {
    pub path: String,
    pub path_match_type: PathMatchType,
    pub methods: Vec<String>,
    pub headers: BTreeMap<String, String>,
}

/// An HTTP route match together with the clusters it routes to.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteWeightedClusters {
    pub route_match: HttpRouteMatch,
    pub weighted_clusters: BTreeSet<WeightedCluster>,
    pub retry_policy: Option<RetryPolicy>,
    pub rate_limit: Option<HttpRateLimit>,
}

/// An inbound route and the principals allowed to use it.
#[derive(Clone, Debug, PartialEq)]
pub struct Rule {
    pub route: RouteWeightedClusters,
    pub allowed_principals: BTreeSet<String>,
}

/// Inbound HTTP routes for a set of hostnames.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InboundTrafficPolicy {
    pub name: String,
    pub hostnames: Vec<String>,
    pub rules: Vec<Rule>,
    pub rate_limit: Option<HttpRateLimit>,
}

/// Outbound HTTP routes for a set of hostnames.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutboundTrafficPolicy {
    pub name: String,
    pub hostnames: Vec<String>,
    pub routes: Vec<RouteWeightedClusters>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("route {path:?} already exists with different weighted clusters")]
pub struct RouteConflict {
    pub path: String,
}

// === impl HttpRouteMatch ===

impl HttpRouteMatch {
    /// Matches any path with any method.
    pub fn wildcard() -> Self {
        Self {
            path: REGEX_MATCH_ALL.to_string(),
            path_match_type: PathMatchType::Regex,
            methods: vec![WILDCARD_HTTP_METHOD.to_string()],
            headers: BTreeMap::new(),
        }
    }

    /// Fills in the defaults for an empty path or method list.
    pub fn with_defaults(mut self) -> Self {
        if self.path.is_empty() {
            self.path = REGEX_MATCH_ALL.to_string();
            self.path_match_type = PathMatchType::Regex;
        }
        if self.methods.is_empty() {
            self.methods = vec![WILDCARD_HTTP_METHOD.to_string()];
        }
        self
    }

    pub fn is_wildcard_path(&self) -> bool {
        self.path == REGEX_MATCH_ALL
    }
}

// === impl RouteWeightedClusters ===

impl RouteWeightedClusters {
    pub fn new(
        route_match: HttpRouteMatch,
        weighted_clusters: impl IntoIterator<Item = WeightedCluster>,
    ) -> Self {
        Self {
            route_match,
            weighted_clusters: weighted_clusters.into_iter().collect(),
            retry_policy: None,
            rate_limit: None,
        }
    }
}

// === impl InboundTrafficPolicy ===

impl InboundTrafficPolicy {
    pub fn new(name: impl Into<String>, hostnames: Vec<String>) -> Self {
        Self {
            name: name.into(),
            hostnames,
            ..Default::default()
        }
    }

    /// Adds a rule, or merges the principal into an existing rule with the
    /// same match and clusters.
    pub fn add_rule(&mut self, route: RouteWeightedClusters, allowed_principal: impl Into<String>) {
        let principal = allowed_principal.into();
        if let Some(rule) = self.rules.iter_mut().find(|r| {
            r.route.route_match == route.route_match
                && r.route.weighted_clusters == route.weighted_clusters
        }) {
            rule.allowed_principals.insert(principal);
            return;
        }
        self.rules.push(Rule {
            route,
            allowed_principals: std::iter::once(principal).collect(),
        });
    }
}

// === impl OutboundTrafficPolicy ===

impl OutboundTrafficPolicy {
    pub fn new(name: impl Into<String>, hostnames: Vec<String>) -> Self {
        Self {
            name: name.into(),
            hostnames,
            routes: Vec::new(),
        }
    }

    /// Adds a route unless an identical one exists. A route with the same
    /// match but different clusters is rejected.
    pub fn add_route(
        &mut self,
        route_match: HttpRouteMatch,
        retry_policy: Option<RetryPolicy>,
        weighted_clusters: impl IntoIterator<Item = WeightedCluster>,
    ) -> Result<(), RouteConflict> {
        let weighted_clusters = weighted_clusters.into_iter().collect::<BTreeSet<_>>();
        if let Some(existing) = self
            .routes
            .iter()
            .find(|r| r.route_match == route_match)
        {
            if existing.weighted_clusters == weighted_clusters {
                return Ok(());
            }
            return Err(RouteConflict {
                path: route_match.path,
            });
        }
        self.routes.push(RouteWeightedClusters {
            route_match,
            weighted_clusters,
            retry_policy,
            rate_limit: None,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn books() -> HttpRouteMatch {
        HttpRouteMatch {
            path: "/books/*".to_string(),
            path_match_type: PathMatchType::Regex,
            methods: vec!["GET".to_string()],
            headers: BTreeMap::new(),
        }
    }

    #[test]
    fn inbound_rules_merge_principals() {
        let mut policy = InboundTrafficPolicy::new("bookstore", vec!["bookstore".to_string()]);
        let route = RouteWeightedClusters::new(
            books(),
            Some(WeightedCluster::new("ns/bookstore|80|local", 100)),
        );
        policy.add_rule(route.clone(), "bookbuyer.ns.cluster.local");
        policy.add_rule(route, "bookthief.ns.cluster.local");

        assert_eq!(policy.rules.len(), 1);
        assert_eq!(
            policy.rules[0].allowed_principals,
            ["bookbuyer.ns.cluster.local", "bookthief.ns.cluster.local"]
                .into_iter()
                .map(String::from)
                .collect()
        );
    }

    #[test]
    fn outbound_routes_reject_conflicting_clusters() {
        let mut policy = OutboundTrafficPolicy::new("b.ns2", vec![]);
        policy
            .add_route(
                HttpRouteMatch::wildcard(),
                None,
                Some(WeightedCluster::new("ns2/b|80", 100)),
            )
            .unwrap();
        policy
            .add_route(
                HttpRouteMatch::wildcard(),
                None,
                Some(WeightedCluster::new("ns2/b|80", 100)),
            )
            .unwrap();
        assert_eq!(policy.routes.len(), 1);

        let err = policy
            .add_route(
                HttpRouteMatch::wildcard(),
                None,
                Some(WeightedCluster::new("ns2/c|80", 100)),
            )
            .unwrap_err();
        assert_eq!(err.path, ".*");
    }

    #[test]
    fn empty_matches_get_defaults() {
        let m = HttpRouteMatch {
            path: String::new(),
            path_match_type: PathMatchType::Prefix,
            methods: vec![],
            headers: BTreeMap::new(),
        }
        .with_defaults();
        assert_eq!(m, HttpRouteMatch::wildcard());
    }
}
