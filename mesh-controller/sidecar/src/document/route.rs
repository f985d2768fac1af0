use fsm_mesh_controller_core::{
    constants::{REGEX_MATCH_ALL, WILDCARD_HTTP_METHOD},
    identity::WILDCARD_PRINCIPAL,
    trafficpolicy::{HttpRouteMatch, PathMatchType},
};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::BTreeMap};

/// Cluster name to weight.
pub type WeightedClusters = BTreeMap<String, u32>;

/// Plugin name to the configuration it runs with.
pub type Plugins = BTreeMap<String, serde_json::Value>;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum MatchType {
    #[default]
    Regex,
    Exact,
    Prefix,
}

/// Selects the requests a route applies to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpMatchRule {
    pub path: String,
    #[serde(rename = "Type")]
    pub match_type: MatchType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Empty when any method matches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(skip)]
    any_method: bool,
}

/// A route and the clusters it sends traffic to.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpRouteRule {
    #[serde(flatten)]
    pub matches: HttpMatchRule,
    pub target_clusters: WeightedClusters,

    /// Empty when any service may use the route.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_services: Vec<String>,
    #[serde(skip)]
    any_service: bool,
}

/// Names the route rule group that serves a host.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteRuleRef {
    pub rule_name: String,

    /// The group's name before it was replaced by a flowcode.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
}

// === impl HttpMatchRule ===

impl HttpMatchRule {
    /// Builds a match from a route, defaulting an empty path to match everything and an
    /// empty method list to any method.
    pub fn from_route(route: &HttpRouteMatch) -> Self {
        let mut rule = Self {
            path: if route.path.is_empty() {
                REGEX_MATCH_ALL.to_string()
            } else {
                route.path.clone()
            },
            match_type: match route.path_match_type {
                PathMatchType::Regex => MatchType::Regex,
                PathMatchType::Exact => MatchType::Exact,
                PathMatchType::Prefix => MatchType::Prefix,
            },
            headers: route.headers.clone(),
            methods: Vec::new(),
            any_method: false,
        };
        if route.methods.is_empty() {
            rule.add_method(WILDCARD_HTTP_METHOD);
        }
        for method in &route.methods {
            rule.add_method(method);
        }
        rule
    }

    /// A wildcard method clears the list; later methods are ignored.
    pub fn add_method(&mut self, method: &str) {
        if self.any_method {
            return;
        }
        if method == WILDCARD_HTTP_METHOD {
            self.any_method = true;
            self.methods.clear();
        } else {
            self.methods.push(method.to_string());
        }
    }

    fn is_match_all(&self) -> bool {
        self.path == REGEX_MATCH_ALL
    }
}

/// Orders routes from most to least specific: for the same path, more header and then more
/// method constraints first; otherwise by path, with the match-all path last.
pub(crate) fn cmp_specificity(a: &HttpMatchRule, b: &HttpMatchRule) -> Ordering {
    if a.path.eq_ignore_ascii_case(&b.path) {
        return b
            .headers
            .len()
            .cmp(&a.headers.len())
            .then_with(|| b.methods.len().cmp(&a.methods.len()));
    }
    match (a.is_match_all(), b.is_match_all()) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => a.path.cmp(&b.path),
    }
}

// === impl HttpRouteRule ===

impl HttpRouteRule {
    pub fn new(matches: HttpMatchRule) -> Self {
        Self {
            matches,
            ..Default::default()
        }
    }

    pub fn add_weighted_cluster(&mut self, cluster: impl Into<String>, weight: u32) {
        self.target_clusters.insert(cluster.into(), weight);
    }

    /// The wildcard principal opens the route to every service and clears the list.
    pub fn add_allowed_service(&mut self, service: &str) {
        if self.any_service {
            return;
        }
        if service == WILDCARD_PRINCIPAL {
            self.any_service = true;
            self.allowed_services.clear();
        } else {
            self.allowed_services.push(service.to_string());
        }
    }
}

/// Returns the rule with an equal match, appending a new one when absent, and whether the
/// rule already existed.
pub(crate) fn route_rule<'r, R>(
    rules: &'r mut Vec<R>,
    matches: HttpMatchRule,
    new: impl FnOnce(HttpMatchRule) -> R,
) -> (&'r mut R, bool)
where
    R: AsRef<HttpMatchRule>,
{
    match rules.iter().position(|r| *r.as_ref() == matches) {
        Some(idx) => (&mut rules[idx], true),
        None => {
            rules.push(new(matches));
            let last = rules.len() - 1;
            (&mut rules[last], false)
        }
    }
}

impl AsRef<HttpMatchRule> for HttpRouteRule {
    fn as_ref(&self) -> &HttpMatchRule {
        &self.matches
    }
}

/// Whether `name` should replace `prev` as the group serving a host: shorter names win,
/// then the lexically smaller one. When both names end in `suffix`, only a shorter name
/// replaces the previous one.
pub(crate) fn prefers(name: &str, prev: &str, suffix: Option<&str>) -> bool {
    if let Some(suffix) = suffix.filter(|s| !s.is_empty()) {
        if name.ends_with(suffix) && prev.ends_with(suffix) {
            return name.len() < prev.len();
        }
    }
    match name.len().cmp(&prev.len()) {
        Ordering::Less => true,
        Ordering::Equal => name < prev,
        Ordering::Greater => false,
    }
}

pub(crate) fn add_host_port(
    hosts: &mut BTreeMap<String, RouteRuleRef>,
    host: &str,
    rule_name: &str,
    suffix: Option<&str>,
) {
    let rule_ref = RouteRuleRef {
        rule_name: rule_name.to_string(),
        service: String::new(),
    };
    match hosts.get(host) {
        Some(prev) if !prefers(rule_name, &prev.rule_name, suffix) => {}
        _ => {
            hosts.insert(host.to_string(), rule_ref);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn route(path: &str, methods: &[&str]) -> HttpRouteMatch {
        HttpRouteMatch {
            path: path.to_string(),
            path_match_type: PathMatchType::Regex,
            methods: methods.iter().map(|m| m.to_string()).collect(),
            headers: BTreeMap::new(),
        }
    }

    #[test]
    fn empty_matches_default_to_any() {
        let rule = HttpMatchRule::from_route(&route("", &[]));
        assert_eq!(rule.path, ".*");
        assert!(rule.methods.is_empty());
        assert_eq!(
            serde_json::to_value(&rule).unwrap(),
            serde_json::json!({ "Path": ".*", "Type": "Regex" })
        );
    }

    #[test]
    fn wildcard_method_clears_methods() {
        let rule = HttpMatchRule::from_route(&route("/books", &["GET", "*", "POST"]));
        assert!(rule.methods.is_empty());

        let rule = HttpMatchRule::from_route(&route("/books", &["GET", "POST"]));
        assert_eq!(rule.methods, vec!["GET", "POST"]);
    }

    #[test]
    fn wildcard_principal_clears_services() {
        let mut rule = HttpRouteRule::new(HttpMatchRule::from_route(&route("/", &[])));
        rule.add_allowed_service("bookbuyer.ns.cluster.local");
        rule.add_allowed_service("*");
        rule.add_allowed_service("thief.ns.cluster.local");
        assert!(rule.allowed_services.is_empty());
    }

    #[test]
    fn specific_routes_sort_first() {
        let mut rules = vec![
            HttpMatchRule::from_route(&route("", &[])),
            HttpMatchRule::from_route(&route("/books", &[])),
            HttpMatchRule {
                headers: btreemap! { "user".to_string() => "a".to_string() },
                ..HttpMatchRule::from_route(&route("/books", &[]))
            },
            HttpMatchRule::from_route(&route("/authors", &["GET"])),
        ];
        rules.sort_by(cmp_specificity);
        let order = rules
            .iter()
            .map(|r| (r.path.as_str(), r.headers.len()))
            .collect::<Vec<_>>();
        assert_eq!(order, vec![("/authors", 0), ("/books", 1), ("/books", 0), (".*", 0)]);
    }

    #[test]
    fn shorter_rule_names_serve_hosts() {
        let mut hosts = BTreeMap::new();
        add_host_port(&mut hosts, "bookstore", "bookstore.ns.svc.cluster.local", None);
        add_host_port(&mut hosts, "bookstore", "bookstore.ns", None);
        assert_eq!(hosts["bookstore"].rule_name, "bookstore.ns");
        add_host_port(&mut hosts, "bookstore", "bookstore.nt", None);
        assert_eq!(hosts["bookstore"].rule_name, "bookstore.ns");
        add_host_port(&mut hosts, "bookstore", "bookstore.nr", None);
        assert_eq!(hosts["bookstore"].rule_name, "bookstore.nr");
    }

    #[test]
    fn suffixed_names_only_yield_to_shorter_ones() {
        let suffix = Some("ns.svc.cluster.local");
        assert!(!prefers("b.ns.svc.cluster.local", "c.ns.svc.cluster.local", suffix));
        assert!(prefers("b.ns.svc.cluster.local", "bb.ns.svc.cluster.local", suffix));
        assert!(prefers("b.ns", "c.ns", suffix));
    }
}
