//! Admission rules applied to policy resources before they are indexed.

use crate::Index;
use fsm_mesh_controller_core::{
    constants::{PROTOCOL_GRPC, PROTOCOL_HTTP, PROTOCOL_HTTPS},
    IpNet,
};
use fsm_mesh_controller_k8s_api::{
    plugin::Plugin,
    policy::{
        self, AccessControl, BackendSpec, Egress, EgressGateway, IngressBackend, SourceKind,
        SourceSpec, UpstreamTrafficSetting,
    },
    smi::{self, TrafficTarget},
    ResourceExt,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("duplicate backends detected with service name: {name} and port: {port}")]
    DuplicateBackend { name: String, port: u16 },

    #[error("backend {name}:{port} conflicts with {namespace}/{other}")]
    ConflictingBackend {
        name: String,
        port: u16,
        namespace: String,
        other: String,
    },

    #[error("'source.name' not specified for source kind {0}")]
    MissingSourceName(SourceKind),

    #[error("'source.namespace' not specified for source kind {0}")]
    MissingSourceNamespace(SourceKind),

    #[error("invalid 'source.name' value specified for IPRange; expected CIDR notation 'a.b.c.d/x', got {0:?}")]
    InvalidIpRange(String),

    #[error("expected 'port.protocol' to be 'http', 'https' or 'grpc', got: {0}")]
    UnsupportedProtocol(String),

    #[error("backends skipping client certificate validation must specify at least one 'AuthenticatedPrincipal' source")]
    MissingAuthenticatedPrincipal,

    #[error("invalid FQDN {0:?} specified as host")]
    InvalidHost(String),

    #[error("conflicts with UpstreamTrafficSetting {namespace}/{other} since they have the same host {host}")]
    DuplicateHost {
        host: String,
        namespace: String,
        other: String,
    },

    #[error("invalid responseStatusCode {0}")]
    InvalidResponseStatusCode(u32),

    #[error("the traffic target namespace ({namespace}) must match spec.destination.namespace ({destination})")]
    DestinationNamespace {
        namespace: String,
        destination: String,
    },

    #[error(
        "expected 'matches.apiGroup' to be one of [{specs}, {policies}], got: {0}",
        specs = smi::SPECS_GROUP_VERSION,
        policies = policy::GROUP_VERSION
    )]
    UnsupportedApiGroup(String),

    #[error("expected 'matches.kind' for match {name:?} to be {expected}, got: {kind}")]
    UnsupportedMatchKind {
        name: String,
        kind: String,
        expected: &'static str,
    },

    #[error("cannot have more than 1 UpstreamTrafficSetting match")]
    MultipleUpstreamTrafficSettings,

    #[error("redefinition of global egress gateway policy and conflict with {namespace}.{name}")]
    GlobalEgressGatewayRedefined { namespace: String, name: String },

    #[error("plugin {0} is missing pipy script")]
    MissingScript(String),
}

pub(crate) fn access_control(index: &Index, acl: &AccessControl) -> Result<(), Error> {
    let namespace = acl.namespace().unwrap_or_default();
    let name = acl.name_unchecked();
    let authenticated = has_authenticated_principal(&acl.spec.sources);

    check_unique_backends(&acl.spec.backends)?;
    for backend in &acl.spec.backends {
        let conflict = index
            .access_controls
            .in_namespace(&namespace)
            .filter(|other| other.name_unchecked() != name)
            .find(|other| has_backend(&other.spec.backends, backend));
        if let Some(other) = conflict {
            return Err(conflicting(backend, &namespace, other.name_unchecked()));
        }

        if backend.tls.is_some() && backend.skips_client_cert_validation() && !authenticated {
            return Err(Error::MissingAuthenticatedPrincipal);
        }
    }

    check_sources(&acl.spec.sources)
}

pub(crate) fn ingress_backend(index: &Index, ib: &IngressBackend) -> Result<(), Error> {
    let namespace = ib.namespace().unwrap_or_default();
    let name = ib.name_unchecked();
    let authenticated = has_authenticated_principal(&ib.spec.sources);

    check_unique_backends(&ib.spec.backends)?;
    for backend in &ib.spec.backends {
        let conflict = index
            .ingress_backends
            .in_namespace(&namespace)
            .filter(|other| other.name_unchecked() != name)
            .find(|other| has_backend(&other.spec.backends, backend));
        if let Some(other) = conflict {
            return Err(conflicting(backend, &namespace, other.name_unchecked()));
        }

        match backend.port.protocol.to_ascii_lowercase().as_str() {
            PROTOCOL_HTTP => {}
            PROTOCOL_HTTPS | PROTOCOL_GRPC => {
                if backend.skips_client_cert_validation() && !authenticated {
                    return Err(Error::MissingAuthenticatedPrincipal);
                }
            }
            _ => return Err(Error::UnsupportedProtocol(backend.port.protocol.clone())),
        }
    }

    check_sources(&ib.spec.sources)
}

pub(crate) fn upstream_traffic_setting(
    index: &Index,
    ust: &UpstreamTrafficSetting,
) -> Result<(), Error> {
    let host = &ust.spec.host;
    if host.split('.').count() < 2 {
        return Err(Error::InvalidHost(host.clone()));
    }

    let namespace = ust.namespace().unwrap_or_default();
    let name = ust.name_unchecked();
    let duplicate = index.upstream_traffic_settings.iter().find(|other| {
        other.spec.host == *host
            && (other.namespace().unwrap_or_default() != namespace || other.name_unchecked() != name)
    });
    if let Some(other) = duplicate {
        return Err(Error::DuplicateHost {
            host: host.clone(),
            namespace: other.namespace().unwrap_or_default(),
            other: other.name_unchecked(),
        });
    }

    let local = ust
        .spec
        .rate_limit
        .as_ref()
        .and_then(|rl| rl.local.as_ref())
        .and_then(|local| local.http.as_ref());
    let routes = ust
        .spec
        .http_routes
        .iter()
        .filter_map(|r| r.rate_limit.as_ref()?.local.as_ref());
    for http in local.into_iter().chain(routes) {
        check_status_code(http.response_status_code)?;
    }

    Ok(())
}

pub(crate) fn traffic_target(tt: &TrafficTarget) -> Result<(), Error> {
    let namespace = tt.namespace().unwrap_or_default();
    if tt.spec.destination.namespace != namespace {
        return Err(Error::DestinationNamespace {
            namespace,
            destination: tt.spec.destination.namespace.clone(),
        });
    }
    Ok(())
}

pub(crate) fn egress(egress: &Egress) -> Result<(), Error> {
    let mut upstream_traffic_settings = 0;
    for m in &egress.spec.matches {
        match m.api_group.as_deref().unwrap_or_default() {
            smi::SPECS_GROUP_VERSION => {
                if m.kind != smi::HTTP_ROUTE_GROUP_KIND {
                    return Err(Error::UnsupportedMatchKind {
                        name: m.name.clone(),
                        kind: m.kind.clone(),
                        expected: smi::HTTP_ROUTE_GROUP_KIND,
                    });
                }
            }
            policy::GROUP_VERSION => {
                if m.kind != "UpstreamTrafficSetting" {
                    return Err(Error::UnsupportedMatchKind {
                        name: m.name.clone(),
                        kind: m.kind.clone(),
                        expected: "UpstreamTrafficSetting",
                    });
                }
                upstream_traffic_settings += 1;
            }
            group => return Err(Error::UnsupportedApiGroup(group.to_string())),
        }
    }

    if upstream_traffic_settings > 1 {
        return Err(Error::MultipleUpstreamTrafficSettings);
    }
    Ok(())
}

pub(crate) fn egress_gateway(index: &Index, eg: &EgressGateway) -> Result<(), Error> {
    if eg.spec.global_egress_gateways.is_empty() {
        return Ok(());
    }

    let namespace = eg.namespace().unwrap_or_default();
    let name = eg.name_unchecked();
    let existing = index.egress_gateways.iter().find(|other| {
        !other.spec.global_egress_gateways.is_empty()
            && !(other.name_unchecked().eq_ignore_ascii_case(&name)
                && other
                    .namespace()
                    .unwrap_or_default()
                    .eq_ignore_ascii_case(&namespace))
    });
    match existing {
        Some(other) => Err(Error::GlobalEgressGatewayRedefined {
            namespace: other.namespace().unwrap_or_default(),
            name: other.name_unchecked(),
        }),
        None => Ok(()),
    }
}

pub(crate) fn plugin(plugin: &Plugin) -> Result<(), Error> {
    if plugin.spec.pipyscript.trim().is_empty() {
        return Err(Error::MissingScript(plugin.name_unchecked()));
    }
    Ok(())
}

fn check_unique_backends(backends: &[BackendSpec]) -> Result<(), Error> {
    for (i, backend) in backends.iter().enumerate() {
        if has_backend(&backends[..i], backend) {
            return Err(Error::DuplicateBackend {
                name: backend.name.clone(),
                port: backend.port.number,
            });
        }
    }
    Ok(())
}

fn has_backend(backends: &[BackendSpec], backend: &BackendSpec) -> bool {
    backends
        .iter()
        .any(|b| b.name == backend.name && b.port.number == backend.port.number)
}

fn conflicting(backend: &BackendSpec, namespace: &str, other: String) -> Error {
    Error::ConflictingBackend {
        name: backend.name.clone(),
        port: backend.port.number,
        namespace: namespace.to_string(),
        other,
    }
}

fn has_authenticated_principal(sources: &[SourceSpec]) -> bool {
    sources
        .iter()
        .any(|s| s.kind == SourceKind::AuthenticatedPrincipal)
}

fn check_sources(sources: &[SourceSpec]) -> Result<(), Error> {
    for source in sources {
        match source.kind {
            SourceKind::Service => {
                if source.name.is_empty() {
                    return Err(Error::MissingSourceName(SourceKind::Service));
                }
                if source.namespace.as_deref().unwrap_or_default().is_empty() {
                    return Err(Error::MissingSourceNamespace(SourceKind::Service));
                }
            }
            SourceKind::AuthenticatedPrincipal => {
                if source.name.is_empty() {
                    return Err(Error::MissingSourceName(SourceKind::AuthenticatedPrincipal));
                }
            }
            SourceKind::IpRange => {
                if source.name.parse::<IpNet>().is_err() {
                    return Err(Error::InvalidIpRange(source.name.clone()));
                }
            }
        }
    }
    Ok(())
}

/// Zero selects the proxy's default status code.
fn check_status_code(code: u32) -> Result<(), Error> {
    if code == 0 || (100..600).contains(&code) {
        return Ok(());
    }
    Err(Error::InvalidResponseStatusCode(code))
}
