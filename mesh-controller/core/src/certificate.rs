use chrono::{DateTime, Utc};
use std::time::Duration;

/// Distinguishes workload certificates from control-plane ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CertKind {
    Service,
    Internal,
}

/// A PEM-encoded workload certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    /// `<name>.<namespace>.<trust-domain>` of the service account.
    pub common_name: String,
    pub sans: Vec<String>,
    pub cert_chain: String,
    pub private_key: String,
    pub issuing_ca: String,
    pub issued_at: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    pub serial_number: String,
}

// === impl Certificate ===

impl Certificate {
    /// The identity prefix shared by every certificate issued for the same
    /// service account.
    pub fn cn_prefix(&self) -> &str {
        &self.common_name
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expiration - now).to_std().unwrap_or_default()
    }

    pub fn validity(&self) -> Duration {
        (self.expiration - self.issued_at).to_std().unwrap_or_default()
    }

    /// Expiration as written into proxy documents, `YYYY-MM-DD HH:MM:SS` in UTC.
    pub fn expiration_string(&self) -> String {
        self.expiration.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    /// Whether the first two labels of the common name equal
    /// `<name>.<namespace>` of the given service account.
    pub fn belongs_to(&self, name: &str, namespace: &str) -> bool {
        let mut labels = self.common_name.split('.');
        labels.next() == Some(name) && labels.next() == Some(namespace)
    }
}
