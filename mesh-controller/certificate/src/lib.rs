//! Issues workload certificates from an in-process certificate authority.
//!
//! Certificates are cached by common-name prefix, `<name>.<namespace>.<trust-domain>` of the
//! workload's service account. Re-issued and released certificates are announced on the
//! broker's certificate topic so that the proxies sharing the service account are rebuilt.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use fsm_mesh_controller_core::{
    broker::{Broker, CertificateRotated, Message},
    certificate::{CertKind, Certificate},
};
use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);
const ORGANIZATION: &str = "flomesh.io";

/// Certificates are rotated once less than this fraction of their validity remains.
const ROTATION_FRACTION: f64 = 0.3;
const MIN_REMAINING: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to generate certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("invalid validity period {0:?}")]
    Validity(Duration),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub struct Manager {
    issuer: Issuer<'static, KeyPair>,
    issuing_ca: String,
    trust_domain: String,
    broker: Arc<Broker>,
    certs: RwLock<HashMap<String, Arc<Certificate>>>,
    serial: AtomicU64,
}

// === impl Manager ===

impl Manager {
    /// Creates a manager with a freshly generated self-signed root.
    pub fn new(trust_domain: impl Into<String>, broker: Arc<Broker>) -> Result<Self> {
        let trust_domain = trust_domain.into();
        let now = Utc::now();

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&format!("fsm-ca.{trust_domain}"));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = offset(now)?;
        params.not_after = offset(now + validity(CA_VALIDITY)?)?;

        let key = KeyPair::generate()?;
        let issuing_ca = params.self_signed(&key)?.pem();
        tracing::info!(%trust_domain, "Generated root certificate");

        Ok(Self {
            issuer: Issuer::new(params, key),
            issuing_ca,
            trust_domain,
            broker,
            certs: Default::default(),
            serial: AtomicU64::new(now.timestamp_micros().unsigned_abs()),
        })
    }

    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// The PEM-encoded root certificate.
    pub fn issuing_ca(&self) -> &str {
        &self.issuing_ca
    }

    /// Issues a certificate and caches it under `cn_prefix`. Replacing a cached certificate is
    /// announced as a rotation.
    pub fn issue_certificate(
        &self,
        cn_prefix: &str,
        kind: CertKind,
        sans: &[String],
        validity_period: Duration,
    ) -> Result<Arc<Certificate>> {
        let issued_at = Utc::now();
        let expiration = issued_at + validity(validity_period)?;

        let mut params = CertificateParams::new(sans.to_vec())?;
        params.distinguished_name = distinguished_name(cn_prefix);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = match kind {
            CertKind::Service => vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
            CertKind::Internal => vec![ExtendedKeyUsagePurpose::ClientAuth],
        };
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        params.serial_number = Some(SerialNumber::from(serial));
        params.not_before = offset(issued_at)?;
        params.not_after = offset(expiration)?;

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.issuer)?;
        let cert = Arc::new(Certificate {
            common_name: cn_prefix.to_string(),
            sans: sans.to_vec(),
            cert_chain: cert.pem(),
            private_key: key.serialize_pem(),
            issuing_ca: self.issuing_ca.clone(),
            issued_at,
            expiration,
            serial_number: format!("{serial:x}"),
        });

        let prior = self
            .certs
            .write()
            .insert(cn_prefix.to_string(), cert.clone());
        tracing::debug!(%cn_prefix, serial = %cert.serial_number, expiration = %cert.expiration_string(), "Issued certificate");
        if prior.is_some() {
            self.broker
                .publish(Message::CertificateRotated(CertificateRotated {
                    cn_prefix: cn_prefix.to_string(),
                    certificate: Some(cert.clone()),
                }));
        }
        Ok(cert)
    }

    pub fn get_certificate(&self, cn_prefix: &str) -> Option<Arc<Certificate>> {
        self.certs.read().get(cn_prefix).cloned()
    }

    /// Whether less than 30% of the certificate's validity, or less than a minute, remains.
    pub fn should_rotate(&self, cert: &Certificate) -> bool {
        needs_rotation(cert, Utc::now())
    }

    /// Forgets the certificate of `cn_prefix` and announces its release.
    pub fn release_certificate(&self, cn_prefix: &str) {
        if self.certs.write().remove(cn_prefix).is_none() {
            return;
        }
        tracing::debug!(%cn_prefix, "Released certificate");
        self.broker
            .publish(Message::CertificateRotated(CertificateRotated {
                cn_prefix: cn_prefix.to_string(),
                certificate: None,
            }));
    }

    /// Re-issues every cached certificate that is due for rotation, returning how many were
    /// rotated.
    pub fn rotate_expiring(&self) -> usize {
        let now = Utc::now();
        let expiring = self
            .certs
            .read()
            .values()
            .filter(|cert| needs_rotation(cert, now))
            .cloned()
            .collect::<Vec<_>>();

        let mut rotated = 0;
        for cert in expiring {
            match self.issue_certificate(
                &cert.common_name,
                CertKind::Service,
                &cert.sans,
                cert.validity(),
            ) {
                Ok(_) => rotated += 1,
                Err(error) => {
                    tracing::warn!(%error, cn_prefix = %cert.common_name, "Failed to rotate certificate")
                }
            }
        }
        rotated
    }

    /// Periodically rotates expiring certificates until shutdown.
    pub async fn rotate(self: Arc<Self>, interval: Duration, drain: drain::Watch) {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let rotated = self.rotate_expiring();
                    if rotated > 0 {
                        tracing::info!(rotated, "Rotated certificates");
                    }
                }
                _release = &mut shutdown => return,
            }
        }
    }
}

fn needs_rotation(cert: &Certificate, now: DateTime<Utc>) -> bool {
    let remaining = cert.remaining(now);
    remaining < MIN_REMAINING || remaining.as_secs_f64() < cert.validity().as_secs_f64() * ROTATION_FRACTION
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn
}

fn validity(period: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(period).map_err(|_| Error::Validity(period))
}

fn offset(at: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|_| Error::Validity(Duration::from_secs(at.timestamp().unsigned_abs())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn manager() -> (Arc<Broker>, Manager) {
        let broker = Arc::new(Broker::new());
        let manager = Manager::new("cluster.local", broker.clone()).expect("CA must generate");
        (broker, manager)
    }

    fn sans() -> Vec<String> {
        vec![
            "bookstore.ns".to_string(),
            "bookstore.ns.svc.cluster.local".to_string(),
        ]
    }

    #[test]
    fn issues_and_caches_certificates() {
        let (_, manager) = manager();
        let cert = manager
            .issue_certificate("bookstore.ns.cluster.local", CertKind::Service, &sans(), HOUR)
            .expect("certificate must issue");

        assert_eq!(cert.common_name, "bookstore.ns.cluster.local");
        assert_eq!(cert.sans, sans());
        assert!(cert.cert_chain.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(cert.private_key.contains("PRIVATE KEY"));
        assert_eq!(cert.issuing_ca, manager.issuing_ca());
        assert_eq!(cert.validity(), HOUR);
        assert!(cert.belongs_to("bookstore", "ns"));
        assert!(!manager.should_rotate(&cert));

        assert_eq!(
            manager.get_certificate("bookstore.ns.cluster.local"),
            Some(cert)
        );
        assert_eq!(manager.get_certificate("other.ns.cluster.local"), None);
    }

    #[test]
    fn short_lived_certificates_rotate() {
        let (_, manager) = manager();
        let cert = manager
            .issue_certificate(
                "bookstore.ns.cluster.local",
                CertKind::Service,
                &sans(),
                Duration::from_secs(30),
            )
            .unwrap();
        assert!(manager.should_rotate(&cert));

        let now = cert.issued_at;
        let mut aged = (*cert).clone();
        aged.issued_at = now - chrono::Duration::hours(10);
        aged.expiration = now + chrono::Duration::hours(2);
        assert!(needs_rotation(&aged, now), "less than 30% remains");
        aged.expiration = now + chrono::Duration::hours(5);
        assert!(!needs_rotation(&aged, now));
    }

    #[tokio::test]
    async fn rotation_and_release_are_announced() {
        let (broker, manager) = manager();
        let mut rotations = broker.subscribe_certificates();

        manager
            .issue_certificate(
                "bookstore.ns.cluster.local",
                CertKind::Service,
                &sans(),
                Duration::from_secs(30),
            )
            .unwrap();
        assert!(rotations.try_recv().is_err(), "first issuance is not a rotation");

        assert_eq!(manager.rotate_expiring(), 1);
        let rotated = rotations.recv().await.unwrap();
        assert_eq!(rotated.cn_prefix, "bookstore.ns.cluster.local");
        assert!(rotated.certificate.is_some());

        manager.release_certificate("bookstore.ns.cluster.local");
        let released = rotations.recv().await.unwrap();
        assert!(released.certificate.is_none());
        assert_eq!(manager.get_certificate("bookstore.ns.cluster.local"), None);

        manager.release_certificate("bookstore.ns.cluster.local");
        assert!(rotations.try_recv().is_err(), "releasing twice is silent");
    }
}
