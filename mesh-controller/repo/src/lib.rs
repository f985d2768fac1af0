//! Client of the content-addressable script repository that serves proxy codebases.
//!
//! A codebase is a versioned directory of files. Every proxy pulls its own codebase, derived
//! from a shared base codebase, and reloads when the codebase version changes.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
mod codebase;
#[cfg(any(test, feature = "test-util"))]
mod memory;

pub use self::{
    client::RepoClient,
    codebase::{
        base_batch, restore, wait_until_up, BASE_CODEBASE, CONFIG_FILE, CONFIG_FILE_GZ,
        SIDECAR_CODEBASE,
    },
};
#[cfg(any(test, feature = "test-util"))]
pub use self::memory::{InMemoryRepository, StoredCodebase};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("repository request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{method} {path} failed with status {status}: {body}")]
    Status {
        method: &'static str,
        path: String,
        status: u16,
        body: String,
    },

    #[error("codebase {0} does not exist")]
    NotFound(String),
}

/// The repository operations the control plane relies on.
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    /// Whether the repository answers requests.
    async fn is_repo_up(&self) -> bool;

    /// Returns the codebase at `path`, if it exists.
    async fn get_codebase(&self, path: &str) -> Result<Option<Codebase>>;

    /// Creates `path` as a copy-on-write derivative of `parent`, at `version`.
    async fn derive_codebase(&self, path: &str, parent: &str, version: u64) -> Result<()>;

    /// Applies every batch atomically and sets the version of their codebases.
    async fn batch(&self, version: u64, batches: Vec<Batch>) -> Result<()>;

    /// Removes the codebase at `path`. Removing a missing codebase succeeds.
    async fn delete(&self, path: &str) -> Result<()>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Codebase {
    #[serde(deserialize_with = "de_version")]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Changes to the files of one codebase.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Batch {
    pub basepath: String,
    pub items: Vec<BatchItem>,
}

/// An upserted or deleted file.
///
/// Binary content is carried base64-encoded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct BatchItem {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Encoding>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub obsolete: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Base64,
}

// === impl BatchItem ===

impl BatchItem {
    pub fn text(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn binary(filename: impl Into<String>, content: &[u8]) -> Self {
        Self {
            filename: filename.into(),
            content: Some(BASE64.encode(content)),
            encoding: Some(Encoding::Base64),
            obsolete: false,
        }
    }

    pub fn obsolete(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            obsolete: true,
            ..Default::default()
        }
    }

    /// The decoded file content. `None` for obsolete items and undecodable content.
    pub fn bytes(&self) -> Option<Vec<u8>> {
        let content = self.content.as_ref()?;
        match self.encoding {
            None => Some(content.clone().into_bytes()),
            Some(Encoding::Base64) => BASE64.decode(content).ok(),
        }
    }
}

/// Repositories report versions either as numbers or as decimal strings.
fn de_version<'de, D>(de: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Version {
        Number(u64),
        String(String),
    }

    match Version::deserialize(de)? {
        Version::Number(v) => Ok(v),
        Version::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn batch_items_encode_compactly() {
        let batch = Batch {
            basepath: "/fsm/sidecars/a.ns.cluster.local".to_string(),
            items: vec![
                BatchItem::text("config.json", "{}"),
                BatchItem::obsolete("config.json.gz"),
            ],
        };
        assert_eq!(
            serde_json::to_value(&batch).unwrap(),
            serde_json::json!({
                "basepath": "/fsm/sidecars/a.ns.cluster.local",
                "items": [
                    { "filename": "config.json", "content": "{}" },
                    { "filename": "config.json.gz", "obsolete": true },
                ],
            })
        );
    }

    #[test]
    fn binary_items_decode() {
        let item = BatchItem::binary("config.json.gz", &[0x1f, 0x8b, 0x08]);
        assert_eq!(item.encoding, Some(Encoding::Base64));
        assert_eq!(item.bytes(), Some(vec![0x1f, 0x8b, 0x08]));
        assert_eq!(BatchItem::obsolete("x").bytes(), None);
    }

    #[test]
    fn codebase_versions_parse_from_strings() {
        let cb: Codebase = serde_json::from_str(r#"{"version":"42"}"#).unwrap();
        assert_eq!(cb.version, 42);
        let cb: Codebase = serde_json::from_str(r#"{"version":7,"etag":"abc"}"#).unwrap();
        assert_eq!(cb.etag.as_deref(), Some("abc"));
    }
}
