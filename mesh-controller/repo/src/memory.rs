use crate::{Batch, Codebase, Error, Repository, Result};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};

/// A repository held in memory, recording every request it serves.
#[derive(Clone, Debug)]
pub struct InMemoryRepository {
    state: Arc<Mutex<State>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredCodebase {
    pub version: u64,
    pub base: Option<String>,
    pub files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
struct State {
    up: bool,
    fail_batches: bool,
    requests: usize,
    codebases: BTreeMap<String, StoredCodebase>,
}

// === impl InMemoryRepository ===

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                up: true,
                fail_batches: false,
                requests: 0,
                codebases: BTreeMap::new(),
            })),
        }
    }
}

impl InMemoryRepository {
    pub fn set_up(&self, up: bool) {
        self.state.lock().up = up;
    }

    /// Makes every following batch fail with a server error.
    pub fn fail_batches(&self, fail: bool) {
        self.state.lock().fail_batches = fail;
    }

    /// The number of derive, batch and delete requests served.
    pub fn request_count(&self) -> usize {
        self.state.lock().requests
    }

    pub fn codebase(&self, path: &str) -> Option<StoredCodebase> {
        self.state.lock().codebases.get(&normalize(path)).cloned()
    }

    pub fn file(&self, path: &str, filename: &str) -> Option<Vec<u8>> {
        self.codebase(path)?.files.get(filename).cloned()
    }

    pub fn codebase_paths(&self) -> Vec<String> {
        self.state.lock().codebases.keys().cloned().collect()
    }
}

#[async_trait::async_trait]
impl Repository for InMemoryRepository {
    async fn is_repo_up(&self) -> bool {
        self.state.lock().up
    }

    async fn get_codebase(&self, path: &str) -> Result<Option<Codebase>> {
        Ok(self.codebase(path).map(|cb| Codebase {
            version: cb.version,
            etag: None,
        }))
    }

    async fn derive_codebase(&self, path: &str, parent: &str, version: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.requests += 1;
        let parent = normalize(parent);
        let files = match state.codebases.get(&parent) {
            Some(cb) => cb.files.clone(),
            None => return Err(Error::NotFound(parent)),
        };
        let child = state.codebases.entry(normalize(path)).or_default();
        for (name, content) in files {
            child.files.entry(name).or_insert(content);
        }
        child.base = Some(parent);
        child.version = version;
        Ok(())
    }

    async fn batch(&self, version: u64, batches: Vec<Batch>) -> Result<()> {
        let mut state = self.state.lock();
        state.requests += 1;
        if state.fail_batches {
            return Err(Error::Status {
                method: "POST",
                path: batches
                    .first()
                    .map(|b| b.basepath.clone())
                    .unwrap_or_default(),
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        for batch in batches {
            let cb = state.codebases.entry(normalize(&batch.basepath)).or_default();
            for item in batch.items {
                if item.obsolete {
                    cb.files.remove(&item.filename);
                } else if let Some(content) = item.bytes() {
                    cb.files.insert(item.filename, content);
                }
            }
            cb.version = version;
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.requests += 1;
        state.codebases.remove(&normalize(path));
        Ok(())
    }
}

fn normalize(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BatchItem, BASE_CODEBASE};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn derived_codebases_inherit_parent_files() {
        let repo = InMemoryRepository::default();
        let err = repo
            .derive_codebase("/fsm/sidecars/a", BASE_CODEBASE, 8)
            .await
            .expect_err("parent is missing");
        assert!(matches!(err, Error::NotFound(p) if p == BASE_CODEBASE));

        crate::restore(&repo).await.unwrap();
        repo.derive_codebase("/fsm/sidecars/a", BASE_CODEBASE, 8)
            .await
            .unwrap();
        repo.batch(
            9,
            vec![Batch {
                basepath: "/fsm/sidecars/a/".to_string(),
                items: vec![BatchItem::text("config.json", "{\"Spec\":{}}")],
            }],
        )
        .await
        .unwrap();

        let cb = repo.codebase("fsm/sidecars/a").unwrap();
        assert_eq!(cb.version, 9);
        assert_eq!(cb.base.as_deref(), Some(BASE_CODEBASE));
        assert!(cb.files.contains_key("main.js"));
        assert_eq!(
            repo.file("/fsm/sidecars/a", "config.json"),
            Some(b"{\"Spec\":{}}".to_vec())
        );

        repo.delete("/fsm/sidecars/a").await.unwrap();
        assert_eq!(repo.codebase_paths(), vec![BASE_CODEBASE.to_string()]);
    }
}
