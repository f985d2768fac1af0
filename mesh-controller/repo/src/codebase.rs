use crate::{Batch, BatchItem, Repository, Result};
use std::time::Duration;

/// The codebase every proxy codebase derives from.
pub const BASE_CODEBASE: &str = "/fsm/base";

/// The parent directory of per-proxy codebases, named by certificate common name.
pub const SIDECAR_CODEBASE: &str = "/fsm/sidecars";

pub const CONFIG_FILE: &str = "config.json";
pub const CONFIG_FILE_GZ: &str = "config.json.gz";

const BASE_VERSION: u64 = 1;
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

static BASE_FILES: &[(&str, &str)] = &[
    ("main.js", include_str!("../codebase/main.js")),
    (CONFIG_FILE, include_str!("../codebase/config.json")),
];

/// The embedded base codebase.
pub fn base_batch() -> Batch {
    Batch {
        basepath: BASE_CODEBASE.to_string(),
        items: BASE_FILES
            .iter()
            .map(|(name, content)| BatchItem::text(*name, *content))
            .collect(),
    }
}

/// Uploads the embedded base codebase. Uploading it again is harmless.
pub async fn restore(repo: &dyn Repository) -> Result<()> {
    repo.batch(BASE_VERSION, vec![base_batch()]).await?;
    tracing::info!(codebase = BASE_CODEBASE, "Restored base codebase");
    Ok(())
}

/// Polls the repository until it is up, backing off exponentially between attempts.
pub async fn wait_until_up(repo: &dyn Repository) {
    let mut backoff = MIN_BACKOFF;
    while !repo.is_repo_up().await {
        tracing::info!(?backoff, "Waiting for the repository");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryRepository;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn restore_uploads_the_base_codebase() {
        let repo = InMemoryRepository::default();
        restore(&repo).await.unwrap();
        restore(&repo).await.unwrap();

        let base = repo.codebase(BASE_CODEBASE).expect("base must exist");
        assert_eq!(base.version, BASE_VERSION);
        assert_eq!(
            base.files.keys().cloned().collect::<Vec<_>>(),
            vec!["config.json".to_string(), "main.js".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn waits_with_bounded_backoff() {
        let repo = InMemoryRepository::default();
        repo.set_up(false);

        let start = tokio::time::Instant::now();
        let wait = tokio::spawn({
            let repo = repo.clone();
            async move { wait_until_up(&repo).await }
        });

        // Probes run at 0, 1, 3, 7, 15, 31, 61 and 91 seconds.
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(!wait.is_finished());
        repo.set_up(true);
        wait.await.unwrap();
        assert!(start.elapsed() <= Duration::from_secs(91 + 30));
    }
}
