use crate::{
    document::PolicyDocument, hash::document_hash, metrics::UpdateResult, pack::pack,
    proxy::BuildState, BuildError, Proxy,
};
use chrono::Utc;
use flate2::{write::GzEncoder, Compression};
use fsm_mesh_controller_repo::{
    Batch, BatchItem, Repository, BASE_CODEBASE, CONFIG_FILE, CONFIG_FILE_GZ,
};
use serde::Serialize;
use std::io::Write;

/// How a document is written to the repository.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Encoding {
    pub(crate) pretty: bool,
    pub(crate) compress: bool,
}

/// Publishes a proxy's document unless it hashes to the last published version.
///
/// The proxy's codebase is derived from the base codebase at `hash - 2` and the document is
/// written at `hash - 1`, so that a proxy polling the codebase never observes the base
/// version of its own configuration. A failed write removes the codebase; the next rebuild
/// derives it again.
pub(crate) async fn publish(
    repo: &dyn Repository,
    proxy: &Proxy,
    state: &mut BuildState,
    mut doc: PolicyDocument,
    encoding: Encoding,
) -> Result<UpdateResult, BuildError> {
    doc.ts = None;
    doc.version = None;
    if !encoding.pretty {
        pack(&mut doc)?;
    }

    let hash = document_hash(&doc, &doc.plugin_set_version)?;
    if hash == state.etag {
        return Ok(UpdateResult::Unchanged);
    }

    doc.ts = Some(Utc::now());
    doc.version = Some(hash.to_string());
    let items = encode(&doc, encoding)?;

    let codebase = proxy.codebase();
    let res = async {
        repo.derive_codebase(&codebase, BASE_CODEBASE, hash.wrapping_sub(2))
            .await?;
        repo.batch(
            hash.wrapping_sub(1),
            vec![Batch {
                basepath: codebase.clone(),
                items,
            }],
        )
        .await
    }
    .await;

    if let Err(error) = res {
        if let Err(error) = repo.delete(&codebase).await {
            tracing::warn!(%error, %codebase, "Failed to delete codebase");
        }
        return Err(error.into());
    }

    tracing::debug!(%proxy, prev = state.etag, curv = hash, "Published proxy configuration");
    state.etag = hash;
    Ok(UpdateResult::Published)
}

/// The document file and the obsolete marker for the other encoding.
fn encode(doc: &PolicyDocument, encoding: Encoding) -> Result<Vec<BatchItem>, BuildError> {
    let json = if encoding.pretty {
        let mut buf = Vec::new();
        let fmt = serde_json::ser::PrettyFormatter::with_indent(b" ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, fmt);
        doc.serialize(&mut ser)?;
        buf
    } else {
        serde_json::to_vec(doc)?
    };

    if encoding.compress {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&json)?;
        let bytes = gz.finish()?;
        return Ok(vec![
            BatchItem::binary(CONFIG_FILE_GZ, &bytes),
            BatchItem::obsolete(CONFIG_FILE),
        ]);
    }
    Ok(vec![
        BatchItem::text(CONFIG_FILE, String::from_utf8_lossy(&json).into_owned()),
        BatchItem::obsolete(CONFIG_FILE_GZ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{proxy::tests::workload, ProxyKind};
    use flate2::read::GzDecoder;
    use fsm_mesh_controller_repo::{restore, InMemoryRepository};
    use std::io::Read;

    fn proxy() -> Proxy {
        Proxy::new(
            ProxyKind::Sidecar,
            workload("uuid-1", "bookbuyer-0", "bookbuyer", "10.0.0.1"),
        )
    }

    fn doc(identity: &str) -> PolicyDocument {
        let mut doc = PolicyDocument::default();
        doc.spec.service_identity = identity.to_string();
        doc
    }

    #[tokio::test]
    async fn unchanged_documents_are_not_published() {
        let repo = InMemoryRepository::default();
        restore(&repo).await.unwrap();
        let proxy = proxy();
        let mut state = BuildState::default();

        let res = publish(&repo, &proxy, &mut state, doc("bookbuyer.ns"), Encoding::default())
            .await
            .unwrap();
        assert_eq!(res, UpdateResult::Published);
        assert_ne!(state.etag, 0);

        let stored = repo.codebase(&proxy.codebase()).expect("codebase");
        assert_eq!(stored.version, state.etag.wrapping_sub(1));
        let json = repo.file(&proxy.codebase(), CONFIG_FILE).expect("config");
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["Version"], state.etag.to_string());

        let requests = repo.request_count();
        let res = publish(&repo, &proxy, &mut state, doc("bookbuyer.ns"), Encoding::default())
            .await
            .unwrap();
        assert_eq!(res, UpdateResult::Unchanged);
        assert_eq!(repo.request_count(), requests);
    }

    #[tokio::test]
    async fn compressed_documents_obsolete_plain_ones() {
        let repo = InMemoryRepository::default();
        restore(&repo).await.unwrap();
        let proxy = proxy();
        let mut state = BuildState::default();

        publish(&repo, &proxy, &mut state, doc("a.ns"), Encoding::default())
            .await
            .unwrap();
        assert!(repo.file(&proxy.codebase(), CONFIG_FILE).is_some());

        let encoding = Encoding {
            pretty: true,
            compress: true,
        };
        publish(&repo, &proxy, &mut state, doc("b.ns"), encoding)
            .await
            .unwrap();
        assert!(repo.file(&proxy.codebase(), CONFIG_FILE).is_none());

        let gz = repo.file(&proxy.codebase(), CONFIG_FILE_GZ).expect("gzip");
        let mut json = String::new();
        GzDecoder::new(&gz[..]).read_to_string(&mut json).unwrap();
        assert!(json.starts_with("{\n \""), "{json}");
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["Spec"]["ServiceIdentity"], "b.ns");
    }

    #[tokio::test]
    async fn failed_writes_remove_the_codebase() {
        let repo = InMemoryRepository::default();
        restore(&repo).await.unwrap();
        repo.fail_batches(true);
        let proxy = proxy();
        let mut state = BuildState::default();

        let res = publish(&repo, &proxy, &mut state, doc("a.ns"), Encoding::default()).await;
        assert!(res.is_err());
        assert_eq!(state.etag, 0);
        assert!(repo.codebase(&proxy.codebase()).is_none());
    }
}
