use crate::{Batch, Codebase, Error, Repository, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A [`Repository`] reached over HTTP.
#[derive(Clone, Debug)]
pub struct RepoClient {
    http: reqwest::Client,
    base: String,
}

// === impl RepoClient ===

impl RepoClient {
    /// A client of the repository API served at `http://<addr>:<port>/api/v1`.
    pub fn new(addr: &str, port: u16) -> Result<Self> {
        Self::with_base_url(format!("http://{addr}:{port}/api/v1"))
    }

    pub fn with_base_url(base: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repo/{}", self.base, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path))
    }
}

#[async_trait::async_trait]
impl Repository for RepoClient {
    async fn is_repo_up(&self) -> bool {
        match self.request(Method::GET, "/").send().await {
            Ok(rsp) => !rsp.status().is_server_error(),
            Err(error) => {
                tracing::debug!(%error, "Repository is not reachable");
                false
            }
        }
    }

    async fn get_codebase(&self, path: &str) -> Result<Option<Codebase>> {
        let rsp = self.request(Method::GET, path).send().await?;
        if rsp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let rsp = check("GET", path, rsp).await?;
        Ok(Some(rsp.json().await?))
    }

    async fn derive_codebase(&self, path: &str, parent: &str, version: u64) -> Result<()> {
        let rsp = self
            .request(Method::POST, path)
            .query(&[("derive", parent.to_string()), ("version", version.to_string())])
            .send()
            .await?;
        check("POST", path, rsp).await?;
        tracing::debug!(%path, %parent, version, "Derived codebase");
        Ok(())
    }

    async fn batch(&self, version: u64, batches: Vec<Batch>) -> Result<()> {
        for batch in &batches {
            let rsp = self
                .request(Method::POST, &batch.basepath)
                .query(&[("version", version.to_string())])
                .json(std::slice::from_ref(batch))
                .send()
                .await?;
            check("POST", &batch.basepath, rsp).await?;
            tracing::debug!(
                basepath = %batch.basepath,
                version,
                items = batch.items.len(),
                "Published batch"
            );
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let rsp = self.request(Method::DELETE, path).send().await?;
        if rsp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check("DELETE", path, rsp).await?;
        Ok(())
    }
}

async fn check(method: &'static str, path: &str, rsp: Response) -> Result<Response> {
    let status = rsp.status();
    if status.is_success() {
        return Ok(rsp);
    }
    let body = rsp.text().await.unwrap_or_default();
    Err(Error::Status {
        method,
        path: path.to_string(),
        status: status.as_u16(),
        body,
    })
}
