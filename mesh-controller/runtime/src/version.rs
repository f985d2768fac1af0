//! Serves the controller's build information at `/version`.

use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::Incoming,
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::{convert::Infallible, net::SocketAddr};
use tokio::net::TcpListener;
use tracing::{info, instrument};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildInfo {
    version: &'static str,
    git_commit: &'static str,
    build_date: &'static str,
}

const BUILD_INFO: BuildInfo = BuildInfo {
    version: env!("CARGO_PKG_VERSION"),
    git_commit: match option_env!("GIT_SHA") {
        Some(sha) => sha,
        None => "unknown",
    },
    build_date: match option_env!("BUILD_DATE") {
        Some(date) => date,
        None => "unknown",
    },
};

#[instrument(skip_all, fields(port = %addr.port()))]
pub(crate) async fn serve(addr: SocketAddr, drain: drain::Watch) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "version server listening");

    let shutdown = drain.signaled();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, client) = match res {
                    Ok(conn) => conn,
                    Err(error) => {
                        tracing::warn!(%error, "Failed to accept connection");
                        continue;
                    }
                };
                tokio::spawn(async move {
                    let svc = service_fn(|req: Request<Incoming>| async move {
                        Ok::<_, Infallible>(respond(req.method(), req.uri().path()))
                    });
                    if let Err(error) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await
                    {
                        tracing::debug!(%error, %client, "Connection failed");
                    }
                });
            }
            _release = &mut shutdown => return Ok(()),
        }
    }
}

fn respond(method: &Method, path: &str) -> Response<Full<Bytes>> {
    if path != "/version" {
        return status(StatusCode::NOT_FOUND);
    }
    if *method != Method::GET && *method != Method::HEAD {
        return status(StatusCode::METHOD_NOT_ALLOWED);
    }

    let body = match serde_json::to_vec(&BUILD_INFO) {
        Ok(body) => body,
        Err(error) => {
            tracing::error!(%error, "Failed to encode build info");
            return status(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    let mut rsp = Response::new(Full::new(Bytes::from(body)));
    rsp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    rsp
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    let mut rsp = Response::new(Full::default());
    *rsp.status_mut() = code;
    rsp
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn version_reports_build_info() {
        let rsp = respond(&Method::GET, "/version");
        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(rsp.headers()[CONTENT_TYPE], "application/json");

        let body = rsp.into_body().collect().await.unwrap().to_bytes();
        let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
        assert!(info["gitCommit"].is_string());
        assert!(info["buildDate"].is_string());
    }

    #[test]
    fn other_requests_are_rejected() {
        assert_eq!(
            respond(&Method::GET, "/metrics").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            respond(&Method::POST, "/version").status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
