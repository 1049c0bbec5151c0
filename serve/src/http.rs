//! Serving blob reads over HTTP.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use casfs_castore::blobservice::BlobService;
use casfs_castore::{Error, SriDigest};

use crate::runnable::Runnable;

/// Builds the blob router: `GET /<digest>` returns the blob bytes.
///
/// The wildcard matters: standard base64 may contain `/`, so a digest
/// spans multiple path segments.
pub fn router(blob_service: Arc<dyn BlobService>) -> Router {
    Router::new()
        .route("/*digest", get(get_blob))
        .with_state(blob_service)
}

#[instrument(skip(blob_service))]
async fn get_blob(
    State(blob_service): State<Arc<dyn BlobService>>,
    Path(digest): Path<String>,
) -> Response {
    let digest: SriDigest = match digest.parse() {
        Ok(digest) => digest,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    match blob_service.open_read(&digest).await {
        Ok(Some(reader)) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Body::from_stream(ReaderStream::new(reader)),
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(blob.digest=%digest, err=%e, "failed to open blob");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serves the blob router on one listener.
pub struct HttpServer {
    app: Router,
    listener: Mutex<Option<tokio_listener::Listener>>,
    stop: CancellationToken,
}

impl HttpServer {
    pub fn new(blob_service: Arc<dyn BlobService>, listener: tokio_listener::Listener) -> Self {
        Self {
            app: router(blob_service),
            listener: Mutex::new(Some(listener)),
            stop: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Runnable for HttpServer {
    async fn serve(&self, cancel: CancellationToken) -> Result<(), Error> {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::AlreadyRunning)?;

        let stop = self.stop.clone();
        tokio_listener::axum07::serve(listener, self.app.clone().into_make_service())
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = stop.cancelled() => {}
                }
            })
            .await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Error> {
        self.stop.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use casfs_castore::blobservice::MemoryBlobService;
    use casfs_castore::{sri, Algorithm};

    use super::*;

    async fn service_with_blob(contents: &[u8]) -> (Router, SriDigest) {
        let blob_service = Arc::new(MemoryBlobService::new());
        let digest = sri::hash_reader(Algorithm::Sha256, contents).await.unwrap();
        blob_service.write(&digest, &mut &contents[..]).await.unwrap();
        (router(blob_service), digest)
    }

    #[tokio::test]
    async fn get_present_blob() {
        let (app, digest) = service_with_blob(b"hello\n").await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/{digest}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello\n");
    }

    #[tokio::test]
    async fn get_absent_blob_is_404() {
        let (app, _) = service_with_blob(b"hello\n").await;
        let absent = sri::hash_reader(Algorithm::Sha256, &b"absent"[..])
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/{absent}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_malformed_digest_is_400() {
        let (app, _) = service_with_blob(b"hello\n").await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/not-a-digest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
