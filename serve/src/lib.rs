//! The CAS server: one shared blob store behind any number of
//! supervised transport runnables.

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use casfs_castore::blobservice::BlobService;
use casfs_castore::Error;

mod http;
mod recorder;
mod runnable;

pub use http::{router, HttpServer};
pub use recorder::{RecordConsumer, RecordListener};
pub use runnable::Runnable;

/// Supervises a set of runnables sharing one blob store.
///
/// `serve` launches every runnable, waits for a stop signal or context
/// cancellation, shuts everything down and returns the union of all
/// start and shutdown errors. One runnable failing never aborts the
/// others.
pub struct Server {
    blob_service: Arc<dyn BlobService>,
    runnables: Vec<Arc<dyn Runnable>>,
    stop: CancellationToken,
}

impl Server {
    pub fn new(blob_service: Arc<dyn BlobService>) -> Self {
        Self {
            blob_service,
            runnables: Vec::new(),
            stop: CancellationToken::new(),
        }
    }

    pub fn blob_service(&self) -> Arc<dyn BlobService> {
        self.blob_service.clone()
    }

    pub fn add(&mut self, runnable: Arc<dyn Runnable>) {
        self.runnables.push(runnable);
    }

    /// Serves blob reads over HTTP on the given listener.
    pub fn add_http_listener(&mut self, listener: tokio_listener::Listener) {
        let http = HttpServer::new(self.blob_service.clone(), listener);
        self.add(Arc::new(http));
    }

    /// Accepts record connections on the given listener.
    pub fn add_record_listener(&mut self, listener: tokio_listener::Listener) {
        let recorder = RecordListener::new(self.blob_service.clone(), listener);
        self.add(Arc::new(recorder));
    }

    /// Consumes records from a pre-opened byte stream (stdin, a file).
    pub fn add_record_reader(&mut self, reader: impl AsyncRead + Send + Unpin + 'static) {
        let consumer = RecordConsumer::new(self.blob_service.clone(), Box::new(reader));
        self.add(Arc::new(consumer));
    }

    /// Signals the server to stop. Idempotent; safe to call from any
    /// task holding a [`Server::stop_token`] clone as well.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Runs all runnables until a stop signal or `cancel` fires, then
    /// shuts them down and waits for every worker to terminate.
    #[instrument(skip_all)]
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), Error> {
        info!(runnables = self.runnables.len(), "starting CAS server");

        let mut serve_workers = Vec::new();
        for runnable in &self.runnables {
            let runnable = runnable.clone();
            let ctx = cancel.clone();
            serve_workers.push(tokio::spawn(async move { runnable.serve(ctx).await }));
        }

        // wait for stop signal or context cancellation.
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.stop.cancelled() => {}
        }
        info!("stopping CAS server");

        let mut shutdown_workers = Vec::new();
        for runnable in &self.runnables {
            let runnable = runnable.clone();
            shutdown_workers.push(tokio::spawn(async move { runnable.shutdown().await }));
        }

        let mut errors = Vec::new();
        for worker in serve_workers.into_iter().chain(shutdown_workers) {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(e.into()),
            }
        }

        match Error::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
