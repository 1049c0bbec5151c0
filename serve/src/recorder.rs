//! Record ingestion runnables: a consumer bound to one byte stream,
//! and a listener spawning a consumer per accepted connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use casfs_castore::blobservice::BlobService;
use casfs_castore::{record, Error};

use crate::runnable::Runnable;

type RecordStream = Box<dyn AsyncRead + Send + Unpin>;

/// Runs the record consumer over a single byte stream (a connection,
/// stdin, or a file).
///
/// Single-flight: a second concurrent `serve` fails with
/// [`Error::AlreadyRunning`]. `shutdown` fires the cancel signal (which
/// drops the stream, closing any underlying connection) and waits for
/// the serving worker to exit.
pub struct RecordConsumer {
    blob_service: Arc<dyn BlobService>,
    reader: AsyncMutex<Option<RecordStream>>,
    running: AtomicBool,
    cancel: CancellationToken,
}

impl RecordConsumer {
    pub fn new(blob_service: Arc<dyn BlobService>, reader: RecordStream) -> Self {
        Self {
            blob_service,
            reader: AsyncMutex::new(Some(reader)),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Runnable for RecordConsumer {
    async fn serve(&self, cancel: CancellationToken) -> Result<(), Error> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }

        let result = {
            let mut guard = self.reader.lock().await;
            match guard.as_mut() {
                // stream already consumed by an earlier serve.
                None => Ok(()),
                Some(reader) => {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => Ok(()),
                        _ = self.cancel.cancelled() => Ok(()),
                        result = record::consume(self.blob_service.as_ref(), reader) => result,
                    };
                    // the stream is one-shot; dropping it closes the
                    // underlying connection.
                    guard.take();
                    result
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn shutdown(&self) -> Result<(), Error> {
        self.cancel.cancel();
        // serve holds the reader lock while consuming; acquiring it
        // here joins the serving worker.
        let _guard = self.reader.lock().await;
        Ok(())
    }
}

/// Accepts connections and runs a [`RecordConsumer`] per connection.
pub struct RecordListener {
    blob_service: Arc<dyn BlobService>,
    listener: AsyncMutex<Option<tokio_listener::Listener>>,
    stop: CancellationToken,
    connection_counter: AtomicU64,
    handlers: Arc<Mutex<HashMap<u64, Arc<RecordConsumer>>>>,
}

impl RecordListener {
    pub fn new(blob_service: Arc<dyn BlobService>, listener: tokio_listener::Listener) -> Self {
        Self {
            blob_service,
            listener: AsyncMutex::new(Some(listener)),
            stop: CancellationToken::new(),
            connection_counter: AtomicU64::new(0),
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Runnable for RecordListener {
    #[instrument(skip_all)]
    async fn serve(&self, cancel: CancellationToken) -> Result<(), Error> {
        let mut listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(Error::AlreadyRunning)?;

        // the accept loop owns the listener; ending it closes the
        // socket.
        let (accept_tx, mut accept_rx) = mpsc::channel(1);
        let accept_cancel = CancellationToken::new();
        let accept_loop = {
            let accept_cancel = accept_cancel.clone();
            tokio::spawn(async move {
                loop {
                    let accepted = tokio::select! {
                        _ = accept_cancel.cancelled() => return,
                        accepted = listener.accept() => accepted,
                    };
                    match accepted {
                        Ok((connection, address)) => {
                            debug!(%address, "accepted record connection");
                            if accept_tx.send(connection).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => return,
                    }
                }
            })
        };

        let mut connection_tasks = Vec::new();
        loop {
            let connection = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.stop.cancelled() => break,
                connection = accept_rx.recv() => match connection {
                    Some(connection) => connection,
                    None => break,
                },
            };

            let id = self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1;
            let handler = Arc::new(RecordConsumer::new(
                self.blob_service.clone(),
                Box::new(connection),
            ));
            self.handlers.lock().unwrap().insert(id, handler.clone());

            let handlers = self.handlers.clone();
            let ctx = cancel.clone();
            connection_tasks.push(tokio::spawn(async move {
                if let Err(e) = handler.serve(ctx).await {
                    // a failed connection is closed and deregistered;
                    // the listener keeps serving.
                    warn!(connection = id, err = %e, "record connection failed");
                }
                handlers.lock().unwrap().remove(&id);
            }));
        }

        accept_cancel.cancel();
        accept_loop.await?;
        for task in connection_tasks {
            task.await?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Error> {
        self.stop.cancel();

        let handlers: Vec<Arc<RecordConsumer>> =
            self.handlers.lock().unwrap().values().cloned().collect();
        let results =
            futures::future::join_all(handlers.iter().map(|handler| handler.shutdown())).await;

        let errors: Vec<Error> = results.into_iter().filter_map(Result::err).collect();
        match Error::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
