use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use casfs_castore::Error;

/// A supervised unit of the CAS server.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Starts the runnable and blocks until it completes or is stopped.
    async fn serve(&self, cancel: CancellationToken) -> Result<(), Error>;

    /// Gracefully stops the runnable. Idempotent; a no-op when the
    /// runnable is already stopped.
    async fn shutdown(&self) -> Result<(), Error>;
}
