//! Unix-domain-socket server: accepts agent and client connections and
//! spawns one driver task per connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use super::connection::drive_connection;
use super::hub::TransportHub;
use super::TransportError;

pub struct UdsServer {
    path: PathBuf,
    listener: UnixListener,
}

impl UdsServer {
    /// Binds the socket, replacing a stale file from a previous run.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        tracing::info!(path = %path.display(), "transport listening");
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept loop; each connection gets its own driver task and a child
    /// cancellation token.
    pub async fn run(self, hub: Arc<TransportHub>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let hub = Arc::clone(&hub);
                        let conn_cancel = cancel.child_token();
                        tokio::spawn(async move {
                            drive_connection(stream, hub, conn_cancel).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(error = %e, "socket cleanup failed");
        }
    }
}
