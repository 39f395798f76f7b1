//! Unix domain socket fan-out of scan reports
//!
//! Every connected client receives each report as one line of JSON. Slow
//! clients that fall more than [`CHANNEL_CAPACITY`] reports behind lose the
//! oldest ones rather than stalling the scanner.

#![cfg(target_family = "unix")]

use super::{ReportSink, ScanReport, report_value};
use crate::error::{Error, Result};
use serde_json::Value;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Pause after a failed `accept`, e.g. while out of file descriptors
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Reports buffered per client before lagging clients start skipping
pub const CHANNEL_CAPACITY: usize = 128;

/// Accept forever, backing off after errors instead of spinning
async fn accept_loop<C, A, F>(mut accept: A, mut on_client: impl FnMut(C))
where
    A: FnMut() -> F,
    F: Future<Output = io::Result<C>>,
{
    loop {
        match accept().await {
            Ok(client) => on_client(client),
            Err(err) => {
                tracing::warn!(error = %err, "Unix socket accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Broadcasts reports to all connected Unix domain socket clients
pub struct UnixBroadcast {
    sender: broadcast::Sender<Arc<String>>,
    accept_task: JoinHandle<()>,
    socket_path: PathBuf,
}

impl UnixBroadcast {
    /// Bind `path`, replacing a stale socket, and start accepting clients
    pub async fn bind(path: &Path) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_context(e, format!("create directory {}", parent.display())))?;
        }

        if path.exists() {
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| io_context(e, format!("remove stale socket {}", path.display())))?;
        }

        let listener = UnixListener::bind(path)
            .map_err(|e| io_context(e, format!("bind Unix socket {}", path.display())))?;

        let (sender, _) = broadcast::channel::<Arc<String>>(CHANNEL_CAPACITY);
        let subscribe = sender.clone();

        let listener = Arc::new(listener);
        let accept_task = tokio::spawn(accept_loop(
            move || {
                let listener = Arc::clone(&listener);
                async move { listener.accept().await.map(|(stream, _addr)| stream) }
            },
            move |stream| {
                tracing::debug!("Report client connected");
                tokio::spawn(handle_client(stream, subscribe.subscribe()));
            },
        ));

        tracing::info!(path = %path.display(), "Broadcasting reports on Unix socket");

        Ok(Arc::new(Self {
            sender,
            accept_task,
            socket_path: path.to_path_buf(),
        }))
    }

    /// Socket path clients connect to
    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of clients currently subscribed
    pub fn client_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Broadcast a JSON value; having no clients is not an error
    pub fn send_value(&self, value: &Value) -> Result<()> {
        let line = serde_json::to_string(value)?;
        // send only fails when nobody is listening
        let _ = self.sender.send(Arc::new(line));
        Ok(())
    }
}

impl ReportSink for UnixBroadcast {
    fn emit(&self, report: &ScanReport) -> Result<()> {
        self.send_value(&report_value(report))
    }
}

impl Drop for UnixBroadcast {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            tracing::debug!(
                path = %self.socket_path.display(),
                error = %err,
                "Failed to remove Unix socket"
            );
        }
    }
}

fn io_context(err: std::io::Error, action: String) -> Error {
    Error::Io(std::io::Error::new(err.kind(), format!("Failed to {action}: {err}")))
}

async fn handle_client(mut stream: UnixStream, mut rx: broadcast::Receiver<Arc<String>>) {
    loop {
        let line = match rx.recv().await {
            Ok(line) => line,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Report client lagging, reports dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let written = async {
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await
        }
        .await;

        if let Err(err) = written {
            tracing::debug!(error = %err, "Report client disconnected");
            break;
        }
    }
}
