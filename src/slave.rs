//! Slave Applier
//!
//! Receives sync packets and applies them idempotently under the local
//! sync root. Writes that would not change on-disk bytes are skipped,
//! deletes of absent paths are no-ops, and directories emptied by deletes
//! are pruned up to (but never including) the root. Counters are atomic
//! and shared with the periodic status report.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::error::SyncError;
use crate::protocol::{Op, SyncPacket};
use crate::transport::{PacketHandler, QuicTransport};

/// Delay before the startup full-sync request, giving the master time to
/// come up.
const FULL_SYNC_DELAY: Duration = Duration::from_secs(2);

/// Atomic apply counters. Monotonic for the process lifetime.
#[derive(Debug, Default)]
pub struct SlaveStats {
    received: AtomicU64,
    applied: AtomicU64,
    errors: AtomicU64,
    last_apply_ms: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub applied: u64,
    pub errors: u64,
    /// Epoch milliseconds of the last successful apply; 0 if none yet.
    pub last_apply_ms: u64,
}

impl SlaveStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_apply_ms: self.last_apply_ms.load(Ordering::Relaxed),
        }
    }

    fn mark_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_apply_ms.store(now_ms, Ordering::Relaxed);
    }
}

/// Join a wire-relative path under `root`, rejecting anything that could
/// escape it.
pub(crate) fn safe_join(root: &Path, rel: &str) -> Result<PathBuf, SyncError> {
    if rel.is_empty() {
        return Err(SyncError::Validation("empty relative path".to_string()));
    }

    let rel_path = Path::new(rel);
    let mut out = root.to_path_buf();
    for component in rel_path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            _ => {
                return Err(SyncError::Validation(format!(
                    "unsafe relative path: {}",
                    rel
                )))
            }
        }
    }
    Ok(out)
}

/// The slave node: applies inbound packets under the sync root.
pub struct Slave {
    config: Config,
    transport: Arc<QuicTransport>,
    stats: Arc<SlaveStats>,
}

impl Slave {
    pub fn new(config: Config) -> Self {
        let transport = Arc::new(QuicTransport::new(config.key_bytes()));
        Self {
            config,
            transport,
            stats: Arc::new(SlaveStats::default()),
        }
    }

    /// Ensure the sync root exists, start listening, then request a full
    /// sync and begin heartbeating. Sync root creation failure is fatal.
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        tokio::fs::create_dir_all(&self.config.sync_path).await?;

        self.transport
            .listen(self.config.port, self.clone() as Arc<dyn PacketHandler>)?;

        tracing::info!(
            node_id = %self.config.node_id,
            master = %self.config.master_addr,
            sync_path = %self.config.sync_path,
            "slave started"
        );

        let slave = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FULL_SYNC_DELAY).await;
            slave.request_full_sync().await;
        });

        let slave = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(slave.config.heartbeat_secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                slave.send_heartbeat().await;
            }
        });

        Ok(())
    }

    /// Ask the master to resend the full tree.
    pub async fn request_full_sync(&self) {
        let packet = SyncPacket::new(Op::SyncRequest, self.config.node_id.clone(), Vec::new());
        match self.transport.send(&self.config.master_addr, &packet).await {
            Ok(()) => tracing::info!(master = %self.config.master_addr, "full sync requested"),
            Err(e) => tracing::warn!(master = %self.config.master_addr, "full sync request failed: {}", e),
        }
    }

    async fn send_heartbeat(&self) {
        let packet = SyncPacket::new(Op::Heartbeat, self.config.node_id.clone(), Vec::new());
        if let Err(e) = self.transport.send(&self.config.master_addr, &packet).await {
            tracing::warn!(master = %self.config.master_addr, "heartbeat failed: {}", e);
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn stop(&self) {
        self.transport.close().await;
        tracing::info!(node_id = %self.config.node_id, "slave stopped");
    }

    fn sync_root(&self) -> &Path {
        Path::new(&self.config.sync_path)
    }

    /// Write `content` at the packet path. Returns whether on-disk bytes
    /// changed.
    async fn apply_write(&self, rel: &str, content: &[u8]) -> Result<bool, SyncError> {
        let target = safe_join(self.sync_root(), rel)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Ok(existing) = tokio::fs::read(&target).await {
            if existing == content {
                tracing::debug!(path = %rel, "content unchanged, skipping write");
                return Ok(false);
            }
        }

        tokio::fs::write(&target, content).await?;
        Ok(true)
    }

    /// Remove the packet path if present, then prune empty ancestors
    /// strictly below the sync root. Returns whether anything was
    /// removed.
    async fn apply_delete(&self, rel: &str) -> Result<bool, SyncError> {
        let target = safe_join(self.sync_root(), rel)?;

        let meta = match tokio::fs::metadata(&target).await {
            Ok(meta) => meta,
            Err(_) => {
                tracing::debug!(path = %rel, "already absent, nothing to delete");
                return Ok(false);
            }
        };

        if meta.is_dir() {
            tokio::fs::remove_dir_all(&target).await?;
        } else {
            tokio::fs::remove_file(&target).await?;
        }

        if let Some(parent) = target.parent() {
            self.prune_empty_dirs(parent.to_path_buf()).await;
        }
        Ok(true)
    }

    /// Walk upward removing empty directories, stopping at the sync root.
    async fn prune_empty_dirs(&self, mut dir: PathBuf) {
        let root = self.sync_root().to_path_buf();
        while dir != root && dir.starts_with(&root) {
            match tokio::fs::remove_dir(&dir).await {
                Ok(()) => {
                    tracing::debug!(path = %dir.display(), "pruned empty directory");
                    match dir.parent() {
                        Some(parent) => dir = parent.to_path_buf(),
                        None => break,
                    }
                }
                // Non-empty or already gone; either way stop climbing.
                Err(_) => break,
            }
        }
    }
}

#[async_trait::async_trait]
impl PacketHandler for Slave {
    async fn handle(&self, packet: SyncPacket, remote_addr: String) -> Result<(), SyncError> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let result = match packet.op {
            Op::Create | Op::Modify => self.apply_write(&packet.path, &packet.content).await,
            Op::Delete => self.apply_delete(&packet.path).await,
            Op::SyncRequest | Op::Heartbeat => {
                tracing::debug!(op = %packet.op, addr = %remote_addr, "ignoring op not meant for a mirror");
                return Ok(());
            }
            Op::SyncResponse => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Err(SyncError::Validation(format!(
                    "unexpected op {} from {}",
                    packet.op, remote_addr
                )));
            }
        };

        match result {
            Ok(true) => {
                self.stats.mark_applied();
                tracing::info!(op = %packet.op, path = %packet.path, "change applied");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(op = %packet.op, path = %packet.path, "apply failed: {}", e);
                Err(e)
            }
        }
    }
}
