//! Master Replicator
//!
//! Watches each configured directory and pushes changes to that
//! directory's slave targets. Fan-out is concurrent per target with a
//! bounded retry policy; a slow or dead slave never blocks replication to
//! the others. Also answers full-sync requests from slaves and performs a
//! full push of every monitored tree shortly after startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{Config, MonitorPath};
use crate::error::SyncError;
use crate::protocol::{Op, SyncPacket};
use crate::transport::{PacketHandler, QuicTransport};
use crate::watcher::{is_ignored, FileEvent, FileWatcher};
use crate::webserver::WebServer;

/// Attempts per target before a send is declared failed.
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Logging ceiling for one event's fan-out. Sends still in flight past
/// this keep running; only the completion log stops waiting.
const FAN_OUT_CEILING: Duration = Duration::from_secs(10);

/// Delay before the startup full push, giving slaves time to come up.
const STARTUP_PUSH_DELAY: Duration = Duration::from_secs(3);

/// Delivery progress for one packet to one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Pending,
    Attempting(u32),
    Retrying(u32),
    Sent,
    Failed,
}

/// Drive one packet to one target through the retry state machine.
///
/// Attempt `n` failing with `n < max_attempts` backs off `n` seconds
/// before attempt `n + 1`. Returns whether the packet was delivered.
pub(crate) async fn send_with_retry<F, Fut>(mut attempt: F, max_attempts: u32, target: &str) -> bool
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<(), SyncError>>,
{
    let mut state = SendState::Pending;

    loop {
        state = match state {
            SendState::Pending => SendState::Attempting(1),
            SendState::Attempting(n) => match attempt(n).await {
                Ok(()) => SendState::Sent,
                Err(e) if n < max_attempts => {
                    tracing::warn!(%target, attempt = n, "send failed, will retry: {}", e);
                    SendState::Retrying(n)
                }
                Err(e) => {
                    tracing::error!(%target, attempts = n, "send failed permanently: {}", e);
                    SendState::Failed
                }
            },
            SendState::Retrying(n) => {
                tokio::time::sleep(Duration::from_secs(n as u64)).await;
                SendState::Attempting(n + 1)
            }
            SendState::Sent => return true,
            SendState::Failed => return false,
        };
    }
}

/// Build the wire packet for a debounced change. Content is read from
/// disk at packet-build time, so the packet carries the file's current
/// bytes rather than the bytes at notification time.
pub(crate) async fn packet_for_event(
    base: &Path,
    event: &FileEvent,
) -> Result<SyncPacket, SyncError> {
    let content = match event.op {
        Op::Delete => Vec::new(),
        _ => tokio::fs::read(base.join(&event.path)).await?,
    };
    Ok(SyncPacket::new(event.op, event.path.clone(), content))
}

/// Walk `root` and return every replicable file as (absolute path,
/// relative forward-slash path). Directories and ignored names are
/// skipped.
pub(crate) fn collect_files(root: &Path) -> Result<Vec<(PathBuf, String)>, SyncError> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if is_ignored(&path) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(root) {
                let rel: Vec<&str> = rel
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect();
                out.push((path.clone(), rel.join("/")));
            }
        }
    }

    Ok(out)
}

/// Point-in-time master status for the periodic report.
#[derive(Debug, Clone)]
pub struct MasterStats {
    pub node_id: String,
    pub monitored_paths: usize,
    pub active_watchers: usize,
}

/// The master node: watchers, fan-out, and full-sync serving.
pub struct Master {
    config: Config,
    transport: Arc<QuicTransport>,
    watchers: Mutex<Vec<FileWatcher>>,
    web: Mutex<Option<WebServer>>,
}

impl Master {
    pub fn new(config: Config) -> Self {
        let transport = Arc::new(QuicTransport::new(config.key_bytes()));
        Self {
            config,
            transport,
            watchers: Mutex::new(Vec::new()),
            web: Mutex::new(None),
        }
    }

    /// Start listening, the upload panel if configured, and one watcher
    /// per monitored path. Any watcher failing to start is fatal.
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        self.transport
            .listen(self.config.port, self.clone() as Arc<dyn PacketHandler>)?;

        if let Some(web_cfg) = &self.config.web {
            if web_cfg.enabled {
                let server = WebServer::start(web_cfg.clone()).await?;
                *self.web.lock() = Some(server);
            }
        }

        let debounce = Duration::from_millis(self.config.debounce_ms);
        for mp in &self.config.monitor_paths {
            let mut watcher = FileWatcher::new(&mp.path, debounce)?;
            let mut rx = watcher
                .take_event_rx()
                .ok_or_else(|| SyncError::Config("watcher event stream missing".to_string()))?;

            let master = self.clone();
            let monitor = mp.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let master = master.clone();
                    let monitor = monitor.clone();
                    tokio::spawn(async move {
                        master.replicate(event, &monitor).await;
                    });
                }
            });

            self.watchers.lock().push(watcher);
        }

        tracing::info!(
            node_id = %self.config.node_id,
            paths = self.config.monitor_paths.len(),
            "master started"
        );

        self.spawn_startup_push();
        Ok(())
    }

    /// Push every monitored tree to its targets after a short grace
    /// period.
    fn spawn_startup_push(self: &Arc<Self>) {
        let master = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STARTUP_PUSH_DELAY).await;
            master.sync_all().await;
        });
    }

    /// Full walk-and-send of every monitored path to all its targets.
    pub async fn sync_all(&self) {
        for mp in &self.config.monitor_paths {
            let files = match collect_files(Path::new(&mp.path)) {
                Ok(files) => files,
                Err(e) => {
                    tracing::error!(path = %mp.path, "initial sync walk failed: {}", e);
                    continue;
                }
            };

            tracing::info!(path = %mp.path, files = files.len(), "pushing initial tree");
            for (abs, rel) in files {
                match tokio::fs::read(&abs).await {
                    Ok(content) => {
                        let packet = SyncPacket::new(Op::Create, rel, content);
                        self.fan_out(packet, &mp.slaves).await;
                    }
                    Err(e) => tracing::warn!(path = %abs.display(), "skipping unreadable file: {}", e),
                }
            }
        }
    }

    /// Turn one debounced event into a packet and fan it out.
    async fn replicate(&self, event: FileEvent, mp: &MonitorPath) {
        let packet = match packet_for_event(Path::new(&mp.path), &event).await {
            Ok(packet) => packet,
            Err(e) => {
                // The file can legitimately be gone again by now.
                tracing::warn!(op = %event.op, path = %event.path, "skipping event: {}", e);
                return;
            }
        };

        tracing::info!(op = %packet.op, path = %packet.path, targets = mp.slaves.len(), "replicating change");
        self.fan_out(packet, &mp.slaves).await;
    }

    /// Deliver one packet to every target concurrently. Waits for all
    /// deliveries up to the ceiling; late sends continue on their own.
    async fn fan_out(&self, packet: SyncPacket, targets: &[String]) {
        let mut handles = Vec::with_capacity(targets.len());

        for target in targets {
            let transport = self.transport.clone();
            let packet = packet.clone();
            let target = target.clone();
            handles.push(tokio::spawn(async move {
                let attempt = |_n: u32| {
                    let transport = transport.clone();
                    let target = target.clone();
                    let packet = packet.clone();
                    async move { transport.send(&target, &packet).await }
                };
                send_with_retry(attempt, MAX_SEND_ATTEMPTS, &target).await
            }));
        }

        let op = packet.op;
        let path = packet.path.clone();
        let all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(FAN_OUT_CEILING, all).await {
            Ok(()) => tracing::debug!(%op, %path, "fan-out complete"),
            Err(_) => tracing::warn!(%op, %path, "fan-out still in flight after ceiling"),
        }
    }

    /// Serve a full tree to the requesting slave: every monitored path
    /// whose target list contains the requester gets walked and sent,
    /// file by file. Per-file failures are logged and skipped.
    async fn serve_full_sync(&self, addr: &str) {
        for mp in &self.config.monitor_paths {
            if !mp.slaves.iter().any(|s| s == addr) {
                continue;
            }

            let files = match collect_files(Path::new(&mp.path)) {
                Ok(files) => files,
                Err(e) => {
                    tracing::error!(path = %mp.path, "full sync walk failed: {}", e);
                    continue;
                }
            };

            let mut sent = 0usize;
            for (abs, rel) in &files {
                let content = match tokio::fs::read(abs).await {
                    Ok(content) => content,
                    Err(e) => {
                        tracing::warn!(path = %abs.display(), "skipping unreadable file: {}", e);
                        continue;
                    }
                };

                let packet = SyncPacket::new(Op::Create, rel.clone(), content);
                match self.transport.send(addr, &packet).await {
                    Ok(()) => sent += 1,
                    Err(e) => tracing::warn!(%addr, path = %rel, "full sync send failed: {}", e),
                }
            }

            tracing::info!(%addr, path = %mp.path, sent, total = files.len(), "full sync served");
        }
    }

    pub fn stats(&self) -> MasterStats {
        MasterStats {
            node_id: self.config.node_id.clone(),
            monitored_paths: self.config.monitor_paths.len(),
            active_watchers: self.watchers.lock().len(),
        }
    }

    /// Stop watchers, the upload panel, and the transport.
    pub async fn stop(&self) {
        let mut watchers = std::mem::take(&mut *self.watchers.lock());
        for watcher in &mut watchers {
            watcher.stop();
        }

        if let Some(web) = self.web.lock().take() {
            web.stop();
        }

        self.transport.close().await;
        tracing::info!(node_id = %self.config.node_id, "master stopped");
    }
}

#[async_trait::async_trait]
impl PacketHandler for Master {
    async fn handle(&self, packet: SyncPacket, remote_addr: String) -> Result<(), SyncError> {
        match packet.op {
            Op::SyncRequest => {
                tracing::info!(node = %packet.path, addr = %remote_addr, "full sync requested");
                self.serve_full_sync(&remote_addr).await;
            }
            Op::Heartbeat => {
                tracing::info!(node = %packet.path, addr = %remote_addr, "heartbeat received");
            }
            other => {
                tracing::debug!(op = %other, addr = %remote_addr, "ignoring unexpected op");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_first_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let delivered = send_with_retry(
            move |_n| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            MAX_SEND_ATTEMPTS,
            "10.0.0.2:9000",
        )
        .await;

        assert!(delivered);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_one_then_two_seconds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let start = tokio::time::Instant::now();

        let delivered = send_with_retry(
            move |n| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(SyncError::Transport("unreachable".to_string()))
                    } else {
                        Ok(())
                    }
                }
            },
            MAX_SEND_ATTEMPTS,
            "10.0.0.2:9000",
        )
        .await;

        assert!(delivered);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_three_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let start = tokio::time::Instant::now();

        let delivered = send_with_retry(
            move |_n| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::Transport("unreachable".to_string())) }
            },
            MAX_SEND_ATTEMPTS,
            "10.0.0.2:9000",
        )
        .await;

        assert!(!delivered);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Sleeps follow attempts 1 and 2 only.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_target_does_not_delay_healthy_one() {
        let healthy = tokio::spawn(send_with_retry(
            |_n| async { Ok(()) },
            MAX_SEND_ATTEMPTS,
            "10.0.0.2:9000",
        ));
        let dead = tokio::spawn(send_with_retry(
            |_n| async { Err(SyncError::Transport("unreachable".to_string())) },
            MAX_SEND_ATTEMPTS,
            "10.0.0.3:9000",
        ));

        let start = tokio::time::Instant::now();
        assert!(healthy.await.unwrap());
        assert_eq!(start.elapsed(), Duration::ZERO);

        assert!(!dead.await.unwrap());
    }

    #[tokio::test]
    async fn test_packet_for_event_reads_content() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("f.txt"), b"payload")
            .await
            .unwrap();

        let event = FileEvent {
            op: Op::Create,
            path: "f.txt".to_string(),
        };
        let packet = packet_for_event(dir.path(), &event).await.unwrap();
        assert_eq!(packet.content, b"payload");
        assert_eq!(packet.checksum, crc32fast::hash(b"payload"));
    }

    #[tokio::test]
    async fn test_packet_for_event_delete_has_no_content() {
        let dir = tempfile::tempdir().unwrap();
        let event = FileEvent {
            op: Op::Delete,
            path: "gone.txt".to_string(),
        };
        let packet = packet_for_event(dir.path(), &event).await.unwrap();
        assert!(packet.content.is_empty());
    }

    #[tokio::test]
    async fn test_packet_for_event_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let event = FileEvent {
            op: Op::Modify,
            path: "vanished.txt".to_string(),
        };
        let err = packet_for_event(dir.path(), &event).await.unwrap_err();
        assert!(matches!(err, SyncError::FileSystem(_)));
    }

    #[test]
    fn test_collect_files_walks_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("top.txt"), b"1").unwrap();
        std::fs::write(dir.path().join("a/mid.txt"), b"2").unwrap();
        std::fs::write(dir.path().join("a/b/deep.txt"), b"3").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"4").unwrap();
        std::fs::write(dir.path().join("a/tmp.txt~"), b"5").unwrap();

        let mut rels: Vec<String> = collect_files(dir.path())
            .unwrap()
            .into_iter()
            .map(|(_, rel)| rel)
            .collect();
        rels.sort();

        assert_eq!(rels, vec!["a/b/deep.txt", "a/mid.txt", "top.txt"]);
    }

    #[test]
    fn test_collect_files_missing_root_is_error() {
        let err = collect_files(Path::new("/nonexistent/mirrorsync-root")).unwrap_err();
        assert!(matches!(err, SyncError::FileSystem(_)));
    }
}
