//! The replication controller: observes the host's commit path, forms
//! segments, stages them in the shadow log, fans out to replicas, drives
//! snapshotting and retention, and accounts for replication lag.
//!
//! The controller runs on the host's commit thread for segment work and
//! owns one background thread for retention. Fan-out is parallel across
//! replicas and awaited before the commit callback returns, so a slow
//! replica slows commits rather than growing an unbounded queue.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::cancel::Cancel;
use crate::codec::Codec;
use crate::config::{default_shadow_dir, Config};
use crate::error::{aggregate, StreamError};
use crate::factory::build_replicas;
use crate::host::{HostDatabase, PageFlushInfo, PageFlushObserver};
use crate::replica::Replica;
use crate::restore;
use crate::retention::prune_directory_tree;
use crate::segment::{Segment, SegmentHeader, Snapshot, SnapshotHeader};
use crate::shadow::ShadowLog;

#[derive(Debug, Default)]
struct StreamState {
    current_generation: String,
    last_tx_id: u64,
    last_snapshot: Option<DateTime<Utc>>,
    last_replication: Option<DateTime<Utc>>,
    replica_lag: HashMap<String, DateTime<Utc>>,
}

/// Orchestrates replication for one host database.
pub struct Controller {
    db: Arc<dyn HostDatabase>,
    config: Config,
    codec: Codec,
    replicas: Vec<Arc<dyn Replica>>,
    shadow: ShadowLog,
    cancel: Cancel,
    state: RwLock<StreamState>,
    retention_tx: Mutex<Option<SyncSender<()>>>,
    retention_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Creates a controller for the given database, configuration, and
    /// replica set. Defaults are applied to zero-valued intervals and the
    /// shadow directory is created.
    pub fn new(
        db: Arc<dyn HostDatabase>,
        mut config: Config,
        replicas: Vec<Arc<dyn Replica>>,
    ) -> Result<Self, StreamError> {
        config.apply_defaults();
        let shadow_dir = config
            .shadow_dir
            .clone()
            .unwrap_or_else(|| default_shadow_dir(&db.path()));
        let shadow = ShadowLog::open(shadow_dir)?;
        let codec = Codec::new(config.compression.normalized());
        Ok(Controller {
            db,
            config,
            codec,
            replicas,
            shadow,
            cancel: Cancel::new(),
            state: RwLock::new(StreamState::default()),
            retention_tx: Mutex::new(None),
            retention_handle: Mutex::new(None),
        })
    }

    /// Builds replicas from the configuration, constructs a controller, and
    /// starts it. The host registers the returned controller as its page
    /// flush observer.
    pub fn enable(db: Arc<dyn HostDatabase>, config: Config) -> Result<Arc<Self>, StreamError> {
        let replicas = build_replicas(&config)?;
        let controller = Arc::new(Controller::new(db, config, replicas)?);
        controller.start()?;
        Ok(controller)
    }

    /// Runs the optional startup restore and spawns the retention loop.
    pub fn start(self: &Arc<Self>) -> Result<(), StreamError> {
        if self.config.restore.enabled {
            let target = self
                .config
                .restore
                .target_path
                .clone()
                .unwrap_or_else(|| self.db.path());
            let restored = restore::restore_into(
                &self.shadow,
                &self.replicas,
                &self.cancel,
                &target,
                self.config.restore.temp_dir.as_deref(),
            )?;
            if restored {
                info!("stream: restored {} before startup", target.display());
            }
        }

        let mut handle_slot = self.retention_handle.lock().unwrap();
        if handle_slot.is_some() {
            return Ok(());
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        *self.retention_tx.lock().unwrap() = Some(tx);
        let controller = Arc::clone(self);
        *handle_slot = Some(thread::spawn(move || controller.retention_loop(rx)));
        Ok(())
    }

    /// Stops the retention loop, joins it, and closes every replica even if
    /// some fail. Returns an aggregated error.
    pub fn stop(&self) -> Result<(), StreamError> {
        self.cancel.cancel();
        // Dropping the trigger sender disconnects the loop's receiver.
        self.retention_tx.lock().unwrap().take();
        if let Some(handle) = self.retention_handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        let mut errs = Vec::new();
        for replica in &self.replicas {
            if let Err(err) = replica.close() {
                errs.push(StreamError::Replica {
                    name: replica.name().to_string(),
                    msg: format!("close: {err}"),
                });
            }
        }
        match aggregate("close replicas", errs) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The shadow log this controller stages artifacts in.
    pub fn shadow(&self) -> &ShadowLog {
        &self.shadow
    }

    /// The generation currently being written, if any commit was observed.
    pub fn current_generation(&self) -> Option<String> {
        let state = self.state.read().unwrap();
        if state.current_generation.is_empty() {
            None
        } else {
            Some(state.current_generation.clone())
        }
    }

    /// The worst-case window of committed-but-unreplicated data.
    ///
    /// With no per-replica success recorded this is the time since the last
    /// observed commit (zero if none); otherwise the maximum age of any
    /// replica's last successful upload.
    pub fn data_loss_window(&self) -> Duration {
        let now = Utc::now();
        let state = self.state.read().unwrap();
        if state.replica_lag.is_empty() {
            return match state.last_replication {
                Some(ts) => (now - ts).to_std().unwrap_or_default(),
                None => Duration::ZERO,
            };
        }
        let mut max = Duration::ZERO;
        for ts in state.replica_lag.values() {
            let lag = (now - *ts).to_std().unwrap_or_default();
            if lag > max {
                max = lag;
            }
        }
        max
    }

    fn build_segment(&self, info: &PageFlushInfo) -> Result<Segment, StreamError> {
        // Frames are copied out of the host's buffers; the segment owns its
        // bytes from here on.
        let frames = info.frames.clone();
        let created_at = info.timestamp.unwrap_or_else(Utc::now);
        let header = SegmentHeader {
            magic: String::new(),
            version: 0,
            tx_id: info.tx_id,
            parent_tx_id: info.parent_tx_id,
            page_count: 0,
            page_size: info.page_size,
            checksum: 0,
            compression: self.codec.settings().codec,
            compression_level: self.codec.settings().level,
            compression_window: self.codec.settings().window,
            created_at,
            high_water_mark: info.high_water_mark,
            attrs: Default::default(),
        };
        self.codec.seal_segment(header, frames)
    }

    fn persist_segment(&self, info: &PageFlushInfo, segment: Segment) -> Result<(), StreamError> {
        let generation = {
            let mut state = self.state.write().unwrap();
            let broken_chain = state.last_tx_id != 0 && info.parent_tx_id != state.last_tx_id;
            if state.current_generation.is_empty() || broken_chain {
                let generation = new_generation_id();
                info!("stream: starting generation {} (tx={})", generation, info.tx_id);
                state.current_generation = generation;
                state.last_tx_id = 0;
            }
            state.last_tx_id = info.tx_id;
            state.last_replication = Some(Utc::now());
            state.current_generation.clone()
        };

        // The commit path sees shadow staging failures directly.
        self.shadow.put_segment(&generation, &segment)?;

        let mut errs = self.fan_out("put segment", |replica, cancel| {
            replica.put_segment(cancel, &generation, &segment)
        });

        if let Err(err) = self.maybe_snapshot(&generation) {
            errs.push(err);
        }

        self.trigger_retention();
        self.warn_if_lagging();

        match aggregate("persist segment", errs) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs `op` against every replica in parallel, waiting for all of them.
    /// Successes refresh the replica's lag timestamp; failures are collected
    /// and never short-circuit the others.
    fn fan_out<F>(&self, what: &str, op: F) -> Vec<StreamError>
    where
        F: Fn(&dyn Replica, &Cancel) -> Result<(), StreamError> + Sync,
    {
        if self.replicas.is_empty() {
            return Vec::new();
        }
        let results: Vec<(String, thread::Result<Result<(), StreamError>>)> =
            thread::scope(|scope| {
                let handles: Vec<_> = self
                    .replicas
                    .iter()
                    .map(|replica| {
                        let op = &op;
                        let cancel = &self.cancel;
                        let name = replica.name().to_string();
                        let handle = scope.spawn(move || op(replica.as_ref(), cancel));
                        (name, handle)
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|(name, handle)| (name, handle.join()))
                    .collect()
            });

        let now = Utc::now();
        let mut errs = Vec::new();
        for (name, joined) in results {
            match joined {
                Ok(Ok(())) => {
                    self.state.write().unwrap().replica_lag.insert(name, now);
                }
                Ok(Err(err)) => errs.push(StreamError::Replica {
                    name,
                    msg: format!("{what}: {err}"),
                }),
                Err(_) => errs.push(StreamError::Replica {
                    name,
                    msg: format!("{what}: panicked"),
                }),
            }
        }
        errs
    }

    fn maybe_snapshot(&self, generation: &str) -> Result<(), StreamError> {
        let interval = self.config.snapshot_interval;
        if interval.is_zero() {
            return Ok(());
        }
        let last = self.state.read().unwrap().last_snapshot;
        if let Some(last) = last {
            let elapsed = (Utc::now() - last).to_std().unwrap_or_default();
            if elapsed < interval {
                return Ok(());
            }
        }

        let snapshot = match self.create_snapshot(generation)? {
            Some(snapshot) => snapshot,
            None => return Ok(()),
        };
        self.state.write().unwrap().last_snapshot = Some(snapshot.header.created_at);
        Ok(())
    }

    /// Serializes a consistent image of the host database, seals it, stages
    /// it, and fans it out. Succeeds only when every replica accepted it.
    fn create_snapshot(&self, generation: &str) -> Result<Option<Snapshot>, StreamError> {
        let page_size = self.db.page_size();
        let codec = self.codec;
        let mut sealed: Option<Snapshot> = None;
        self.db.view(&mut |tx| {
            let mut image = Vec::new();
            tx.write_to(&mut image)?;
            if page_size == 0 {
                return Err(StreamError::InvalidSnapshot {
                    msg: "host reports page size zero".to_string(),
                });
            }
            let tx_id = tx.id().max(0) as u64;
            let header = SnapshotHeader {
                magic: String::new(),
                version: 0,
                tx_id,
                page_count: 0,
                page_size,
                compression: codec.settings().codec,
                compression_level: codec.settings().level,
                compression_window: codec.settings().window,
                created_at: Utc::now(),
            };
            sealed = Some(codec.seal_snapshot(header, &image)?);
            Ok(())
        })?;

        let snapshot = match sealed {
            Some(snapshot) => snapshot,
            None => return Ok(None),
        };

        self.shadow.put_snapshot(generation, &snapshot)?;

        let errs = self.fan_out("put snapshot", |replica, cancel| {
            replica.put_snapshot(cancel, generation, &snapshot)
        });
        if let Some(err) = aggregate("replicate snapshot", errs) {
            return Err(err);
        }

        self.trigger_retention();
        Ok(Some(snapshot))
    }

    /// Raises the single-slot retention signal without blocking.
    fn trigger_retention(&self) {
        if let Some(tx) = self.retention_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(());
        }
    }

    fn retention_loop(self: Arc<Self>, rx: Receiver<()>) {
        let interval = self.config.retention.check_interval;
        loop {
            match rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => self.enforce_retention(),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn enforce_retention(&self) {
        let retention = self.config.retention;
        let now = Utc::now();
        if let Err(err) = prune_directory_tree(self.shadow.root(), now, &retention) {
            if !err.is_cancelled() {
                warn!("stream: shadow prune failed: {}", err);
            }
        }
        let generation = self.state.read().unwrap().current_generation.clone();
        for replica in &self.replicas {
            if let Err(err) = replica.prune(&self.cancel, &generation, &retention) {
                if !err.is_cancelled() {
                    warn!("stream: prune {} failed: {}", replica.name(), err);
                }
            }
        }
    }

    fn warn_if_lagging(&self) {
        let threshold = self.config.data_loss_window_threshold;
        if threshold.is_zero() {
            return;
        }
        let window = self.data_loss_window();
        if window >= threshold {
            warn!(
                "stream: data loss window {:?} exceeds threshold {:?}",
                window, threshold
            );
        }
    }
}

impl PageFlushObserver for Controller {
    fn on_page_flush(&self, info: &PageFlushInfo) -> Result<(), StreamError> {
        let segment = self.build_segment(info)?;
        self.persist_segment(info, segment)
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("shadow", &self.shadow.root())
            .field("replicas", &self.replicas.len())
            .finish()
    }
}

fn new_generation_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SnapshotSource;
    use crate::replica_memory::MemoryReplica;
    use crate::segment::{CompressionKind, PageFrame};
    use std::path::PathBuf;

    const PAGE: u32 = 64;

    struct StubTx<'a> {
        id: i64,
        image: &'a [u8],
    }

    impl SnapshotSource for StubTx<'_> {
        fn id(&self) -> i64 {
            self.id
        }

        fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<u64> {
            out.write_all(self.image)?;
            Ok(self.image.len() as u64)
        }
    }

    struct StubHost {
        path: PathBuf,
        image: Mutex<Vec<u8>>,
        tx_id: Mutex<i64>,
    }

    impl StubHost {
        fn new(path: PathBuf) -> Self {
            StubHost {
                path,
                image: Mutex::new(vec![0u8; 4 * PAGE as usize]),
                tx_id: Mutex::new(0),
            }
        }

        fn commit(&self, frames: Vec<PageFrame>) -> PageFlushInfo {
            let mut image = self.image.lock().unwrap();
            for frame in &frames {
                let offset = frame.id as usize * PAGE as usize;
                let end = offset + frame.data.len();
                if image.len() < end {
                    image.resize(end, 0);
                }
                image[offset..end].copy_from_slice(&frame.data);
            }
            let mut tx = self.tx_id.lock().unwrap();
            let parent = *tx as u64;
            *tx += 1;
            PageFlushInfo {
                tx_id: *tx as u64,
                parent_tx_id: parent,
                db_path: self.path.clone(),
                page_size: PAGE,
                page_count: (image.len() / PAGE as usize) as u32,
                high_water_mark: (image.len() / PAGE as usize) as u64,
                timestamp: None,
                frames,
            }
        }
    }

    impl HostDatabase for StubHost {
        fn path(&self) -> PathBuf {
            self.path.clone()
        }

        fn page_size(&self) -> u32 {
            PAGE
        }

        fn view(
            &self,
            f: &mut dyn FnMut(&dyn SnapshotSource) -> Result<(), StreamError>,
        ) -> Result<(), StreamError> {
            let image = self.image.lock().unwrap();
            let tx = StubTx {
                id: *self.tx_id.lock().unwrap(),
                image: &image,
            };
            f(&tx)
        }
    }

    fn frame(id: u64, fill: u8) -> PageFrame {
        PageFrame {
            id,
            overflow: 0,
            data: vec![fill; PAGE as usize],
        }
    }

    fn controller_with(
        dir: &std::path::Path,
        replicas: Vec<Arc<dyn Replica>>,
    ) -> (Arc<Controller>, Arc<StubHost>) {
        let host = Arc::new(StubHost::new(dir.join("db")));
        let config = Config {
            shadow_dir: Some(dir.join("shadow")),
            compression: crate::config::CompressionConfig {
                codec: Some(CompressionKind::None),
                level: 0,
                window: 0,
            },
            ..Config::default()
        };
        let controller =
            Arc::new(Controller::new(host.clone(), config, replicas).unwrap());
        controller.start().unwrap();
        (controller, host)
    }

    #[test]
    fn test_first_commit_mints_generation_and_stages_segment() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, host) = controller_with(dir.path(), Vec::new());

        let info = host.commit(vec![frame(1, 0x41)]);
        controller.on_page_flush(&info).unwrap();

        let generation = controller.current_generation().unwrap();
        assert_eq!(generation.len(), 16);
        let segments = controller.shadow().list_segments(&generation, 0).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].tx_id, 1);
        // The first commit also snapshots: the interval has never elapsed.
        assert_eq!(
            controller.shadow().list_snapshots(&generation).unwrap().len(),
            1
        );
        controller.stop().unwrap();
    }

    #[test]
    fn test_parent_gap_rotates_generation() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, host) = controller_with(dir.path(), Vec::new());

        let info = host.commit(vec![frame(1, 0x01)]);
        controller.on_page_flush(&info).unwrap();
        let first_generation = controller.current_generation().unwrap();

        let mut gapped = host.commit(vec![frame(2, 0x02)]);
        gapped.tx_id = 5;
        gapped.parent_tx_id = 3;
        controller.on_page_flush(&gapped).unwrap();
        let second_generation = controller.current_generation().unwrap();

        assert_ne!(first_generation, second_generation);
        let generations = controller.shadow().list_generations().unwrap();
        assert_eq!(generations.len(), 2);
        controller.stop().unwrap();
    }

    #[test]
    fn test_first_commit_with_nonzero_parent_does_not_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, host) = controller_with(dir.path(), Vec::new());

        // Attaching to an already-progressed database: tx 6 extends tx 5.
        let mut info = host.commit(vec![frame(1, 0x01)]);
        info.tx_id = 6;
        info.parent_tx_id = 5;
        controller.on_page_flush(&info).unwrap();
        let generation = controller.current_generation().unwrap();

        let mut next = host.commit(vec![frame(2, 0x02)]);
        next.tx_id = 7;
        next.parent_tx_id = 6;
        controller.on_page_flush(&next).unwrap();

        assert_eq!(controller.current_generation().unwrap(), generation);
        assert_eq!(controller.shadow().list_generations().unwrap().len(), 1);
        controller.stop().unwrap();
    }

    #[test]
    fn test_failing_replica_reports_aggregate_but_stages_locally() {
        let dir = tempfile::tempdir().unwrap();
        let healthy = Arc::new(MemoryReplica::new("healthy"));
        let failing = Arc::new(MemoryReplica::new("failing"));
        failing.fail_puts(true);
        let (controller, host) = controller_with(
            dir.path(),
            vec![healthy.clone(), failing.clone()],
        );

        let info = host.commit(vec![frame(1, 0x11)]);
        let err = controller.on_page_flush(&info).unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("persist segment: "));
        assert!(text.contains("failing"));
        assert!(!text.contains("replica healthy"));

        // The healthy replica received the segment and the local stage
        // happened regardless.
        assert!(healthy.contains(&crate::segment::segment_object_name(
            &controller.current_generation().unwrap(),
            1
        )));
        let generation = controller.current_generation().unwrap();
        assert_eq!(
            controller.shadow().list_segments(&generation, 0).unwrap().len(),
            1
        );
        controller.stop().unwrap();
    }

    #[test]
    fn test_data_loss_window_tracks_failing_replica() {
        let dir = tempfile::tempdir().unwrap();
        let healthy = Arc::new(MemoryReplica::new("healthy"));
        let failing = Arc::new(MemoryReplica::new("failing"));
        failing.fail_puts(true);
        let (controller, host) =
            controller_with(dir.path(), vec![healthy, failing]);

        let info = host.commit(vec![frame(1, 0x22)]);
        let _ = controller.on_page_flush(&info);

        // Only the healthy replica recorded a success, so the window is its
        // (tiny) age, not zero and not unbounded.
        let window = controller.data_loss_window();
        assert!(window < Duration::from_secs(5));

        std::thread::sleep(Duration::from_millis(15));
        let later = controller.data_loss_window();
        assert!(later >= window);
        controller.stop().unwrap();
    }

    #[test]
    fn test_data_loss_window_zero_before_any_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _host) = controller_with(dir.path(), Vec::new());
        assert_eq!(controller.data_loss_window(), Duration::ZERO);
        controller.stop().unwrap();
    }

    #[test]
    fn test_replicas_receive_snapshot_manifest_head() {
        let dir = tempfile::tempdir().unwrap();
        let replica = Arc::new(MemoryReplica::new("mem"));
        let (controller, host) = controller_with(dir.path(), vec![replica.clone()]);

        let info = host.commit(vec![frame(1, 0x33)]);
        controller.on_page_flush(&info).unwrap();

        let state = replica.latest_state(&Cancel::new()).unwrap();
        assert_eq!(state.generation, controller.current_generation().unwrap());
        // The first-commit snapshot replaced the segment as the head.
        assert!(state.snapshot.is_some());
        assert!(state.validate().is_ok());
        controller.stop().unwrap();
    }

    #[test]
    fn test_stop_is_idempotent_and_joins_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _host) = controller_with(dir.path(), Vec::new());
        controller.stop().unwrap();
        controller.stop().unwrap();
    }

    #[test]
    fn test_generation_id_shape() {
        let id = new_generation_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
