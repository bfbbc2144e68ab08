use crate::config::AppConfig;
use crate::core::calculator::{CalculatorError, CalculatorFactory};
use crate::core::duplicate::{DuplicateGrouper, ScanSummary};
use crate::core::fs::{FileSystem, LocalFileSystem};
use crate::core::ids::{IdGenerator, UuidGenerator};
use crate::core::jobs::{Job, JobError, JobQueue};
use crate::core::video::{FfmpegVideoService, VideoService};
use crate::database::models::{Content, ContentHash};
use crate::database::repositories::{
    ContentHashRepository, ContentRepository, DuplicateGroupRepository, ScanQueueRepository,
};
use crate::database::{Database, DatabaseError};
use log::info;
use serde::{Deserialize, Serialize};
use rusqlite::Connection;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum DedupError {
    #[error(transparent)]
    Calculator(#[from] CalculatorError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("Blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Job was dropped before reporting a result")]
    Dropped,
}

impl DedupError {
    /// Recover the typed error a job handler failed with.
    fn from_job(error: JobError) -> Self {
        match error {
            JobError::Failed(e) => match e.downcast::<DedupError>() {
                Ok(dedup) => dedup,
                Err(other) => DedupError::Job(JobError::Failed(other)),
            },
            panicked => DedupError::Job(panicked),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationOutcome {
    pub content_id: String,
    pub hashes: Vec<ContentHash>,
    pub scan_triggered: bool,
}

pub type Reply<T> = oneshot::Receiver<Result<T, DedupError>>;

/// Registration, scanning and removal, serialized through one job queue.
///
/// Cloning is cheap and every clone shares the same queue and database.
#[derive(Clone)]
pub struct DedupService {
    db: Arc<Database>,
    calculators: CalculatorFactory,
    grouper: Arc<DuplicateGrouper>,
    ids: Arc<dyn IdGenerator>,
    jobs: JobQueue,
    batch_threshold: usize,
    /// Set while an automatic scan waits in the queue.
    scan_scheduled: Arc<AtomicBool>,
}

impl DedupService {
    pub fn new(
        db: Arc<Database>,
        config: &AppConfig,
        video: Arc<dyn VideoService>,
        fs: Arc<dyn FileSystem>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            db,
            calculators: CalculatorFactory::new(config, video, fs, ids.clone()),
            grouper: Arc::new(DuplicateGrouper::new(
                config.dhash_size,
                config.dhash_max_distance,
                ids.clone(),
            )),
            ids,
            jobs: JobQueue::new(),
            batch_threshold: config.batch_threshold,
            scan_scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Service using ffmpeg, the local disk and random ids.
    pub fn from_config(db: Arc<Database>, config: &AppConfig) -> Self {
        Self::new(
            db,
            config,
            Arc::new(FfmpegVideoService::new(
                &config.ffmpeg_path,
                &config.ffprobe_path,
            )),
            Arc::new(LocalFileSystem),
            Arc::new(UuidGenerator),
        )
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Queue hash calculation for `content`. The receiver may be dropped.
    pub fn enqueue_registration(&self, content: Content) -> Reply<RegistrationOutcome> {
        let service = self.clone();
        self.submit(format!("register {}", content.id), content, move |content| async move {
            service.run_registration(content).await
        })
    }

    pub async fn register(&self, content: Content) -> Result<RegistrationOutcome, DedupError> {
        self.enqueue_registration(content)
            .await
            .map_err(|_| DedupError::Dropped)?
    }

    pub fn enqueue_scan(&self) -> Reply<ScanSummary> {
        let db = self.db.clone();
        let grouper = self.grouper.clone();
        let scheduled = self.scan_scheduled.clone();
        self.submit("scan".to_string(), (), move |_| async move {
            scheduled.store(false, Ordering::SeqCst);
            let summary = tokio::task::spawn_blocking(move || {
                let conn = db.lock()?;
                grouper.scan(&conn)
            })
            .await??;
            Ok(summary)
        })
    }

    pub async fn scan(&self) -> Result<ScanSummary, DedupError> {
        self.enqueue_scan().await.map_err(|_| DedupError::Dropped)?
    }

    /// Queue removal of a content with its hashes and group membership.
    /// Resolves to whether the content row existed.
    pub fn enqueue_removal(&self, content_id: String) -> Reply<bool> {
        let service = self.clone();
        let name = format!("remove {}", content_id);
        self.submit(name, content_id, move |content_id| async move {
            service.run_removal(&content_id)
        })
    }

    pub async fn remove_content(&self, content_id: &str) -> Result<bool, DedupError> {
        self.enqueue_removal(content_id.to_string())
            .await
            .map_err(|_| DedupError::Dropped)?
    }

    /// Queue every known hash for comparison again.
    pub async fn requeue_all(&self) -> Result<usize, DedupError> {
        let db = self.db.clone();
        self.submit("requeue".to_string(), (), move |_| async move {
            let conn = db.lock()?;
            let added = ScanQueueRepository::new(&conn).requeue_all()?;
            info!("Requeued {} hashes", added);
            Ok(added)
        })
        .await
        .map_err(|_| DedupError::Dropped)?
    }

    pub async fn wait_idle(&self) {
        self.jobs.wait_idle().await;
    }

    fn submit<I, T, F, Fut>(&self, name: String, input: I, handle: F) -> Reply<T>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: FnOnce(I) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, DedupError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let on_success = Arc::new(Mutex::new(Some(tx)));
        let on_error = on_success.clone();

        let job = Job::new(name, input, move |input| async move {
            handle(input).await.map_err(anyhow::Error::from)
        })
        .on_success(move |value| reply(&on_success, Ok(value)))
        .on_error(move |e| reply(&on_error, Err(DedupError::from_job(e))));

        self.jobs.enqueue(job);
        rx
    }

    async fn run_registration(&self, content: Content) -> Result<RegistrationOutcome, DedupError> {
        let hashes = self.calculators.calculate(&content).await?;

        let pending = {
            let conn = self.db.lock()?;
            let tx = conn.unchecked_transaction().map_err(DatabaseError::from)?;

            // Re-registration starts over for this content.
            self.leave_groups(&tx, &content.id)?;
            let hash_repo = ContentHashRepository::new(&tx);
            hash_repo.delete_by_content_id(&content.id)?;

            let queue = ScanQueueRepository::new(&tx);
            for hash in &hashes {
                hash_repo.save(hash)?;
                queue.add(&hash.id)?;
            }
            let pending = queue.count()?;
            tx.commit().map_err(DatabaseError::from)?;
            pending
        };

        info!(
            "Registered {} ({}) with {} hashes, {} pending",
            content.id,
            content.content_type,
            hashes.len(),
            pending
        );

        let scan_triggered =
            pending >= self.batch_threshold && !self.scan_scheduled.swap(true, Ordering::SeqCst);
        if scan_triggered {
            info!("Scan queue reached {}, scheduling scan", pending);
            drop(self.enqueue_scan());
        }

        Ok(RegistrationOutcome {
            content_id: content.id,
            hashes,
            scan_triggered,
        })
    }

    fn run_removal(&self, content_id: &str) -> Result<bool, DedupError> {
        let conn = self.db.lock()?;
        let tx = conn.unchecked_transaction().map_err(DatabaseError::from)?;

        let groups_deleted = self.leave_groups(&tx, content_id)?;
        let hashes_deleted = ContentHashRepository::new(&tx).delete_by_content_id(content_id)?;
        let existed = ContentRepository::new(&tx).delete(content_id)?;
        tx.commit().map_err(DatabaseError::from)?;

        info!(
            "Removed {}: {} hashes, {} groups dissolved",
            content_id, hashes_deleted, groups_deleted
        );
        Ok(existed)
    }

    /// Drop a content from its groups. Surviving groups are measured
    /// against their new first item. Returns the number of groups deleted.
    fn leave_groups(&self, conn: &Connection, content_id: &str) -> Result<usize, DedupError> {
        let groups = DuplicateGroupRepository::new(conn, self.ids.as_ref());
        let group_ids = groups.find_ids_by_content_id(content_id)?;
        let deleted = groups.remove_content(content_id)?;

        for group_id in &group_ids {
            if self.grouper.refresh_group(conn, group_id)? {
                info!("Group {} measured against a new representative", group_id);
            }
        }
        Ok(deleted)
    }
}

fn reply<T>(slot: &Mutex<Option<oneshot::Sender<T>>>, value: T) {
    let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(sender) = sender {
        // The caller may have dropped the receiver.
        let _ = sender.send(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::calculator::tests::StubVideoService;
    use crate::core::hash::tests::banded_image;
    use crate::core::ids::SequentialIdGenerator;
    use crate::database::models::{ContentType, HashType};
    use tempfile::TempDir;

    struct Harness {
        storage: TempDir,
        _scratch: TempDir,
        service: DedupService,
    }

    fn harness(batch_threshold: usize) -> Harness {
        let storage = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        std::fs::create_dir_all(storage.path().join("library")).unwrap();

        let config = AppConfig {
            storage_root: storage.path().to_path_buf(),
            temp_dir: Some(scratch.path().to_path_buf()),
            batch_threshold,
            ..AppConfig::default()
        };
        let service = DedupService::new(
            Arc::new(Database::open_in_memory().unwrap()),
            &config,
            Arc::new(StubVideoService::new(3.2)),
            Arc::new(LocalFileSystem),
            Arc::new(SequentialIdGenerator::new()),
        );

        Harness {
            storage,
            _scratch: scratch,
            service,
        }
    }

    impl Harness {
        fn add_image(&self, id: &str, name: &str, invert: bool) -> Content {
            let path = self.storage.path().join("library").join(name);
            banded_image(120, 80, invert).save(&path).unwrap();
            self.content(id, name, ContentType::Image)
        }

        fn add_file(
            &self,
            id: &str,
            name: &str,
            bytes: &[u8],
            content_type: ContentType,
        ) -> Content {
            std::fs::write(self.storage.path().join("library").join(name), bytes).unwrap();
            self.content(id, name, content_type)
        }

        fn content(&self, id: &str, name: &str, content_type: ContentType) -> Content {
            let content = Content {
                id: id.to_string(),
                path: "library".to_string(),
                name: name.to_string(),
                content_type,
            };
            let conn = self.service.database().lock().unwrap();
            ContentRepository::new(&conn).save(&content).unwrap();
            content
        }

        fn pending(&self) -> usize {
            let conn = self.service.database().lock().unwrap();
            ScanQueueRepository::new(&conn).count().unwrap()
        }

        fn group_count(&self) -> usize {
            let conn = self.service.database().lock().unwrap();
            let ids = SequentialIdGenerator::new();
            DuplicateGroupRepository::new(&conn, &ids).count(None).unwrap()
        }
    }

    #[tokio::test]
    async fn test_register_then_manual_scan() {
        let h = harness(10);
        let a = h.add_image("cnt_a", "a.png", false);
        let copy = h.add_image("cnt_b", "b.png", false);

        let first = h.service.register(a).await.unwrap();
        let second = h.service.register(copy).await.unwrap();
        assert_eq!(first.hashes.len(), 1);
        assert!(!second.scan_triggered);
        assert_eq!(first.hashes[0].value, second.hashes[0].value);
        assert_eq!(h.pending(), 2);

        let summary = h.service.scan().await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.groups_created, 1);
        assert_eq!(h.pending(), 0);
    }

    #[tokio::test]
    async fn test_batch_threshold_triggers_scan() {
        let h = harness(2);
        let a = h.add_image("cnt_a", "a.png", false);
        let b = h.add_image("cnt_b", "b.png", false);

        assert!(!h.service.register(a).await.unwrap().scan_triggered);
        assert!(h.service.register(b).await.unwrap().scan_triggered);
        h.service.wait_idle().await;

        assert_eq!(h.pending(), 0);
        assert_eq!(h.group_count(), 1);
    }

    #[tokio::test]
    async fn test_one_automatic_scan_pending_at_a_time() {
        let h = harness(2);
        let replies: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let id = format!("cnt_{}", name);
                let content = h.add_image(&id, &format!("{}.png", name), false);
                h.service.enqueue_registration(content)
            })
            .collect();

        let mut triggered = Vec::new();
        for reply in replies {
            triggered.push(reply.await.unwrap().unwrap().scan_triggered);
        }
        assert_eq!(triggered, vec![false, true, false]);
        h.service.wait_idle().await;
        assert_eq!(h.pending(), 0);
        assert_eq!(h.group_count(), 1);

        // Once that scan ran the threshold arms again.
        let d = h.add_image("cnt_d", "d.png", true);
        let e = h.add_image("cnt_e", "e.png", true);
        assert!(!h.service.register(d).await.unwrap().scan_triggered);
        assert!(h.service.register(e).await.unwrap().scan_triggered);
        h.service.wait_idle().await;
        assert_eq!(h.pending(), 0);
    }

    #[tokio::test]
    async fn test_reregistration_replaces_hashes() {
        let h = harness(10);
        let a = h.add_image("cnt_a", "a.png", false);

        h.service.register(a.clone()).await.unwrap();
        h.add_image("cnt_a", "a.png", true);
        let outcome = h.service.register(a).await.unwrap();

        let conn = h.service.database().lock().unwrap();
        let stored = ContentHashRepository::new(&conn)
            .find_by_content_id("cnt_a")
            .unwrap();
        assert_eq!(stored, outcome.hashes);
        assert_eq!(ScanQueueRepository::new(&conn).count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_registration_persists_nothing() {
        let h = harness(10);
        let audio = h.add_file("cnt_audio", "song.mp3", b"ID3", ContentType::Audio);

        let result = h.service.register(audio).await;
        assert!(matches!(
            result,
            Err(DedupError::Calculator(CalculatorError::UnsupportedContentType(
                ContentType::Audio
            )))
        ));
        assert_eq!(h.pending(), 0);

        // The queue keeps serving jobs.
        let a = h.add_image("cnt_a", "a.png", false);
        assert!(h.service.register(a).await.is_ok());
    }

    #[tokio::test]
    async fn test_videos_group_by_frames() {
        let h = harness(10);
        let first = h.add_file("cnt_v1", "one.mp4", b"first encoding", ContentType::Video);
        let second = h.add_file("cnt_v2", "two.mp4", b"second encoding", ContentType::Video);

        let outcome = h.service.register(first).await.unwrap();
        assert_eq!(outcome.hashes.len(), 4);
        h.service.register(second).await.unwrap();

        let summary = h.service.scan().await.unwrap();
        assert_eq!(summary.processed, 8);
        assert_eq!(summary.groups_created, 1);

        let conn = h.service.database().lock().unwrap();
        let ids = SequentialIdGenerator::new();
        let groups = DuplicateGroupRepository::new(&conn, &ids).find_all(None).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].hash_type, HashType::DHash);
        assert!(groups[0].contains("cnt_v1") && groups[0].contains("cnt_v2"));
    }

    #[tokio::test]
    async fn test_remove_content_dissolves_pair() {
        let h = harness(10);
        let a = h.add_image("cnt_a", "a.png", false);
        let b = h.add_image("cnt_b", "b.png", false);
        h.service.register(a).await.unwrap();
        h.service.register(b).await.unwrap();
        h.service.scan().await.unwrap();
        assert_eq!(h.group_count(), 1);

        assert!(h.service.remove_content("cnt_a").await.unwrap());
        assert!(!h.service.remove_content("cnt_a").await.unwrap());
        assert_eq!(h.group_count(), 0);

        let conn = h.service.database().lock().unwrap();
        assert!(ContentHashRepository::new(&conn)
            .find_by_content_id("cnt_a")
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_removing_representative_rebases_group() {
        let h = harness(10);
        for (content_id, value) in [
            ("cnt_a", "0000000000000000"),
            ("cnt_b", "00000000000000ff"),
            ("cnt_c", "000000000000ffff"),
        ] {
            h.content(content_id, &format!("{}.png", content_id), ContentType::Image);
            let conn = h.service.database().lock().unwrap();
            let hash_id = format!("hash_{}", content_id);
            ContentHashRepository::new(&conn)
                .save(&ContentHash {
                    id: hash_id.clone(),
                    content_id: content_id.to_string(),
                    hash_type: HashType::DHash,
                    value: value.to_string(),
                    metadata: None,
                })
                .unwrap();
            ScanQueueRepository::new(&conn).add(&hash_id).unwrap();
        }
        h.service.scan().await.unwrap();

        assert!(h.service.remove_content("cnt_a").await.unwrap());

        let conn = h.service.database().lock().unwrap();
        let ids = SequentialIdGenerator::new();
        let groups = DuplicateGroupRepository::new(&conn, &ids).find_all(None).unwrap();
        assert_eq!(groups.len(), 1);
        let similarities: Vec<(&str, f64)> = groups[0]
            .items
            .iter()
            .map(|i| (i.content_id.as_str(), i.similarity))
            .collect();
        assert_eq!(similarities, vec![("cnt_b", 1.0), ("cnt_c", 0.875)]);
    }

    #[tokio::test]
    async fn test_fire_and_forget_registration() {
        let h = harness(10);
        let a = h.add_image("cnt_a", "a.png", false);

        drop(h.service.enqueue_registration(a));
        h.service.wait_idle().await;
        assert_eq!(h.pending(), 1);

        assert_eq!(h.service.requeue_all().await.unwrap(), 0);
    }
}
