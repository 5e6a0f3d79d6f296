//! Deferred cleanup. One loop owns every scheduled deletion and also runs the
//! periodic sweep of the transfer directory.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    path::PathBuf,
    sync::Arc,
};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
    artifacts::{ArtifactStore, remove_scratch},
    tracker::{DownloadId, ProgressStore},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupTarget {
    Scratch(PathBuf),
    Record(DownloadId),
}

#[derive(Debug)]
struct ScheduledCleanup {
    due: Instant,
    targets: Vec<CleanupTarget>,
}

#[derive(Clone)]
pub struct Reaper {
    sender: mpsc::UnboundedSender<ScheduledCleanup>,
}

impl Reaper {
    /// Starts the loop. It runs until every `Reaper` handle is dropped and
    /// nothing is left pending.
    pub fn spawn(
        store: Arc<dyn ProgressStore>,
        artifacts: ArtifactStore,
        sweep_every: Duration,
        stale_after: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_loop(
            receiver,
            store,
            artifacts,
            sweep_every,
            stale_after,
        ));
        (Self { sender }, handle)
    }

    pub fn schedule(&self, delay: Duration, targets: Vec<CleanupTarget>) {
        if targets.is_empty() {
            return;
        }
        let entry = ScheduledCleanup {
            due: Instant::now() + delay,
            targets,
        };
        if self.sender.send(entry).is_err() {
            debug!("Limpieza descartada: el reaper ya no esta activo");
        }
    }
}

async fn run_loop(
    mut receiver: mpsc::UnboundedReceiver<ScheduledCleanup>,
    store: Arc<dyn ProgressStore>,
    artifacts: ArtifactStore,
    sweep_every: Duration,
    stale_after: Duration,
) {
    let mut queue: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut pending: HashMap<u64, Vec<CleanupTarget>> = HashMap::new();
    let mut next_key = 0u64;
    let mut closed = false;

    // The first tick fires immediately, which doubles as the startup sweep.
    let mut sweep = tokio::time::interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if closed && queue.is_empty() {
            break;
        }
        let next_due = queue.peek().map(|Reverse((due, _))| *due);

        tokio::select! {
            received = receiver.recv(), if !closed => match received {
                Some(entry) => {
                    queue.push(Reverse((entry.due, next_key)));
                    pending.insert(next_key, entry.targets);
                    next_key += 1;
                }
                None => closed = true,
            },
            _ = sleep_until_due(next_due), if next_due.is_some() => {
                let now = Instant::now();
                while let Some(Reverse((due, key))) = queue.peek().copied() {
                    if due > now {
                        break;
                    }
                    queue.pop();
                    if let Some(targets) = pending.remove(&key) {
                        execute(&targets, store.as_ref()).await;
                    }
                }
            }
            _ = sweep.tick(), if !closed => {
                artifacts.sweep_stale(stale_after).await;
            }
        }
    }

    info!("Reaper detenido");
}

async fn sleep_until_due(due: Option<Instant>) {
    if let Some(due) = due {
        tokio::time::sleep_until(due).await;
    }
}

async fn execute(targets: &[CleanupTarget], store: &dyn ProgressStore) {
    for target in targets {
        match target {
            CleanupTarget::Scratch(dir) => {
                remove_scratch(dir).await;
                debug!("Carpeta temporal eliminada: {:?}", dir);
            }
            CleanupTarget::Record(id) => {
                if store.delete(*id).is_some() {
                    debug!("Registro de descarga {id} eliminado");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::MemoryProgressStore;

    fn spawn_reaper(root: &std::path::Path, store: Arc<MemoryProgressStore>) -> (Reaper, JoinHandle<()>) {
        Reaper::spawn(
            store,
            ArtifactStore::new(root.to_path_buf(), 1024),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn scheduled_cleanup_removes_directory_and_record() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryProgressStore::new());
        let (reaper, _handle) = spawn_reaper(temp.path(), store.clone());

        let dir = temp.path().join("job");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Test Video.mp4"), b"data").unwrap();
        let id = DownloadId::generate();
        store.create(id);

        reaper.schedule(
            Duration::from_millis(50),
            vec![CleanupTarget::Scratch(dir.clone()), CleanupTarget::Record(id)],
        );

        assert!(dir.exists());
        assert!(store.get(id).is_some());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!dir.exists());
        assert!(store.get(id).is_none());
    }

    #[tokio::test]
    async fn earlier_deadline_runs_first() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryProgressStore::new());
        let (reaper, _handle) = spawn_reaper(temp.path(), store.clone());

        let late = DownloadId::generate();
        let soon = DownloadId::generate();
        store.create(late);
        store.create(soon);

        reaper.schedule(Duration::from_secs(60), vec![CleanupTarget::Record(late)]);
        reaper.schedule(Duration::ZERO, vec![CleanupTarget::Record(soon)]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.get(soon).is_none());
        assert!(store.get(late).is_some());
    }

    #[tokio::test]
    async fn loop_drains_and_stops_when_handles_drop() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryProgressStore::new());
        let (reaper, handle) = spawn_reaper(temp.path(), store.clone());

        let id = DownloadId::generate();
        store.create(id);
        reaper.schedule(Duration::from_millis(20), vec![CleanupTarget::Record(id)]);
        drop(reaper);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(store.get(id).is_none());
    }
}
