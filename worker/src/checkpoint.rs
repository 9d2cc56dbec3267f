use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::{fs, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;

use crate::{Result, Session, VariableSet, WorkerErr};

/// The index file listing the retained snapshots.
pub const INDEX_FILE: &str = "checkpoint";

/// A snapshot of the shared state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub global_step: u64,
    pub variables: BTreeMap<String, Vec<f32>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    latest: Option<String>,
    all: Vec<String>,
}

impl Index {
    /// Records `file` as the newest snapshot.
    ///
    /// # Returns
    /// The snapshots that fell out of the `max_to_keep` window.
    fn push(&mut self, file: String, max_to_keep: usize) -> Vec<String> {
        self.all.retain(|f| *f != file);
        self.all.push(file.clone());
        self.latest = Some(file);

        let excess = self.all.len().saturating_sub(max_to_keep.max(1));
        self.all.drain(..excess).collect()
    }
}

/// Saves and restores snapshots of the global variables and the global step.
#[derive(Debug, Clone)]
pub struct Saver {
    dir: PathBuf,
    /// Name and declared length of every global variable.
    globals: Vec<(String, usize)>,
    max_to_keep: usize,
}

impl Saver {
    /// Creates a new `Saver`.
    ///
    /// # Arguments
    /// * `dir` - Where snapshots are kept.
    /// * `vars` - The variables of the trainer, only global ones are saved.
    /// * `max_to_keep` - How many snapshots are retained.
    pub fn new(dir: impl Into<PathBuf>, vars: &VariableSet, max_to_keep: usize) -> Self {
        Self {
            dir: dir.into(),
            globals: vars
                .global()
                .iter()
                .map(|spec| (spec.name().to_string(), spec.len()))
                .collect(),
            max_to_keep,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes a snapshot of the current shared state.
    ///
    /// Variables are read one at a time while training goes on, the snapshot is
    /// consistent per variable only.
    ///
    /// # Returns
    /// The path of the new snapshot.
    pub async fn save(&self, session: &Session) -> Result<PathBuf> {
        let global_step = session.global_step().await?;
        let mut variables = BTreeMap::new();

        for (name, _) in &self.globals {
            variables.insert(name.clone(), session.pull(name).await?);
        }

        let snapshot = Snapshot {
            global_step,
            variables,
        };

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| self.err(&self.dir, source))?;

        let file = format!("model.ckpt-{global_step}.json");
        let path = self.dir.join(&file);
        self.write_atomic(&path, &snapshot).await?;

        let mut index = self.read_index().await?.unwrap_or_default();
        let stale = index.push(file, self.max_to_keep);
        self.write_atomic(&self.dir.join(INDEX_FILE), &index).await?;

        for file in stale {
            match fs::remove_file(self.dir.join(&file)).await {
                Ok(()) => debug!("removed old snapshot {file}"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove old snapshot {file}: {e}"),
            }
        }

        Ok(path)
    }

    /// Returns the path of the newest snapshot, if any.
    pub async fn latest(&self) -> Result<Option<PathBuf>> {
        let index = self.read_index().await?;
        Ok(index.and_then(|i| i.latest).map(|file| self.dir.join(file)))
    }

    /// Restores the newest snapshot into the shared state.
    ///
    /// Variables the snapshot holds but the trainer no longer declares are skipped. The
    /// global step is restored first, readiness still waits for the whole restore.
    ///
    /// # Returns
    /// The restored global step, `None` if there's no snapshot, or
    /// `WorkerErr::SnapshotMismatch` if a declared variable changed its length, in which
    /// case nothing is restored.
    pub async fn restore(&self, session: &Session) -> Result<Option<u64>> {
        let Some(path) = self.latest().await? else {
            return Ok(None);
        };

        let bytes = fs::read(&path).await.map_err(|source| self.err(&path, source))?;
        let snapshot: Snapshot =
            serde_json::from_slice(&bytes).map_err(|e| self.err(&path, e.into()))?;

        let mut restored = Vec::with_capacity(snapshot.variables.len());

        for (name, values) in &snapshot.variables {
            let Some((_, len)) = self.globals.iter().find(|(n, _)| n == name) else {
                warn!("skipping `{name}` from {}, it is not declared", path.display());
                continue;
            };

            if values.len() != *len {
                return Err(WorkerErr::SnapshotMismatch {
                    path,
                    name: name.clone(),
                    expected: *len,
                    got: values.len(),
                });
            }

            restored.push((name, values));
        }

        session.assign_global_step(snapshot.global_step).await?;

        for (name, values) in restored {
            session.assign(name, values).await?;
        }

        Ok(Some(snapshot.global_step))
    }

    async fn read_index(&self) -> Result<Option<Index>> {
        let path = self.dir.join(INDEX_FILE);

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.err(&path, source)),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| self.err(&path, e.into()))
    }

    /// Writes `value` next to `path` and renames it into place.
    async fn write_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| self.err(path, e.into()))?;
        let tmp = path.with_extension("tmp");

        fs::write(&tmp, bytes)
            .await
            .map_err(|source| self.err(&tmp, source))?;

        fs::rename(&tmp, path)
            .await
            .map_err(|source| self.err(path, source))
    }

    fn err(&self, path: &Path, source: io::Error) -> WorkerErr {
        WorkerErr::Checkpoint {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Periodically saves snapshots in the background.
pub struct CheckpointTimer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CheckpointTimer {
    /// Spawns the timer, the first snapshot is written one `every` after this call.
    ///
    /// A failed save is logged and the timer keeps going.
    ///
    /// # Returns
    /// The running timer, or `None` if `every` is zero, which disables checkpointing.
    pub fn spawn(saver: Saver, session: Session, every: Duration) -> Option<Self> {
        if every.is_zero() {
            return None;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let rank = session.rank();

        let handle = tokio::spawn(async move {
            let mut ticks = time::interval_at(time::Instant::now() + every, every);
            ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticks.tick() => match saver.save(&session).await {
                        Ok(path) => info!(rank = rank; "saved checkpoint {}", path.display()),
                        Err(e) => warn!(rank = rank; "failed to save checkpoint: {e}"),
                    },
                }
            }
        });

        Some(Self { token, handle })
    }

    /// Stops the timer, waiting for an in flight save to end.
    pub async fn stop(self) {
        self.token.cancel();

        if let Err(e) = self.handle.await {
            warn!("checkpoint timer panicked: {e}");
        }
    }
}
