use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

/// The file every summary writer appends to inside its directory.
pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Serialize)]
struct Event<'a> {
    step: u64,
    tag: &'a str,
    value: f64,
    wall_time: f64,
}

/// A per-rank metrics sink writing one JSON object per line.
///
/// Clones share the same file.
#[derive(Clone)]
pub struct SummaryWriter {
    dir: PathBuf,
    file: Arc<Mutex<File>>,
}

impl SummaryWriter {
    /// Creates the summary writer of `rank`, under `<log_dir>/train_<rank>`.
    ///
    /// # Arguments
    /// * `log_dir` - The root log directory.
    /// * `rank` - The rank owning the writer.
    ///
    /// # Returns
    /// The writer or an io error if the directory or file can't be created.
    pub async fn create(log_dir: &Path, rank: usize) -> io::Result<Self> {
        let dir = log_dir.join(format!("train_{rank}"));
        fs::create_dir_all(&dir).await?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))
            .await?;

        Ok(Self {
            dir,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Records a scalar value at a given global step.
    pub async fn scalar(&self, tag: &str, value: f64, step: u64) -> io::Result<()> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        let event = Event {
            step,
            tag,
            value,
            wall_time,
        };

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        self.file.lock().await.write_all(&line).await
    }

    /// Waits until every recorded value reached the file.
    pub async fn flush(&self) -> io::Result<()> {
        self.file.lock().await.flush().await
    }
}
