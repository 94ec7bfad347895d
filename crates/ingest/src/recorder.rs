//! JSONL mirror of the event stream, and playback of a recorded file into the channel.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kairos_core::ChangeEvent;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Appends every mirrored event to a JSONL file until all senders are dropped.
pub struct Recorder {
    path: PathBuf,
    task: JoinHandle<u64>,
}

impl Recorder {
    /// Open `path` for append and start the writer task. Hand the returned sender to
    /// [`crate::Processor::with_mirror`].
    pub async fn start(path: &Path, cap: usize) -> Result<(Self, mpsc::Sender<ChangeEvent>)> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("opening record file {}", path.display()))?;
        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(cap.max(1));
        let owned = path.to_path_buf();
        let task = tokio::spawn(async move {
            let mut out = BufWriter::new(file);
            let mut written = 0u64;
            while let Some(ev) = rx.recv().await {
                let mut line = match serde_json::to_string(&ev) {
                    Ok(l) => l,
                    Err(e) => {
                        warn!(error = %e, "event not serializable; skipped");
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = out.write_all(line.as_bytes()).await {
                    warn!(path = %owned.display(), error = %e, "record write failed");
                    continue;
                }
                written += 1;
            }
            if let Err(e) = out.flush().await {
                warn!(path = %owned.display(), error = %e, "record flush failed");
            }
            if let Err(e) = out.get_ref().sync_all().await {
                warn!(path = %owned.display(), error = %e, "record fsync failed");
            }
            written
        });
        info!(path = %path.display(), "event recorder started");
        Ok((Self { path: path.to_path_buf(), task }, tx))
    }

    /// Wait for the writer to flush. Returns lines written.
    /// Resolves once every sender (the processor's mirror) is gone.
    pub async fn close(self) -> u64 {
        match self.task.await {
            Ok(n) => {
                info!(path = %self.path.display(), lines = n, "event recorder closed");
                n
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "event recorder task failed");
                0
            }
        }
    }
}

/// Feed a recorded JSONL file into the event channel. Bad lines are skipped.
pub async fn play_file(path: &Path, tx: &mpsc::Sender<ChangeEvent>) -> Result<usize> {
    let file = File::open(path).await.with_context(|| format!("opening playback file {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut sent = 0usize;
    let mut lineno = 0usize;
    while let Some(line) = lines.next_line().await.context("reading playback file")? {
        lineno += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ChangeEvent>(&line) {
            Ok(ev) => {
                if tx.send(ev).await.is_err() {
                    warn!("event channel closed during playback");
                    break;
                }
                sent += 1;
            }
            Err(e) => warn!(line = lineno, error = %e, "skipping malformed playback line"),
        }
    }
    info!(path = %path.display(), sent, "playback finished");
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use kairos_core::ChangeKind;
    use tempfile::TempDir;

    fn ev(name: &str) -> ChangeEvent {
        let at = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z").unwrap().with_timezone(&Utc);
        ChangeEvent::new("Pod", "default", name, at, ChangeKind::Create, "{}")
    }

    #[tokio::test]
    async fn records_then_plays_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rec/events.jsonl");
        let (rec, tx) = Recorder::start(&path, 8).await.unwrap();
        tx.send(ev("a")).await.unwrap();
        tx.send(ev("b")).await.unwrap();
        drop(tx);
        assert_eq!(rec.close().await, 2);

        // A corrupt line in the middle is tolerated.
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.insert_str(0, "{garbage\n");
        std::fs::write(&path, contents).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(play_file(&path, &tx).await.unwrap(), 2);
        drop(tx);
        let mut names = Vec::new();
        while let Some(e) = rx.recv().await {
            names.push(e.name);
        }
        assert_eq!(names, vec!["a", "b"]);
    }
}
