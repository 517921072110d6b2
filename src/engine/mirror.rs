//! Copy an archive's tree into a directory.
//!
//! A mirror runs on its own task: progress is reported through a stream of
//! `put` events and the outcome arrives once on a completion channel. The
//! archive marker is written last, so a destination holding a marker went
//! through a complete copy.

use super::content::{normalize_path, write_marker};
use super::traits::{Archive, EngineError, EngineResult};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A file written by the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorPut {
    pub path: String,
    pub bytes: u64,
}

/// Totals of a finished mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorSummary {
    pub files: u64,
    pub bytes: u64,
}

/// Stream of `put` events.
pub type MirrorPuts = UnboundedReceiverStream<MirrorPut>;

/// A running mirror. Dropping it stops the copy.
pub struct Mirror {
    pub puts: MirrorPuts,
    pub done: oneshot::Receiver<EngineResult<MirrorSummary>>,
    task: JoinHandle<()>,
}

impl Drop for Mirror {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start mirroring `source` into `dest`.
pub fn mirror(source: Arc<dyn Archive>, dest: PathBuf) -> Mirror {
    let (put_tx, put_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let result = run(source, dest, put_tx).await;
        let _ = done_tx.send(result);
    });

    Mirror {
        puts: UnboundedReceiverStream::new(put_rx),
        done: done_rx,
        task,
    }
}

async fn run(
    source: Arc<dyn Archive>,
    dest: PathBuf,
    puts: mpsc::UnboundedSender<MirrorPut>,
) -> EngineResult<MirrorSummary> {
    tokio::fs::create_dir_all(&dest).await?;

    let mut summary = MirrorSummary::default();
    for path in source.list_files().await? {
        let path = normalize_path(&path)?;
        let data = source.read_file(&path).await?;

        let target = dest.join(&path);
        if !target.starts_with(&dest) {
            return Err(EngineError::InvalidPath(path));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &data).await?;

        summary.files += 1;
        summary.bytes += data.len() as u64;
        let _ = puts.send(MirrorPut {
            path,
            bytes: data.len() as u64,
        });
    }
    write_marker(&dest, &source.key(), source.stats().version).await?;
    Ok(summary)
}
