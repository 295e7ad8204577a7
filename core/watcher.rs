// Copyright 2018-2026 the Som authors. MIT license.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use notify::event::EventKind;
use notify::RecursiveMode;
use notify::Watcher;

use crate::errors::AnyError;

const DEBOUNCE_TIMEOUT: Duration = Duration::from_millis(200);
const CLOSE_TIMEOUT: Duration = Duration::from_millis(5_000);

pub type ChangeCallback = Arc<dyn Fn(&[PathBuf]) + Send + Sync>;

/// A debounced filesystem watcher over a fixed set of paths. Events are
/// batched until the paths go quiet for the debounce window, then the
/// callback fires once with everything that changed.
pub struct FileWatcher {
  paths: Vec<PathBuf>,
  stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
  task: Option<tokio::task::JoinHandle<()>>,
}

impl FileWatcher {
  pub fn start(
    paths: Vec<PathBuf>,
    callback: ChangeCallback,
  ) -> Result<Self, AnyError> {
    let (event_tx, mut event_rx) =
      tokio::sync::mpsc::unbounded_channel::<Vec<PathBuf>>();

    let mut watcher = notify::recommended_watcher(
      move |result: Result<notify::Event, notify::Error>| {
        if let Ok(event) = result {
          if matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
          ) {
            // Send failures mean the receiving task is gone already.
            let _ = event_tx.send(event.paths);
          }
        }
      },
    )?;
    for path in &paths {
      watcher.watch(path, RecursiveMode::NonRecursive)?;
    }

    let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(async move {
      // The watcher must live inside the task; dropping it unsubscribes.
      let _watcher = watcher;
      let mut pending: Vec<PathBuf> = Vec::new();
      loop {
        tokio::select! {
          _ = &mut stop_rx => break,
          maybe_paths = event_rx.recv() => match maybe_paths {
            Some(changed) => {
              pending.extend(changed);
              loop {
                match tokio::time::timeout(
                  DEBOUNCE_TIMEOUT,
                  event_rx.recv(),
                )
                .await
                {
                  Ok(Some(more)) => pending.extend(more),
                  _ => break,
                }
              }
              pending.sort();
              pending.dedup();
              let batch = std::mem::take(&mut pending);
              debug!("file change detected: {} paths", batch.len());
              callback(&batch);
            }
            None => break,
          }
        }
      }
    });

    Ok(Self {
      paths,
      stop_tx: Some(stop_tx),
      task: Some(task),
    })
  }

  pub fn paths(&self) -> &[PathBuf] {
    &self.paths
  }

  /// Signal the watcher task and wait for it to exit, racing the close
  /// against a bounded timeout. Returns false when the race was lost.
  pub async fn close(mut self) -> bool {
    if let Some(stop_tx) = self.stop_tx.take() {
      let _ = stop_tx.send(());
    }
    match self.task.take() {
      Some(task) => tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_ok(),
      None => true,
    }
  }
}

impl Drop for FileWatcher {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use tempfile::TempDir;

  use super::*;

  #[tokio::test(flavor = "multi_thread")]
  async fn fires_once_per_quiet_period() {
    let t = TempDir::new().unwrap();
    let file = t.path().join("watched.som");
    std::fs::write(&file, "a").unwrap();

    let seen: Arc<Mutex<Vec<PathBuf>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in_callback = Arc::clone(&seen);
    let watcher = FileWatcher::start(
      vec![t.path().to_path_buf()],
      Arc::new(move |paths| {
        seen_in_callback.lock().unwrap().extend(paths.to_vec());
      }),
    )
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(&file, "b").unwrap();

    let mut waited = 0;
    while seen.lock().unwrap().is_empty() && waited < 3_000 {
      tokio::time::sleep(Duration::from_millis(50)).await;
      waited += 50;
    }
    assert!(
      seen
        .lock()
        .unwrap()
        .iter()
        .any(|path| path.ends_with("watched.som")),
      "expected a change notification for watched.som"
    );
    assert!(watcher.close().await);
  }

  #[tokio::test]
  async fn close_resolves_quickly_when_idle() {
    let t = TempDir::new().unwrap();
    let watcher = FileWatcher::start(
      vec![t.path().to_path_buf()],
      Arc::new(|_| {}),
    )
    .unwrap();
    assert!(watcher.close().await);
  }
}
