// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local supervision of sandbox runtime processes.
//!
//! The supervisor keeps one slot per worker UID in a concurrent map. A slot owns
//! a supervision loop that runs
//!
//! ```text
//! <runtime_bin> serve <worker_dir>/workerd.capnp --verbose <extra_args...>
//! ```
//!
//! with the worker directory as working directory, and respawns it after a fixed
//! delay whenever it exits (a failed spawn counts as an exit). The loop only ends
//! through [`ProcessSupervisor::stop`].
//!
//! # Slot lifecycle
//!
//! ```text
//!   start()          spawn ok          exit / spawn error
//! ─────────► STARTING ───────► RUNNING ────────────► STARTING (after delay)
//!               │                 │
//!               └──── stop() ─────┴──► STOPPING ──► STOPPED (slot removed)
//! ```
//!
//! The pid is held only while a child is alive. A start arriving while the slot
//! is stopping is recorded on the slot and honoured by the stop once the old
//! process is gone, so a stop followed by a start always ends supervised.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use edgehost_agent_sdk::LogStream;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifacts::{CONFIG_FILE_NAME, WorkerArtifacts};
use crate::error::{Error, Result};
use crate::log_batcher::LogQueue;

/// Configuration for the process supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Sandbox runtime binary.
    pub runtime_bin: PathBuf,
    /// Fixed delay before a respawn.
    pub restart_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            runtime_bin: PathBuf::from("workerd"),
            restart_delay: Duration::from_secs(3),
        }
    }
}

/// Lifecycle state of a supervision slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Waiting for the next spawn.
    Starting,
    /// A child process is alive.
    Running,
    /// A stop was requested.
    Stopping,
    /// The loop has ended.
    Stopped,
}

/// Externally visible status of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// A child process is alive.
    Running,
    /// No child process, or the UID is not supervised.
    NotRunning,
}

impl WorkerStatus {
    /// Numeric form used by health tooling: 1 running, 0 not running.
    pub fn code(&self) -> i32 {
        match self {
            WorkerStatus::Running => 1,
            WorkerStatus::NotRunning => 0,
        }
    }
}

#[derive(Debug)]
struct SlotState {
    lifecycle: Lifecycle,
    pid: Option<u32>,
    spawns: u32,
}

struct WorkerSlot {
    state: Mutex<SlotState>,
    cancel: CancellationToken,
    exited: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Extra args of a start requested while stopping.
    restart: Mutex<Option<Vec<String>>>,
}

impl WorkerSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                lifecycle: Lifecycle::Starting,
                pid: None,
                spawns: 0,
            }),
            cancel: CancellationToken::new(),
            exited: CancellationToken::new(),
            task: Mutex::new(None),
            restart: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        let mut state = self.state();
        // Once stopping, only the loop's own exit may advance the state.
        if state.lifecycle == Lifecycle::Stopping && lifecycle != Lifecycle::Stopped {
            return;
        }
        state.lifecycle = lifecycle;
    }

    fn child_started(&self, pid: Option<u32>) {
        let mut state = self.state();
        state.pid = pid;
        state.spawns += 1;
        if state.lifecycle != Lifecycle::Stopping {
            state.lifecycle = Lifecycle::Running;
        }
    }

    fn child_exited(&self) {
        let mut state = self.state();
        state.pid = None;
        if state.lifecycle == Lifecycle::Running {
            state.lifecycle = Lifecycle::Starting;
        }
    }
}

/// Owns the sandbox runtime process of every locally running worker.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    artifacts: WorkerArtifacts,
    logs: LogQueue,
    slots: DashMap<String, Arc<WorkerSlot>>,
}

impl ProcessSupervisor {
    /// Create a supervisor writing process output to `logs`.
    pub fn new(config: SupervisorConfig, artifacts: WorkerArtifacts, logs: LogQueue) -> Self {
        Self {
            config,
            artifacts,
            logs,
            slots: DashMap::new(),
        }
    }

    /// Start supervising `uid`. A no-op returning `false` if it is already supervised.
    ///
    /// If the current slot is being stopped, the start is deferred until the stop
    /// completes and `true` is returned.
    pub fn start(&self, uid: &str, extra_args: &[String]) -> bool {
        match self.slots.entry(uid.to_string()) {
            Entry::Occupied(occupied) => {
                let slot = occupied.get();
                if matches!(slot.state().lifecycle, Lifecycle::Stopping | Lifecycle::Stopped) {
                    *slot.restart.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(extra_args.to_vec());
                    info!(worker_uid = %uid, "Worker is stopping, start deferred");
                    return true;
                }
                debug!(worker_uid = %uid, "Worker already supervised, start ignored");
                false
            }
            Entry::Vacant(vacant) => {
                let slot = Arc::new(WorkerSlot::new());
                let run = SupervisionLoop {
                    uid: uid.to_string(),
                    worker_dir: self.artifacts.worker_dir(uid),
                    runtime_bin: self.config.runtime_bin.clone(),
                    extra_args: extra_args.to_vec(),
                    restart_delay: self.config.restart_delay,
                    logs: self.logs.clone(),
                    slot: slot.clone(),
                };
                let handle = tokio::spawn(run.run());
                *slot.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                vacant.insert(slot);
                info!(worker_uid = %uid, "Worker supervision started");
                true
            }
        }
    }

    /// Stop supervising `uid`, killing its process and waiting for it to exit.
    ///
    /// Stopping an untracked UID logs a warning and succeeds.
    pub async fn stop(&self, uid: &str) -> Result<()> {
        let Some(slot) = self.slots.get(uid).map(|s| s.value().clone()) else {
            warn!(worker_uid = %uid, "Stop requested for worker that is not supervised");
            return Ok(());
        };

        slot.set_lifecycle(Lifecycle::Stopping);
        slot.cancel.cancel();
        slot.exited.cancelled().await;

        let handle = slot
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let joined = match handle {
            Some(handle) => handle.await,
            None => Ok(()),
        };

        slot.set_lifecycle(Lifecycle::Stopped);
        self.slots.remove_if(uid, |_, current| Arc::ptr_eq(current, &slot));

        // The slot is out of the map, so no start can record a restart on it anymore.
        let restart = slot
            .restart
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(extra_args) = restart {
            info!(worker_uid = %uid, "Restarting worker after stop");
            self.start(uid, &extra_args);
        }

        match joined {
            Ok(()) => {
                info!(worker_uid = %uid, "Worker supervision stopped");
                Ok(())
            }
            Err(e) => {
                error!(worker_uid = %uid, error = %e, "Supervision task panicked");
                Err(Error::Other(format!("supervision task for {} failed: {}", uid, e)))
            }
        }
    }

    /// Stop every supervised worker, best-effort.
    pub async fn stop_all(&self) {
        let uids = self.supervised();
        info!(count = uids.len(), "Stopping all workers");

        let results = futures::future::join_all(uids.iter().map(|uid| self.stop(uid))).await;
        for (uid, result) in uids.iter().zip(results) {
            if let Err(e) = result {
                warn!(worker_uid = %uid, error = %e, "Failed to stop worker");
            }
        }
    }

    /// Whether `uid` currently has a live process. Unknown UIDs are not running.
    pub fn status(&self, uid: &str) -> WorkerStatus {
        match self.lifecycle(uid) {
            Some(Lifecycle::Running) => WorkerStatus::Running,
            _ => WorkerStatus::NotRunning,
        }
    }

    /// Lifecycle state of `uid`, `None` if it is not supervised.
    pub fn lifecycle(&self, uid: &str) -> Option<Lifecycle> {
        self.slots.get(uid).map(|slot| slot.state().lifecycle)
    }

    /// Pid of the live process of `uid`.
    pub fn pid(&self, uid: &str) -> Option<u32> {
        self.slots.get(uid).and_then(|slot| slot.state().pid)
    }

    /// Number of times a process was spawned for `uid` since supervision started.
    pub fn spawn_count(&self, uid: &str) -> u32 {
        self.slots
            .get(uid)
            .map(|slot| slot.state().spawns)
            .unwrap_or_default()
    }

    /// UIDs currently supervised, sorted.
    pub fn supervised(&self) -> Vec<String> {
        let mut uids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        uids.sort();
        uids
    }
}

struct SupervisionLoop {
    uid: String,
    worker_dir: PathBuf,
    runtime_bin: PathBuf,
    extra_args: Vec<String>,
    restart_delay: Duration,
    logs: LogQueue,
    slot: Arc<WorkerSlot>,
}

impl SupervisionLoop {
    async fn run(self) {
        let _exited = self.slot.exited.clone().drop_guard();
        let cancel = self.slot.cancel.clone();

        while !cancel.is_cancelled() {
            self.slot.set_lifecycle(Lifecycle::Starting);

            match self.spawn() {
                Ok(mut child) => {
                    let pid = child.id();
                    self.slot.child_started(pid);
                    info!(worker_uid = %self.uid, pid = ?pid, "Worker process started");

                    if let Some(stdout) = child.stdout.take() {
                        self.spawn_reader(stdout, LogStream::Stdout);
                    }
                    if let Some(stderr) = child.stderr.take() {
                        self.spawn_reader(stderr, LogStream::Stderr);
                    }

                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => {
                            debug!(worker_uid = %self.uid, "Killing worker process");
                            if let Err(e) = child.kill().await {
                                warn!(worker_uid = %self.uid, error = %e, "Failed to kill worker process");
                            }
                        }

                        status = child.wait() => match status {
                            Ok(status) => warn!(
                                worker_uid = %self.uid,
                                exit_code = ?status.code(),
                                "Worker process exited"
                            ),
                            Err(e) => error!(worker_uid = %self.uid, error = %e, "Failed to wait for worker process"),
                        },
                    }

                    self.slot.child_exited();
                }
                Err(e) => {
                    error!(
                        worker_uid = %self.uid,
                        runtime_bin = %self.runtime_bin.display(),
                        error = %e,
                        "Failed to spawn worker process"
                    );
                }
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = tokio::time::sleep(self.restart_delay) => {
                    debug!(worker_uid = %self.uid, "Restarting worker process");
                }
            }
        }

        self.slot.set_lifecycle(Lifecycle::Stopped);
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.runtime_bin)
            .arg("serve")
            .arg(self.worker_dir.join(CONFIG_FILE_NAME))
            .arg("--verbose")
            .args(&self.extra_args)
            .current_dir(&self.worker_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    fn spawn_reader<R>(&self, reader: R, stream: LogStream)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let uid = self.uid.clone();
        let logs = self.logs.clone();
        let cancel = self.slot.cancel.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if !logs.push_line(&uid, line, stream).await {
                                break;
                            }
                        }
                        // EOF or read error ends the reader quietly.
                        Ok(None) | Err(_) => break,
                    },
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_batcher::{LogBatcher, LogBatcherConfig};
    use crate::store::MemoryStore;

    fn supervisor(bin: &str, root: &std::path::Path) -> ProcessSupervisor {
        let (queue, _batcher) =
            LogBatcher::new(LogBatcherConfig::default(), Arc::new(MemoryStore::new()));
        ProcessSupervisor::new(
            SupervisorConfig {
                runtime_bin: PathBuf::from(bin),
                restart_delay: Duration::from_millis(50),
            },
            WorkerArtifacts::new(root),
            queue,
        )
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(WorkerStatus::Running.code(), 1);
        assert_eq!(WorkerStatus::NotRunning.code(), 0);
    }

    #[tokio::test]
    async fn test_unknown_uid_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor("workerd", dir.path());
        assert_eq!(supervisor.status("never-seen"), WorkerStatus::NotRunning);
        assert_eq!(supervisor.lifecycle("never-seen"), None);
    }

    #[tokio::test]
    async fn test_stop_untracked_uid_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor("workerd", dir.path());
        supervisor.stop("never-started").await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_keeps_retrying_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor("/nonexistent/edgehost-runtime", dir.path());

        assert!(supervisor.start("w1", &[]));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(supervisor.status("w1"), WorkerStatus::NotRunning);
        assert_eq!(supervisor.lifecycle("w1"), Some(Lifecycle::Starting));
        assert_eq!(supervisor.spawn_count("w1"), 0);

        supervisor.stop("w1").await.unwrap();
        assert_eq!(supervisor.lifecycle("w1"), None);
        assert!(supervisor.supervised().is_empty());
    }

    #[tokio::test]
    async fn test_second_start_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor("/nonexistent/edgehost-runtime", dir.path());

        assert!(supervisor.start("w1", &[]));
        assert!(!supervisor.start("w1", &[]));
        assert_eq!(supervisor.supervised(), vec!["w1".to_string()]);

        supervisor.stop_all().await;
        assert!(supervisor.supervised().is_empty());
    }
}
