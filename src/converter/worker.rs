//! A single converter server process bound to one port.

use super::command;
use super::process::{self, Liveness};
use crate::config::ConverterConfig;
use crate::error::ServiceError;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tracing::{debug, info};

/// One long-lived converter server.
///
/// Only ever touched while holding the pool's worker-map lock.
#[derive(Debug)]
pub struct ConverterWorker {
    pub(crate) port: u16,
    pub(crate) child: Option<Child>,
    pub(crate) pid: Option<u32>,
    /// Pool-unique id of the current process; changes on every (re)launch.
    pub(crate) generation: u64,
    /// Held by a lease or by the supervisor while it restarts the worker.
    pub(crate) busy: bool,
    pub(crate) healthy: bool,
    pub(crate) restarts: u32,
}

/// Readiness view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub port: u16,
    pub pid: Option<u32>,
    pub busy: bool,
    pub healthy: bool,
    pub process_alive: bool,
    pub restarts: u32,
}

impl ConverterWorker {
    /// Spawn a server on `port`. Spawn failures yield an unhealthy worker
    /// without a process, which the supervisor retries.
    pub(crate) fn launch(port: u16, config: &ConverterConfig, generation: u64) -> Self {
        match spawn_server(port, config) {
            Ok(child) => Self::running(port, child, generation),
            Err(e) => {
                tracing::error!("Converter worker on port {port} failed to start: {e}");
                Self {
                    port,
                    child: None,
                    pid: None,
                    generation,
                    busy: false,
                    healthy: false,
                    restarts: 0,
                }
            }
        }
    }

    fn running(port: u16, child: Child, generation: u64) -> Self {
        let pid = child.id();
        info!("Converter worker started on port {port} (pid {pid:?})");
        Self {
            port,
            child: Some(child),
            pid,
            generation,
            busy: false,
            healthy: true,
            restarts: 0,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn is_assignable(&self) -> bool {
        !self.busy && self.healthy && self.child.is_some()
    }

    /// Whether the server process is still running. Reaps it if it exited.
    pub(crate) fn probe(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                info!("Converter worker on port {} exited: {status}", self.port);
                false
            }
            Err(e) => {
                debug!("try_wait failed for port {}: {e}", self.port);
                false
            }
            Ok(None) => match self.pid {
                Some(pid) => process::liveness(pid) == Liveness::Running,
                None => false,
            },
        }
    }

    /// Install a freshly spawned server process.
    pub(crate) fn replace_process(&mut self, child: Child, generation: u64) {
        self.pid = child.id();
        self.generation = generation;
        self.child = Some(child);
        self.healthy = true;
        self.restarts += 1;
        info!(
            "Converter worker on port {} restarted (pid {:?}, restart #{})",
            self.port, self.pid, self.restarts
        );
    }

    pub(crate) fn status(&mut self) -> WorkerStatus {
        let process_alive = self.probe();
        WorkerStatus {
            port: self.port,
            pid: self.pid,
            busy: self.busy,
            healthy: self.healthy,
            process_alive,
            restarts: self.restarts,
        }
    }
}

pub(crate) fn spawn_server(port: u16, config: &ConverterConfig) -> Result<Child, ServiceError> {
    let profile = command::profile_dir(config, port);
    std::fs::create_dir_all(&profile).map_err(|e| ServiceError::io(&profile, e))?;
    let (program, mut cmd) = command::server_command(config, port);
    cmd.spawn()
        .map_err(|source| ServiceError::Spawn { program, source })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::CommandTemplate;

    fn config(dir: &tempfile::TempDir, program: &str, args: &[&str]) -> ConverterConfig {
        ConverterConfig {
            server_command: CommandTemplate::new(program, args.iter().copied()),
            tmp_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn launched_worker_is_assignable_and_alive() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = ConverterWorker::launch(9950, &config(&dir, "sleep", &["30"]), 1);
        assert!(worker.is_assignable());
        assert!(worker.probe());
        assert!(dir.path().join("lo_profile_9950").is_dir());
    }

    #[tokio::test]
    async fn missing_program_yields_unhealthy_worker() {
        let dir = tempfile::tempdir().unwrap();
        let worker = ConverterWorker::launch(9951, &config(&dir, "/nonexistent/converter", &[]), 1);
        assert!(!worker.healthy);
        assert!(!worker.is_assignable());
        assert!(worker.pid.is_none());
    }

    #[tokio::test]
    async fn exited_server_is_reported_dead() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = ConverterWorker::launch(9952, &config(&dir, "true", &[]), 1);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let status = worker.status();
        assert!(!status.process_alive);
        assert_eq!(status.port, 9952);
    }
}
