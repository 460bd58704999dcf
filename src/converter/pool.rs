//! The converter-process pool and its health supervisor.
//!
//! ## Ownership
//!
//! Every [`ConverterWorker`] lives in one `BTreeMap<port, worker>` behind a
//! single `parking_lot::Mutex`. Request handlers (acquire/release/mark
//! unhealthy) and the supervisor (probe/restart) both go through it, and it
//! is never held across an `.await`. Slow work (spawning, terminating,
//! reaping) happens outside the lock on a worker that has been claimed by
//! setting its `busy` flag, so no other caller can touch it meanwhile.
//!
//! ## Leases
//!
//! [`ConverterPool::acquire`] hands out a [`WorkerLease`]. Dropping the lease
//! releases the worker, so the worker comes back on every exit path of a
//! conversion, including errors, timeouts and cancelled futures.
//!
//! A lease is tied to the worker's generation, not just its port. A lease
//! that outlives a restart of its port (supervisor relaunch, or `stop` then
//! `start`) releases nothing and cannot mark the new process unhealthy.

use super::command;
use super::process;
use super::registry::PortRegistry;
use super::worker::{spawn_server, ConverterWorker, WorkerStatus};
use crate::config::ConverterConfig;
use crate::error::ServiceError;
use crate::pipeline::context::ConversionRequest;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long to wait for an exited process to be reaped before giving up.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Aggregated readiness of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolReadiness {
    /// `"ready"` or `"degraded"`.
    pub status: String,
    pub workers: usize,
    /// e.g. `converter_process_exited:9900`.
    pub issues: Vec<String>,
}

impl PoolReadiness {
    pub fn is_ready(&self) -> bool {
        self.issues.is_empty() && self.workers > 0
    }
}

struct Supervisor {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct PoolInner {
    config: ConverterConfig,
    workers: Mutex<BTreeMap<u16, ConverterWorker>>,
    supervisor: tokio::sync::Mutex<Option<Supervisor>>,
    generations: AtomicU64,
}

impl PoolInner {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The worker on `port`, if it is still the process generation `generation`.
    fn current(
        workers: &mut BTreeMap<u16, ConverterWorker>,
        port: u16,
        generation: u64,
    ) -> Option<&mut ConverterWorker> {
        workers
            .get_mut(&port)
            .filter(|w| w.generation == generation)
    }
}

/// Pool of converter server processes.
///
/// Cheap to clone; clones share the same workers.
#[derive(Clone)]
pub struct ConverterPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConverterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterPool")
            .field("ports", &self.inner.config.effective_port_range())
            .field("workers", &self.inner.workers.lock().len())
            .finish()
    }
}

/// Exclusive use of one worker. Releases the worker when dropped.
pub struct WorkerLease {
    pool: Arc<PoolInner>,
    port: u16,
    server_pid: Option<u32>,
    generation: u64,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("port", &self.port)
            .field("server_pid", &self.server_pid)
            .field("generation", &self.generation)
            .finish()
    }
}

impl WorkerLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn server_pid(&self) -> Option<u32> {
        self.server_pid
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let mut workers = self.pool.workers.lock();
        match PoolInner::current(&mut workers, self.port, self.generation) {
            Some(worker) => {
                worker.busy = false;
                debug!("Released converter worker on port {}", self.port);
            }
            None => debug!(
                "Lease on port {} outlived its worker; nothing to release",
                self.port
            ),
        }
    }
}

impl ConverterPool {
    /// Create an empty pool. Call [`ConverterPool::start`] to provision workers.
    pub fn new(config: ConverterConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                workers: Mutex::new(BTreeMap::new()),
                supervisor: tokio::sync::Mutex::new(None),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.inner.config
    }

    pub async fn is_running(&self) -> bool {
        self.inner.supervisor.lock().await.is_some()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Provision workers and start the health supervisor. Idempotent.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let mut supervisor = self.inner.supervisor.lock().await;
        if supervisor.is_some() {
            debug!("Converter pool already running");
            return Ok(());
        }

        let cfg = &self.inner.config;
        tokio::fs::create_dir_all(&cfg.tmp_dir)
            .await
            .map_err(|e| ServiceError::io(&cfg.tmp_dir, e))?;

        let tmp_dir = cfg.tmp_dir.clone();
        let removed = tokio::task::spawn_blocking(move || process::cleanup_stale_profiles(&tmp_dir))
            .await
            .map_err(|e| ServiceError::Internal(format!("Profile cleanup task panicked: {e}")))?;
        if removed > 0 {
            info!("Removed {removed} stale converter profiles");
        }

        let ports = self.provision_ports().await?;
        for port in &ports {
            let worker = ConverterWorker::launch(*port, cfg, self.inner.next_generation());
            self.inner.workers.lock().insert(*port, worker);
        }
        info!(
            "Converter pool started: {} workers on ports {:?}",
            ports.len(),
            ports
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(supervise(self.clone(), stop_rx));
        *supervisor = Some(Supervisor { stop_tx, handle });
        Ok(())
    }

    /// Stop the supervisor, then terminate every worker. Idempotent.
    pub async fn stop(&self) {
        let mut supervisor = self.inner.supervisor.lock().await;
        let Some(running) = supervisor.take() else {
            debug!("Converter pool already stopped");
            return;
        };

        let _ = running.stop_tx.send(true);
        if let Err(e) = running.handle.await {
            warn!("Converter supervisor ended abnormally: {e}");
        }

        let workers: Vec<ConverterWorker> = {
            let mut map = self.inner.workers.lock();
            std::mem::take(&mut *map).into_values().collect()
        };
        let grace = self.grace();
        for mut worker in workers {
            if let Some(pid) = worker.pid {
                process::terminate_tree(pid, grace).await;
            }
            if let Some(child) = worker.child.take() {
                reap(child).await;
            }
            debug!("Converter worker on port {} stopped", worker.port);
        }
        info!("Converter pool stopped");
    }

    /// Ports this pool instance owns.
    async fn provision_ports(&self) -> Result<Vec<u16>, ServiceError> {
        let cfg = &self.inner.config;
        let range = cfg.effective_port_range();
        let Some(path) = cfg.registry_path.clone() else {
            return Ok(range.ports().take(cfg.workers.max(1)).collect());
        };

        let registry = PortRegistry::new(path, range);
        let slot = cfg.replica_slot;
        let pid = std::process::id();
        let port = tokio::task::spawn_blocking(move || match slot {
            Some(slot) => registry.record(slot, pid),
            None => registry.claim(pid, process::is_alive),
        })
        .await
        .map_err(|e| ServiceError::Internal(format!("Registry task panicked: {e}")))??;
        info!("Replica {pid} owns converter port {port}");
        Ok(vec![port])
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.inner.config.shutdown_grace_ms)
    }

    // ── Assignment ───────────────────────────────────────────────────────

    /// Claim a free, healthy worker without waiting.
    pub fn acquire(&self) -> Result<WorkerLease, ServiceError> {
        let mut workers = self.inner.workers.lock();
        let worker = workers
            .values_mut()
            .find(|w| w.is_assignable())
            .ok_or(ServiceError::ConverterUnavailable)?;
        worker.busy = true;
        debug!("Acquired converter worker on port {}", worker.port);
        Ok(WorkerLease {
            pool: Arc::clone(&self.inner),
            port: worker.port,
            server_pid: worker.pid,
            generation: worker.generation,
        })
    }

    /// Return a worker to the pool. Equivalent to dropping the lease.
    pub fn release(&self, lease: WorkerLease) {
        drop(lease);
    }

    /// Mark the leased worker unhealthy, unless its port has been relaunched since.
    pub fn mark_unhealthy(&self, lease: &WorkerLease) {
        let mut workers = self.inner.workers.lock();
        if let Some(worker) = PoolInner::current(&mut workers, lease.port, lease.generation) {
            worker.healthy = false;
            warn!("Converter worker on port {} marked unhealthy", lease.port);
        }
    }

    // ── Conversion ───────────────────────────────────────────────────────

    /// Convert `request` to PDF on the leased worker.
    ///
    /// On timeout the client's process tree and the server's process tree are
    /// both terminated and the worker is marked unhealthy. A non-zero exit or
    /// a missing/empty output file also marks it unhealthy.
    pub async fn convert(
        &self,
        lease: &WorkerLease,
        request: &ConversionRequest,
        timeout: Duration,
    ) -> Result<Vec<u8>, ServiceError> {
        let cfg = &self.inner.config;
        let port = lease.port;

        tokio::fs::create_dir_all(&cfg.tmp_dir)
            .await
            .map_err(|e| ServiceError::io(&cfg.tmp_dir, e))?;
        let scratch = tempfile::Builder::new()
            .prefix("convert-")
            .tempdir_in(&cfg.tmp_dir)
            .map_err(|e| ServiceError::io(&cfg.tmp_dir, e))?;

        let id = uuid::Uuid::new_v4();
        let input = scratch.path().join(format!("{id}_{}", request.file_name));
        let output = scratch.path().join(format!("{id}_converted.pdf"));
        tokio::fs::write(&input, &request.bytes)
            .await
            .map_err(|e| ServiceError::io(&input, e))?;

        let filter = command::input_filter_for(&request.extension);
        let (program, mut cmd) = command::client_command(cfg, port, &input, &output, filter);
        cmd.current_dir(scratch.path());

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|source| ServiceError::Spawn { program, source })?;
        let client_pid = child.id();
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).trim().to_string()
        });

        let waited = tokio::time::timeout(timeout, child.wait()).await;
        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                stderr_task.abort();
                self.mark_unhealthy(lease);
                return Err(ServiceError::io(&input, e));
            }
            Err(_) => {
                warn!(
                    "Conversion of '{}' on port {port} exceeded {}s; terminating",
                    request.file_name,
                    timeout.as_secs()
                );
                let grace = self.grace();
                if let Some(pid) = client_pid {
                    process::terminate_tree(pid, grace).await;
                }
                let _ = child.start_kill();
                reap(child).await;
                if let Some(server_pid) = lease.server_pid {
                    process::terminate_tree(server_pid, grace).await;
                }
                stderr_task.abort();
                self.mark_unhealthy(lease);
                return Err(ServiceError::ConversionTimeout {
                    port,
                    secs: timeout.as_secs(),
                });
            }
        };

        let stderr = match tokio::time::timeout(REAP_TIMEOUT, stderr_task).await {
            Ok(Ok(text)) => text,
            _ => String::new(),
        };

        if !status.success() {
            self.mark_unhealthy(lease);
            return Err(ServiceError::ConversionFailed {
                port,
                detail: format!("client exited with {status}: {}", tail(&stderr)),
            });
        }

        match read_output(&output).await {
            Some(pdf) => {
                info!(
                    "Converted '{}' on port {port}: {} bytes in {}ms",
                    request.file_name,
                    pdf.len(),
                    started.elapsed().as_millis()
                );
                Ok(pdf)
            }
            None => {
                self.mark_unhealthy(lease);
                Err(ServiceError::ConversionFailed {
                    port,
                    detail: format!("no output file produced: {}", tail(&stderr)),
                })
            }
        }
    }

    // ── Supervision ──────────────────────────────────────────────────────

    /// Run one health-check cycle, restarting dead or unhealthy idle workers.
    ///
    /// Returns the number of workers that were restarted.
    pub async fn supervise_once(&self) -> usize {
        let stale: Vec<(u16, u64, Option<u32>, Option<Child>)> = {
            let mut workers = self.inner.workers.lock();
            workers
                .values_mut()
                .filter(|w| !w.busy)
                .filter_map(|w| {
                    let alive = w.probe();
                    if alive && w.healthy {
                        return None;
                    }
                    w.busy = true;
                    w.healthy = false;
                    Some((w.port, w.generation, w.pid.take(), w.child.take()))
                })
                .collect()
        };

        if stale.is_empty() {
            debug!("All {} converter workers alive", self.worker_count());
            return 0;
        }

        let grace = self.grace();
        let mut restarted = 0;
        for (port, generation, pid, child) in stale {
            warn!("Replacing converter worker on port {port} (pid {pid:?})");
            if let Some(pid) = pid {
                process::terminate_tree(pid, grace).await;
            }
            if let Some(child) = child {
                reap(child).await;
            }

            let launched = spawn_server(port, &self.inner.config);
            let next = self.inner.next_generation();
            let mut workers = self.inner.workers.lock();
            match (PoolInner::current(&mut workers, port, generation), launched) {
                (Some(worker), Ok(child)) => {
                    worker.replace_process(child, next);
                    worker.busy = false;
                    restarted += 1;
                }
                (Some(worker), Err(e)) => {
                    error!("Could not relaunch converter worker on port {port}: {e}");
                    worker.busy = false;
                }
                // Pool stopped or restarted meanwhile; dropping the child kills it.
                (None, _) => {}
            }
        }
        restarted
    }

    // ── Readiness ────────────────────────────────────────────────────────

    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().len()
    }

    /// Per-worker `{port, pid, busy, healthy, process_alive}`.
    pub fn status(&self) -> Vec<WorkerStatus> {
        self.inner
            .workers
            .lock()
            .values_mut()
            .map(ConverterWorker::status)
            .collect()
    }

    pub fn readiness(&self) -> PoolReadiness {
        let statuses = self.status();
        let issues: Vec<String> = statuses
            .iter()
            .filter(|s| !s.process_alive)
            .map(|s| format!("converter_process_exited:{}", s.port))
            .collect();
        let status = if issues.is_empty() && !statuses.is_empty() {
            "ready"
        } else {
            "degraded"
        };
        PoolReadiness {
            status: status.to_string(),
            workers: statuses.len(),
            issues,
        }
    }
}

/// Background loop: one [`ConverterPool::supervise_once`] per interval until stopped.
async fn supervise(pool: ConverterPool, mut stop_rx: watch::Receiver<bool>) {
    let interval = Duration::from_secs(pool.inner.config.monitor_interval_secs.max(1));
    info!("Converter supervisor running every {}s", interval.as_secs());
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let restarted = pool.supervise_once().await;
                if restarted > 0 {
                    info!("Supervisor restarted {restarted} converter workers");
                }
            }
            _ = stop_rx.changed() => break,
        }
    }
    debug!("Converter supervisor stopped");
}

async fn reap(mut child: Child) {
    if tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
        let _ = child.start_kill();
        debug!("Process {:?} not reaped within {REAP_TIMEOUT:?}", child.id());
    }
}

async fn read_output(path: &Path) -> Option<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        _ => None,
    }
}

fn tail(stderr: &str) -> &str {
    let start = stderr.len().saturating_sub(400);
    let start = (start..stderr.len())
        .find(|i| stderr.is_char_boundary(*i))
        .unwrap_or(stderr.len());
    if stderr.is_empty() {
        "(no stderr)"
    } else {
        &stderr[start..]
    }
}
