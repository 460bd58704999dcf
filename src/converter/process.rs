//! OS process inspection and process-tree termination.
//!
//! Every kill in the crate goes through [`terminate_tree`]: the pool on
//! conversion timeout, the supervisor when replacing a dead worker, and
//! shutdown. The contract is two-phase:
//!
//! 1. send `SIGTERM` to the root and all of its descendants,
//! 2. poll until they are gone or the grace period expires,
//! 3. send `SIGKILL` to whatever is still running.
//!
//! Descendants are collected *before* the root is signalled, because once the
//! root dies its children are re-parented and can no longer be found by
//! walking parent links.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant};
use sysinfo::{
    Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System, UpdateKind,
};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Observed state of an OS process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    /// Exited but not yet reaped by its parent.
    Zombie,
    Missing,
}

/// Outcome of a [`terminate_tree`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminationReport {
    /// Processes that received the graceful signal.
    pub signalled: usize,
    /// Processes that had to be force-killed after the grace period.
    pub killed: usize,
}

pub fn liveness(pid: u32) -> Liveness {
    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    match sys.process(target) {
        None => Liveness::Missing,
        Some(p) => match p.status() {
            ProcessStatus::Zombie | ProcessStatus::Dead => Liveness::Zombie,
            _ => Liveness::Running,
        },
    }
}

/// True when `pid` exists and is not a zombie.
pub fn is_alive(pid: u32) -> bool {
    liveness(pid) == Liveness::Running
}

/// `root` followed by all of its descendants, breadth first.
fn collect_tree(sys: &System, root: Pid) -> Vec<Pid> {
    if sys.process(root).is_none() {
        return Vec::new();
    }

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut tree = vec![root];
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                if !tree.contains(kid) {
                    tree.push(*kid);
                    queue.push_back(*kid);
                }
            }
        }
    }
    tree
}

fn still_running(sys: &System, pids: &[Pid]) -> Vec<Pid> {
    pids.iter()
        .copied()
        .filter(|pid| {
            sys.process(*pid)
                .map(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
                .unwrap_or(false)
        })
        .collect()
}

/// Blocking implementation of [`terminate_tree`].
pub fn terminate_tree_blocking(pid: u32, grace: Duration) -> TerminationReport {
    let root = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let tree = collect_tree(&sys, root);
    if tree.is_empty() {
        debug!("Process {pid} already gone");
        return TerminationReport::default();
    }

    let mut report = TerminationReport::default();
    for member in &tree {
        if let Some(process) = sys.process(*member) {
            // Platforms without SIGTERM fall straight through to kill().
            let sent = process.kill_with(Signal::Term).unwrap_or_else(|| process.kill());
            if sent {
                report.signalled += 1;
            }
        }
    }

    let deadline = Instant::now() + grace;
    let mut alive = tree.clone();
    loop {
        sys.refresh_processes(ProcessesToUpdate::Some(&alive), true);
        alive = still_running(&sys, &alive);
        if alive.is_empty() || Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    for survivor in &alive {
        if let Some(process) = sys.process(*survivor) {
            if process.kill() {
                report.killed += 1;
            }
        }
    }

    if report.killed > 0 {
        warn!(
            "Process tree {pid}: {} terminated, {} force-killed after {}ms",
            report.signalled,
            report.killed,
            grace.as_millis()
        );
    } else {
        debug!("Process tree {pid}: {} terminated", report.signalled);
    }
    report
}

/// Terminate `pid` and all of its descendants, force-killing after `grace`.
///
/// Runs on the blocking pool because it polls `/proc` and sleeps.
pub async fn terminate_tree(pid: u32, grace: Duration) -> TerminationReport {
    match tokio::task::spawn_blocking(move || terminate_tree_blocking(pid, grace)).await {
        Ok(report) => report,
        Err(e) => {
            warn!("Termination task for pid {pid} panicked: {e}");
            TerminationReport::default()
        }
    }
}

/// Remove `lo_profile_*` directories under `dir` that no running process
/// references on its command line. Returns the number removed.
pub fn cleanup_stale_profiles(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let candidates: Vec<_> = entries
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .filter(|e| e.file_name().to_string_lossy().starts_with("lo_profile_"))
        .collect();
    if candidates.is_empty() {
        return 0;
    }

    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    let command_lines: Vec<String> = sys
        .processes()
        .values()
        .map(|p| {
            p.cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();

    let mut removed = 0;
    for entry in candidates {
        let name = entry.file_name().to_string_lossy().to_string();
        if command_lines.iter().any(|cmd| cmd.contains(&name)) {
            continue;
        }
        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => {
                info!("Removed stale converter profile {}", entry.path().display());
                removed += 1;
            }
            Err(e) => warn!("Could not remove {}: {e}", entry.path().display()),
        }
    }
    removed
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn own_process_is_running() {
        assert_eq!(liveness(std::process::id()), Liveness::Running);
    }

    #[test]
    fn terminate_kills_parent_and_children() {
        let dir = tempfile::tempdir().unwrap();
        let child_pid_file = dir.path().join("child.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", child_pid_file.display());
        let mut parent = Command::new("sh").arg("-c").arg(&script).spawn().unwrap();

        let mut grandchild = None;
        for _ in 0..100 {
            if let Ok(s) = std::fs::read_to_string(&child_pid_file) {
                if let Ok(pid) = s.trim().parse::<u32>() {
                    grandchild = Some(pid);
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let grandchild = grandchild.expect("grandchild pid written");

        let report = terminate_tree_blocking(parent.id(), Duration::from_secs(2));
        assert!(report.signalled >= 2, "report: {report:?}");
        parent.wait().unwrap();

        let mut gone = false;
        for _ in 0..50 {
            if !is_alive(grandchild) {
                gone = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(gone, "grandchild {grandchild} survived");
    }

    #[test]
    fn terminate_missing_pid_is_a_no_op() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        let report = terminate_tree_blocking(pid, Duration::from_millis(100));
        assert_eq!(report.killed, 0);
    }

    #[test]
    fn stale_profiles_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("lo_profile_59999_stale_test");
        let other = dir.path().join("keep_me");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::create_dir_all(&other).unwrap();

        assert_eq!(cleanup_stale_profiles(dir.path()), 1);
        assert!(!stale.exists());
        assert!(other.exists());
    }
}
