//! Cross-process worker-port registry.
//!
//! Several service replicas on one host share a small JSON file mapping each
//! converter port to the pid of the replica that owns it:
//!
//! ```json
//! {"9900": 4182, "9901": 4190}
//! ```
//!
//! Every read-modify-write happens under an exclusive file lock, so two
//! replicas starting at the same moment cannot claim the same port. Entries
//! for dead pids are harmless; [`PortRegistry::claim`] reuses their ports.

use crate::config::PortRange;
use crate::error::ServiceError;
use std::collections::BTreeMap;
use fs4::fs_std::FileExt;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

type PortMap = BTreeMap<u16, u32>;

/// Handle on the registry file for one port range.
#[derive(Debug, Clone)]
pub struct PortRegistry {
    path: PathBuf,
    range: PortRange,
}

impl PortRegistry {
    pub fn new(path: impl Into<PathBuf>, range: PortRange) -> Self {
        Self {
            path: path.into(),
            range,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Assign the port of `slot` to `pid`, overwriting any previous owner.
    pub fn record(&self, slot: usize, pid: u32) -> Result<u16, ServiceError> {
        let port = self.range.port_for_slot(slot).ok_or_else(|| {
            ServiceError::Registry(format!("slot {slot} is outside port range {}", self.range))
        })?;
        self.update(|map| {
            map.insert(port, pid);
            Ok(port)
        })
    }

    /// Port currently recorded for `pid`, if any.
    pub fn assigned_port(&self, pid: u32) -> Result<Option<u16>, ServiceError> {
        let map = self.entries()?;
        Ok(map
            .iter()
            .find(|(port, owner)| **owner == pid && self.range.contains(**port))
            .map(|(port, _)| *port))
    }

    /// Reattach `pid` to its recorded port, or claim the first port that is
    /// unassigned or owned by a process for which `is_alive` returns false.
    pub fn claim(&self, pid: u32, is_alive: impl Fn(u32) -> bool) -> Result<u16, ServiceError> {
        let range = self.range;
        self.update(|map| {
            if let Some((port, _)) = map
                .iter()
                .find(|(port, owner)| **owner == pid && range.contains(**port))
            {
                return Ok(*port);
            }
            let free = range.ports().find(|port| match map.get(port) {
                None => true,
                Some(owner) => !is_alive(*owner),
            });
            match free {
                Some(port) => {
                    map.insert(port, pid);
                    Ok(port)
                }
                None => Err(ServiceError::Registry(format!(
                    "every port in {range} is owned by a live process"
                ))),
            }
        })
    }

    /// Snapshot of the whole registry.
    pub fn entries(&self) -> Result<PortMap, ServiceError> {
        self.update(|map| Ok(map.clone()))
    }

    /// Run `f` on the parsed map under the lock, rewriting the file if it changed.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut PortMap) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ServiceError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| ServiceError::io(&self.path, e))?;

        FileExt::lock_exclusive(&file)
            .map_err(|e| ServiceError::Registry(format!("lock {}: {e}", self.path.display())))?;

        let mut raw = String::new();
        file.read_to_string(&mut raw)
            .map_err(|e| ServiceError::io(&self.path, e))?;
        let mut map: PortMap = if raw.trim().is_empty() {
            PortMap::new()
        } else {
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(
                    "Port registry {} is unreadable ({e}); starting fresh",
                    self.path.display()
                );
                PortMap::new()
            })
        };

        let before = map.clone();
        let out = f(&mut map)?;
        if map != before {
            let json = serde_json::to_string(&map)
                .map_err(|e| ServiceError::Registry(format!("serialise: {e}")))?;
            file.set_len(0)
                .and_then(|_| file.seek(SeekFrom::Start(0)))
                .and_then(|_| file.write_all(json.as_bytes()))
                .and_then(|_| file.sync_all())
                .map_err(|e| ServiceError::io(&self.path, e))?;
            debug!("Port registry updated: {json}");
        }
        FileExt::unlock(&file).map_err(|e| ServiceError::io(&self.path, e))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &tempfile::TempDir) -> PortRegistry {
        PortRegistry::new(dir.path().join("ports.json"), PortRange::new(9900, 9903))
    }

    #[test]
    fn record_writes_port_for_slot() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        assert_eq!(reg.record(1, 4242).unwrap(), 9901);
        assert_eq!(reg.assigned_port(4242).unwrap(), Some(9901));

        let raw = std::fs::read_to_string(reg.path()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["9901"], 4242);
    }

    #[test]
    fn record_rejects_slot_outside_range() {
        let dir = tempfile::tempdir().unwrap();
        assert!(registry(&dir).record(3, 1).is_err());
    }

    #[test]
    fn claim_reattaches_same_pid() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        let first = reg.claim(100, |_| true).unwrap();
        let again = reg.claim(100, |_| true).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn claim_skips_live_owners_and_reuses_dead_ones() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        reg.record(0, 1).unwrap();
        reg.record(1, 2).unwrap();
        reg.record(2, 3).unwrap();

        assert!(reg.claim(50, |_| true).is_err());
        let port = reg.claim(50, |pid| pid != 2).unwrap();
        assert_eq!(port, 9901);
        assert_eq!(reg.entries().unwrap().get(&9901), Some(&50));
    }

    #[test]
    fn unreadable_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        std::fs::write(reg.path(), "{not json").unwrap();
        assert_eq!(reg.record(0, 7).unwrap(), 9900);
        assert_eq!(reg.entries().unwrap().len(), 1);
    }

    #[test]
    fn concurrent_claims_get_distinct_ports() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        let handles: Vec<_> = (0..3u32)
            .map(|i| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.claim(1000 + i, |_| true).unwrap())
            })
            .collect();
        let mut ports: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![9900, 9901, 9902]);
    }

    #[test]
    fn rewrite_truncates_longer_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        let stale = format!("{{\"9900\": 1, \"padding\": \"{}\"", "x".repeat(200));
        std::fs::write(reg.path(), stale).unwrap();

        reg.record(2, 77).unwrap();
        let raw = std::fs::read_to_string(reg.path()).unwrap();
        assert_eq!(raw, r#"{"9902":77}"#);
    }
}
