//! ---
//! upkeep_section: "02-host-inspection"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Process table, signalling, and resource sampling."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessRefreshKind, System, UpdateKind};
use tracing::debug;

use crate::error::HostError;

/// Snapshot of one running process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Parent pid, when the platform reports one.
    #[serde(default)]
    pub parent: Option<u32>,
    pub name: String,
    pub cmdline: String,
    pub run_time: Duration,
}

impl ProcessInfo {
    /// True when the command line contains a pattern or the name equals one.
    /// Empty patterns never match.
    pub fn matches_any(&self, patterns: &[String]) -> bool {
        patterns
            .iter()
            .filter(|pattern| !pattern.is_empty())
            .any(|pattern| self.cmdline.contains(pattern.as_str()) || self.name == *pattern)
    }
}

/// Read and signal access to the host process table.
pub trait ProcessTable: Send + Sync {
    /// Pid of the calling process.
    fn current_pid(&self) -> u32;

    /// Every process currently visible.
    fn list(&self) -> Result<Vec<ProcessInfo>, HostError>;

    /// Whether `pid` still exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// Ask the process to exit (SIGTERM).
    fn terminate(&self, pid: u32) -> Result<(), HostError>;

    /// Kill the process outright (SIGKILL).
    fn force_kill(&self, pid: u32) -> Result<(), HostError>;

    /// Processes whose command line contains any pattern, excluding our own
    /// lineage: this process, its ancestors (`sudo`, `sh -c`, wrapper scripts)
    /// and its descendants.
    fn find_matching(&self, patterns: &[String]) -> Result<Vec<ProcessInfo>, HostError> {
        let own = self.current_pid();
        let processes = self.list()?;
        let parents: HashMap<u32, u32> = processes
            .iter()
            .filter_map(|process| process.parent.map(|parent| (process.pid, parent)))
            .collect();
        let ancestors = ancestors_of(own, &parents);
        Ok(processes
            .into_iter()
            .filter(|process| process.matches_any(patterns))
            .filter(|process| {
                process.pid != own
                    && !ancestors.contains(&process.pid)
                    && !ancestors_of(process.pid, &parents).contains(&own)
            })
            .collect())
    }
}

/// Walk parent links upwards from `pid`. Stops at pid 0, unknown parents or a cycle.
fn ancestors_of(pid: u32, parents: &HashMap<u32, u32>) -> HashSet<u32> {
    let mut seen = HashSet::new();
    let mut cursor = pid;
    while let Some(&parent) = parents.get(&cursor) {
        if parent == 0 || parent == pid || !seen.insert(parent) {
            break;
        }
        cursor = parent;
    }
    seen
}

/// Orchestration processes seen on the host, with the long-running subset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlapScan {
    pub matches: Vec<ProcessInfo>,
    /// Matches running longer than the hung threshold.
    pub hung: Vec<ProcessInfo>,
}

impl OverlapScan {
    /// No matching process at all.
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Pids of every match, in table order.
    pub fn pids(&self) -> Vec<u32> {
        self.matches.iter().map(|process| process.pid).collect()
    }
}

/// Shared scan used by both the health probe and the conflict detector.
pub fn scan_overlap(
    table: &dyn ProcessTable,
    patterns: &[String],
    hung_after: Duration,
) -> Result<OverlapScan, HostError> {
    let matches = table.find_matching(patterns)?;
    let hung = matches
        .iter()
        .filter(|process| process.run_time >= hung_after)
        .cloned()
        .collect();
    Ok(OverlapScan { matches, hung })
}

/// [`ProcessTable`] backed by sysinfo for reads and POSIX signals for writes.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    /// Empty snapshot; every [`ProcessTable::list`] call refreshes it.
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemProcessTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProcessTable").finish_non_exhaustive()
    }
}

impl ProcessTable for SystemProcessTable {
    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    fn list(&self) -> Result<Vec<ProcessInfo>, HostError> {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessRefreshKind::new().with_cmd(UpdateKind::OnlyIfNotSet),
        );
        let processes = system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                parent: process.parent().map(|parent| parent.as_u32()),
                name: process.name().to_owned(),
                cmdline: process.cmd().join(" "),
                run_time: Duration::from_secs(process.run_time()),
            })
            .collect::<Vec<_>>();
        debug!(count = processes.len(), "process table refreshed");
        Ok(processes)
    }

    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, pid: u32) -> bool {
        let mut system = self.system.lock();
        system.refresh_process(sysinfo::Pid::from_u32(pid))
    }

    fn terminate(&self, pid: u32) -> Result<(), HostError> {
        send_signal(self, pid, false)
    }

    fn force_kill(&self, pid: u32) -> Result<(), HostError> {
        send_signal(self, pid, true)
    }
}

#[cfg(unix)]
fn send_signal(_table: &SystemProcessTable, pid: u32, force: bool) -> Result<(), HostError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => {
            debug!(pid, signal = ?signal, "signal delivered");
            Ok(())
        }
        Err(Errno::ESRCH) => Err(HostError::ProcessNotFound(pid)),
        Err(err) => Err(HostError::Signal {
            pid,
            reason: err.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn send_signal(table: &SystemProcessTable, pid: u32, force: bool) -> Result<(), HostError> {
    let mut system = table.system.lock();
    let sys_pid = sysinfo::Pid::from_u32(pid);
    if !system.refresh_process(sys_pid) {
        return Err(HostError::ProcessNotFound(pid));
    }
    let process = system
        .process(sys_pid)
        .ok_or(HostError::ProcessNotFound(pid))?;
    let delivered = if force {
        process.kill()
    } else {
        process.kill_with(sysinfo::Signal::Term).unwrap_or(false)
    };
    if delivered {
        Ok(())
    } else {
        Err(HostError::Signal {
            pid,
            reason: "signal not delivered".to_owned(),
        })
    }
}

/// Scripted process table for embedding and tests.
///
/// Processes registered as stubborn ignore `terminate` and only disappear on
/// `force_kill`. Every signal is recorded in delivery order.
#[derive(Debug)]
pub struct InMemoryProcessTable {
    current_pid: u32,
    processes: Mutex<BTreeMap<u32, ProcessInfo>>,
    stubborn: Mutex<HashSet<u32>>,
    signals: Mutex<Vec<(u32, &'static str)>>,
}

impl InMemoryProcessTable {
    /// Empty table reporting `current_pid` as the caller.
    pub fn new(current_pid: u32) -> Self {
        Self {
            current_pid,
            processes: Mutex::new(BTreeMap::new()),
            stubborn: Mutex::new(HashSet::new()),
            signals: Mutex::new(Vec::new()),
        }
    }

    /// Register a process without a known parent.
    pub fn spawn(&self, pid: u32, cmdline: &str, run_time: Duration) {
        self.insert(pid, None, cmdline, run_time);
    }

    /// Register a process started by `parent`.
    pub fn spawn_child(&self, pid: u32, parent: u32, cmdline: &str, run_time: Duration) {
        self.insert(pid, Some(parent), cmdline, run_time);
    }

    fn insert(&self, pid: u32, parent: Option<u32>, cmdline: &str, run_time: Duration) {
        let name = cmdline
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_owned();
        self.processes.lock().insert(
            pid,
            ProcessInfo {
                pid,
                parent,
                name,
                cmdline: cmdline.to_owned(),
                run_time,
            },
        );
    }

    /// Register a process that ignores SIGTERM.
    pub fn spawn_stubborn(&self, pid: u32, cmdline: &str, run_time: Duration) {
        self.spawn(pid, cmdline, run_time);
        self.stubborn.lock().insert(pid);
    }

    /// Remove `pid` as if it had exited on its own.
    pub fn exit(&self, pid: u32) {
        self.processes.lock().remove(&pid);
    }

    /// Signals delivered so far, oldest first.
    pub fn signals(&self) -> Vec<(u32, &'static str)> {
        self.signals.lock().clone()
    }
}

impl ProcessTable for InMemoryProcessTable {
    fn current_pid(&self) -> u32 {
        self.current_pid
    }

    fn list(&self) -> Result<Vec<ProcessInfo>, HostError> {
        Ok(self.processes.lock().values().cloned().collect())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.processes.lock().contains_key(&pid)
    }

    fn terminate(&self, pid: u32) -> Result<(), HostError> {
        if !self.is_alive(pid) {
            return Err(HostError::ProcessNotFound(pid));
        }
        self.signals.lock().push((pid, "SIGTERM"));
        if !self.stubborn.lock().contains(&pid) {
            self.exit(pid);
        }
        Ok(())
    }

    fn force_kill(&self, pid: u32) -> Result<(), HostError> {
        if !self.is_alive(pid) {
            return Err(HostError::ProcessNotFound(pid));
        }
        self.signals.lock().push((pid, "SIGKILL"));
        self.exit(pid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_matching_skips_own_process() {
        let table = InMemoryProcessTable::new(10);
        table.spawn(10, "upkeepd run --instance alpha", Duration::ZERO);
        table.spawn(11, "upkeepd run --instance beta", Duration::ZERO);
        table.spawn(12, "sshd -D", Duration::ZERO);

        let found = table.find_matching(&["upkeepd run".to_owned()]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pid, 11);
    }

    #[test]
    fn find_matching_skips_own_lineage() {
        let table = InMemoryProcessTable::new(30);
        table.spawn(1, "/sbin/init", Duration::ZERO);
        table.spawn_child(10, 1, "cron", Duration::ZERO);
        table.spawn_child(20, 10, "sh -c upkeepd run --instance alpha", Duration::ZERO);
        table.spawn_child(25, 20, "sudo upkeepd run --instance alpha", Duration::ZERO);
        table.spawn_child(30, 25, "upkeepd run --instance alpha", Duration::ZERO);
        table.spawn_child(31, 30, "upkeepd run --instance alpha --worker", Duration::ZERO);
        table.spawn_child(40, 10, "sh -c upkeepd run --instance beta", Duration::ZERO);
        table.spawn_child(41, 40, "upkeepd run --instance beta", Duration::ZERO);

        let found = table.find_matching(&["upkeepd run".to_owned()]).unwrap();
        let pids: Vec<u32> = found.iter().map(|process| process.pid).collect();
        assert_eq!(pids, vec![40, 41]);
    }

    #[test]
    fn parent_cycles_do_not_hang_the_walk() {
        let table = InMemoryProcessTable::new(5);
        table.spawn_child(5, 6, "upkeepd run", Duration::ZERO);
        table.spawn_child(6, 7, "upkeepd run", Duration::ZERO);
        table.spawn_child(7, 6, "upkeepd run", Duration::ZERO);
        table.spawn(8, "upkeepd run", Duration::ZERO);

        let found = table.find_matching(&["upkeepd run".to_owned()]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pid, 8);
    }

    #[test]
    fn overlap_scan_flags_long_runners() {
        let table = InMemoryProcessTable::new(1);
        table.spawn(2, "upkeepd run", Duration::from_secs(13 * 3600));
        table.spawn(3, "upkeepd run", Duration::from_secs(60));
        let scan = scan_overlap(
            &table,
            &["upkeepd run".to_owned()],
            Duration::from_secs(12 * 3600),
        )
        .unwrap();
        assert_eq!(scan.pids(), vec![2, 3]);
        assert_eq!(scan.hung.len(), 1);
        assert_eq!(scan.hung[0].pid, 2);
    }

    #[test]
    fn stubborn_process_survives_terminate() {
        let table = InMemoryProcessTable::new(1);
        table.spawn_stubborn(7, "worker", Duration::ZERO);
        table.terminate(7).unwrap();
        assert!(table.is_alive(7));
        table.force_kill(7).unwrap();
        assert!(!table.is_alive(7));
        assert_eq!(table.signals(), vec![(7, "SIGTERM"), (7, "SIGKILL")]);
    }

    #[test]
    fn empty_patterns_match_nothing() {
        let table = InMemoryProcessTable::new(1);
        table.spawn(2, "anything", Duration::ZERO);
        assert!(table.find_matching(&[String::new()]).unwrap().is_empty());
    }

    #[test]
    fn system_table_sees_current_process() {
        let table = SystemProcessTable::new();
        let own = table.current_pid();
        assert!(table.is_alive(own));
        let listed = table.list().unwrap();
        let me = listed.iter().find(|p| p.pid == own).unwrap();
        assert!(me.parent.is_some());
    }
}
