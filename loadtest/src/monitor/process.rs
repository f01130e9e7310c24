use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System, UpdateKind};

use super::types::MonitorError;

/// What a locator exposes about a candidate process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    /// Arguments joined by spaces
    pub cmdline: String,
}

/// A located process whose memory can be read repeatedly
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;

    fn name(&self) -> &str;

    /// Current resident set size in bytes
    fn resident_bytes(&mut self) -> Result<u64, MonitorError>;
}

/// Platform-specific process discovery
pub trait ProcessLocator: Send + Sync {
    /// First process accepted by `predicate`, if any
    fn find(&self, predicate: &dyn Fn(&ProcessInfo) -> bool) -> Option<Box<dyn ProcessHandle>>;
}

/// Case-insensitive substring match on the process name or command line
pub fn pattern_matcher(pattern: &str) -> impl Fn(&ProcessInfo) -> bool + use<> {
    let needle = pattern.to_lowercase();
    move |info: &ProcessInfo| {
        info.name.to_lowercase().contains(&needle) || info.cmdline.to_lowercase().contains(&needle)
    }
}

/// Locator backed by `sysinfo`. Never returns the harness's own process.
#[derive(Debug, Default)]
pub struct SysinfoLocator;

impl SysinfoLocator {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessLocator for SysinfoLocator {
    fn find(&self, predicate: &dyn Fn(&ProcessInfo) -> bool) -> Option<Box<dyn ProcessHandle>> {
        let refresh = ProcessRefreshKind::nothing()
            .with_memory()
            .with_cmd(UpdateKind::OnlyIfNotSet);
        let mut system = System::new_with_specifics(RefreshKind::nothing().with_processes(refresh));
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh);

        let own_pid = sysinfo::get_current_pid().ok();
        let mut candidates: Vec<ProcessInfo> = system
            .processes()
            .iter()
            .filter(|(pid, _)| Some(**pid) != own_pid)
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
                cmdline: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" "),
            })
            .collect();
        // Lowest pid first so repeated runs pick the same process
        candidates.sort_by_key(|info| info.pid);

        let info = candidates.into_iter().find(|info| predicate(info))?;
        Some(Box::new(SysinfoHandle {
            pid: Pid::from_u32(info.pid),
            name: info.name,
            system,
        }))
    }
}

struct SysinfoHandle {
    pid: Pid,
    name: String,
    system: System,
}

impl ProcessHandle for SysinfoHandle {
    fn pid(&self) -> u32 {
        self.pid.as_u32()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn resident_bytes(&mut self) -> Result<u64, MonitorError> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system
            .process(self.pid)
            .map(|process| process.memory())
            .ok_or(MonitorError::ProcessGone(self.pid.as_u32()))
    }
}
