//! Watch command implementation: the long-running coordinator plus the
//! PID-file contract (decimal PID; presence + signal test means running).

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::adapter::AdapterRegistry;
use crate::config::Config;
use crate::identity::Device;
use crate::ingest::Orchestrator;
use crate::store::Store;
use crate::watch::WatchCoordinator;

pub fn run(store: Store, config: &Config, device: Device) -> Result<()> {
    let pid_path = config.pid_path();
    if let Some(pid) = read_pid(&pid_path) {
        if is_running(pid) {
            bail!("watcher already running (pid {pid})");
        }
    }

    write_pid(&pid_path)?;
    println!("Watching sources (ctrl-c to stop)");

    let registry = AdapterRegistry::new(config);
    let orchestrator = Orchestrator::new(store, registry, device, config.redaction.redact_secrets)?;
    let mut coordinator = WatchCoordinator::new(
        Arc::new(Mutex::new(orchestrator)),
        config.watch.clone(),
    );

    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    let result = runtime.block_on(coordinator.run_until_signal());

    let _ = std::fs::remove_file(&pid_path);
    result
}

pub fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn is_running(pid: i32) -> bool {
    // Signal 0 probes for existence without touching the process.
    unsafe { libc::kill(pid, 0) == 0 }
}

fn write_pid(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}", std::process::id()))
        .with_context(|| format!("writing pid file at {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pid_roundtrip_and_liveness() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watcher.pid");
        write_pid(&path).unwrap();

        let pid = read_pid(&path).unwrap();
        assert_eq!(pid as u32, std::process::id());
        // Our own process is certainly alive.
        assert!(is_running(pid));
    }

    #[test]
    fn stale_pid_reads_as_not_running() {
        // PID 0 targets the caller's process group; use an implausible pid.
        assert!(!is_running(i32::MAX - 1));
    }
}
