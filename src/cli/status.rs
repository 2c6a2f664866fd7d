//! Status command implementation

use anyhow::Result;
use std::collections::BTreeMap;

use crate::config::Config;
use crate::identity::Device;
use crate::store::Store;

pub fn run(store: &Store, config: &Config, device: &Device) -> Result<()> {
    println!("Device   {} ({})", device.device_id, device.nickname);

    let pid_path = config.pid_path();
    match super::watch::read_pid(&pid_path) {
        Some(pid) if super::watch::is_running(pid) => {
            println!("Watcher  running (pid {pid})");
        }
        Some(_) => println!("Watcher  stale pid file at {}", pid_path.display()),
        None => println!("Watcher  not running"),
    }

    let sources = store.list_sources(None)?;
    let mut by_status: BTreeMap<&str, usize> = BTreeMap::new();
    for source in &sources {
        *by_status.entry(source.status.as_str()).or_default() += 1;
    }
    let status_line: Vec<String> = by_status
        .iter()
        .map(|(status, count)| format!("{count} {status}"))
        .collect();
    println!(
        "Sources  {} ({})",
        sources.len(),
        if status_line.is_empty() {
            "none".to_string()
        } else {
            status_line.join(", ")
        }
    );

    println!("Events   {}", store.count_events()?);
    println!("Projects {}", store.list_projects()?.len());

    for source in sources.iter().filter(|s| s.status == "error") {
        println!(
            "  ⚠ {}: {}",
            source.locator,
            source.error_message.as_deref().unwrap_or("unknown error")
        );
    }

    Ok(())
}
