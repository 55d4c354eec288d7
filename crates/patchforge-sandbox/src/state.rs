//! System state capture and comparison inside sandbox containers.
//!
//! Capture probes for the package manager first (apt, dnf, yum, zypper
//! in that order), then collects packages, services, sentinel-file
//! metadata, network state, processes, os-release, kernel and memory.
//! Every probe tolerates its tool being absent; a minimal container
//! simply yields a sparser snapshot.

use chrono::Utc;
use std::collections::BTreeMap;
use tracing::debug;

use patchforge_core::{
    FileMeta, PackageChange, PackageManager, StateDiff, SystemState,
};

use crate::runtime::ContainerRuntime;

/// Sentinel files watched for modification.
const SENTINEL_FILES: [&str; 4] = ["/etc/passwd", "/etc/group", "/etc/hosts", "/etc/resolv.conf"];

/// Process-listing cap.
const PROCESS_CAP: usize = 50;

/// Capture the observable state of a sandbox container.
pub async fn capture_state(runtime: &dyn ContainerRuntime, container_id: &str) -> SystemState {
    debug!("capturing system state of {}", container_id);

    let package_manager = detect_package_manager(runtime, container_id).await;

    let mut state = SystemState {
        captured_at: Some(Utc::now()),
        package_manager,
        ..SystemState::default()
    };

    if let Some(pm) = package_manager {
        state.packages = capture_packages(runtime, container_id, pm).await;
    }
    state.services = capture_services(runtime, container_id).await;
    state.files = capture_files(runtime, container_id).await;
    capture_network(runtime, container_id, &mut state).await;
    state.processes = capture_processes(runtime, container_id).await;
    capture_system_info(runtime, container_id, &mut state).await;

    debug!(
        "captured state: {} packages, {} services",
        state.packages.len(),
        state.services.len()
    );
    state
}

/// Probe for the package manager, in preference order.
pub async fn detect_package_manager(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
) -> Option<PackageManager> {
    let probes = [
        ("apt-get", PackageManager::Apt),
        ("dnf", PackageManager::Dnf),
        ("yum", PackageManager::Yum),
        ("zypper", PackageManager::Zypper),
    ];

    for (binary, manager) in probes {
        let command = format!("command -v {binary} >/dev/null 2>&1 && echo yes || echo no");
        if let Ok(output) = runtime.exec(container_id, &command).await {
            if output.success() && output.stdout.trim() == "yes" {
                return Some(manager);
            }
        }
    }
    None
}

async fn capture_packages(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    pm: PackageManager,
) -> BTreeMap<String, String> {
    let command = match pm {
        PackageManager::Apt => r"dpkg-query -W -f='${Package}=${Version}\n'",
        PackageManager::Dnf | PackageManager::Yum | PackageManager::Zypper => {
            r"rpm -qa --queryformat '%{NAME}=%{VERSION}-%{RELEASE}\n'"
        }
        PackageManager::Apk | PackageManager::Unknown => return BTreeMap::new(),
    };

    let mut packages = BTreeMap::new();
    if let Ok(output) = runtime.exec(container_id, command).await {
        if output.success() {
            for line in output.stdout.lines() {
                if let Some((name, version)) = line.split_once('=') {
                    packages.insert(name.to_string(), version.to_string());
                }
            }
        }
    }
    packages
}

async fn capture_services(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
) -> BTreeMap<String, String> {
    let mut services = BTreeMap::new();

    // Prefer systemd; fall back to the sysv service listing.
    let systemd = runtime
        .exec(
            container_id,
            "systemctl list-units --type=service --state=running --no-pager --no-legend 2>/dev/null",
        )
        .await;

    if let Ok(output) = systemd {
        if output.success() && !output.stdout.trim().is_empty() {
            for line in output.stdout.lines() {
                if let Some(unit) = line.split_whitespace().next() {
                    services.insert(unit.trim_end_matches(".service").to_string(), "running".to_string());
                }
            }
            return services;
        }
    }

    if let Ok(output) = runtime
        .exec(container_id, "service --status-all 2>/dev/null")
        .await
    {
        for line in output.stdout.lines() {
            if line.contains("[ + ]") || line.contains("[+]") {
                if let Some(name) = line.split_whitespace().last() {
                    services.insert(name.to_string(), "running".to_string());
                }
            }
        }
    }

    services
}

async fn capture_files(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
) -> BTreeMap<String, FileMeta> {
    let mut files = BTreeMap::new();

    for path in SENTINEL_FILES {
        let command = format!("stat -c '%s %Y' {path} 2>/dev/null");
        if let Ok(output) = runtime.exec(container_id, &command).await {
            if output.success() {
                let parts: Vec<&str> = output.stdout.split_whitespace().collect();
                if let [size, mtime] = parts.as_slice() {
                    if let (Ok(size), Ok(mtime)) = (size.parse(), mtime.parse()) {
                        files.insert(path.to_string(), FileMeta { size, mtime });
                    }
                }
            }
        }
    }
    files
}

async fn capture_network(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    state: &mut SystemState,
) {
    if let Ok(output) = runtime
        .exec(container_id, "ip -o addr show 2>/dev/null")
        .await
    {
        if output.success() {
            for line in output.stdout.lines() {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() >= 4 {
                    state
                        .interfaces
                        .entry(parts[1].to_string())
                        .or_default()
                        .push(parts[3].to_string());
                }
            }
        }
    }

    if let Ok(output) = runtime
        .exec(
            container_id,
            "ss -tuln 2>/dev/null | grep LISTEN || netstat -tuln 2>/dev/null | grep LISTEN",
        )
        .await
    {
        state.listening_ports = output
            .stdout
            .lines()
            .filter(|l| l.contains("LISTEN"))
            .map(|l| l.trim().to_string())
            .collect();
    }
}

async fn capture_processes(runtime: &dyn ContainerRuntime, container_id: &str) -> Vec<String> {
    if let Ok(output) = runtime
        .exec(container_id, "ps aux --no-headers 2>/dev/null || ps aux 2>/dev/null")
        .await
    {
        return output
            .stdout
            .lines()
            .take(PROCESS_CAP)
            .map(|l| l.trim().to_string())
            .collect();
    }
    Vec::new()
}

async fn capture_system_info(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    state: &mut SystemState,
) {
    if let Ok(output) = runtime
        .exec(container_id, "cat /etc/os-release 2>/dev/null")
        .await
    {
        for line in output.stdout.lines() {
            if let Some((key, value)) = line.split_once('=') {
                state
                    .os_release
                    .insert(key.to_string(), value.trim_matches('"').to_string());
            }
        }
    }

    if let Ok(output) = runtime.exec(container_id, "uname -r 2>/dev/null").await {
        let kernel = output.stdout.trim();
        if !kernel.is_empty() {
            state.kernel = Some(kernel.to_string());
        }
    }

    if let Ok(output) = runtime
        .exec(container_id, "free -m 2>/dev/null | grep Mem")
        .await
    {
        let parts: Vec<&str> = output.stdout.split_whitespace().collect();
        if parts.len() >= 2 {
            state.memory_total_mb = parts[1].parse().ok();
        }
    }
}

/// Structured comparison of two snapshots.
pub fn diff_states(before: &SystemState, after: &SystemState) -> StateDiff {
    let mut diff = StateDiff::default();

    for (package, version) in &after.packages {
        match before.packages.get(package) {
            None => {
                diff.added_packages.insert(package.clone(), version.clone());
            }
            Some(before_version) if before_version != version => {
                diff.updated_packages.push(PackageChange {
                    package: package.clone(),
                    before_version: before_version.clone(),
                    after_version: version.clone(),
                });
            }
            Some(_) => {}
        }
    }
    for (package, version) in &before.packages {
        if !after.packages.contains_key(package) {
            diff.removed_packages.insert(package.clone(), version.clone());
        }
    }

    for service in after.services.keys() {
        if !before.services.contains_key(service) {
            diff.started_services.push(service.clone());
        }
    }
    for service in before.services.keys() {
        if !after.services.contains_key(service) {
            diff.stopped_services.push(service.clone());
        }
    }

    for (path, before_meta) in &before.files {
        if let Some(after_meta) = after.files.get(path) {
            if before_meta != after_meta {
                diff.modified_files.push(path.clone());
            }
        }
    }

    diff.interfaces_changed = before.interfaces != after.interfaces;
    diff.listening_ports_changed = before.listening_ports != after.listening_ports;

    diff.has_changes = !diff.added_packages.is_empty()
        || !diff.removed_packages.is_empty()
        || !diff.updated_packages.is_empty()
        || !diff.started_services.is_empty()
        || !diff.stopped_services.is_empty()
        || !diff.modified_files.is_empty();

    diff
}
