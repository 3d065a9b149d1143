//! The sidecar portfile: `<db-parent>/.agrafes_sidecar.json`, written on
//! `serve` startup and removed on clean shutdown. `serve`/`status`/
//! `shutdown` all consult it to find (or avoid colliding with) a running
//! sidecar.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfile {
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub started_at: String,
    pub db_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn portfile_path(db_parent: &Path) -> PathBuf {
    db_parent.join(".agrafes_sidecar.json")
}

pub fn write(db_parent: &Path, portfile: &Portfile) -> Result<()> {
    std::fs::create_dir_all(db_parent)?;
    let path = portfile_path(db_parent);
    let json = serde_json::to_string_pretty(portfile)?;
    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))
}

pub fn read(db_parent: &Path) -> Result<Option<Portfile>> {
    let path = portfile_path(db_parent);
    if !path.is_file() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

pub fn remove(db_parent: &Path) -> Result<()> {
    let path = portfile_path(db_parent);
    if path.is_file() {
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SidecarState {
    /// No portfile present; no sidecar known to be running.
    Missing,
    /// Portfile present and the recorded pid is alive.
    Running,
    /// Portfile present but the recorded pid is not alive; the file is
    /// stale and safe to remove before starting a new sidecar.
    Stale,
}

/// Classify the sidecar's apparent state from its portfile: `missing` (no
/// file), `running` (file present, pid alive, `/health` answers OK within
/// ~600ms), or `stale` (file present but the pid is dead, the portfile is
/// malformed, or `/health` is unreachable/non-OK).
pub async fn inspect_state(db_parent: &Path) -> Result<SidecarState> {
    let Some(portfile) = read(db_parent)? else {
        return Ok(SidecarState::Missing);
    };
    if !pid_is_alive(portfile.pid) {
        return Ok(SidecarState::Stale);
    }
    if health_check_ok(&portfile).await {
        Ok(SidecarState::Running)
    } else {
        Ok(SidecarState::Stale)
    }
}

const HEALTH_CHECK_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(600);

async fn health_check_ok(portfile: &Portfile) -> bool {
    let url = format!("http://{}:{}/health", portfile.host, portfile.port);
    let client = match reqwest::Client::builder()
        .timeout(HEALTH_CHECK_TIMEOUT)
        .build()
    {
        Ok(c) => c,
        Err(_) => return false,
    };
    match client.get(&url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    // Signal 0 performs no actual signal delivery; it only checks whether
    // the process exists and is addressable by us.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    // Conservatively assume the process might still be running; the
    // sidecar is developed and deployed on unix hosts.
    true
}
