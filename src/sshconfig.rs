//! Keeps a `~/.ssh/config` Host block pointed at the pod.
//!
//! When the tunnel comes up, the `HostName` and `Port` lines of the
//! configured Host block are rewritten to the pod's current endpoint so a
//! plain `ssh <alias>` keeps working across pod restarts. Strictly
//! fire-and-forget: every failure is logged and the next tunnel-up edge
//! tries again.

use crate::state::{GlobalState, SshEndpoint};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const TICK: Duration = Duration::from_secs(5);

pub async fn run(state: Arc<GlobalState>, host: String, mut shutdown_rx: watch::Receiver<bool>) {
    let mut was_running = false;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(TICK) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        }

        let running = state.ssh_running();
        if running && !was_running {
            if let Some(endpoint) = state.ssh.lock().endpoint.clone() {
                update_home_config(&host, &endpoint);
            }
        }
        was_running = running;
    }
    debug!("SSH config updater stopped");
}

fn update_home_config(host: &str, endpoint: &SshEndpoint) {
    let Some(path) = config_path() else {
        warn!("Could not determine home directory, skipping ssh config update");
        return;
    };
    match apply_update(&path, host, endpoint) {
        Ok(true) => {
            info!(host, ip = %endpoint.ip, port = endpoint.port, "Updated ssh config")
        }
        Ok(false) => debug!(host, "ssh config already up to date"),
        Err(e) => warn!(host, error = %e, "Failed to update ssh config"),
    }
}

fn config_path() -> Option<PathBuf> {
    dirs_next::home_dir().map(|h| h.join(".ssh").join("config"))
}

/// Rewrite in place with a config.new / config.old rotation so a crash
/// mid-update never leaves a truncated config behind.
fn apply_update(path: &Path, host: &str, endpoint: &SshEndpoint) -> io::Result<bool> {
    let content = std::fs::read_to_string(path)?;
    let updated = rewrite_config(&content, host, endpoint.ip.as_str(), endpoint.port);
    if updated == content {
        return Ok(false);
    }

    let new_path = path.with_file_name("config.new");
    let old_path = path.with_file_name("config.old");
    std::fs::write(&new_path, &updated)?;
    std::fs::rename(path, &old_path)?;
    std::fs::rename(&new_path, path)?;
    Ok(true)
}

/// Rewrite the `HostName` and `Port` lines inside the matching `Host`
/// block, leaving every other line (and all indentation) untouched.
fn rewrite_config(content: &str, host: &str, ip: &str, port: u16) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_block = false;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("Host ") {
            in_block = rest.split_whitespace().any(|h| h == host);
            out.push(line.to_string());
            continue;
        }
        if in_block {
            let indent = &line[..line.len() - trimmed.len()];
            if trimmed.starts_with("HostName") {
                out.push(format!("{indent}HostName {ip}"));
                continue;
            }
            if trimmed.starts_with("Port") {
                out.push(format!("{indent}Port {port}"));
                continue;
            }
        }
        out.push(line.to_string());
    }

    let mut result = out.join("\n");
    if content.ends_with('\n') {
        result.push('\n');
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = "\
Host other
    HostName other.example.com
    Port 22

Host gpu-pod
    HostName 198.51.100.1
    Port 40000
    User root

Host last
    HostName last.example.com
";

    fn endpoint() -> SshEndpoint {
        SshEndpoint {
            ip: "203.0.113.7".to_string(),
            port: 41022,
        }
    }

    #[test]
    fn test_rewrites_only_target_block() {
        let updated = rewrite_config(CONFIG, "gpu-pod", "203.0.113.7", 41022);
        assert!(updated.contains("    HostName 203.0.113.7\n    Port 41022\n    User root"));
        assert!(updated.contains("Host other\n    HostName other.example.com\n    Port 22"));
        assert!(updated.contains("HostName last.example.com"));
        assert!(updated.ends_with('\n'));
    }

    #[test]
    fn test_unchanged_content_is_identical() {
        let updated = rewrite_config(CONFIG, "gpu-pod", "198.51.100.1", 40000);
        assert_eq!(updated, CONFIG);
    }

    #[test]
    fn test_missing_host_block_changes_nothing() {
        let updated = rewrite_config(CONFIG, "no-such-host", "203.0.113.7", 41022);
        assert_eq!(updated, CONFIG);
    }

    #[test]
    fn test_host_line_with_multiple_aliases() {
        let config = "Host gpu gpu-pod\n    HostName 1.2.3.4\n    Port 1\n";
        let updated = rewrite_config(config, "gpu-pod", "203.0.113.7", 41022);
        assert_eq!(
            updated,
            "Host gpu gpu-pod\n    HostName 203.0.113.7\n    Port 41022\n"
        );
    }

    #[test]
    fn test_apply_update_rotates_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, CONFIG).unwrap();

        let changed = apply_update(&path, "gpu-pod", &endpoint()).unwrap();
        assert!(changed);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("HostName 203.0.113.7"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("config.old")).unwrap(),
            CONFIG
        );

        // Second run sees nothing to do
        assert!(!apply_update(&path, "gpu-pod", &endpoint()).unwrap());
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let apps = vec![crate::config::AppConfig {
            name: "control".to_string(),
            local_port: 8080,
            remote_port: 0,
        }];
        let state = GlobalState::new(&apps, false).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(state, "gpu-pod".to_string(), shutdown_rx));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("updater did not stop on shutdown")
            .unwrap();
    }

    #[test]
    fn test_apply_update_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        assert!(apply_update(&path, "gpu-pod", &endpoint()).is_err());
    }
}
