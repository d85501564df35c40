//! SSH tunnel supervisor.
//!
//! Owns the one SSH subprocess: resolves the pod's public SSH endpoint,
//! launches the client with a local port-forward per forwarding app plus
//! the remote status command, and ingests the telemetry stream line by
//! line. Telemetry drives the CPU/GPU side of the demand signal. Any
//! failure is logged and retried after a backoff; nothing here may crash
//! the process.

use crate::config::SshConfig;
use crate::controlplane::{ControlPlane, ControlPlaneError};
use crate::state::{GlobalState, SshState};
use crate::telemetry::UtilizationSample;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Poll interval while SSH is not needed
const IDLE_POLL: Duration = Duration::from_secs(30);
/// Backoff after an endpoint-resolution or connection failure
const FAILURE_BACKOFF: Duration = Duration::from_secs(30);
/// Cooldown after the subprocess exits before reconnecting
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
    #[error("SSH IP or port not available yet")]
    EndpointUnavailable,
    #[error("failed to launch ssh: {0}")]
    Launch(std::io::Error),
}

enum StreamEnd {
    /// Subprocess output ended (connection dropped or remote command exited)
    Eof,
    /// Application shutdown requested
    Shutdown,
}

/// Supervises the SSH subprocess lifecycle: Idle -> Connecting ->
/// Streaming -> Closing -> Idle.
pub struct TunnelSupervisor<C> {
    control_plane: Arc<C>,
    state: Arc<GlobalState>,
    config: SshConfig,
    pod_name: String,
    forward_ports: Vec<u16>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<C: ControlPlane> TunnelSupervisor<C> {
    pub fn new(
        control_plane: Arc<C>,
        state: Arc<GlobalState>,
        config: SshConfig,
        pod_name: String,
        forward_ports: Vec<u16>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            control_plane,
            state,
            config,
            pod_name,
            forward_ports,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let need_ssh = self.state.pod.lock().need_ssh;
            if !need_ssh {
                if self.sleep_or_shutdown(IDLE_POLL).await {
                    break;
                }
                continue;
            }

            match self.connect_and_stream().await {
                Ok(StreamEnd::Shutdown) => break,
                Ok(StreamEnd::Eof) => {
                    info!("SSH connection closed");
                    if self.sleep_or_shutdown(RECONNECT_COOLDOWN).await {
                        break;
                    }
                }
                Err(TunnelError::EndpointUnavailable) => {
                    warn!("SSH IP or port not found, retrying");
                    if self.sleep_or_shutdown(FAILURE_BACKOFF).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Error in SSH monitoring");
                    self.state.ssh.lock().ssh_running = false;
                    if self.sleep_or_shutdown(FAILURE_BACKOFF).await {
                        break;
                    }
                }
            }
        }

        debug!("Tunnel supervisor stopped");
    }

    /// Sleep for `duration`, returning true if shutdown was requested.
    async fn sleep_or_shutdown(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown_rx.changed() => *self.shutdown_rx.borrow(),
        }
    }

    async fn connect_and_stream(&mut self) -> Result<StreamEnd, TunnelError> {
        let pod = self.control_plane.find_pod(&self.pod_name).await?;
        let endpoint = pod
            .and_then(|p| p.ssh_endpoint())
            .ok_or(TunnelError::EndpointUnavailable)?;

        self.state.ssh.lock().endpoint = Some(endpoint.clone());

        if let Some(start) = self.state.pod.lock().pod_start_time {
            if let Ok(elapsed) = start.elapsed() {
                debug!(secs = elapsed.as_secs(), "Seconds since pod start");
            }
        }
        info!(ip = %endpoint.ip, port = endpoint.port, "Establishing SSH connection to pod");

        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "ServerAliveInterval=60",
            "-o",
            "ServerAliveCountMax=3",
            "-o",
            "ConnectTimeout=10",
        ]);
        for port in &self.forward_ports {
            cmd.arg("-L").arg(format!("{port}:127.0.0.1:{port}"));
        }
        cmd.arg("-p").arg(endpoint.port.to_string());
        cmd.arg(format!("{}@{}", self.config.user, endpoint.ip));
        cmd.arg(&self.config.status_command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(TunnelError::Launch)?;
        let pid = child.id().unwrap_or(0);
        info!(pid, "SSH client launched");

        // Running as soon as the process is launched, not once data arrives
        self.state.ssh.lock().ssh_running = true;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(line = %line, "ssh stderr");
                }
            });
        }

        let stdout = child.stdout.take().expect("stdout is piped");
        let mut lines = BufReader::new(stdout).lines();
        let mut last_was_active: Option<bool> = None;

        let end = loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => self.ingest_line(&line, &mut last_was_active),
                        Ok(None) => break StreamEnd::Eof,
                        Err(e) => {
                            warn!(error = %e, "Error reading SSH output");
                            break StreamEnd::Eof;
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break StreamEnd::Shutdown;
                    }
                }
            }
        };

        self.state.ssh.lock().ssh_running = false;

        match end {
            StreamEnd::Eof => {
                let _ = child.wait().await;
            }
            StreamEnd::Shutdown => {
                let _ = child.kill().await;
            }
        }

        Ok(end)
    }

    /// Decode one line of telemetry and fold it into shared state. Bad
    /// lines are logged and discarded; they never end the stream.
    fn ingest_line(&self, line: &str, last_was_active: &mut Option<bool>) {
        debug!(line = %line, "SSH output");

        let sample = match UtilizationSample::parse(line) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, line = %line, "Failed to decode telemetry line, skipping");
                return;
            }
        };

        let mut ssh = self.state.ssh.lock();
        let active = apply_sample(&mut ssh, sample, &self.config);
        check_cpu_idle(&mut ssh, self.config.shutdown_timeout());
        drop(ssh);

        if *last_was_active != Some(active) {
            info!(
                status = if active { "active" } else { "idle" },
                "CPU/GPU status changed"
            );
            *last_was_active = Some(active);
        }
    }
}

/// Overwrite the utilization fields with the new sample and update
/// activity-driven demand. Returns whether the sample counted as active.
fn apply_sample(ssh: &mut SshState, sample: UtilizationSample, config: &SshConfig) -> bool {
    ssh.cpu_util = sample.cpu_util;
    ssh.gpu_util = sample.gpu_util;
    ssh.cpu_mem_gb = sample.cpu_mem_gb;
    ssh.gpu_mem_gb = sample.gpu_mem_gb;

    let active = sample.is_active(config.cpu_util_threshold, config.gpu_util_threshold);
    if active {
        if !ssh.need_pod {
            info!(
                cpu_util = format_args!("{:.0}%", ssh.cpu_util),
                gpu_util = format_args!("{:.0}%", ssh.gpu_util),
                "CPU/GPU activity detected, pod is needed"
            );
            ssh.need_pod = true;
        }
        ssh.last_activity = Some(Instant::now());
    }
    active
}

/// Clear telemetry-driven demand once activity has been quiet past the
/// timeout. Independent of the web-traffic idle path.
fn check_cpu_idle(ssh: &mut SshState, timeout: Duration) {
    let idle = ssh.last_activity.map_or(true, |t| t.elapsed() > timeout);
    if idle && ssh.need_pod {
        info!("CPU and GPU idle past timeout, clearing pod demand");
        ssh.need_pod = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SshConfig {
        SshConfig {
            cpu_util_threshold: 50.0,
            gpu_util_threshold: 80.0,
            ..SshConfig::default()
        }
    }

    fn sample(cpu: f64, gpu: f64) -> UtilizationSample {
        UtilizationSample::parse(&format!(
            r#"{{"cpu_util": {cpu}, "gpu_util": {gpu}, "cpu_mem_gb": 2.1, "gpu_mem_gb": 10.0}}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_gpu_activity_sets_demand() {
        let mut ssh = SshState::default();
        let active = apply_sample(&mut ssh, sample(5.0, 95.0), &config());
        assert!(active);
        assert!(ssh.need_pod);
        assert!(ssh.last_activity.is_some());
        assert_eq!(ssh.gpu_util, 95.0);
        assert_eq!(ssh.cpu_mem_gb, 2.1);
    }

    #[test]
    fn test_quiet_sample_does_not_set_demand() {
        let mut ssh = SshState::default();
        let active = apply_sample(&mut ssh, sample(5.0, 3.0), &config());
        assert!(!active);
        assert!(!ssh.need_pod);
        assert!(ssh.last_activity.is_none());
        // Utilization fields are still overwritten
        assert_eq!(ssh.cpu_util, 5.0);
    }

    #[test]
    fn test_active_sample_refreshes_activity() {
        let mut ssh = SshState::default();
        apply_sample(&mut ssh, sample(90.0, 0.0), &config());
        let first = ssh.last_activity.unwrap();
        apply_sample(&mut ssh, sample(90.0, 0.0), &config());
        assert!(ssh.last_activity.unwrap() >= first);
        assert!(ssh.need_pod);
    }

    #[test]
    fn test_idle_past_timeout_clears_demand() {
        let mut ssh = SshState::default();
        ssh.need_pod = true;
        ssh.last_activity = Some(Instant::now() - Duration::from_secs(3600));
        check_cpu_idle(&mut ssh, Duration::from_secs(1800));
        assert!(!ssh.need_pod);
    }

    #[test]
    fn test_recent_activity_keeps_demand() {
        let mut ssh = SshState::default();
        ssh.need_pod = true;
        ssh.last_activity = Some(Instant::now());
        check_cpu_idle(&mut ssh, Duration::from_secs(1800));
        assert!(ssh.need_pod);
    }

    #[test]
    fn test_idle_check_is_noop_without_demand() {
        let mut ssh = SshState::default();
        check_cpu_idle(&mut ssh, Duration::from_secs(1800));
        assert!(!ssh.need_pod);
    }

    #[test]
    fn test_activity_sequence() {
        // need_pod must flip on the first threshold-crossing sample and
        // survive quiet samples until the idle timeout passes
        let mut ssh = SshState::default();
        let cfg = config();
        let timeout = Duration::from_secs(1800);

        apply_sample(&mut ssh, sample(0.0, 0.0), &cfg);
        check_cpu_idle(&mut ssh, timeout);
        assert!(!ssh.need_pod);

        apply_sample(&mut ssh, sample(60.0, 0.0), &cfg);
        check_cpu_idle(&mut ssh, timeout);
        assert!(ssh.need_pod);

        apply_sample(&mut ssh, sample(0.0, 0.0), &cfg);
        check_cpu_idle(&mut ssh, timeout);
        assert!(ssh.need_pod, "quiet sample within timeout keeps demand");
    }
}
