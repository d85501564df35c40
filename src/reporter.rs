//! Periodic status reporter.
//!
//! Emits one structured status line at least every minute, and immediately
//! whenever the pod or tunnel state flips. Quiet periods with nothing
//! running are reported at debug so an idle deployment does not spam the
//! log.

use crate::state::GlobalState;
use crate::status::format_minutes_ago;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

const TICK: Duration = Duration::from_secs(1);
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

pub struct StatusReporter {
    state: Arc<GlobalState>,
    shutdown_rx: watch::Receiver<bool>,
    last_report: Option<Instant>,
    last_pod_running: bool,
    last_ssh_running: bool,
}

impl StatusReporter {
    pub fn new(state: Arc<GlobalState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            state,
            shutdown_rx,
            last_report: None,
            last_pod_running: false,
            last_ssh_running: false,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TICK) => self.tick(),
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Status reporter stopped");
    }

    fn tick(&mut self) {
        let pod_running = self.state.pod.lock().pod_running;
        let ssh_running = self.state.ssh_running();

        if !self.due(pod_running, ssh_running) {
            return;
        }
        self.last_report = Some(Instant::now());
        let changed = pod_running != self.last_pod_running || ssh_running != self.last_ssh_running;
        self.last_pod_running = pod_running;
        self.last_ssh_running = ssh_running;

        let (cpu_util, gpu_util, cpu_mem_gb, gpu_mem_gb, last_activity) = {
            let ssh = self.state.ssh.lock();
            (
                ssh.cpu_util,
                ssh.gpu_util,
                ssh.cpu_mem_gb,
                ssh.gpu_mem_gb,
                ssh.last_activity,
            )
        };
        let last_web = format_minutes_ago(self.state.latest_web_activity());
        let last_cpu_gpu = format_minutes_ago(last_activity);

        if pod_running || ssh_running || changed {
            info!(
                pod_running,
                ssh_running,
                last_web_activity = %last_web,
                cpu_util = format_args!("{cpu_util:.0}%"),
                gpu_util = format_args!("{gpu_util:.0}%"),
                cpu_mem_gb = format_args!("{cpu_mem_gb:.1}"),
                gpu_mem_gb = format_args!("{gpu_mem_gb:.1}"),
                last_cpu_gpu_activity = %last_cpu_gpu,
                "status"
            );
        } else {
            debug!(
                pod_running,
                ssh_running,
                last_web_activity = %last_web,
                "status"
            );
        }
    }

    /// Report on any state flip, otherwise on the periodic interval.
    fn due(&self, pod_running: bool, ssh_running: bool) -> bool {
        pod_running != self.last_pod_running
            || ssh_running != self.last_ssh_running
            || self.last_report.map_or(true, |t| t.elapsed() >= REPORT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn reporter() -> StatusReporter {
        let apps = vec![AppConfig {
            name: "control".to_string(),
            local_port: 8080,
            remote_port: 0,
        }];
        let state = GlobalState::new(&apps, false).unwrap();
        let (_tx, rx) = watch::channel(false);
        StatusReporter::new(state, rx)
    }

    #[test]
    fn test_first_tick_reports() {
        let r = reporter();
        assert!(r.due(false, false));
    }

    #[test]
    fn test_fresh_report_suppresses_until_interval() {
        let mut r = reporter();
        r.last_report = Some(Instant::now());
        assert!(!r.due(false, false));
    }

    #[test]
    fn test_state_flip_reports_immediately() {
        let mut r = reporter();
        r.last_report = Some(Instant::now());
        assert!(r.due(true, false));
        assert!(r.due(false, true));
    }

    #[test]
    fn test_stale_report_is_due_again() {
        let mut r = reporter();
        r.last_report = Some(Instant::now() - REPORT_INTERVAL);
        assert!(r.due(false, false));
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let apps = vec![AppConfig {
            name: "control".to_string(),
            local_port: 8080,
            remote_port: 0,
        }];
        let state = GlobalState::new(&apps, false).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(StatusReporter::new(state, shutdown_rx).run());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter did not stop on shutdown")
            .unwrap();
    }

    #[test]
    fn test_tick_updates_tracking() {
        let mut r = reporter();
        r.state.pod.lock().pod_running = true;
        r.tick();
        assert!(r.last_pod_running);
        assert!(r.last_report.is_some());
        assert!(!r.due(true, false));
    }
}
