//! Pod lifecycle controller.
//!
//! Drives the pod through Stopped -> Starting -> Running -> Stopping based
//! on the aggregated demand predicate, reconciles local belief against the
//! control plane on a bounded interval, and runs the configured maintenance
//! commands while the pod is up. A failed cycle forces the pod state down
//! and retries after a backoff; the loop itself never exits on error.

use crate::config::{Config, PeriodicTaskConfig};
use crate::controlplane::{ControlPlane, ControlPlaneError};
use crate::state::GlobalState;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const TICK: Duration = Duration::from_secs(10);
const FAILURE_BACKOFF: Duration = Duration::from_secs(30);

pub struct LifecycleController<C> {
    control_plane: Arc<C>,
    state: Arc<GlobalState>,
    pod_name: String,
    template_id: String,
    startup_wait: Duration,
    check_pod_interval: Duration,
    tasks: Vec<PeriodicTaskConfig>,
    task_last_run: Vec<Option<Instant>>,
    last_reconcile: Option<Instant>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<C: ControlPlane> LifecycleController<C> {
    pub fn new(
        control_plane: Arc<C>,
        state: Arc<GlobalState>,
        config: &Config,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let task_last_run = vec![None; config.periodic_tasks.len()];
        Self {
            control_plane,
            state,
            pod_name: config.control_plane.pod_name.clone(),
            template_id: config.control_plane.template_id.clone(),
            startup_wait: config.web.startup_wait(),
            check_pod_interval: config.web.check_pod_interval(),
            tasks: config.periodic_tasks.clone(),
            task_last_run,
            last_reconcile: None,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let backoff = match self.run_cycle().await {
                Ok(()) => TICK,
                Err(e) => {
                    error!(error = %e, "Error in pod monitoring");
                    // Fail safe: assume the pod is down until reconciled
                    let mut pod = self.state.pod.lock();
                    pod.pod_running = false;
                    pod.need_ssh = false;
                    drop(pod);
                    FAILURE_BACKOFF
                }
            };

            if self.sleep_or_shutdown(backoff).await {
                break;
            }
        }

        debug!("Lifecycle controller stopped");
    }

    async fn sleep_or_shutdown(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown_rx.changed() => *self.shutdown_rx.borrow(),
        }
    }

    /// One control cycle: reconcile, then converge pod state on demand.
    pub async fn run_cycle(&mut self) -> Result<(), ControlPlaneError> {
        if self
            .last_reconcile
            .map_or(true, |t| t.elapsed() >= self.check_pod_interval)
        {
            self.reconcile().await?;
            self.last_reconcile = Some(Instant::now());
        }

        let need = self.state.need_pod();
        let running = self.state.pod.lock().pod_running;

        if need && !running {
            self.start_pod().await?;
        } else if !need && running {
            self.stop_pod().await?;
        } else if running {
            self.run_due_tasks().await;
        }

        Ok(())
    }

    /// Ask the control plane what is actually true and overwrite local
    /// belief with it.
    async fn reconcile(&mut self) -> Result<(), ControlPlaneError> {
        let pod = self.control_plane.find_pod(&self.pod_name).await?;
        let running = pod.map_or(false, |p| p.is_running());

        let mut state = self.state.pod.lock();
        if state.pod_running != running {
            info!(running, "Pod state reconciled against control plane");
        }
        state.pod_running = running;
        state.need_ssh = running;
        if !running {
            state.pod_start_time = None;
        }
        Ok(())
    }

    /// Resume the pod if it exists, create it from the template otherwise,
    /// then hold SSH back for the startup grace period.
    async fn start_pod(&mut self) -> Result<(), ControlPlaneError> {
        match self.control_plane.find_pod(&self.pod_name).await? {
            Some(pod) => {
                info!(id = %pod.id, "Resuming pod");
                self.control_plane.resume_pod(&pod.id).await?;
            }
            None => {
                info!(name = %self.pod_name, template = %self.template_id, "Creating pod");
                self.control_plane
                    .create_pod(&self.pod_name, &self.template_id)
                    .await?;
            }
        }

        {
            let mut pod = self.state.pod.lock();
            pod.pod_running = true;
            pod.pod_start_time = Some(SystemTime::now());
        }

        info!(
            secs = self.startup_wait.as_secs(),
            "Pod started, waiting before SSH"
        );
        if !self.sleep_or_shutdown(self.startup_wait).await {
            self.state.pod.lock().need_ssh = true;
        }
        Ok(())
    }

    async fn stop_pod(&mut self) -> Result<(), ControlPlaneError> {
        info!("No demand for pod, terminating");
        match self.control_plane.find_pod(&self.pod_name).await? {
            Some(pod) => self.control_plane.terminate_pod(&pod.id).await?,
            None => warn!(name = %self.pod_name, "Pod already gone from control plane"),
        }

        let mut pod = self.state.pod.lock();
        pod.pod_running = false;
        pod.pod_start_time = None;
        pod.need_ssh = false;
        Ok(())
    }

    /// Run every maintenance task whose interval has elapsed. Task failures
    /// are logged and never fail the cycle.
    async fn run_due_tasks(&mut self) {
        for (i, task) in self.tasks.iter().enumerate() {
            let due = self.task_last_run[i]
                .map_or(true, |t| t.elapsed() >= Duration::from_secs(task.interval_secs));
            if !due {
                continue;
            }
            self.task_last_run[i] = Some(Instant::now());
            run_task(task).await;
        }
    }
}

async fn run_task(task: &PeriodicTaskConfig) {
    debug!(task = %task.name, command = %task.command, "Running periodic task");
    let output = match Command::new("sh").arg("-c").arg(&task.command).output().await {
        Ok(output) => output,
        Err(e) => {
            error!(task = %task.name, error = %e, "Failed to launch periodic task");
            return;
        }
    };

    if output.status.success() {
        debug!(task = %task.name, "Periodic task succeeded");
        return;
    }

    error!(
        task = %task.name,
        code = output.status.code().unwrap_or(-1),
        "Periodic task failed"
    );
    for line in String::from_utf8_lossy(&output.stdout)
        .lines()
        .chain(String::from_utf8_lossy(&output.stderr).lines())
    {
        error!(task = %task.name, line = %line, "task output");
    }
}
