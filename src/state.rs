//! Shared runtime state for the gateway.
//!
//! One `GlobalState` exists for the lifetime of the process. Monitor loops
//! and request handlers share it behind `Arc`; every record is guarded by a
//! `parking_lot::Mutex` and no caller holds a lock across an await point,
//! so readers always observe a committed value.

use crate::config::{AppConfig, ConfigError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::info;

/// Resolved SSH endpoint of the pod (public IP + mapped port 22).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub ip: String,
    pub port: u16,
}

/// Pod lifecycle bookkeeping, reconciled against the control plane.
#[derive(Debug, Default)]
pub struct PodState {
    /// Believed-running flag; optimistic between reconciliation polls
    pub pod_running: bool,
    /// When the pod was last started (None if not running)
    pub pod_start_time: Option<SystemTime>,
    /// SSH is attempted only while this is set
    pub need_ssh: bool,
}

/// Tunnel status and the most recent telemetry sample.
#[derive(Debug, Default)]
pub struct SshState {
    pub ssh_running: bool,
    pub endpoint: Option<SshEndpoint>,
    /// Percent, summed across cores (may exceed 100)
    pub cpu_util: f64,
    /// Percent, summed across GPUs (may exceed 100)
    pub gpu_util: f64,
    pub cpu_mem_gb: f64,
    pub gpu_mem_gb: f64,
    /// Last time a telemetry sample crossed an activity threshold
    pub last_activity: Option<Instant>,
    /// Telemetry-driven demand for the pod
    pub need_pod: bool,
}

/// Mutable per-application demand tracking.
#[derive(Debug, Default)]
struct ProxyActivity {
    need_pod: bool,
    /// None means "never", including after an immediate-shutdown request
    last_web_activity: Option<Instant>,
    scheduled_shutdown: Option<SystemTime>,
}

/// One configured application: immutable identity plus guarded activity.
pub struct ProxyState {
    pub name: String,
    pub local_port: u16,
    /// 0 marks the control app (status/shutdown surface, no forwarding)
    pub remote_port: u16,
    activity: Mutex<ProxyActivity>,
}

impl ProxyState {
    fn new(config: &AppConfig) -> Self {
        Self {
            name: config.name.clone(),
            local_port: config.local_port,
            remote_port: config.remote_port,
            activity: Mutex::new(ProxyActivity::default()),
        }
    }

    pub fn is_control(&self) -> bool {
        self.remote_port == 0
    }

    /// Record demand from an inbound request. Returns true when this request
    /// flipped the proxy from idle to needed.
    pub fn record_web_activity(&self) -> bool {
        let mut activity = self.activity.lock();
        let became_needed = !activity.need_pod;
        activity.need_pod = true;
        activity.last_web_activity = Some(Instant::now());
        became_needed
    }

    /// Refresh the activity timestamp without touching demand (used per
    /// forwarded WebSocket frame).
    pub fn touch(&self) {
        self.activity.lock().last_web_activity = Some(Instant::now());
    }

    pub fn need_pod(&self) -> bool {
        self.activity.lock().need_pod
    }

    pub fn clear_need_pod(&self) {
        self.activity.lock().need_pod = false;
    }

    pub fn last_web_activity(&self) -> Option<Instant> {
        self.activity.lock().last_web_activity
    }

    /// Drop the activity timestamp so the next idle tick clears demand.
    pub fn force_idle(&self) {
        self.activity.lock().last_web_activity = None;
    }

    pub fn scheduled_shutdown(&self) -> Option<SystemTime> {
        self.activity.lock().scheduled_shutdown
    }

    pub fn set_scheduled_shutdown(&self, at: SystemTime) {
        self.activity.lock().scheduled_shutdown = Some(at);
    }

    pub fn clear_scheduled_shutdown(&self) {
        self.activity.lock().scheduled_shutdown = None;
    }

    /// True when web activity is older than `timeout` (or never happened).
    pub fn web_idle_for(&self, timeout: Duration) -> bool {
        self.activity
            .lock()
            .last_web_activity
            .map_or(true, |t| t.elapsed() > timeout)
    }

    fn seed_running(&self) {
        let mut activity = self.activity.lock();
        activity.need_pod = true;
        activity.last_web_activity = Some(Instant::now());
    }
}

/// Process-wide shared state, constructed once at startup.
pub struct GlobalState {
    pub pod: Mutex<PodState>,
    pub ssh: Mutex<SshState>,
    pub proxies: Vec<Arc<ProxyState>>,
}

impl GlobalState {
    /// Build the state tree from configuration and the control plane's
    /// current truth. A pod that is already running is kept running: demand
    /// is seeded on every proxy and activity is seeded to "now" so the idle
    /// check does not fire spuriously at startup.
    pub fn new(apps: &[AppConfig], initially_running: bool) -> Result<Arc<Self>, ConfigError> {
        let control_count = apps.iter().filter(|a| a.remote_port == 0).count();
        if control_count != 1 {
            return Err(ConfigError::ControlAppCount(control_count));
        }

        let proxies: Vec<Arc<ProxyState>> =
            apps.iter().map(|a| Arc::new(ProxyState::new(a))).collect();

        let state = Arc::new(Self {
            pod: Mutex::new(PodState {
                pod_running: initially_running,
                pod_start_time: initially_running.then(SystemTime::now),
                need_ssh: initially_running,
            }),
            ssh: Mutex::new(SshState::default()),
            proxies,
        });

        if initially_running {
            info!("pod already running at startup, keeping it up");
            for proxy in &state.proxies {
                proxy.seed_running();
            }
        }

        Ok(state)
    }

    /// The aggregated demand predicate: recomputed on every call, never
    /// cached.
    pub fn need_pod(&self) -> bool {
        self.ssh.lock().need_pod || self.proxies.iter().any(|p| p.need_pod())
    }

    pub fn ssh_running(&self) -> bool {
        self.ssh.lock().ssh_running
    }

    pub fn control_proxy(&self) -> &Arc<ProxyState> {
        self.proxies
            .iter()
            .find(|p| p.is_control())
            .expect("constructor guarantees exactly one control app")
    }

    pub fn forwarding_proxies(&self) -> impl Iterator<Item = &Arc<ProxyState>> {
        self.proxies.iter().filter(|p| !p.is_control())
    }

    /// Mark every proxy idle so the next idle tick clears all demand.
    pub fn force_all_idle(&self) {
        for proxy in &self.proxies {
            proxy.force_idle();
        }
    }

    /// Most recent web activity across all proxies.
    pub fn latest_web_activity(&self) -> Option<Instant> {
        self.proxies
            .iter()
            .filter_map(|p| p.last_web_activity())
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apps() -> Vec<AppConfig> {
        vec![
            AppConfig {
                name: "control".to_string(),
                local_port: 8080,
                remote_port: 0,
            },
            AppConfig {
                name: "comfyui".to_string(),
                local_port: 8188,
                remote_port: 8188,
            },
            AppConfig {
                name: "jupyter".to_string(),
                local_port: 8888,
                remote_port: 8888,
            },
        ]
    }

    #[test]
    fn test_constructor_enforces_single_control_app() {
        let mut two_controls = apps();
        two_controls[1].remote_port = 0;
        assert!(matches!(
            GlobalState::new(&two_controls, false),
            Err(ConfigError::ControlAppCount(2))
        ));

        let no_control: Vec<_> = apps().into_iter().filter(|a| a.remote_port != 0).collect();
        assert!(matches!(
            GlobalState::new(&no_control, false),
            Err(ConfigError::ControlAppCount(0))
        ));
    }

    #[test]
    fn test_need_pod_aggregates_all_sources() {
        let state = GlobalState::new(&apps(), false).unwrap();
        assert!(!state.need_pod());

        state.proxies[1].record_web_activity();
        assert!(state.need_pod());

        state.proxies[1].clear_need_pod();
        assert!(!state.need_pod());

        state.ssh.lock().need_pod = true;
        assert!(state.need_pod());

        state.ssh.lock().need_pod = false;
        assert!(!state.need_pod());
    }

    #[test]
    fn test_startup_seeding_when_pod_running() {
        let state = GlobalState::new(&apps(), true).unwrap();
        assert!(state.pod.lock().pod_running);
        assert!(state.pod.lock().need_ssh);
        assert!(state.pod.lock().pod_start_time.is_some());
        for proxy in &state.proxies {
            assert!(proxy.need_pod());
            assert!(proxy.last_web_activity().is_some());
        }
    }

    #[test]
    fn test_startup_without_pod_is_all_idle() {
        let state = GlobalState::new(&apps(), false).unwrap();
        assert!(!state.pod.lock().pod_running);
        assert!(!state.need_pod());
        assert!(state.latest_web_activity().is_none());
    }

    #[test]
    fn test_record_web_activity_reports_transition() {
        let state = GlobalState::new(&apps(), false).unwrap();
        let proxy = &state.proxies[1];
        assert!(proxy.record_web_activity());
        assert!(!proxy.record_web_activity());
        proxy.clear_need_pod();
        assert!(proxy.record_web_activity());
    }

    #[test]
    fn test_force_all_idle() {
        let state = GlobalState::new(&apps(), true).unwrap();
        state.force_all_idle();
        for proxy in &state.proxies {
            assert!(proxy.last_web_activity().is_none());
            // Demand is only cleared by the idle tick, not by forcing
            assert!(proxy.need_pod());
            assert!(proxy.web_idle_for(Duration::from_secs(0)));
        }
    }

    #[test]
    fn test_web_idle_for() {
        let state = GlobalState::new(&apps(), false).unwrap();
        let proxy = &state.proxies[1];
        assert!(proxy.web_idle_for(Duration::from_secs(3600)));
        proxy.record_web_activity();
        assert!(!proxy.web_idle_for(Duration::from_secs(3600)));
    }

    #[test]
    fn test_control_proxy_lookup() {
        let state = GlobalState::new(&apps(), false).unwrap();
        assert_eq!(state.control_proxy().name, "control");
        assert_eq!(state.forwarding_proxies().count(), 2);
    }

    #[test]
    fn test_scheduled_shutdown_roundtrip() {
        let state = GlobalState::new(&apps(), false).unwrap();
        let control = state.control_proxy();
        assert!(control.scheduled_shutdown().is_none());

        let at = SystemTime::now() + Duration::from_secs(300);
        control.set_scheduled_shutdown(at);
        assert_eq!(control.scheduled_shutdown(), Some(at));

        control.clear_scheduled_shutdown();
        assert!(control.scheduled_shutdown().is_none());

        // Cancelling again is a no-op
        control.clear_scheduled_shutdown();
        assert!(control.scheduled_shutdown().is_none());
    }
}
