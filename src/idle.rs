//! Idle and scheduled-shutdown management.
//!
//! One monitor per application. Each tick clears the application's demand
//! once web activity has been quiet past the timeout, and fires the
//! scheduled shutdown if its time has been reached. Firing only forces
//! every application idle; the demand actually drops on the next tick,
//! and the pod stops once the lifecycle controller sees no demand at all.

use crate::state::{GlobalState, ProxyState};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, info};

const TICK: Duration = Duration::from_secs(10);

pub struct IdleMonitor {
    proxy: Arc<ProxyState>,
    global: Arc<GlobalState>,
    web_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl IdleMonitor {
    pub fn new(
        proxy: Arc<ProxyState>,
        global: Arc<GlobalState>,
        web_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            proxy,
            global,
            web_timeout,
            shutdown_rx,
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
        debug!(app = %self.proxy.name, "Idle monitor stopped");
    }

    /// One idle check. Separated from the loop so it can be unit tested.
    pub fn tick(&self) {
        if self.proxy.need_pod() && self.proxy.web_idle_for(self.web_timeout) {
            match self.proxy.last_web_activity() {
                Some(_) => info!(
                    app = %self.proxy.name,
                    timeout_secs = self.web_timeout.as_secs(),
                    "No web activity past timeout, clearing pod demand"
                ),
                None => info!(
                    app = %self.proxy.name,
                    "Immediate shutdown requested, clearing pod demand"
                ),
            }
            self.proxy.clear_need_pod();
        }

        if let Some(at) = self.proxy.scheduled_shutdown() {
            if SystemTime::now() >= at {
                info!(
                    app = %self.proxy.name,
                    "Scheduled shutdown time reached, forcing all applications idle"
                );
                self.global.force_all_idle();
                self.proxy.clear_scheduled_shutdown();
            }
        }
    }
}
