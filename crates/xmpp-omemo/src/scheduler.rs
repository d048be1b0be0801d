use crate::session_manager::ManagerInner;
use crate::{OmemoConfig, OmemoManager};
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::warn;

/// Periodic signed pre-key renewal and device pruning.
///
/// Both checks stop when the scheduler is dropped or the manager is gone.
pub struct LifecycleScheduler {
    renewal: JoinHandle<()>,
    pruning: JoinHandle<()>,
}

impl LifecycleScheduler {
    pub(crate) fn start(manager: Weak<ManagerInner>, config: &OmemoConfig) -> Self {
        let renewal = spawn_check(
            manager.clone(),
            config.signed_pre_key_renewal_check_interval(),
            Check::SignedPreKeyRenewal,
        );
        let pruning = spawn_check(
            manager,
            config.device_removal_check_interval(),
            Check::DevicePruning,
        );
        Self { renewal, pruning }
    }
}

impl Drop for LifecycleScheduler {
    fn drop(&mut self) {
        self.renewal.abort();
        self.pruning.abort();
    }
}

#[derive(Debug, Clone, Copy)]
enum Check {
    SignedPreKeyRenewal,
    DevicePruning,
}

fn spawn_check(manager: Weak<ManagerInner>, period: Duration, check: Check) -> JoinHandle<()> {
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let Some(inner) = manager.upgrade() else {
                break;
            };
            let manager = OmemoManager::from_inner(inner);
            let result = match check {
                Check::SignedPreKeyRenewal => manager.renew_signed_pre_key_pairs().await,
                Check::DevicePruning => manager.prune_absent_devices().await,
            };
            if let Err(e) = result {
                warn!(?check, error = %e, "periodic OMEMO check failed");
            }
        }
    })
}
