// Shutdown safety net
//
// Termination signals, panics, and dropping the guard all funnel into one
// trigger that zeroes the wheels through `MotorWorker::stop` and wakes the
// runtime so it can shut down. The trigger fires at most once.

use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;
use tracing::{error, warn};

use crate::motor::MotorHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Signal,
    Panic,
    Fault,
    Exit,
}

struct Inner {
    motor: MotorHandle,
    fired: AtomicBool,
    reason: OnceLock<TriggerReason>,
    wake: Notify,
}

impl Inner {
    fn fire(&self, reason: TriggerReason) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.motor.stop();
        let _ = self.reason.set(reason);
        self.wake.notify_one();
        true
    }
}

pub struct SafetyGuard {
    inner: Arc<Inner>,
}

impl SafetyGuard {
    pub fn new(motor: MotorHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                motor,
                fired: AtomicBool::new(false),
                reason: OnceLock::new(),
                wake: Notify::new(),
            }),
        }
    }

    /// Zero the wheels and request shutdown. Returns `false` if an earlier
    /// trigger already did.
    pub fn trigger(&self, reason: TriggerReason) -> bool {
        let fired = self.inner.fire(reason);
        if fired {
            warn!("Safety stop triggered ({:?})", reason);
        }
        fired
    }

    pub fn reason(&self) -> Option<TriggerReason> {
        self.inner.reason.get().copied()
    }

    /// Resolves once any trigger has fired
    pub async fn triggered(&self) {
        if self.inner.fired.load(Ordering::Acquire) {
            return;
        }
        self.inner.wake.notified().await;
    }

    /// SIGINT/SIGTERM zero the wheels; a second signal exits immediately in
    /// case the clean shutdown path hangs.
    pub fn install_signal_handler(&self) -> Result<(), ctrlc::Error> {
        let inner = Arc::clone(&self.inner);
        ctrlc::set_handler(move || {
            if inner.fire(TriggerReason::Signal) {
                warn!("Termination signal received, stopping");
                return;
            }
            error!("Second termination signal, exiting without clean shutdown");
            inner.motor.stop();
            std::process::exit(130);
        })
    }

    /// Chain a panic hook that zeroes the wheels before the default report
    pub fn install_panic_hook(&self) {
        let inner = Arc::clone(&self.inner);
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            inner.fire(TriggerReason::Panic);
            previous(info);
        }));
    }
}

impl Drop for SafetyGuard {
    fn drop(&mut self) {
        self.trigger(TriggerReason::Exit);
    }
}
