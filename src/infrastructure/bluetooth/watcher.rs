//! Advertisement Watcher
//!
//! A registration waits for a single advertisement from an authorized
//! device, hands the device to its trigger, and is then inert. Cancellation
//! wins ties: once `cancel` has been requested, the trigger can no longer
//! fire, even if the advertisement arrives in the same scheduler tick.

use crate::domain::models::DeviceHandle;
use crate::infrastructure::bluetooth::transport::{CancelToken, Transport};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Lifecycle of a watcher registration. `Triggered` and `Cancelled` are
/// terminal; a fresh registration is required to watch the device again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Watching,
    Triggered,
    Cancelled,
}

/// Handle to a one-shot advertisement watcher.
pub struct WatcherRegistration {
    device: DeviceHandle,
    state: Arc<Mutex<WatcherState>>,
    cancel: CancelToken,
}

impl WatcherRegistration {
    /// Register a watcher for `device`. The trigger runs on the watcher's
    /// own task, never on the platform notification source, and at most
    /// once.
    pub fn register<F>(transport: Arc<dyn Transport>, device: DeviceHandle, trigger: F) -> Self
    where
        F: FnOnce(DeviceHandle) + Send + 'static,
    {
        let state = Arc::new(Mutex::new(WatcherState::Idle));
        let cancel = CancelToken::new();
        *state.lock().unwrap() = WatcherState::Watching;

        let task_state = Arc::clone(&state);
        let task_cancel = cancel.clone();
        let task_device = device.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = task_cancel.cancelled() => Err(()),
                result = transport.watch_advertisements(&task_device, &task_cancel) => {
                    result.map_err(|e| {
                        warn!(device = %task_device, error = %e, "advertisement watch failed");
                    })
                }
            };

            // Terminal transition happens under the lock with the token
            // re-checked, so a same-tick cancel beats the advertisement.
            let fired = {
                let mut state = task_state.lock().unwrap();
                if outcome.is_ok() && !task_cancel.is_cancelled() {
                    *state = WatcherState::Triggered;
                    true
                } else {
                    *state = WatcherState::Cancelled;
                    false
                }
            };

            if fired {
                debug!(device = %task_device, "advertisement observed, triggering connect");
                trigger(task_device);
            }
        });

        Self {
            device,
            state,
            cancel,
        }
    }

    /// Tear the watcher down. Idempotent; a no-op once terminal.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let mut state = self.state.lock().unwrap();
        if *state == WatcherState::Watching {
            *state = WatcherState::Cancelled;
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.lock().unwrap()
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::transport::{GattLink, TransportError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Transport stub: advertisements fire when the test says so.
    #[derive(Default)]
    struct StubTransport {
        advertisers: Mutex<HashMap<u64, Arc<Notify>>>,
    }

    impl StubTransport {
        fn advertiser(&self, address: u64) -> Arc<Notify> {
            Arc::clone(
                self.advertisers
                    .lock()
                    .unwrap()
                    .entry(address)
                    .or_default(),
            )
        }

        fn advertise(&self, address: u64) {
            self.advertiser(address).notify_one();
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn authorized_devices(&self) -> Result<Vec<DeviceHandle>, TransportError> {
            Ok(Vec::new())
        }

        async fn request_device(&self) -> Result<DeviceHandle, TransportError> {
            Err(TransportError::UserCancelled)
        }

        async fn watch_advertisements(
            &self,
            device: &DeviceHandle,
            cancel: &CancelToken,
        ) -> Result<(), TransportError> {
            let advertiser = self.advertiser(device.address);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                _ = advertiser.notified() => Ok(()),
            }
        }

        async fn connect(
            &self,
            _device: &DeviceHandle,
        ) -> Result<Box<dyn GattLink>, TransportError> {
            Err(TransportError::Connect("stub".to_string()))
        }
    }

    async fn settle() {
        // Let spawned watcher tasks observe their wakeups.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn counting_trigger(count: &Arc<AtomicUsize>) -> impl FnOnce(DeviceHandle) + Send + 'static {
        let count = Arc::clone(count);
        move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_trigger_fires_once_on_advertisement() {
        let transport = Arc::new(StubTransport::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let watcher = WatcherRegistration::register(
            Arc::clone(&transport) as Arc<dyn Transport>,
            DeviceHandle::new(1, "Mask"),
            counting_trigger(&fired),
        );
        assert_eq!(watcher.state(), WatcherState::Watching);

        transport.advertise(1);
        settle().await;

        assert_eq!(watcher.state(), WatcherState::Triggered);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Further advertisements hit a terminal watcher.
        transport.advertise(1);
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_watcher_never_triggers() {
        let transport = Arc::new(StubTransport::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let watcher = WatcherRegistration::register(
            Arc::clone(&transport) as Arc<dyn Transport>,
            DeviceHandle::new(2, "Mask"),
            counting_trigger(&fired),
        );

        // Cancellation and advertisement land in the same tick; the
        // cancel must win.
        watcher.cancel();
        transport.advertise(2);
        settle().await;

        assert_eq!(watcher.state(), WatcherState::Cancelled);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_trigger_is_noop() {
        let transport = Arc::new(StubTransport::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let watcher = WatcherRegistration::register(
            Arc::clone(&transport) as Arc<dyn Transport>,
            DeviceHandle::new(3, "Mask"),
            counting_trigger(&fired),
        );

        transport.advertise(3);
        settle().await;
        watcher.cancel();

        assert_eq!(watcher.state(), WatcherState::Triggered);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
