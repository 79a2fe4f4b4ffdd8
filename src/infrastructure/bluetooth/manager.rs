//! Connection Manager
//!
//! Orchestrates discovery and the single session: arms one advertisement
//! watcher per previously authorized device, connects whichever advertises
//! first, runs interactive pairing on request, and tears everything down
//! cleanly. Only one physical link is meaningful for the rig, so the first
//! session to reach `Connected` cancels every other watcher.

use crate::domain::models::{DeviceHandle, LinkEvent, MessageSeverity, StatusMessage};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::session::{Session, SessionConfig, SessionError};
use crate::infrastructure::bluetooth::transport::{Transport, TransportError};
use crate::infrastructure::bluetooth::watcher::WatcherRegistration;
use anyhow::Result;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct ConnectionManager {
    weak_self: Weak<ConnectionManager>,
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
    watchers: Mutex<Vec<WatcherRegistration>>,
    settings: Arc<Mutex<SettingsService>>,
    event_sender: mpsc::UnboundedSender<LinkEvent>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: Arc<Mutex<SettingsService>>,
        event_sender: mpsc::UnboundedSender<LinkEvent>,
    ) -> Arc<Self> {
        let session_config = {
            let settings = settings.lock().unwrap();
            let s = settings.get();
            SessionConfig {
                service_uuid: s.ble_service_uuid.clone(),
                characteristic_uuid: s.ble_characteristic_uuid.clone(),
                request_config_on_connect: s.request_config_on_connect,
            }
        };
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            transport,
            session: Session::new(session_config, event_sender.clone()),
            watchers: Mutex::new(Vec::new()),
            settings,
            event_sender,
        })
    }

    /// The one session this manager owns. The UI layer uses it for
    /// `status`, `send` and `on_config`; it never mutates session
    /// internals.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Arm a one-shot watcher for every previously authorized device.
    /// Whichever advertises first wins the race to become the session;
    /// the rest are cancelled once it connects.
    pub async fn watch_known_devices(&self) -> Result<usize> {
        let devices = match self.transport.authorized_devices().await {
            Ok(devices) => devices,
            Err(error) => {
                self.send_log(
                    &format!("Bluetooth unavailable: {error}"),
                    MessageSeverity::Error,
                );
                return Err(error.into());
            }
        };
        info!(count = devices.len(), "arming watchers for authorized devices");

        let mut watchers = self.watchers.lock().unwrap();
        for device in devices {
            watchers.push(self.register_watcher(device));
        }
        Ok(watchers.len())
    }

    /// Arm a fresh watcher for one device, e.g. to make a remembered rig
    /// reachable again after a disconnect.
    pub fn watch_device(&self, device: DeviceHandle) {
        let registration = self.register_watcher(device);
        self.watchers.lock().unwrap().push(registration);
    }

    fn register_watcher(&self, device: DeviceHandle) -> WatcherRegistration {
        let weak_manager = self.weak_self.clone();
        WatcherRegistration::register(Arc::clone(&self.transport), device, move |device| {
            let Some(manager) = weak_manager.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                manager.connect_from_watcher(device).await;
            });
        })
    }

    async fn connect_from_watcher(&self, device: DeviceHandle) {
        match self.session.connect(&self.transport, device.clone()).await {
            Ok(()) => {
                // First success wins; the other watchers are moot now.
                self.cancel_watchers();
                self.remember(&device);
            }
            Err(SessionError::AlreadyConnecting) | Err(SessionError::AlreadyConnected) => {
                debug!(device = %device, "another connection attempt already won");
            }
            Err(SessionError::Cancelled) => {}
            Err(error) => {
                // One-shot semantics: the watcher stays spent. The device
                // becomes reachable again only via a fresh registration.
                warn!(device = %device, error = %error, "reconnect attempt failed");
            }
        }
    }

    /// Interactive pairing: prompt the operator for a device, then connect
    /// directly. Returns the paired device, or `None` when the operator
    /// dismissed the prompt.
    pub async fn pair_interactive(&self) -> Result<Option<DeviceHandle>> {
        // A manual pick supersedes any pending auto-reconnect.
        self.cancel_watchers();

        let device = match self.transport.request_device().await {
            Ok(device) => device,
            Err(TransportError::UserCancelled) => {
                debug!("pairing prompt dismissed");
                return Ok(None);
            }
            Err(error) => {
                self.send_log(&format!("Pairing failed: {error}"), MessageSeverity::Error);
                return Err(error.into());
            }
        };

        info!(device = %device, "device picked, connecting");
        self.session
            .connect(&self.transport, device.clone())
            .await?;
        self.remember(&device);
        Ok(Some(device))
    }

    fn remember(&self, device: &DeviceHandle) {
        let mut settings = self.settings.lock().unwrap();
        if let Err(error) = settings.remember_device(device) {
            warn!(error = %error, "could not persist device authorization");
        }
    }

    /// Cancel and discard every outstanding watcher.
    pub fn cancel_watchers(&self) {
        let mut watchers = self.watchers.lock().unwrap();
        for watcher in watchers.iter() {
            watcher.cancel();
        }
        watchers.clear();
    }

    /// Number of watchers still registered (terminal ones included until
    /// the next `cancel_watchers`).
    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().unwrap().len()
    }

    /// Full teardown: watchers cancelled, a pending connect aborted
    /// quietly, a live link closed. Safe to call at any point; teardown is
    /// not a failure.
    pub fn shutdown(&self) {
        info!("shutting down connection manager");
        self.cancel_watchers();
        self.session.abort_pending();
        self.session.disconnect();
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(LinkEvent::LogMessage(StatusMessage {
                message: message.to_string(),
                severity,
            }));
    }
}
