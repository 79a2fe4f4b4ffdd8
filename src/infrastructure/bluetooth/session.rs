//! Rig Session
//!
//! Owns the one live link to the mask: the connect → resolve → subscribe
//! pipeline, the notify decode loop, command writes, and teardown. The
//! characteristic handle lives inside the `Connected` state, so a
//! connected session always has one and nothing else ever does.

use crate::domain::models::{
    ConfigPayload, ConnectionStatus, DeviceHandle, LinkEvent, MessageSeverity, StatusMessage,
};
use crate::infrastructure::bluetooth::protocol::{self, Command};
use crate::infrastructure::bluetooth::transport::{
    CancelToken, Characteristic, GattLink, NotifyEvent, NotifySubscription, Transport,
    TransportError,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Session behavior knobs, filled from [`LinkSettings`] by the manager.
///
/// [`LinkSettings`]: crate::domain::settings::LinkSettings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub service_uuid: String,
    pub characteristic_uuid: String,
    /// Ask the rig for its pose table as part of connecting.
    pub request_config_on_connect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID.to_string(),
            characteristic_uuid: protocol::CHARACTERISTIC_UUID.to_string(),
            request_config_on_connect: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,
    #[error("a session is already connected")]
    AlreadyConnected,
    #[error("GATT connect failed: {0}")]
    Connect(#[source] TransportError),
    #[error("service resolution failed: {0}")]
    Resolve(#[source] TransportError),
    #[error("notify subscription failed: {0}")]
    Subscribe(#[source] TransportError),
    #[error("initial config request failed: {0}")]
    ConfigRequest(#[source] TransportError),
    #[error("connection attempt cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,
    #[error("characteristic write failed: {0}")]
    Write(#[source] TransportError),
}

/// Everything owned while the link is up. Dropping out of `Connected`
/// releases the subscription first, then the GATT link.
struct ActiveLink {
    device: DeviceHandle,
    characteristic: Arc<dyn Characteristic>,
    link: Box<dyn GattLink>,
    subscription: Option<NotifySubscription>,
    /// Ties the notify loop to the link that spawned it; a stale loop can
    /// never tear down a newer link.
    epoch: u64,
}

enum LinkState {
    Disconnected,
    Connecting { device: DeviceHandle },
    ResolvingService { device: DeviceHandle },
    Connected(ActiveLink),
}

type ConfigListener = Box<dyn Fn(&ConfigPayload) + Send>;

pub struct Session {
    weak_self: Weak<Session>,
    config: SessionConfig,
    state: Mutex<LinkState>,
    epochs: AtomicU64,
    /// Cancel token of the in-flight connect attempt, if any.
    pending_cancel: Mutex<Option<CancelToken>>,
    config_listeners: Mutex<Vec<ConfigListener>>,
    event_sender: mpsc::UnboundedSender<LinkEvent>,
}

impl Session {
    pub fn new(config: SessionConfig, event_sender: mpsc::UnboundedSender<LinkEvent>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            config,
            state: Mutex::new(LinkState::Disconnected),
            epochs: AtomicU64::new(0),
            pending_cancel: Mutex::new(None),
            config_listeners: Mutex::new(Vec::new()),
            event_sender,
        })
    }

    /// Register a listener invoked once per successfully decoded inbound
    /// configuration. Decode failures never reach it.
    pub fn on_config<F>(&self, listener: F)
    where
        F: Fn(&ConfigPayload) + Send + 'static,
    {
        self.config_listeners
            .lock()
            .unwrap()
            .push(Box::new(listener));
    }

    pub fn status(&self) -> ConnectionStatus {
        match &*self.state.lock().unwrap() {
            LinkState::Disconnected => ConnectionStatus::Disconnected,
            LinkState::Connecting { .. } => ConnectionStatus::Connecting,
            LinkState::ResolvingService { .. } => ConnectionStatus::ResolvingService,
            LinkState::Connected(_) => ConnectionStatus::Connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), LinkState::Connected(_))
    }

    pub fn device_name(&self) -> Option<String> {
        match &*self.state.lock().unwrap() {
            LinkState::Disconnected => None,
            LinkState::Connecting { device } | LinkState::ResolvingService { device } => {
                Some(device.name.clone())
            }
            LinkState::Connected(active) => Some(active.device.name.clone()),
        }
    }

    /// Connect to `device` and bring the session to `Connected`.
    ///
    /// Exactly one attempt can be in flight: concurrent calls fail with
    /// [`SessionError::AlreadyConnecting`] / [`SessionError::AlreadyConnected`]
    /// without disturbing it. Any failure resets the session to
    /// `Disconnected` before returning, so a later attempt starts clean.
    pub async fn connect(
        &self,
        transport: &Arc<dyn Transport>,
        device: DeviceHandle,
    ) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock().unwrap();
            match &*state {
                LinkState::Disconnected => {}
                LinkState::Connecting { .. } | LinkState::ResolvingService { .. } => {
                    return Err(SessionError::AlreadyConnecting)
                }
                LinkState::Connected(_) => return Err(SessionError::AlreadyConnected),
            }
            *state = LinkState::Connecting {
                device: device.clone(),
            };
        }
        info!(device = %device, "connecting");
        self.emit_status(ConnectionStatus::Connecting);

        let cancel = CancelToken::new();
        *self.pending_cancel.lock().unwrap() = Some(cancel.clone());

        let result = self.establish(transport, &device, &cancel).await;
        *self.pending_cancel.lock().unwrap() = None;

        match result {
            Ok(()) => {
                info!(device = %device, "connected");
                self.send_log("Connection established!", MessageSeverity::Success);
                self.emit_status(ConnectionStatus::Connected);
                Ok(())
            }
            Err(SessionError::Cancelled) => {
                // Teardown is not a failure: reset quietly.
                debug!(device = %device, "connection attempt cancelled");
                *self.state.lock().unwrap() = LinkState::Disconnected;
                self.emit_status(ConnectionStatus::Disconnected);
                Err(SessionError::Cancelled)
            }
            Err(error) => {
                warn!(device = %device, error = %error, "connection failed");
                *self.state.lock().unwrap() = LinkState::Disconnected;
                self.send_log(
                    &format!("Connection failed: {error}"),
                    MessageSeverity::Error,
                );
                self.emit_status(ConnectionStatus::Disconnected);
                Err(error)
            }
        }
    }

    async fn establish(
        &self,
        transport: &Arc<dyn Transport>,
        device: &DeviceHandle,
        cancel: &CancelToken,
    ) -> Result<(), SessionError> {
        // Step 1: open the GATT link.
        let link = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            result = transport.connect(device) => result.map_err(SessionError::Connect)?,
        };

        *self.state.lock().unwrap() = LinkState::ResolvingService {
            device: device.clone(),
        };
        self.emit_status(ConnectionStatus::ResolvingService);

        // Step 2: resolve the command characteristic.
        let characteristic = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                link.close();
                return Err(SessionError::Cancelled);
            }
            result = link.resolve_characteristic(
                &self.config.service_uuid,
                &self.config.characteristic_uuid,
            ) => match result {
                Ok(characteristic) => characteristic,
                Err(error) => {
                    link.close();
                    return Err(SessionError::Resolve(error));
                }
            },
        };
        debug!(device = %device, "characteristic resolved");

        // Step 3: open the notify side before anyone can observe
        // `Connected`, so no command races ahead of config delivery.
        let (notify_sender, notify_receiver) = mpsc::unbounded_channel();
        let subscription = match characteristic.subscribe(notify_sender).await {
            Ok(subscription) => subscription,
            Err(error) => {
                link.close();
                return Err(SessionError::Subscribe(error));
            }
        };

        // Step 4: one config request per connect.
        if self.config.request_config_on_connect {
            if let Err(error) = characteristic.write(&Command::GetConfig.encode()).await {
                subscription.unsubscribe();
                link.close();
                return Err(SessionError::ConfigRequest(error));
            }
        }

        if cancel.is_cancelled() {
            subscription.unsubscribe();
            link.close();
            return Err(SessionError::Cancelled);
        }

        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.lock().unwrap() = LinkState::Connected(ActiveLink {
            device: device.clone(),
            characteristic,
            link,
            subscription: Some(subscription),
            epoch,
        });

        if let Some(session) = self.weak_self.upgrade() {
            tokio::spawn(session.notify_loop(notify_receiver, epoch));
        }
        Ok(())
    }

    /// Decode loop for one link epoch. Ends when the subscription is
    /// detached or the peripheral drops the link.
    async fn notify_loop(
        self: Arc<Self>,
        mut receiver: mpsc::UnboundedReceiver<NotifyEvent>,
        epoch: u64,
    ) {
        while let Some(event) = receiver.recv().await {
            match event {
                NotifyEvent::Value(bytes) => match protocol::decode_config(&bytes) {
                    Ok(config) => {
                        debug!(poses = config.poses.len(), "configuration received");
                        let listeners = self.config_listeners.lock().unwrap();
                        for listener in listeners.iter() {
                            listener(&config);
                        }
                    }
                    Err(error) => {
                        warn!(error = %error, "ignoring malformed configuration payload");
                    }
                },
                NotifyEvent::Disconnected => {
                    info!("peripheral dropped the link");
                    self.teardown(epoch, "Disconnected from device");
                    break;
                }
            }
        }
    }

    /// Encode and write one command. Rejects immediately unless
    /// `Connected`; never queues — a dropped command is superseded by the
    /// next one, since servo state is position-absolute.
    pub async fn send(&self, command: &Command) -> Result<(), SendError> {
        let characteristic = {
            let state = self.state.lock().unwrap();
            match &*state {
                LinkState::Connected(active) => Arc::clone(&active.characteristic),
                _ => return Err(SendError::NotConnected),
            }
        };
        debug!(command = ?command, "sending command");
        characteristic
            .write(&command.encode())
            .await
            .map_err(SendError::Write)
    }

    /// Explicit teardown of a connected session.
    pub fn disconnect(&self) {
        let epoch = self.epochs.load(Ordering::SeqCst);
        self.teardown(epoch, "Disconnected from device");
    }

    /// Abort an in-flight connect attempt quietly. A no-op when nothing is
    /// pending.
    pub fn abort_pending(&self) {
        if let Some(cancel) = self.pending_cancel.lock().unwrap().as_ref() {
            cancel.cancel();
        }
    }

    /// Exit `Connected` for the given epoch: detach the subscription,
    /// close the link, reset state. Stale epochs (an older link's notify
    /// loop) are ignored.
    fn teardown(&self, epoch: u64, message: &str) {
        let active = {
            let mut state = self.state.lock().unwrap();
            let owns_link =
                matches!(&*state, LinkState::Connected(active) if active.epoch == epoch);
            if !owns_link {
                return;
            }
            match std::mem::replace(&mut *state, LinkState::Disconnected) {
                LinkState::Connected(active) => active,
                // just matched Connected above
                _ => return,
            }
        };

        if let Some(subscription) = active.subscription {
            subscription.unsubscribe();
        }
        active.link.close();

        info!(device = %active.device, "session closed");
        self.send_log(message, MessageSeverity::Info);
        self.emit_status(ConnectionStatus::Disconnected);
    }

    fn emit_status(&self, status: ConnectionStatus) {
        let _ = self.event_sender.send(LinkEvent::ConnectionStatus(status));
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
