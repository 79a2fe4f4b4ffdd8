//! BLE link layer for the eight-servo mask rig.
//!
//! This crate owns everything between the UI layer and the platform
//! Bluetooth stack: device discovery, pairing persistence,
//! reconnect-on-advertisement, the session state machine, and the wire
//! command protocol. The UI layer drives it through
//! [`ConnectionManager`] / [`Session`] and observes it through a
//! [`LinkEvent`] channel plus config callbacks; it never touches the
//! transport directly.

pub mod domain;
pub mod infrastructure;

pub use domain::models::{
    ConfigPayload, ConnectionStatus, DeviceHandle, LinkEvent, MessageSeverity, Pose, ServoConfig,
    StatusMessage,
};
pub use domain::settings::{LinkSettings, SettingsService};
pub use infrastructure::bluetooth::manager::ConnectionManager;
pub use infrastructure::bluetooth::protocol::{self, Command, DecodeError, ValidationError};
pub use infrastructure::bluetooth::session::{SendError, Session, SessionConfig, SessionError};
pub use infrastructure::bluetooth::transport::{
    CancelToken, Characteristic, GattLink, NotifyEvent, NotifySubscription, Transport,
    TransportError,
};
pub use infrastructure::bluetooth::watcher::{WatcherRegistration, WatcherState};
