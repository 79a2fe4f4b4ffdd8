use serde::{Deserialize, Serialize};

/// Number of servo channels on the rig.
pub const SERVO_COUNT: usize = 8;

/// A peripheral as the transport layer identifies it: BLE address plus
/// the advertised display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub address: u64,
    pub name: String,
}

impl DeviceHandle {
    pub fn new(address: u64, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#014X})", self.name, self.address)
    }
}

/// One servo channel position in degrees, as reported by the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServoConfig {
    pub position: u16,
}

/// A named arrangement of all eight servo channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pose {
    pub name: String,
    pub servos: Vec<ServoConfig>,
}

/// Device-reported configuration: the stored pose table and which pose is
/// currently applied. Received from the rig, never authored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPayload {
    pub poses: Vec<Pose>,
    pub current_pose: usize,
}

/// Externally visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    ResolvingService,
    Connected,
}

/// Events surfaced to the UI layer.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    ConnectionStatus(ConnectionStatus),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
