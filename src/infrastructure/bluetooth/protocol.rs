//! Servo Mask Wire Protocol
//!
//! Commands are text framed, one command per characteristic write. Pose and
//! single-servo moves use colon-separated frames; speed control and the
//! config request go through the firmware's JSON command dispatcher. The
//! rig answers `GET_CONFIG` with a JSON document on the notify side.

use crate::domain::models::{ConfigPayload, SERVO_COUNT};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use thiserror::Error;

/// Servo mask BLE service UUID.
pub const SERVICE_UUID: &str = "4fafc201-1fb5-459e-8fcc-c5c9c331914c";

/// The single write/notify characteristic carrying commands and
/// configuration.
pub const CHARACTERISTIC_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26a9";

/// Largest angle, in degrees, a servo channel accepts.
pub const ANGLE_MAX: u16 = 180;

/// Largest value accepted by the speed command.
pub const SPEED_MAX: u16 = 1000;

/// A command frame that failed validation before encoding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("pose index must be non-negative, got {0}")]
    PoseIndex(i32),
    #[error("pose requires exactly {SERVO_COUNT} angles, got {0}")]
    PoseLength(usize),
    #[error("servo index out of range 0-7, got {0}")]
    ServoIndex(i32),
    #[error("angle out of range 0-{ANGLE_MAX}, got {0}")]
    Angle(i32),
    #[error("speed out of range 0-{SPEED_MAX}, got {0}")]
    Speed(i32),
}

/// An inbound payload that could not be parsed. Recoverable: the caller
/// keeps its previous state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// An outbound command for the rig. Construct through the validating
/// constructors; a value of this type always encodes cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Apply a stored pose: pose index plus all eight channel angles.
    Pose {
        index: u32,
        angles: [u16; SERVO_COUNT],
    },
    /// Move a single servo channel.
    Servo { index: u8, angle: u16 },
    /// Set the motion speed.
    Speed { value: u16 },
    /// Ask the rig to notify its pose table.
    GetConfig,
}

/// JSON command object understood by the firmware dispatcher.
#[derive(Serialize, Deserialize)]
struct SpeedFrame {
    command: String,
    speed: u16,
}

impl Command {
    pub fn pose(index: i32, angles: &[i32]) -> Result<Self, ValidationError> {
        if index < 0 {
            return Err(ValidationError::PoseIndex(index));
        }
        if angles.len() != SERVO_COUNT {
            return Err(ValidationError::PoseLength(angles.len()));
        }
        let mut validated = [0u16; SERVO_COUNT];
        for (slot, &angle) in validated.iter_mut().zip(angles) {
            *slot = check_angle(angle)?;
        }
        Ok(Self::Pose {
            index: index as u32,
            angles: validated,
        })
    }

    pub fn servo(index: i32, angle: i32) -> Result<Self, ValidationError> {
        if !(0..SERVO_COUNT as i32).contains(&index) {
            return Err(ValidationError::ServoIndex(index));
        }
        Ok(Self::Servo {
            index: index as u8,
            angle: check_angle(angle)?,
        })
    }

    pub fn speed(value: i32) -> Result<Self, ValidationError> {
        if !(0..=SPEED_MAX as i32).contains(&value) {
            return Err(ValidationError::Speed(value));
        }
        Ok(Self::Speed {
            value: value as u16,
        })
    }

    /// Encode into the byte frame written to the characteristic.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Pose { index, angles } => {
                let mut frame = format!("POSE:{index}");
                for angle in angles {
                    // writing to a String cannot fail
                    let _ = write!(frame, ":{angle}");
                }
                frame.into_bytes()
            }
            Self::Servo { index, angle } => format!("SERVO:{index}:{angle}").into_bytes(),
            Self::Speed { value } => serde_json::json!({
                "command": "speed",
                "speed": value,
            })
            .to_string()
            .into_bytes(),
            Self::GetConfig => b"GET_CONFIG".to_vec(),
        }
    }
}

fn check_angle(angle: i32) -> Result<u16, ValidationError> {
    if !(0..=ANGLE_MAX as i32).contains(&angle) {
        return Err(ValidationError::Angle(angle));
    }
    Ok(angle as u16)
}

/// Parse a command frame back into a [`Command`], mirroring the firmware's
/// dispatcher: colon frames, the `GET_CONFIG` sentinel, and JSON command
/// objects.
pub fn decode_command(bytes: &[u8]) -> Result<Command, DecodeError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| DecodeError::Malformed("frame is not UTF-8".to_string()))?;

    if text == "GET_CONFIG" {
        return Ok(Command::GetConfig);
    }
    if let Some(rest) = text.strip_prefix("POSE:") {
        let fields = parse_int_fields(rest)?;
        let (index, angles) = fields
            .split_first()
            .ok_or_else(|| DecodeError::Malformed("empty POSE frame".to_string()))?;
        return Command::pose(*index, angles).map_err(|e| DecodeError::Malformed(e.to_string()));
    }
    if let Some(rest) = text.strip_prefix("SERVO:") {
        let fields = parse_int_fields(rest)?;
        if fields.len() != 2 {
            return Err(DecodeError::Malformed(format!(
                "SERVO frame has {} fields, expected 2",
                fields.len()
            )));
        }
        return Command::servo(fields[0], fields[1])
            .map_err(|e| DecodeError::Malformed(e.to_string()));
    }
    if text.starts_with('{') {
        let frame: SpeedFrame = serde_json::from_str(text)
            .map_err(|e| DecodeError::Malformed(format!("bad command object: {e}")))?;
        if frame.command != "speed" {
            return Err(DecodeError::Malformed(format!(
                "unknown command {:?}",
                frame.command
            )));
        }
        return Command::speed(frame.speed as i32)
            .map_err(|e| DecodeError::Malformed(e.to_string()));
    }
    Err(DecodeError::Malformed(format!(
        "unrecognized frame {:?}",
        text
    )))
}

fn parse_int_fields(text: &str) -> Result<Vec<i32>, DecodeError> {
    text.split(':')
        .map(|field| {
            field
                .parse::<i32>()
                .map_err(|_| DecodeError::Malformed(format!("bad integer field {field:?}")))
        })
        .collect()
}

/// Decode the configuration document the rig notifies after `GET_CONFIG`.
///
/// Unknown JSON fields are ignored so newer firmware stays readable. The
/// shape is still checked: every pose carries exactly [`SERVO_COUNT`]
/// servos and `currentPose` indexes into the pose table.
pub fn decode_config(bytes: &[u8]) -> Result<ConfigPayload, DecodeError> {
    let config: ConfigPayload = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::Malformed(format!("bad config document: {e}")))?;

    for pose in &config.poses {
        if pose.servos.len() != SERVO_COUNT {
            return Err(DecodeError::Malformed(format!(
                "pose {:?} has {} servos, expected {SERVO_COUNT}",
                pose.name,
                pose.servos.len()
            )));
        }
    }
    if config.current_pose >= config.poses.len() {
        return Err(DecodeError::Malformed(format!(
            "currentPose {} out of range for {} poses",
            config.current_pose,
            config.poses.len()
        )));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_pose_frame() {
        let command = Command::pose(2, &[0, 45, 90, 135, 180, 90, 90, 90]).unwrap();
        assert_eq!(command.encode(), b"POSE:2:0:45:90:135:180:90:90:90");
    }

    #[test]
    fn test_encode_servo_frame() {
        let command = Command::servo(3, 120).unwrap();
        assert_eq!(command.encode(), b"SERVO:3:120");
    }

    #[test]
    fn test_encode_speed_frame() {
        let command = Command::speed(500).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&command.encode()).unwrap();
        assert_eq!(value["command"], "speed");
        assert_eq!(value["speed"], 500);
    }

    #[test]
    fn test_get_config_sentinel() {
        assert_eq!(Command::GetConfig.encode(), b"GET_CONFIG");
    }

    #[test]
    fn test_servo_round_trip_full_range() {
        for index in 0..SERVO_COUNT as i32 {
            for angle in 0..=ANGLE_MAX as i32 {
                let command = Command::servo(index, angle).unwrap();
                assert_eq!(decode_command(&command.encode()).unwrap(), command);
            }
        }
    }

    #[test]
    fn test_pose_and_speed_round_trip() {
        let pose = Command::pose(7, &[10, 20, 30, 40, 50, 60, 70, 80]).unwrap();
        assert_eq!(decode_command(&pose.encode()).unwrap(), pose);

        let speed = Command::speed(1000).unwrap();
        assert_eq!(decode_command(&speed.encode()).unwrap(), speed);

        assert_eq!(
            decode_command(b"GET_CONFIG").unwrap(),
            Command::GetConfig
        );
    }

    #[test]
    fn test_servo_validation_bounds() {
        assert_eq!(
            Command::servo(0, -1),
            Err(ValidationError::Angle(-1))
        );
        assert_eq!(
            Command::servo(0, 181),
            Err(ValidationError::Angle(181))
        );
        assert_eq!(
            Command::servo(-1, 90),
            Err(ValidationError::ServoIndex(-1))
        );
        assert_eq!(
            Command::servo(8, 90),
            Err(ValidationError::ServoIndex(8))
        );
    }

    #[test]
    fn test_pose_validation_bounds() {
        assert_eq!(
            Command::pose(-1, &[90; 8]),
            Err(ValidationError::PoseIndex(-1))
        );
        assert_eq!(
            Command::pose(0, &[90; 7]),
            Err(ValidationError::PoseLength(7))
        );
        assert_eq!(
            Command::pose(0, &[90, 90, 90, 181, 90, 90, 90, 90]),
            Err(ValidationError::Angle(181))
        );
        assert_eq!(
            Command::speed(1001),
            Err(ValidationError::Speed(1001))
        );
        assert_eq!(Command::speed(-1), Err(ValidationError::Speed(-1)));
    }

    #[test]
    fn test_decode_command_rejects_garbage() {
        assert!(decode_command(b"SERVO:1").is_err());
        assert!(decode_command(b"SERVO:1:abc").is_err());
        assert!(decode_command(b"POSE:").is_err());
        assert!(decode_command(b"{\"command\":\"dance\"}").is_err());
        assert!(decode_command(&[0xFF, 0xFE]).is_err());
    }

    fn sample_config_json() -> String {
        let servos: Vec<String> = (0..SERVO_COUNT)
            .map(|i| format!("{{\"position\":{}}}", 10 * i))
            .collect();
        format!(
            "{{\"poses\":[{{\"name\":\"Rest\",\"servos\":[{}]}}],\"currentPose\":0}}",
            servos.join(",")
        )
    }

    #[test]
    fn test_decode_config_document() {
        let config = decode_config(sample_config_json().as_bytes()).unwrap();
        assert_eq!(config.poses.len(), 1);
        assert_eq!(config.poses[0].name, "Rest");
        assert_eq!(config.poses[0].servos[3].position, 30);
        assert_eq!(config.current_pose, 0);
    }

    #[test]
    fn test_decode_config_ignores_unknown_fields() {
        let json = sample_config_json().replace(
            "\"currentPose\":0}",
            "\"currentPose\":0,\"firmware\":\"2.1\",\"uptime\":12345}",
        );
        assert!(decode_config(json.as_bytes()).is_ok());
    }

    #[test]
    fn test_decode_config_rejects_malformed() {
        assert!(decode_config(b"not json").is_err());
        assert!(decode_config(b"{\"poses\":[],\"currentPose\":0}").is_err());

        let short_pose =
            b"{\"poses\":[{\"name\":\"Rest\",\"servos\":[{\"position\":90}]}],\"currentPose\":0}";
        assert!(decode_config(short_pose).is_err());

        let bad_index = sample_config_json().replace("\"currentPose\":0", "\"currentPose\":5");
        assert!(decode_config(bad_index.as_bytes()).is_err());
    }
}
