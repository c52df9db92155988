//! Wire protocol for the voice proximity relay.
//!
//! Control packets carry a 4-byte ASCII tag followed by a UTF-8 JSON body.
//! Audio packets carry no tag: any datagram of at least 2 bytes whose first
//! 4 bytes are not a known tag is treated as an audio uplink. Multi-byte
//! integers are big-endian, with one legacy exception: the speaker id on an
//! audio uplink is little-endian.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric player identifier as carried on audio frames.
pub type PlayerId = u16;

/// Default UDP port the relay binds.
pub const DEFAULT_PORT: u16 = 2051;

/// Maximum distance at which one player can hear another, in world units.
pub const VOICE_RANGE: f32 = 15.0;

/// Spatial cell edge length. Must be >= `VOICE_RANGE` so a 3x3 neighborhood
/// query covers every possible listener.
pub const CELL_SIZE: f32 = VOICE_RANGE;

/// Per-listener cap on concurrently audible speakers.
pub const MAX_SPEAKERS_PER_LISTENER: usize = 10;

/// How long a cached nearby-player snapshot stays valid.
pub const NEARBY_CACHE_TTL_MS: u64 = 200;

/// How long a cached account snapshot stays valid.
pub const ACCOUNT_CACHE_TTL_MS: u64 = 30_000;

/// A speaker slot not refreshed within this window is considered stale.
pub const SLOT_STALE_MS: u64 = 500;

/// Sessions idle for longer than this are swept.
pub const SESSION_IDLE_SECS: u64 = 24 * 60 * 60;

/// First identifier of the reserved test-bot id space. Ids at or above this
/// skip the voice credential check when a test-bot provider is installed.
pub const TEST_BOT_ID_FLOOR: PlayerId = 60_000;

/// A non-priority volume multiplier below this rounds to silence; the frame
/// is dropped instead of transmitted.
pub const SILENCE_EPSILON: f32 = 0.01;

pub const ACTIVATION_THRESHOLD_MIN: u32 = 3;
pub const ACTIVATION_THRESHOLD_MAX: u32 = 30;
pub const MAX_PRIORITY_PLAYERS_MIN: u32 = 5;
pub const MAX_PRIORITY_PLAYERS_MAX: u32 = 50;
pub const PRIORITY_VOLUME_MAX: f32 = 2.0;
pub const NON_PRIORITY_VOLUME_MAX: f32 = 1.0;

pub const TAG_AUTH: [u8; 4] = *b"AUTH";
pub const TAG_PRIO: [u8; 4] = *b"PRIO";
pub const TAG_PING: [u8; 4] = *b"PING";
pub const TAG_AUTH_RESPONSE: [u8; 4] = *b"ARSP";
pub const TAG_PRIO_RESPONSE: [u8; 4] = *b"PRSP";
pub const PONG: [u8; 4] = *b"PONG";

/// Request tags the relay dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlTag {
    Auth,
    Prio,
    Ping,
}

/// Returns the control tag of a datagram, or None if it should be treated
/// as raw audio.
pub fn control_tag(datagram: &[u8]) -> Option<ControlTag> {
    if datagram.len() < 4 {
        return None;
    }
    match &datagram[0..4] {
        t if t == TAG_AUTH => Some(ControlTag::Auth),
        t if t == TAG_PRIO => Some(ControlTag::Prio),
        t if t == TAG_PING => Some(ControlTag::Ping),
        _ => None,
    }
}

/// Errors produced while encoding or decoding datagrams.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("datagram too short")]
    TooShort,
    #[error("invalid JSON body: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("invalid player id {0:?}")]
    BadPlayerId(String),
    #[error("unknown setting type {0:?}")]
    UnknownSetting(String),
    #[error("invalid value {value:?} for setting {setting}")]
    BadValue {
        setting: &'static str,
        value: String,
    },
    #[error("audio payload exceeds 65535 bytes")]
    PayloadTooLarge,
}

/// A player's position snapshot as reported by the game simulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerPosition {
    pub x: f32,
    pub y: f32,
    pub world_id: i32,
}

impl PlayerPosition {
    pub fn new(x: f32, y: f32, world_id: i32) -> Self {
        Self { x, y, world_id }
    }

    /// Euclidean distance, ignoring world membership.
    pub fn distance_to(&self, other: &PlayerPosition) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Body of an `AUTH` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(rename = "PlayerId")]
    pub player_id: String,
    #[serde(rename = "VoiceId")]
    pub voice_id: String,
    #[serde(rename = "Command", default)]
    pub command: String,
}

/// Body of a `PRIO` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrioRequest {
    #[serde(rename = "PlayerId")]
    pub player_id: String,
    #[serde(rename = "SettingType")]
    pub setting_type: String,
    #[serde(rename = "Value")]
    pub value: String,
}

/// Status field of an `ARSP`/`PRSP` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    #[serde(rename = "ACCEPTED")]
    Accepted,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "SUCCESS")]
    Success,
}

/// Body of an `ARSP`/`PRSP` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    #[serde(rename = "Status")]
    pub status: ResponseStatus,
    #[serde(rename = "Message")]
    pub message: String,
}

impl ControlResponse {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Accepted,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Rejected,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: message.into(),
        }
    }
}

/// A priority configuration command, decoded once at the wire boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingCommand {
    Enabled(bool),
    Threshold(u32),
    NonPriorityVolume(f32),
    AddManual(PlayerId),
    RemoveManual(PlayerId),
}

impl SettingCommand {
    pub fn parse(setting_type: &str, value: &str) -> Result<Self, WireError> {
        let bad = |setting: &'static str| WireError::BadValue {
            setting,
            value: value.to_string(),
        };
        match setting_type {
            "ENABLED" => value
                .parse::<bool>()
                .map(Self::Enabled)
                .map_err(|_| bad("ENABLED")),
            "THRESHOLD" => value
                .parse::<u32>()
                .map(Self::Threshold)
                .map_err(|_| bad("THRESHOLD")),
            "NON_PRIORITY_VOLUME" => value
                .parse::<f32>()
                .map(Self::NonPriorityVolume)
                .map_err(|_| bad("NON_PRIORITY_VOLUME")),
            "ADD_MANUAL" => value
                .parse::<PlayerId>()
                .map(Self::AddManual)
                .map_err(|_| bad("ADD_MANUAL")),
            "REMOVE_MANUAL" => value
                .parse::<PlayerId>()
                .map(Self::RemoveManual)
                .map_err(|_| bad("REMOVE_MANUAL")),
            other => Err(WireError::UnknownSetting(other.to_string())),
        }
    }
}

impl TryFrom<&PrioRequest> for SettingCommand {
    type Error = WireError;

    fn try_from(req: &PrioRequest) -> Result<Self, WireError> {
        SettingCommand::parse(&req.setting_type, &req.value)
    }
}

/// Parses the string player id carried in JSON bodies.
pub fn parse_player_id(raw: &str) -> Result<PlayerId, WireError> {
    raw.trim()
        .parse::<PlayerId>()
        .map_err(|_| WireError::BadPlayerId(raw.to_string()))
}

/// Encodes a tagged control packet: 4-byte tag + JSON body.
pub fn encode_control<T: Serialize>(tag: [u8; 4], body: &T) -> Result<Vec<u8>, WireError> {
    let json = serde_json::to_vec(body)?;
    let mut out = Vec::with_capacity(4 + json.len());
    out.extend_from_slice(&tag);
    out.extend_from_slice(&json);
    Ok(out)
}

/// Decodes the JSON body following a 4-byte tag.
pub fn decode_control_body<'a, T: Deserialize<'a>>(datagram: &'a [u8]) -> Result<T, WireError> {
    if datagram.len() < 4 {
        return Err(WireError::TooShort);
    }
    Ok(serde_json::from_slice(&datagram[4..])?)
}

/// Decodes an audio uplink: `[2-byte LE speaker id][opaque payload]`.
pub fn decode_uplink(datagram: &[u8]) -> Result<(PlayerId, &[u8]), WireError> {
    if datagram.len() < 2 {
        return Err(WireError::TooShort);
    }
    let speaker = u16::from_le_bytes([datagram[0], datagram[1]]);
    Ok((speaker, &datagram[2..]))
}

/// Encodes an audio uplink.
pub fn encode_uplink(speaker: PlayerId, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + payload.len());
    out.extend_from_slice(&speaker.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// A decoded audio downlink frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkFrame {
    pub speaker: PlayerId,
    pub volume: f32,
    pub payload: Vec<u8>,
}

/// Encodes an audio downlink:
/// `[2-byte BE speaker id][4-byte BE f32 volume][2-byte BE length][payload]`.
pub fn encode_downlink(
    speaker: PlayerId,
    volume: f32,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    if payload.len() > u16::MAX as usize {
        return Err(WireError::PayloadTooLarge);
    }
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&speaker.to_be_bytes());
    out.extend_from_slice(&volume.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decodes an audio downlink frame.
pub fn decode_downlink(datagram: &[u8]) -> Result<DownlinkFrame, WireError> {
    if datagram.len() < 8 {
        return Err(WireError::TooShort);
    }
    let speaker = u16::from_be_bytes([datagram[0], datagram[1]]);
    let volume = f32::from_be_bytes([datagram[2], datagram[3], datagram[4], datagram[5]]);
    let length = u16::from_be_bytes([datagram[6], datagram[7]]) as usize;
    if datagram.len() < 8 + length {
        return Err(WireError::TooShort);
    }
    Ok(DownlinkFrame {
        speaker,
        volume,
        payload: datagram[8..8 + length].to_vec(),
    })
}
