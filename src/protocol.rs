//! Gateway wire format: opcodes, close codes, envelopes and outbound payloads.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::{BitOr, BitOrAssign};
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

/// Largest frame the gateway accepts from a client
pub const MAX_PAYLOAD_SIZE: usize = 4096;

/// Gateway opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    Reconnect = 7,
    RequestGuildMembers = 8,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

impl Opcode {
    pub fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0 => Opcode::Dispatch,
            1 => Opcode::Heartbeat,
            2 => Opcode::Identify,
            3 => Opcode::PresenceUpdate,
            4 => Opcode::VoiceStateUpdate,
            6 => Opcode::Resume,
            7 => Opcode::Reconnect,
            8 => Opcode::RequestGuildMembers,
            9 => Opcode::InvalidSession,
            10 => Opcode::Hello,
            11 => Opcode::HeartbeatAck,
            _ => return None,
        })
    }
}

/// WebSocket close codes used by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    NormalClosure = 1000,
    UnknownError = 4000,
    UnknownOpcode = 4001,
    DecodeError = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    InvalidSeq = 4007,
    RateLimited = 4008,
    SessionTimeout = 4009,
    InvalidShard = 4010,
    ShardingRequired = 4011,
    InvalidVersion = 4012,
    InvalidIntents = 4013,
    DisallowedIntents = 4014,
}

impl CloseCode {
    /// Close codes that stop a shard unless configured otherwise.
    pub const DEFAULT_FATAL: [CloseCode; 8] = [
        CloseCode::NotAuthenticated,
        CloseCode::AuthenticationFailed,
        CloseCode::AlreadyAuthenticated,
        CloseCode::InvalidShard,
        CloseCode::ShardingRequired,
        CloseCode::InvalidVersion,
        CloseCode::InvalidIntents,
        CloseCode::DisallowedIntents,
    ];

    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            1000 => CloseCode::NormalClosure,
            4000 => CloseCode::UnknownError,
            4001 => CloseCode::UnknownOpcode,
            4002 => CloseCode::DecodeError,
            4003 => CloseCode::NotAuthenticated,
            4004 => CloseCode::AuthenticationFailed,
            4005 => CloseCode::AlreadyAuthenticated,
            4007 => CloseCode::InvalidSeq,
            4008 => CloseCode::RateLimited,
            4009 => CloseCode::SessionTimeout,
            4010 => CloseCode::InvalidShard,
            4011 => CloseCode::ShardingRequired,
            4012 => CloseCode::InvalidVersion,
            4013 => CloseCode::InvalidIntents,
            4014 => CloseCode::DisallowedIntents,
            _ => return None,
        })
    }

    /// Whether the session must be discarded after this close.
    pub fn invalidates_session(self) -> bool {
        matches!(self, CloseCode::InvalidSeq | CloseCode::SessionTimeout)
    }
}

/// Gateway intents bitfield
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Intents(u64);

impl Intents {
    pub const GUILDS: Intents = Intents(1 << 0);
    pub const GUILD_MEMBERS: Intents = Intents(1 << 1);
    pub const GUILD_BANS: Intents = Intents(1 << 2);
    pub const GUILD_EMOJIS: Intents = Intents(1 << 3);
    pub const GUILD_INTEGRATIONS: Intents = Intents(1 << 4);
    pub const GUILD_WEBHOOKS: Intents = Intents(1 << 5);
    pub const GUILD_INVITES: Intents = Intents(1 << 6);
    pub const GUILD_VOICE_STATES: Intents = Intents(1 << 7);
    pub const GUILD_PRESENCES: Intents = Intents(1 << 8);
    pub const GUILD_MESSAGES: Intents = Intents(1 << 9);
    pub const GUILD_MESSAGE_REACTIONS: Intents = Intents(1 << 10);
    pub const GUILD_MESSAGE_TYPING: Intents = Intents(1 << 11);
    pub const DIRECT_MESSAGES: Intents = Intents(1 << 12);
    pub const DIRECT_MESSAGE_REACTIONS: Intents = Intents(1 << 13);
    pub const DIRECT_MESSAGE_TYPING: Intents = Intents(1 << 14);

    pub const fn empty() -> Self {
        Intents(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Intents(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: Intents) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Intents {
    type Output = Intents;

    fn bitor(self, rhs: Intents) -> Intents {
        Intents(self.0 | rhs.0)
    }
}

impl BitOrAssign for Intents {
    fn bitor_assign(&mut self, rhs: Intents) {
        self.0 |= rhs.0;
    }
}

/// Inbound gateway envelope
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayPayload {
    /// Parse a decoded frame; the top level must be a JSON object.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let value: Value = serde_json::from_slice(bytes)?;
        if !value.is_object() {
            return Err(Error::Protocol(format!(
                "expected a JSON object, got {}",
                json_type_name(&value)
            )));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.op)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Serialize)]
struct Outbound<'a, T: Serialize> {
    op: u8,
    d: &'a T,
}

/// Serialize an outbound frame, rejecting it locally if it exceeds [`MAX_PAYLOAD_SIZE`].
pub fn encode_outbound<T: Serialize>(op: Opcode, d: &T) -> Result<String, Error> {
    let text = serde_json::to_string(&Outbound { op: op as u8, d })?;
    if text.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::PayloadTooLarge {
            size: text.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(text)
}

/// Build the connection URL with the gateway's query parameters.
///
/// Existing `v`, `encoding` and `compress` parameters are replaced; others are kept.
pub fn gateway_url(base: &str, version: u8, compress: bool) -> Result<String, Error> {
    let mut url = Url::parse(base)
        .map_err(|e| Error::ConnectionFailed(format!("Invalid gateway URL: {}", e)))?;

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !matches!(k.as_ref(), "v" | "encoding" | "compress"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (k, v) in &kept {
            query.append_pair(k, v);
        }
        query.append_pair("v", &version.to_string());
        query.append_pair("encoding", "json");
        if compress {
            query.append_pair("compress", "zlib-stream");
        }
    }

    Ok(url.to_string())
}

/// The `$os`/`$browser`/`$device` triplet sent in IDENTIFY
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties {
    #[serde(rename = "$os")]
    pub os: String,
    #[serde(rename = "$browser")]
    pub browser: String,
    #[serde(rename = "$device")]
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Identify<'a> {
    pub token: &'a str,
    pub compress: bool,
    pub large_threshold: u32,
    pub properties: ConnectionProperties,
    pub shard: [u32; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intents: Option<Intents>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresencePayload>,
}

#[derive(Debug, Serialize)]
pub(crate) struct Resume<'a> {
    pub token: &'a str,
    pub session_id: &'a str,
    pub seq: u64,
}

/// Online status shown for the client user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Online,
    Idle,
    Dnd,
    Invisible,
    Offline,
}

/// An activity ("game") shown in the presence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Activity {
    pub fn playing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: 0,
            url: None,
        }
    }
}

/// The presence a shard reports; re-sent after every reconnect.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Presence {
    pub status: Status,
    pub activity: Option<Activity>,
    pub idle_since: Option<SystemTime>,
    pub is_afk: bool,
}

impl Presence {
    pub(crate) fn to_payload(&self) -> PresencePayload {
        PresencePayload {
            since: self.idle_since.map(|t| {
                t.duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            }),
            game: self.activity.clone(),
            status: self.status,
            afk: self.is_afk,
        }
    }
}

/// Wire form of [`Presence`]
#[derive(Debug, Clone, Serialize)]
pub(crate) struct PresencePayload {
    pub since: Option<u64>,
    pub game: Option<Activity>,
    pub status: Status,
    pub afk: bool,
}

/// Partial presence update; `None` fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct PresenceUpdate {
    pub status: Option<Status>,
    pub activity: Option<Option<Activity>>,
    pub idle_since: Option<Option<SystemTime>>,
    pub is_afk: Option<bool>,
}

impl PresenceUpdate {
    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn activity(mut self, activity: Option<Activity>) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn idle_since(mut self, since: Option<SystemTime>) -> Self {
        self.idle_since = Some(since);
        self
    }

    pub fn afk(mut self, is_afk: bool) -> Self {
        self.is_afk = Some(is_afk);
        self
    }

    /// Apply the set fields on top of `current`.
    pub fn apply_to(&self, current: &Presence) -> Presence {
        Presence {
            status: self.status.unwrap_or(current.status),
            activity: self
                .activity
                .clone()
                .unwrap_or_else(|| current.activity.clone()),
            idle_since: self.idle_since.unwrap_or(current.idle_since),
            is_afk: self.is_afk.unwrap_or(current.is_afk),
        }
    }
}

/// Member filter for REQUEST_GUILD_MEMBERS
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MemberFilter {
    /// Members whose username starts with `query`; empty query and zero limit fetch everyone
    Query { query: String, limit: u32 },
    /// Specific members by id
    UserIds { user_ids: Vec<String> },
}

/// REQUEST_GUILD_MEMBERS payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuildMembersRequest {
    #[serde(rename = "guild_id")]
    pub guild_ids: Vec<String>,
    #[serde(flatten)]
    pub filter: MemberFilter,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presences: Option<bool>,
}

impl GuildMembersRequest {
    /// Request members matching a username prefix.
    pub fn query<I, S>(guild_ids: I, query: impl Into<String>, limit: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            guild_ids: guild_ids.into_iter().map(Into::into).collect(),
            filter: MemberFilter::Query {
                query: query.into(),
                limit,
            },
            presences: None,
        }
    }

    /// Request specific members by user id.
    pub fn user_ids<I, S, U, T>(guild_ids: I, user_ids: U) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        U: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            guild_ids: guild_ids.into_iter().map(Into::into).collect(),
            filter: MemberFilter::UserIds {
                user_ids: user_ids.into_iter().map(Into::into).collect(),
            },
            presences: None,
        }
    }

    pub fn with_presences(mut self, presences: bool) -> Self {
        self.presences = Some(presences);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.guild_ids.is_empty() {
            return Err(Error::InvalidPayload(
                "at least one guild id is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// VOICE_STATE_UPDATE payload; `channel_id: None` leaves the voice channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceStateUpdate {
    pub guild_id: String,
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gateway_url_query() {
        let url = gateway_url("wss://gateway.example.com", 6, true).unwrap();
        assert_eq!(
            url,
            "wss://gateway.example.com/?v=6&encoding=json&compress=zlib-stream"
        );

        // Stale protocol params are replaced, unrelated ones survive
        let url = gateway_url("wss://gateway.example.com/?v=3&foo=bar", 8, false).unwrap();
        assert_eq!(url, "wss://gateway.example.com/?foo=bar&v=8&encoding=json");
    }

    #[test]
    fn test_gateway_url_invalid() {
        assert!(gateway_url("not a url", 6, false).is_err());
    }

    #[test]
    fn test_identify_shape() {
        let identify = Identify {
            token: "tok",
            compress: false,
            large_threshold: 250,
            properties: ConnectionProperties::default(),
            shard: [1, 4],
            intents: None,
            presence: None,
        };
        let value: Value = serde_json::from_str(&encode_outbound(Opcode::Identify, &identify).unwrap()).unwrap();

        assert_eq!(value["op"], 2);
        assert_eq!(value["d"]["shard"], json!([1, 4]));
        assert_eq!(value["d"]["large_threshold"], 250);
        assert!(value["d"]["properties"]["$os"].is_string());
        // Unset optional fields are omitted rather than sent as null
        assert!(value["d"].get("intents").is_none());
        assert!(value["d"].get("presence").is_none());
    }

    #[test]
    fn test_identify_with_intents_and_presence() {
        let presence = Presence {
            status: Status::Idle,
            activity: Some(Activity::playing("chess")),
            idle_since: Some(UNIX_EPOCH + std::time::Duration::from_millis(1_500)),
            is_afk: true,
        };
        let identify = Identify {
            token: "tok",
            compress: false,
            large_threshold: 50,
            properties: ConnectionProperties::default(),
            shard: [0, 1],
            intents: Some(Intents::GUILDS | Intents::GUILD_MESSAGES),
            presence: Some(presence.to_payload()),
        };
        let value = serde_json::to_value(&identify).unwrap();

        assert_eq!(value["intents"], 1 | (1 << 9));
        assert_eq!(
            value["presence"],
            json!({
                "since": 1500,
                "game": {"name": "chess", "type": 0},
                "status": "idle",
                "afk": true,
            })
        );
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let big = "x".repeat(MAX_PAYLOAD_SIZE);
        let err = encode_outbound(Opcode::PresenceUpdate, &big).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { max: MAX_PAYLOAD_SIZE, .. }));
    }

    #[test]
    fn test_heartbeat_encoding() {
        assert_eq!(
            encode_outbound(Opcode::Heartbeat, &Some(42u64)).unwrap(),
            r#"{"op":1,"d":42}"#
        );
        assert_eq!(
            encode_outbound(Opcode::Heartbeat, &None::<u64>).unwrap(),
            r#"{"op":1,"d":null}"#
        );
    }

    #[test]
    fn test_payload_must_be_object() {
        assert!(GatewayPayload::from_slice(br#"[1, 2]"#).is_err());
        assert!(GatewayPayload::from_slice(b"not json").is_err());

        let payload = GatewayPayload::from_slice(br#"{"op":0,"d":{},"s":3,"t":"READY"}"#).unwrap();
        assert_eq!(payload.opcode(), Some(Opcode::Dispatch));
        assert_eq!(payload.s, Some(3));
        assert_eq!(payload.t.as_deref(), Some("READY"));
    }

    #[test]
    fn test_unknown_opcode() {
        let payload = GatewayPayload::from_slice(br#"{"op":42}"#).unwrap();
        assert_eq!(payload.opcode(), None);
        assert!(payload.d.is_null());
    }

    #[test]
    fn test_close_code_classification() {
        assert!(CloseCode::from_u16(4007).map_or(false, CloseCode::invalidates_session));
        assert!(CloseCode::from_u16(4009).map_or(false, CloseCode::invalidates_session));
        assert!(!CloseCode::AuthenticationFailed.invalidates_session());
        assert_eq!(CloseCode::from_u16(4006), None);
        assert_eq!(CloseCode::from_u16(4011), Some(CloseCode::ShardingRequired));
    }

    #[test]
    fn test_presence_update_mask() {
        let current = Presence {
            status: Status::Dnd,
            activity: Some(Activity::playing("a")),
            idle_since: None,
            is_afk: false,
        };

        let next = PresenceUpdate::default().afk(true).activity(None).apply_to(&current);

        assert_eq!(next.status, Status::Dnd);
        assert_eq!(next.activity, None);
        assert!(next.is_afk);
    }

    #[test]
    fn test_guild_members_request_shapes() {
        let by_query = GuildMembersRequest::query(["1", "2"], "", 0);
        assert_eq!(
            serde_json::to_value(&by_query).unwrap(),
            json!({"guild_id": ["1", "2"], "query": "", "limit": 0})
        );

        let by_ids = GuildMembersRequest::user_ids(["1"], ["10", "11"]).with_presences(true);
        assert_eq!(
            serde_json::to_value(&by_ids).unwrap(),
            json!({"guild_id": ["1"], "user_ids": ["10", "11"], "presences": true})
        );

        let empty = GuildMembersRequest::query(Vec::<String>::new(), "a", 1);
        assert!(empty.validate().is_err());
    }
}
