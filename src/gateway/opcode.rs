use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Carries a named event.
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    StatusUpdate = 3,
    VoiceStateUpdate = 4,
    VoicePing = 5,
    Resume = 6,
    /// The server wants us to reconnect.
    Reconnect = 7,
    RequestGuildMembers = 8,
    InvalidSession = 9,
    /// First thing the server sends; carries the heartbeat interval.
    Hello = 10,
    HeartbeatAck = 11,
    GuildSync = 12,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Opcode::Dispatch,
            1 => Opcode::Heartbeat,
            2 => Opcode::Identify,
            3 => Opcode::StatusUpdate,
            4 => Opcode::VoiceStateUpdate,
            5 => Opcode::VoicePing,
            6 => Opcode::Resume,
            7 => Opcode::Reconnect,
            8 => Opcode::RequestGuildMembers,
            9 => Opcode::InvalidSession,
            10 => Opcode::Hello,
            11 => Opcode::HeartbeatAck,
            12 => Opcode::GuildSync,
            other => return Err(other),
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as u8)
    }
}

/// Close code we send when the server stopped acknowledging heartbeats. Sits outside the
/// session-invalidating band so the next connection still resumes.
pub const ZOMBIED_CLOSE_CODE: u16 = 4900;

/// Normal closure.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Gateway close codes with a meaning of their own. All of them are errors after which the
/// session can't be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum GatewayCloseCode {
    UnknownError = 4000,
    UnknownOpcode = 4001,
    DecodeError = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    SessionNoLongerValid = 4006,
    InvalidSeq = 4007,
    RateLimited = 4008,
    SessionTimeout = 4009,
    InvalidShard = 4010,
    ShardingRequired = 4011,
}

impl GatewayCloseCode {
    pub fn from_code(code: u16) -> Option<Self> {
        use GatewayCloseCode::*;
        Some(match code {
            4000 => UnknownError,
            4001 => UnknownOpcode,
            4002 => DecodeError,
            4003 => NotAuthenticated,
            4004 => AuthenticationFailed,
            4005 => AlreadyAuthenticated,
            4006 => SessionNoLongerValid,
            4007 => InvalidSeq,
            4008 => RateLimited,
            4009 => SessionTimeout,
            4010 => InvalidShard,
            4011 => ShardingRequired,
            _ => return None,
        })
    }
}

/// What a close code means for the next connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Normal closure; nothing went wrong.
    Clean,
    /// Reconnect and resume the session.
    Resumable,
    /// Reconnect with a fresh identify.
    Reidentify,
}

impl CloseKind {
    /// `None` means the connection ended without a close frame.
    pub fn classify(code: Option<u16>) -> Self {
        match code {
            Some(code) if is_session_invalidating(code) => CloseKind::Reidentify,
            Some(NORMAL_CLOSE_CODE) => CloseKind::Clean,
            _ => CloseKind::Resumable,
        }
    }
}

pub fn is_session_invalidating(code: u16) -> bool {
    GatewayCloseCode::from_code(code).is_some()
}
