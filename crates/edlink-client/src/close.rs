//! WebSocket close codes.

use std::fmt;

/// A WebSocket close code as reported by the transport.
///
/// Only [`CloseCode::NORMAL`] marks a close as intentional. Every other
/// code, including the server's authentication rejections, is treated as
/// an unexpected loss of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CloseCode(u16);

impl CloseCode {
    /// Normal closure, sent by the manager on teardown.
    pub const NORMAL: Self = Self(1000);
    /// The peer closed without a status code.
    pub const NO_STATUS: Self = Self(1005);
    /// The connection dropped without a close frame, or never opened.
    pub const ABNORMAL: Self = Self(1006);
    /// A `ping` went unanswered past the configured pong timeout.
    pub const HEARTBEAT_TIMEOUT: Self = Self(4000);
    /// Server rejected the token.
    pub const INVALID_TOKEN: Self = Self(4001);
    /// Token belongs to a different user than the one in the path.
    pub const USER_MISMATCH: Self = Self(4002);
    /// Server-side authentication failure.
    pub const AUTH_ERROR: Self = Self(4003);

    /// Wrap a raw code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// The raw numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Whether the close was requested on purpose by this client.
    #[must_use]
    pub fn is_intentional(self) -> bool {
        self == Self::NORMAL
    }

    /// Whether the server refused the connection's credentials.
    #[must_use]
    pub fn is_auth_rejection(self) -> bool {
        (Self::INVALID_TOKEN.0..=Self::AUTH_ERROR.0).contains(&self.0)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.0
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
