/// SOCKS4 / SOCKS4A wire format.
///
/// SOCKS4:  carries a literal IPv4 destination.
/// SOCKS4A: a destination address of the form 0.0.0.x (x ≠ 0) marks a
///          hostname appended after the userid, resolved by the proxy.

use std::net::Ipv4Addr;
use thiserror::Error;

// Protocol constants
pub const VERSION: u8 = 4;
pub const CMD_CONNECT: u8 = 1;
pub const CMD_BIND: u8 = 2;

// Reply codes
pub const REPLY_VERSION: u8 = 0;
pub const REPLY_GRANTED: u8 = 0x5A;
pub const REPLY_REJECTED: u8 = 0x5B;

/// Fixed request header plus at least the userid terminator.
pub const MIN_REQUEST_LEN: usize = 9;

/// Reply messages are always exactly this long.
pub const REPLY_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("request too short ({0} bytes)")]
    Truncated(usize),
    #[error("unsupported SOCKS version {0}")]
    Version(u8),
    #[error("unknown command code {0}")]
    BadCommand(u8),
    #[error("userid is not NUL-terminated")]
    UnterminatedUserId,
    #[error("domain is not NUL-terminated")]
    UnterminatedDomain,
    #[error("domain is not valid UTF-8")]
    InvalidDomain,
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::Connect => CMD_CONNECT,
            Command::Bind => CMD_BIND,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Bind => "BIND",
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = DecodeError;

    fn try_from(code: u8) -> Result<Self, DecodeError> {
        match code {
            CMD_CONNECT => Ok(Command::Connect),
            CMD_BIND => Ok(Command::Bind),
            other => Err(DecodeError::BadCommand(other)),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Decoded form of the client's first message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub dst_port: u16,
    /// Raw destination address as sent on the wire. For SOCKS4A requests
    /// this is the 0.0.0.x marker and must never be connected to.
    pub dst_ip: Ipv4Addr,
    /// Contents are parsed and ignored.
    pub userid: String,
    /// Present only for SOCKS4A requests.
    pub domain: Option<String>,
}

impl Request {
    /// Hostname to resolve: the SOCKS4A domain when present, the dotted-quad
    /// of the literal destination otherwise.
    pub fn host(&self) -> String {
        match self.domain {
            Some(ref domain) => domain.clone(),
            None => self.dst_ip.to_string(),
        }
    }

    /// Inverse of [`decode_request`] over the logical fields.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_REQUEST_LEN + self.userid.len());
        buf.push(VERSION);
        buf.push(self.command.code());
        buf.extend_from_slice(&self.dst_port.to_be_bytes());
        buf.extend_from_slice(&self.dst_ip.octets());
        buf.extend_from_slice(self.userid.as_bytes());
        buf.push(0);
        if let Some(ref domain) = self.domain {
            buf.extend_from_slice(domain.as_bytes());
            buf.push(0);
        }
        buf
    }
}

/// Decode a SOCKS4/4A request from the client's first message.
pub fn decode_request(buf: &[u8]) -> Result<Request, DecodeError> {
    if buf.len() < MIN_REQUEST_LEN {
        return Err(DecodeError::Truncated(buf.len()));
    }
    if buf[0] != VERSION {
        return Err(DecodeError::Version(buf[0]));
    }
    let command = Command::try_from(buf[1])?;
    let dst_port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = [buf[4], buf[5], buf[6], buf[7]];

    // SOCKS4A is decided on the raw address bytes, before the literal
    // address is ever interpreted.
    let socks4a = ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0;

    let nul = buf[8..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::UnterminatedUserId)?;
    let userid = String::from_utf8_lossy(&buf[8..8 + nul]).into_owned();

    let domain = if socks4a {
        let rest = &buf[8 + nul + 1..];
        let dnul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::UnterminatedDomain)?;
        let domain = std::str::from_utf8(&rest[..dnul]).map_err(|_| DecodeError::InvalidDomain)?;
        Some(domain.to_owned())
    } else {
        None
    };

    Ok(Request {
        command,
        dst_port,
        dst_ip: Ipv4Addr::from(ip),
        userid,
        domain,
    })
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// The server's 8-byte response. CONNECT replies carry zeros; BIND replies
/// carry the ephemeral listener port and the proxy's local IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub granted: bool,
    pub dst_port: u16,
    pub dst_ip: Ipv4Addr,
}

impl Reply {
    pub fn grant(dst_port: u16, dst_ip: Ipv4Addr) -> Self {
        Reply {
            granted: true,
            dst_port,
            dst_ip,
        }
    }

    pub fn reject() -> Self {
        Reply {
            granted: false,
            dst_port: 0,
            dst_ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    pub fn encode(&self) -> [u8; REPLY_LEN] {
        let cd = if self.granted { REPLY_GRANTED } else { REPLY_REJECTED };
        let port = self.dst_port.to_be_bytes();
        let ip = self.dst_ip.octets();
        [REPLY_VERSION, cd, port[0], port[1], ip[0], ip[1], ip[2], ip[3]]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
