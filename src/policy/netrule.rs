//! Network rule grammar.
//!
//! ```text
//! rule     := endpoint ':' endpoint
//! endpoint := addr ':' port [ '-' port ]
//! addr     := ipv4 | '[' ipv6 ']'      (empty means any)
//! ```
//!
//! The first endpoint is the local (bind) side, the second the peer
//! (connect) side. Both must use the same address family. The scanner reads
//! strictly left to right and rejects trailing input.

use crate::config::types::{PalError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    pub fn raw(self) -> u32 {
        match self {
            AddressFamily::Inet => libc::AF_INET as u32,
            AddressFamily::Inet6 => libc::AF_INET6 as u32,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw as i32 {
            libc::AF_INET => Some(AddressFamily::Inet),
            libc::AF_INET6 => Some(AddressFamily::Inet6),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(begin: u16, end: u16) -> Result<Self> {
        if begin > end {
            return Err(PalError::InvalidArgument(format!(
                "port range {}-{} is reversed",
                begin, end
            )));
        }
        Ok(Self { begin, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.begin..=self.end).contains(&port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetEndpoint {
    pub addr: IpAddr,
    pub ports: PortRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetRule {
    pub family: AddressFamily,
    pub local: NetEndpoint,
    pub peer: NetEndpoint,
}

impl NetRule {
    pub fn parse(input: &str) -> Result<Self> {
        let mut scanner = Scanner {
            input: input.as_bytes(),
            pos: 0,
            text: input,
        };
        let (local_family, local) = scanner.endpoint()?;
        scanner.expect(b':')?;
        let (peer_family, peer) = scanner.endpoint()?;
        if scanner.pos != scanner.input.len() {
            return Err(scanner.error("trailing characters"));
        }
        if local_family != peer_family {
            return Err(scanner.error("local and peer address families differ"));
        }
        Ok(NetRule {
            family: local_family,
            local,
            peer,
        })
    }
}

impl fmt::Display for NetEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(addr) => write!(f, "{}", addr)?,
            IpAddr::V6(addr) => write!(f, "[{}]", addr)?,
        }
        if self.ports.begin == self.ports.end {
            write!(f, ":{}", self.ports.begin)
        } else {
            write!(f, ":{}-{}", self.ports.begin, self.ports.end)
        }
    }
}

impl fmt::Display for NetRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.peer)
    }
}

struct Scanner<'a> {
    input: &'a [u8],
    pos: usize,
    text: &'a str,
}

impl<'a> Scanner<'a> {
    fn error(&self, what: &str) -> PalError {
        PalError::InvalidArgument(format!(
            "network rule {:?}: {} at offset {}",
            self.text, what, self.pos
        ))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    /// Consume bytes up to (not including) `stop`
    fn take_until(&mut self, stop: u8) -> Result<&'a str> {
        let input: &'a [u8] = self.input;
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == stop {
                break;
            }
            self.pos += 1;
        }
        std::str::from_utf8(&input[start..self.pos]).map_err(|_| self.error("invalid UTF-8"))
    }

    fn endpoint(&mut self) -> Result<(AddressFamily, NetEndpoint)> {
        let (family, addr) = if self.peek() == Some(b'[') {
            self.pos += 1;
            let text = self.take_until(b']')?;
            let addr = if text.is_empty() {
                Ipv6Addr::UNSPECIFIED
            } else {
                text.parse::<Ipv6Addr>()
                    .map_err(|_| self.error("bad IPv6 address"))?
            };
            self.expect(b']')?;
            (AddressFamily::Inet6, IpAddr::V6(addr))
        } else {
            let text = self.take_until(b':')?;
            let addr = if text.is_empty() {
                Ipv4Addr::UNSPECIFIED
            } else {
                text.parse::<Ipv4Addr>()
                    .map_err(|_| self.error("bad IPv4 address"))?
            };
            (AddressFamily::Inet, IpAddr::V4(addr))
        };
        self.expect(b':')?;
        let begin = self.port()?;
        let end = if self.peek() == Some(b'-') {
            self.pos += 1;
            self.port()?
        } else {
            begin
        };
        let ports = PortRange::new(begin, end).map_err(|_| self.error("reversed port range"))?;
        Ok((family, NetEndpoint { addr, ports }))
    }

    fn port(&mut self) -> Result<u16> {
        let start = self.pos;
        let mut value: u32 = 0;
        while let Some(b) = self.peek().filter(u8::is_ascii_digit) {
            value = value * 10 + (b - b'0') as u32;
            if value > u16::MAX as u32 {
                return Err(self.error("port out of range"));
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected port"));
        }
        Ok(value as u16)
    }
}
