//! Communication paths: a terminal address, optionally reached through
//! intermediate devices.
//!
//! A path is written as a comma separated list, host first:
//! `10.10.10.5` (direct) or `192.168.1.20,1,0,2,10.10.10.5` (routed through
//! a backplane and an Ethernet module). Routing segments are either numeric
//! (ports, slots) or text (network addresses).

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::constants::{DEFAULT_CHUNK_SIZE, ROUTED_FRAME_BUDGET, ROUTED_RESERVED_BYTES};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("communication path is empty")]
    Empty,
    #[error("empty route segment at position {0}")]
    EmptySegment(usize),
    #[error("route segments must come in port/link pairs, got {0} segments")]
    Unpaired(usize),
    #[error("route port must be numeric, got '{0}'")]
    TextPort(String),
    #[error("route overhead of {overhead} bytes leaves no room for data")]
    TooLong { overhead: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteSegment {
    Numeric(u8),
    Text(String),
}

impl RouteSegment {
    /// Bytes this segment takes out of a routed frame.
    pub fn overhead(&self) -> usize {
        match self {
            RouteSegment::Numeric(_) => 1,
            RouteSegment::Text(s) => {
                let len = 2 + s.len();
                len + len % 2
            }
        }
    }
}

impl fmt::Display for RouteSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteSegment::Numeric(n) => write!(f, "{}", n),
            RouteSegment::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommPath {
    pub host: String,
    pub route: Vec<RouteSegment>,
}

impl CommPath {
    pub fn direct(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            route: Vec::new(),
        }
    }

    pub fn is_routed(&self) -> bool {
        !self.route.is_empty()
    }

    /// Total frame overhead of the route segments.
    pub fn route_overhead(&self) -> usize {
        self.route.iter().map(RouteSegment::overhead).sum()
    }

    /// Chunk size negotiated in every create-transfer request on this path.
    pub fn chunk_size(&self) -> Result<u16, RouteError> {
        if !self.is_routed() {
            return Ok(DEFAULT_CHUNK_SIZE);
        }
        let overhead = self.route_overhead();
        let available = ROUTED_FRAME_BUDGET
            .checked_sub(ROUTED_RESERVED_BYTES + overhead)
            .filter(|&n| n > 0)
            .ok_or(RouteError::TooLong { overhead })?;
        Ok(available as u16)
    }

    /// Encodes the route as CIP port segments (port/link pairs).
    pub fn port_segments(&self) -> Result<Vec<u8>, RouteError> {
        if self.route.len() % 2 != 0 {
            return Err(RouteError::Unpaired(self.route.len()));
        }
        let mut out = Vec::new();
        for pair in self.route.chunks(2) {
            let port = match &pair[0] {
                RouteSegment::Numeric(p) => *p,
                RouteSegment::Text(s) => return Err(RouteError::TextPort(s.clone())),
            };
            match &pair[1] {
                RouteSegment::Numeric(link) => {
                    out.push(port);
                    out.push(*link);
                }
                RouteSegment::Text(addr) => {
                    out.push(port | 0x10);
                    out.push(addr.len() as u8);
                    out.extend_from_slice(addr.as_bytes());
                    if addr.len() % 2 != 0 {
                        out.push(0);
                    }
                }
            }
        }
        Ok(out)
    }
}

impl FromStr for CommPath {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',').map(str::trim);
        let host = match parts.next() {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => return Err(RouteError::Empty),
        };
        let mut route = Vec::new();
        for (i, part) in parts.enumerate() {
            if part.is_empty() {
                return Err(RouteError::EmptySegment(i + 1));
            }
            route.push(match part.parse::<u8>() {
                Ok(n) => RouteSegment::Numeric(n),
                Err(_) => RouteSegment::Text(part.to_string()),
            });
        }
        Ok(Self { host, route })
    }
}

impl fmt::Display for CommPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host)?;
        for seg in &self.route {
            write!(f, ",{}", seg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_path_uses_default_chunk() {
        let path: CommPath = "10.10.10.5".parse().unwrap();
        assert!(!path.is_routed());
        assert_eq!(path.chunk_size().unwrap(), 1984);
    }

    #[test]
    fn test_routed_chunk_size_formula() {
        let path: CommPath = "192.168.1.20,1,0,2,10.10.10.5".parse().unwrap();
        // three numeric segments, one 10 character text segment (2 + 10, already even)
        assert_eq!(path.chunk_size().unwrap(), (466 - 2 - 3 - 12) as u16);

        let odd: CommPath = "192.168.1.20,2,10.1.1.25".parse().unwrap();
        // 2 + 9 = 11, padded to 12
        assert_eq!(odd.chunk_size().unwrap(), (466 - 2 - 1 - 12) as u16);
    }

    #[test]
    fn test_chunk_size_over_many_routes() {
        for numeric in 0..6usize {
            for texts in 0..4usize {
                let mut text = String::from("host");
                for n in 0..numeric {
                    text.push_str(&format!(",{}", n));
                }
                let mut expected = 466 - 2 - numeric;
                for t in 0..texts {
                    let addr = format!("10.0.0.{}", t * 37);
                    let seg = 2 + addr.len();
                    expected -= seg + seg % 2;
                    text.push(',');
                    text.push_str(&addr);
                }
                let path: CommPath = text.parse().unwrap();
                assert_eq!(path.chunk_size().unwrap() as usize, expected, "{}", text);
            }
        }
    }

    #[test]
    fn test_port_segment_encoding() {
        let path: CommPath = "192.168.1.20,1,0,2,10.1.1.25".parse().unwrap();
        let bytes = path.port_segments().unwrap();
        let mut expected = vec![0x01, 0x00, 0x12, 9];
        expected.extend_from_slice(b"10.1.1.25");
        expected.push(0);
        assert_eq!(bytes, expected);

        let unpaired: CommPath = "h,1".parse().unwrap();
        assert_eq!(unpaired.port_segments(), Err(RouteError::Unpaired(1)));
    }

    #[test]
    fn test_parse_errors_and_display() {
        assert_eq!("".parse::<CommPath>(), Err(RouteError::Empty));
        assert_eq!("h,,1".parse::<CommPath>(), Err(RouteError::EmptySegment(1)));
        let path: CommPath = " 10.0.0.1 , 1 , 0 ".parse().unwrap();
        assert_eq!(path.to_string(), "10.0.0.1,1,0");
    }
}
