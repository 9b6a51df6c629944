//! Node identity and peer addressing.
//!
//! An [`Identity`] decides elections; a [`ListenAddress`] names a peer. The
//! two are deliberately separate: identities may collide across test runs,
//! but a listen address is unique within a run, so addresses are the stable
//! key for membership while identities only order the candidates.

use std::fmt;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, ensure};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A node's election identity: days until the mother's birthday, then the
/// student ID as tiebreak.
///
/// The derived ordering is lexicographic on `(days_to_birthday, student_id)`,
/// which is exactly the Bully rule: more days wins, and on equal days the
/// larger student ID wins. On the wire this is the two-element array
/// `[days, student_id]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(u32, u64)", into = "(u32, u64)")]
pub struct Identity {
    pub days_to_birthday: u32,
    pub student_id: u64,
}

impl Identity {
    pub fn new(days_to_birthday: u32, student_id: u64) -> Self {
        Self {
            days_to_birthday,
            student_id,
        }
    }
}

impl From<(u32, u64)> for Identity {
    fn from((days_to_birthday, student_id): (u32, u64)) -> Self {
        Self {
            days_to_birthday,
            student_id,
        }
    }
}

impl From<Identity> for (u32, u64) {
    fn from(identity: Identity) -> Self {
        (identity.days_to_birthday, identity.student_id)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.days_to_birthday, self.student_id)
    }
}

/// The `host:port` endpoint a node accepts connections on.
///
/// Serialized as the string `"host:port"` so it can double as a JSON object
/// key in membership tables. The host may be a hostname; resolution happens
/// at connect time via [`ListenAddress::socket_addr`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenAddress {
    pub host: String,
    pub port: u16,
}

impl ListenAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolves the address for an outbound connection.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve {self}"))?
            .next()
            .ok_or_else(|| anyhow!("no socket addresses for {self}"))
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ListenAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // Split on the last colon so bracketed or qualified hosts survive.
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("expected host:port, got {s:?}"))?;
        ensure!(!host.is_empty(), "empty host in {s:?}");
        let port = port
            .parse()
            .with_context(|| format!("invalid port in {s:?}"))?;
        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for ListenAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl Serialize for ListenAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ListenAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AddrVisitor;

        impl Visitor<'_> for AddrVisitor {
            type Value = ListenAddress;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a host:port string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(AddrVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_orders_on_days_first() {
        assert!(Identity::new(20, 50) > Identity::new(10, 100));
        assert!(Identity::new(5, 200) < Identity::new(10, 100));
    }

    #[test]
    fn identity_breaks_days_tie_on_student_id() {
        assert!(Identity::new(10, 200) > Identity::new(10, 100));
        assert_eq!(Identity::new(10, 100), Identity::new(10, 100));
    }

    #[test]
    fn identity_wire_form_is_a_pair() {
        let encoded = serde_json::to_value(Identity::new(10, 100)).unwrap();
        assert_eq!(encoded, serde_json::json!([10, 100]));
        let decoded: Identity = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, Identity::new(10, 100));
    }

    #[test]
    fn listen_address_round_trips_as_string() {
        let addr = ListenAddress::new("localhost", 60301);
        let encoded = serde_json::to_value(&addr).unwrap();
        assert_eq!(encoded, serde_json::json!("localhost:60301"));
        let decoded: ListenAddress = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn listen_address_parse_rejects_garbage() {
        assert!("no-port-here".parse::<ListenAddress>().is_err());
        assert!(":123".parse::<ListenAddress>().is_err());
        assert!("host:notaport".parse::<ListenAddress>().is_err());
    }
}
