//! Wire codec shared by peers and the group coordinator.
//!
//! Every message is one length-prefixed frame:
//! - 4 bytes: payload length (big-endian u32)
//! - N bytes: a JSON value
//!
//! Requests are the two-element array `[name, data]` where `name` is one of
//! the four tag strings; acknowledgements to ELECT and PROBE are the bare
//! JSON string `"GOT_IT"`, not a tagged pair. One message travels per TCP
//! connection and the connection closes after the reply.

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::identity::{Identity, ListenAddress};
use crate::membership::MembershipTable;

/// Bare-string acknowledgement of ELECT and PROBE.
pub const GOT_IT: &str = "GOT_IT";

/// Frames above this size are treated as malformed rather than buffered.
const MAX_FRAME_LEN: usize = 1 << 20;

const TAG_HOWDY: &str = "HOWDY";
const TAG_ELECT: &str = "ELECT";
const TAG_LEADER: &str = "I_AM_LEADER";
const TAG_PROBE: &str = "PROBE";

/// Everything a node or the coordinator can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Join request, coordinator-bound only.
    Howdy {
        identity: Identity,
        listen: ListenAddress,
    },
    /// Election wave carrying the sender's membership table.
    Elect { members: MembershipTable },
    /// Leader announcement; expects no reply.
    IAmLeader { identity: Identity },
    /// Liveness check against the current leader.
    Probe,
}

impl PeerMessage {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let pair: (&str, Value) = match self {
            PeerMessage::Howdy { identity, listen } => (
                TAG_HOWDY,
                serde_json::to_value((identity, listen)).map_err(to_io_error)?,
            ),
            PeerMessage::Elect { members } => (
                TAG_ELECT,
                serde_json::to_value(members).map_err(to_io_error)?,
            ),
            PeerMessage::IAmLeader { identity } => (
                TAG_LEADER,
                serde_json::to_value(identity).map_err(to_io_error)?,
            ),
            PeerMessage::Probe => (TAG_PROBE, Value::Null),
        };
        serde_json::to_vec(&pair).map_err(to_io_error)
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        let (name, data): (String, Value) =
            serde_json::from_slice(bytes).map_err(to_io_error)?;
        match name.as_str() {
            TAG_HOWDY => {
                let (identity, listen) =
                    serde_json::from_value(data).map_err(to_io_error)?;
                Ok(PeerMessage::Howdy { identity, listen })
            }
            TAG_ELECT => Ok(PeerMessage::Elect {
                members: serde_json::from_value(data).map_err(to_io_error)?,
            }),
            TAG_LEADER => Ok(PeerMessage::IAmLeader {
                identity: serde_json::from_value(data).map_err(to_io_error)?,
            }),
            TAG_PROBE => Ok(PeerMessage::Probe),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message tag {other:?}"),
            )),
        }
    }
}

/// Writes one framed payload.
pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Reads one framed payload.
pub fn read_frame(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writes any serializable value as one frame. Used for the coordinator's
/// membership reply, which is a mapping rather than a tagged pair.
pub fn write_json<T: Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
    let payload = serde_json::to_vec(value).map_err(to_io_error)?;
    write_frame(writer, &payload)
}

/// Reads one frame and decodes it as `T`.
pub fn read_json<T: DeserializeOwned>(reader: &mut impl Read) -> io::Result<T> {
    let payload = read_frame(reader)?;
    serde_json::from_slice(&payload).map_err(to_io_error)
}

pub fn write_message(writer: &mut impl Write, message: &PeerMessage) -> io::Result<()> {
    let payload = message.encode()?;
    write_frame(writer, &payload)
}

pub fn read_message(reader: &mut impl Read) -> io::Result<PeerMessage> {
    PeerMessage::decode(&read_frame(reader)?)
}

/// Writes the bare `"GOT_IT"` acknowledgement.
pub fn write_ack(writer: &mut impl Write) -> io::Result<()> {
    write_json(writer, &GOT_IT)
}

/// Reads a reply frame and checks it is the bare `"GOT_IT"` string.
pub fn read_ack(reader: &mut impl Read) -> io::Result<bool> {
    let reply: String = read_json(reader)?;
    Ok(reply == GOT_IT)
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
