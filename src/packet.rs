// Time sync wire format.
//
// Frame layout (big-endian, identical for both message types):
// - 4 bytes: magic (fixed to b"TSP1")
// - 1 byte : message type (0=probe, 1=reply)
// - 4 bytes: sequence number (u32)
// - 8 bytes: t0, client send time (i64, us)
// - 8 bytes: t1, server receive time (i64, us, zero in probes)
// - 8 bytes: t2, server send time (i64, us, zero in probes)
//
// Trailing bytes past the frame are ignored.
use bytemuck::{Pod, Zeroable};

pub const MAGIC: [u8; 4] = *b"TSP1";
pub const FRAME_LEN: usize = 4 + 1 + 4 + 8 + 8 + 8; // 33 bytes

const TYPE_PROBE: u8 = 0;
const TYPE_REPLY: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
  TooShort,
  BadMagic,
  UnknownType(u8),
}

impl core::fmt::Display for PacketError {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match self {
      PacketError::TooShort => write!(f, "time sync packet too short"),
      PacketError::BadMagic => write!(f, "bad time sync packet magic"),
      PacketError::UnknownType(t) => {
        write!(f, "unknown time sync packet type {t}")
      }
    }
  }
}

impl std::error::Error for PacketError {}

// All fields are byte arrays so the struct has alignment 1 and no padding.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Frame {
  magic: [u8; 4],
  kind: u8,
  seq: [u8; 4],
  t0: [u8; 8],
  t1: [u8; 8],
  t2: [u8; 8],
}

const _: () = assert!(core::mem::size_of::<Frame>() == FRAME_LEN);

/// Sent by the initiator; carries its own send timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
  pub seq: u32,
  pub t0_us: i64,
}

/// Sent by the responder in direct answer to a [`Probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
  pub seq: u32,
  pub t0_us: i64,
  pub t1_us: i64,
  pub t2_us: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
  Probe(Probe),
  Reply(Reply),
}

impl Probe {
  /// Builds the reply for this probe, echoing its sequence and send time.
  pub fn reply(&self, t1_us: i64, t2_us: i64) -> Reply {
    Reply {
      seq: self.seq,
      t0_us: self.t0_us,
      t1_us,
      t2_us,
    }
  }
}

impl Reply {
  /// True when this reply answers exactly the given probe.
  pub fn answers(&self, probe: &Probe) -> bool {
    self.seq == probe.seq && self.t0_us == probe.t0_us
  }
}

pub fn encode(msg: &Message) -> [u8; FRAME_LEN] {
  let (kind, seq, t0, t1, t2) = match *msg {
    Message::Probe(p) => (TYPE_PROBE, p.seq, p.t0_us, 0, 0),
    Message::Reply(r) => (TYPE_REPLY, r.seq, r.t0_us, r.t1_us, r.t2_us),
  };
  let frame = Frame {
    magic: MAGIC,
    kind,
    seq: seq.to_be_bytes(),
    t0: t0.to_be_bytes(),
    t1: t1.to_be_bytes(),
    t2: t2.to_be_bytes(),
  };
  bytemuck::cast(frame)
}

pub fn decode(data: &[u8]) -> Result<Message, PacketError> {
  // Check magic first so unrelated short datagrams report as foreign.
  if data.len() >= MAGIC.len() && data[..MAGIC.len()] != MAGIC {
    return Err(PacketError::BadMagic);
  }
  let head = data.get(..FRAME_LEN).ok_or(PacketError::TooShort)?;
  let frame: &Frame =
    bytemuck::try_from_bytes(head).map_err(|_| PacketError::TooShort)?;

  let seq = u32::from_be_bytes(frame.seq);
  let t0_us = i64::from_be_bytes(frame.t0);
  match frame.kind {
    TYPE_PROBE => Ok(Message::Probe(Probe { seq, t0_us })),
    TYPE_REPLY => Ok(Message::Reply(Reply {
      seq,
      t0_us,
      t1_us: i64::from_be_bytes(frame.t1),
      t2_us: i64::from_be_bytes(frame.t2),
    })),
    other => Err(PacketError::UnknownType(other)),
  }
}
