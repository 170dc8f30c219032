use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::net::packet_handler::HandlerId;
use crate::util::buf_ext::{BufExt, BufMutExt};


/// message kind (u16) followed by the destination service id (u32)
pub const HEADER_LEN: usize = 6;

/// hard maximum for any length-prefixed string on the wire
pub const MAX_STRING_LEN: usize = 240;

const TO_AUTHORITY_RANGE: std::ops::Range<u16> = 0x0001..0x0100;
const TO_PARTICIPANT_RANGE: std::ops::Range<u16> = 0x0100..0x0200;
const TRANSFER_RANGE: std::ops::Range<u16> = 0x0200..0x0300;

/// All message kinds, partitioned into three disjoint numeric ranges: participant to
///  authority, authority to participant, and file transfer (flowing both ways).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum MsgKind {
    Logon = 0x0001,
    Logoff = 0x0002,
    SendLatch = 0x0003,
    RequestModule = 0x0004,
    ImLoaded = 0x0005,

    Accept = 0x0101,
    Reject = 0x0102,
    ModuleInfo = 0x0103,
    ModuleBad = 0x0104,
    Start = 0x0105,
    Kick = 0x0106,
    RecvLatch = 0x0107,

    RequestFile = 0x0201,
    TransferFile = 0x0202,
    CreateDirectory = 0x0203,
    TransferAck = 0x0204,
    AllFilesSent = 0x0205,
    CheckCrc = 0x0206,
    AckCrc = 0x0207,
    SendCrc = 0x0208,
}

impl MsgKind {
    pub fn is_to_authority(&self) -> bool {
        TO_AUTHORITY_RANGE.contains(&u16::from(*self))
    }

    pub fn is_to_participant(&self) -> bool {
        TO_PARTICIPANT_RANGE.contains(&u16::from(*self))
    }

    pub fn is_transfer(&self) -> bool {
        TRANSFER_RANGE.contains(&u16::from(*self))
    }
}


/// Reads the message kind header without advancing the buffer, so the dispatcher can
///  classify a packet before any handler consumes it.
pub fn peek_kind(buf: &[u8]) -> Option<u16> {
    if buf.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([buf[0], buf[1]]))
}

pub fn put_header(buf: &mut BytesMut, kind: MsgKind, service: HandlerId) {
    buf.put_u16(kind.into());
    buf.put_u32(service.0);
}


/// A message's kind plus the serialization of its kind-specific fields; the packet header
///  is composed by the sending host.
pub trait WireMessage {
    fn kind(&self) -> MsgKind;

    fn ser_fields(&self, buf: &mut BytesMut) -> anyhow::Result<()>;
}


/// Payload of the transport's connect event: the connecting machine introduces itself and
///  names the service it wants to talk to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectGreeting {
    pub hostname: String,
    pub display_name: String,
    pub service: HandlerId,
}

impl ConnectGreeting {
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_string(&self.hostname, MAX_STRING_LEN)?;
        buf.put_string(&self.display_name, MAX_STRING_LEN)?;
        buf.put_u32(self.service.0);
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ConnectGreeting> {
        let hostname = buf.try_get_string(MAX_STRING_LEN)?;
        let display_name = buf.try_get_string(MAX_STRING_LEN)?;
        let service = HandlerId(buf.try_get_u32()?);

        Ok(ConnectGreeting {
            hostname,
            display_name,
            service,
        })
    }
}
