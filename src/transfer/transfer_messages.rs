use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::net::wire::{MsgKind, WireMessage, MAX_STRING_LEN};
use crate::util::buf_ext::{BufExt, BufMutExt};


/// File replication messages. `name` fields are protocol path strings as understood by
///  [crate::transfer::file_store::FileStore].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransferMsg {
    RequestFile { remote_name: String, local_name: String },
    TransferFile { name: String, size: u32, offset: u32, data: Bytes },
    CreateDirectory { name: String },
    TransferAck { name: String },
    AllFilesSent,
    CheckCrc { seed: u32, name: String },
    AckCrc { name: String },
    SendCrc { present: bool, value: u32, name: String },
}

impl WireMessage for TransferMsg {
    fn kind(&self) -> MsgKind {
        match self {
            TransferMsg::RequestFile { .. } => MsgKind::RequestFile,
            TransferMsg::TransferFile { .. } => MsgKind::TransferFile,
            TransferMsg::CreateDirectory { .. } => MsgKind::CreateDirectory,
            TransferMsg::TransferAck { .. } => MsgKind::TransferAck,
            TransferMsg::AllFilesSent => MsgKind::AllFilesSent,
            TransferMsg::CheckCrc { .. } => MsgKind::CheckCrc,
            TransferMsg::AckCrc { .. } => MsgKind::AckCrc,
            TransferMsg::SendCrc { .. } => MsgKind::SendCrc,
        }
    }

    fn ser_fields(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        match self {
            TransferMsg::RequestFile { remote_name, local_name } => {
                buf.put_string(remote_name, MAX_STRING_LEN)?;
                buf.put_string(local_name, MAX_STRING_LEN)?;
            }
            TransferMsg::TransferFile { name, size, offset, data } => {
                buf.put_string(name, MAX_STRING_LEN)?;
                buf.put_u32(*size);
                buf.put_u32(*offset);
                if data.len() > u16::MAX as usize {
                    bail!("transfer chunk of {} bytes exceeds the wire format", data.len());
                }
                buf.put_u16(data.len() as u16);
                buf.put_slice(data);
            }
            TransferMsg::CreateDirectory { name }
            | TransferMsg::TransferAck { name }
            | TransferMsg::AckCrc { name } => {
                buf.put_string(name, MAX_STRING_LEN)?;
            }
            TransferMsg::AllFilesSent => {
            }
            TransferMsg::CheckCrc { seed, name } => {
                buf.put_u32(*seed);
                buf.put_string(name, MAX_STRING_LEN)?;
            }
            TransferMsg::SendCrc { present, value, name } => {
                buf.put_u8(*present as u8);
                buf.put_u32(*value);
                buf.put_string(name, MAX_STRING_LEN)?;
            }
        }
        Ok(())
    }
}

impl TransferMsg {
    pub fn try_deser(kind: MsgKind, buf: &[u8]) -> anyhow::Result<TransferMsg> {
        let mut buf = buf;
        let msg = match kind {
            MsgKind::RequestFile => TransferMsg::RequestFile {
                remote_name: buf.try_get_string(MAX_STRING_LEN)?,
                local_name: buf.try_get_string(MAX_STRING_LEN)?,
            },
            MsgKind::TransferFile => {
                let name = buf.try_get_string(MAX_STRING_LEN)?;
                let size = buf.try_get_u32()?;
                let offset = buf.try_get_u32()?;
                let len = buf.try_get_u16()? as usize;
                if buf.remaining() < len {
                    bail!("transfer chunk of {} bytes announced, {} remaining", len, buf.remaining());
                }
                TransferMsg::TransferFile {
                    name,
                    size,
                    offset,
                    data: Bytes::copy_from_slice(&buf[..len]),
                }
            }
            MsgKind::CreateDirectory => TransferMsg::CreateDirectory {
                name: buf.try_get_string(MAX_STRING_LEN)?,
            },
            MsgKind::TransferAck => TransferMsg::TransferAck {
                name: buf.try_get_string(MAX_STRING_LEN)?,
            },
            MsgKind::AllFilesSent => TransferMsg::AllFilesSent,
            MsgKind::CheckCrc => TransferMsg::CheckCrc {
                seed: buf.try_get_u32()?,
                name: buf.try_get_string(MAX_STRING_LEN)?,
            },
            MsgKind::AckCrc => TransferMsg::AckCrc {
                name: buf.try_get_string(MAX_STRING_LEN)?,
            },
            MsgKind::SendCrc => TransferMsg::SendCrc {
                present: buf.try_get_u8()? != 0,
                value: buf.try_get_u32()?,
                name: buf.try_get_string(MAX_STRING_LEN)?,
            },
            other => bail!("not a transfer message kind: {:?}", other),
        };
        Ok(msg)
    }
}
