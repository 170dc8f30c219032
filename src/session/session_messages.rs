use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::net::wire::{MsgKind, WireMessage, MAX_STRING_LEN};
use crate::session::latch::{Latch, LatchFrame};
use crate::session::module_catalog::ModuleSummary;
use crate::util::buf_ext::{BufExt, BufMutExt};


/// All session-level messages: the participant-to-authority logon/input flow and the
///  authority-to-participant replies and replicated state.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionMsg {
    Logon { display_name: String },
    Logoff { display_name: String, slot: u16 },
    SendLatch { frame: LatchFrame },
    RequestModule { name: String },
    ImLoaded,

    Accept { queue_pos: u8 },
    Reject,
    ModuleInfo { summary: ModuleSummary },
    ModuleBad,
    Start,
    Kick,
    RecvLatch { frame: LatchFrame },
}

impl WireMessage for SessionMsg {
    fn kind(&self) -> MsgKind {
        match self {
            SessionMsg::Logon { .. } => MsgKind::Logon,
            SessionMsg::Logoff { .. } => MsgKind::Logoff,
            SessionMsg::SendLatch { .. } => MsgKind::SendLatch,
            SessionMsg::RequestModule { .. } => MsgKind::RequestModule,
            SessionMsg::ImLoaded => MsgKind::ImLoaded,
            SessionMsg::Accept { .. } => MsgKind::Accept,
            SessionMsg::Reject => MsgKind::Reject,
            SessionMsg::ModuleInfo { .. } => MsgKind::ModuleInfo,
            SessionMsg::ModuleBad => MsgKind::ModuleBad,
            SessionMsg::Start => MsgKind::Start,
            SessionMsg::Kick => MsgKind::Kick,
            SessionMsg::RecvLatch { .. } => MsgKind::RecvLatch,
        }
    }

    fn ser_fields(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        match self {
            SessionMsg::Logon { display_name } => {
                buf.put_string(display_name, MAX_STRING_LEN)?;
            }
            SessionMsg::Logoff { display_name, slot } => {
                buf.put_string(display_name, MAX_STRING_LEN)?;
                buf.put_u16(*slot);
            }
            SessionMsg::SendLatch { frame } | SessionMsg::RecvLatch { frame } => {
                ser_frame(frame, buf)?;
            }
            SessionMsg::RequestModule { name } => {
                buf.put_string(name, MAX_STRING_LEN)?;
            }
            SessionMsg::Accept { queue_pos } => {
                buf.put_u8(*queue_pos);
            }
            SessionMsg::ModuleInfo { summary } => {
                buf.put_string(&summary.name, MAX_STRING_LEN)?;
                buf.put_u32(summary.file_count);
                buf.put_u64(summary.byte_size);
            }
            SessionMsg::ImLoaded
            | SessionMsg::Reject
            | SessionMsg::ModuleBad
            | SessionMsg::Start
            | SessionMsg::Kick => {
            }
        }
        Ok(())
    }
}

impl SessionMsg {
    pub fn try_deser(kind: MsgKind, buf: &[u8]) -> anyhow::Result<SessionMsg> {
        let mut buf = buf;
        let msg = match kind {
            MsgKind::Logon => SessionMsg::Logon {
                display_name: buf.try_get_string(MAX_STRING_LEN)?,
            },
            MsgKind::Logoff => SessionMsg::Logoff {
                display_name: buf.try_get_string(MAX_STRING_LEN)?,
                slot: buf.try_get_u16()?,
            },
            MsgKind::SendLatch => SessionMsg::SendLatch {
                frame: try_deser_frame(&mut buf)?,
            },
            MsgKind::RequestModule => SessionMsg::RequestModule {
                name: buf.try_get_string(MAX_STRING_LEN)?,
            },
            MsgKind::ImLoaded => SessionMsg::ImLoaded,
            MsgKind::Accept => SessionMsg::Accept {
                queue_pos: buf.try_get_u8()?,
            },
            MsgKind::Reject => SessionMsg::Reject,
            MsgKind::ModuleInfo => SessionMsg::ModuleInfo {
                summary: ModuleSummary {
                    name: buf.try_get_string(MAX_STRING_LEN)?,
                    file_count: buf.try_get_u32()?,
                    byte_size: buf.try_get_u64()?,
                },
            },
            MsgKind::ModuleBad => SessionMsg::ModuleBad,
            MsgKind::Start => SessionMsg::Start,
            MsgKind::Kick => SessionMsg::Kick,
            MsgKind::RecvLatch => SessionMsg::RecvLatch {
                frame: try_deser_frame(&mut buf)?,
            },
            other => bail!("not a session message kind: {:?}", other),
        };
        Ok(msg)
    }
}

fn ser_frame(frame: &LatchFrame, buf: &mut BytesMut) -> anyhow::Result<()> {
    if frame.entries.len() > u8::MAX as usize {
        bail!("latch frame with {} entries exceeds the wire format", frame.entries.len());
    }
    buf.put_u32(frame.tick);
    buf.put_u8(frame.entries.len() as u8);
    for (entity, latch) in &frame.entries {
        buf.put_u16(*entity);
        buf.put_u32(latch.buttons);
        buf.put_i16(latch.axis_x);
        buf.put_i16(latch.axis_y);
    }
    Ok(())
}

fn try_deser_frame(buf: &mut impl Buf) -> anyhow::Result<LatchFrame> {
    let tick = buf.try_get_u32()?;
    let count = buf.try_get_u8()?;

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let entity = buf.try_get_u16()?;
        let latch = Latch {
            buttons: buf.try_get_u32()?,
            axis_x: buf.try_get_i16()?,
            axis_y: buf.try_get_i16()?,
        };
        entries.push((entity, latch));
    }
    Ok(LatchFrame { tick, entries })
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::session::latch::BUTTON_FIRE;

    use super::*;

    #[rstest]
    #[case::logon(SessionMsg::Logon { display_name: "ripley".to_string() }, MsgKind::Logon)]
    #[case::logoff(SessionMsg::Logoff { display_name: "ripley".to_string(), slot: 3 }, MsgKind::Logoff)]
    #[case::send_latch(SessionMsg::SendLatch { frame: LatchFrame { tick: 77, entries: vec![
        (1, Latch { buttons: BUTTON_FIRE, axis_x: 256, axis_y: -256 }),
        (4, Latch { buttons: 0, axis_x: 0, axis_y: 128 }),
    ] } }, MsgKind::SendLatch)]
    #[case::request_module(SessionMsg::RequestModule { name: "town01".to_string() }, MsgKind::RequestModule)]
    #[case::im_loaded(SessionMsg::ImLoaded, MsgKind::ImLoaded)]
    #[case::accept(SessionMsg::Accept { queue_pos: 2 }, MsgKind::Accept)]
    #[case::reject(SessionMsg::Reject, MsgKind::Reject)]
    #[case::module_info(SessionMsg::ModuleInfo { summary: ModuleSummary {
        name: "town01".to_string(), file_count: 12, byte_size: 987_654 } }, MsgKind::ModuleInfo)]
    #[case::module_bad(SessionMsg::ModuleBad, MsgKind::ModuleBad)]
    #[case::start(SessionMsg::Start, MsgKind::Start)]
    #[case::kick(SessionMsg::Kick, MsgKind::Kick)]
    #[case::recv_latch(SessionMsg::RecvLatch { frame: LatchFrame { tick: 9, entries: vec![] } }, MsgKind::RecvLatch)]
    fn test_ser_session_message(#[case] msg: SessionMsg, #[case] kind: MsgKind) {
        assert_eq!(msg.kind(), kind);

        let mut buf = BytesMut::new();
        msg.ser_fields(&mut buf).unwrap();
        let deser_msg = SessionMsg::try_deser(kind, &buf).unwrap();
        assert_eq!(msg, deser_msg);
    }

    #[rstest]
    fn test_deser_rejects_foreign_kind() {
        assert!(SessionMsg::try_deser(MsgKind::TransferFile, b"").is_err());
    }

    #[rstest]
    fn test_deser_truncated_frame() {
        let mut buf = BytesMut::new();
        ser_frame(&LatchFrame { tick: 5, entries: vec![(1, Latch::default())] }, &mut buf).unwrap();
        assert!(SessionMsg::try_deser(MsgKind::SendLatch, &buf[..buf.len() - 1]).is_err());
    }
}
