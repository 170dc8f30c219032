use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use crate::net::host::Host;
use crate::net::wire::MsgKind;


/// A [HandlerId] is embedded in every application packet right after the message kind to
///  identify the registered client it is addressed to.
///
/// An id is technically a u32, but well-known services use a sequence of up to four ASCII
///  characters to give it a human-readable name, both for uniqueness and for debugging at
///  the wire level. Dynamically minted ids come from [crate::util::random::Random].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HandlerId(pub u32);

impl HandlerId {
    pub const fn new(value: &[u8; 4]) -> HandlerId {
        Self(u32::from_be_bytes(*value))
    }
}

impl Debug for HandlerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_be_bytes();
        let used = bytes.iter()
            .position(|&b| b == 0)
            .map(|len| &bytes[..len])
            .unwrap_or(&bytes);

        let string_repr = std::str::from_utf8(used).unwrap_or("???");

        write!(f, "0x{:08X}({:?})", self.0, string_repr)
    }
}


/// These are well-known ids: the session and file transfer services register under fixed
///  ids on every host, so both sides of a connection can address them without negotiation.
pub const SESSION_HANDLER_ID: HandlerId = HandlerId::new(b"SESS");
pub const TRANSFER_HANDLER_ID: HandlerId = HandlerId::new(b"XFER");


#[derive(Debug)]
pub enum PacketEvent<'a> {
    /// A routed application packet. `buf` starts immediately *after* the service id, i.e.
    ///  it contains only the kind-specific fields.
    Packet { from: SocketAddr, kind: MsgKind, buf: &'a [u8] },
    /// A remote peer was admitted into the inbound connection table, naming this service
    ///  in its greeting.
    PeerConnected { peer: SocketAddr, slot: usize },
    PeerDisconnected { peer: SocketAddr },
}

/// Handlers are pluggable: each logical service (session, file transfer, ...) registers
///  one against a [Host] and receives the packets addressed to its id.
///
/// `handle` is a blocking call, holding up the host's dispatch step. Non-trivial work
///  should probably be offloaded to some asynchronous processing, but it is up to the
///  handler implementation to decide and do this.
#[async_trait::async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    /// Returns whether the event was actually handled.
    async fn handle(&self, host: &Host, event: PacketEvent<'_>) -> bool;

    /// Called once per dispatcher step after all events were drained and before the
    ///  outbound flush. This is what drives periodic per-service work, e.g. the file
    ///  transfer queue.
    async fn on_step(&self, _host: &Host) {
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::session(SESSION_HANDLER_ID, "0x53455353(\"SESS\")")]
    #[case::transfer(TRANSFER_HANDLER_ID, "0x58464552(\"XFER\")")]
    #[case::abc(HandlerId::new(b"ab\0\0"), "0x61620000(\"ab\")")]
    #[case::empty(HandlerId::new(b"\0\0\0\0"), "0x00000000(\"\")")]
    fn test_id_debug(#[case] id: HandlerId, #[case] expected: &str) {
        let formatted = format!("{:?}", id);
        assert_eq!(&formatted, expected);
    }
}
