use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::net::wire::MsgKind;


/// Token for one prepared slot. Handing it back through [PendingRequests::release] is
///  mandatory exactly once per prepare, including after a timeout.
#[derive(Debug)]
pub struct SyncRequest {
    index: usize,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RequestState {
    Waiting,
    Satisfied(Bytes),
    /// The expiry elapsed without a matching packet. Never reported as success, even if
    ///  a matching packet is still pending in the transport.
    Expired,
}

struct RequestSlot {
    in_use: bool,
    kind: MsgKind,
    /// expected source; [None] matches any address (broadcast requests)
    from: Option<SocketAddr>,
    capacity: usize,
    received: bool,
    data: Vec<u8>,
    expiry: Instant,
}

impl RequestSlot {
    fn free() -> RequestSlot {
        RequestSlot {
            in_use: false,
            kind: MsgKind::Reject,
            from: None,
            capacity: 0,
            received: false,
            data: Vec::new(),
            expiry: Instant::now(),
        }
    }
}

/// The synchronous request bridge: a small fixed table of "someone is blocked waiting
///  for message kind K from peer P" slots the dispatcher consults before routing. It
///  converts event-driven delivery into a blocking call with timeout for the few call
///  sites that need request/reply semantics.
///
/// Blocking is polling with a sleep, not a true wakeup: the dispatcher must be stepped
///  concurrently for progress, and callers must tolerate latency on the order of the
///  poll interval.
pub struct PendingRequests {
    slots: Mutex<Vec<RequestSlot>>,
    poll_interval: Duration,
}

impl PendingRequests {
    pub fn new(capacity: usize, poll_interval: Duration) -> PendingRequests {
        PendingRequests {
            slots: Mutex::new((0..capacity).map(|_| RequestSlot::free()).collect()),
            poll_interval,
        }
    }

    /// Claims a free slot, failing when the table is at capacity. Payload bytes beyond
    ///  `capacity` are truncated on delivery.
    pub async fn prepare(&self, kind: MsgKind, from: Option<SocketAddr>, timeout: Duration, capacity: usize) -> anyhow::Result<SyncRequest> {
        let mut slots = self.slots.lock().await;
        let Some(index) = slots.iter().position(|s| !s.in_use) else {
            bail!("no free request slot: all {} are outstanding", slots.len());
        };

        slots[index] = RequestSlot {
            in_use: true,
            kind,
            from,
            capacity,
            received: false,
            data: Vec::new(),
            expiry: Instant::now() + timeout,
        };
        trace!("prepared request for {:?} from {:?} in slot {}", kind, from, index);
        Ok(SyncRequest { index })
    }

    pub async fn poll(&self, request: &SyncRequest) -> RequestState {
        let slots = self.slots.lock().await;
        let slot = &slots[request.index];

        if slot.received {
            RequestState::Satisfied(Bytes::copy_from_slice(&slot.data))
        }
        else if Instant::now() >= slot.expiry {
            RequestState::Expired
        }
        else {
            RequestState::Waiting
        }
    }

    /// Poll-sleeps until the request is satisfied or expired.
    pub async fn wait(&self, request: &SyncRequest) -> RequestState {
        loop {
            match self.poll(request).await {
                RequestState::Waiting => sleep(self.poll_interval).await,
                outcome => return outcome,
            }
        }
    }

    /// Returns the slot to the free pool.
    pub async fn release(&self, request: SyncRequest) {
        let mut slots = self.slots.lock().await;
        slots[request.index] = RequestSlot::free();
    }

    /// Offers a received packet to the outstanding requests. On a kind+source match the
    ///  payload is copied (truncated to the slot's capacity), the slot is marked received
    ///  and the packet is consumed instead of being routed. Expired slots never swallow
    ///  a packet - their caller already sees [RequestState::Expired].
    pub(crate) async fn try_satisfy(&self, kind: MsgKind, from: SocketAddr, payload: &[u8]) -> bool {
        let mut slots = self.slots.lock().await;
        let now = Instant::now();

        let matching = slots.iter_mut().find(|s| {
            s.in_use
                && !s.received
                && s.kind == kind
                && s.from.map(|expected| expected == from).unwrap_or(true)
                && now < s.expiry
        });

        match matching {
            Some(slot) => {
                let len = payload.len().min(slot.capacity);
                slot.data.clear();
                slot.data.extend_from_slice(&payload[..len]);
                slot.received = true;
                debug!("request for {:?} satisfied by packet from {:?}", kind, from);
                true
            }
            None => false,
        }
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::test_util::transport::test_addr;

    use super::*;

    fn requests(capacity: usize) -> PendingRequests {
        PendingRequests::new(capacity, Duration::from_millis(10))
    }

    #[rstest]
    #[tokio::test]
    async fn test_satisfy_and_poll() {
        let requests = requests(4);
        let req = requests.prepare(MsgKind::Accept, Some(test_addr(1)), Duration::from_secs(5), 16).await.unwrap();
        assert_eq!(requests.poll(&req).await, RequestState::Waiting);

        // wrong kind, wrong source: not consumed
        assert!(!requests.try_satisfy(MsgKind::Reject, test_addr(1), b"").await);
        assert!(!requests.try_satisfy(MsgKind::Accept, test_addr(2), b"\x01").await);

        assert!(requests.try_satisfy(MsgKind::Accept, test_addr(1), b"\x03").await);
        assert_eq!(requests.poll(&req).await, RequestState::Satisfied(Bytes::from_static(b"\x03")));
        // a second matching packet is not consumed by the already satisfied slot
        assert!(!requests.try_satisfy(MsgKind::Accept, test_addr(1), b"\x04").await);

        requests.release(req).await;
    }

    #[rstest]
    #[tokio::test]
    async fn test_broadcast_source_matches_any_address() {
        let requests = requests(1);
        let req = requests.prepare(MsgKind::AllFilesSent, None, Duration::from_secs(5), 0).await.unwrap();

        assert!(requests.try_satisfy(MsgKind::AllFilesSent, test_addr(42), b"").await);
        assert_eq!(requests.poll(&req).await, RequestState::Satisfied(Bytes::new()));
        requests.release(req).await;
    }

    #[rstest]
    #[tokio::test]
    async fn test_payload_truncated_to_capacity() {
        let requests = requests(1);
        let req = requests.prepare(MsgKind::ModuleInfo, None, Duration::from_secs(5), 3).await.unwrap();

        assert!(requests.try_satisfy(MsgKind::ModuleInfo, test_addr(1), b"abcdef").await);
        assert_eq!(requests.poll(&req).await, RequestState::Satisfied(Bytes::from_static(b"abc")));
        requests.release(req).await;
    }

    #[rstest]
    #[tokio::test]
    async fn test_zero_timeout_expires_immediately() {
        let requests = requests(1);
        let req = requests.prepare(MsgKind::Accept, None, Duration::ZERO, 16).await.unwrap();

        assert_eq!(requests.poll(&req).await, RequestState::Expired);
        // an expired slot does not swallow the packet
        assert!(!requests.try_satisfy(MsgKind::Accept, test_addr(1), b"\x00").await);
        requests.release(req).await;
    }

    #[rstest]
    #[tokio::test]
    async fn test_release_returns_slot_to_free_pool() {
        let requests = requests(2);
        let a = requests.prepare(MsgKind::Accept, None, Duration::ZERO, 0).await.unwrap();
        let b = requests.prepare(MsgKind::Reject, None, Duration::ZERO, 0).await.unwrap();

        // table at capacity
        assert!(requests.prepare(MsgKind::Start, None, Duration::ZERO, 0).await.is_err());

        requests.release(a).await;
        let c = requests.prepare(MsgKind::Start, None, Duration::ZERO, 0).await.unwrap();

        requests.release(b).await;
        requests.release(c).await;
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let requests = requests(1);
        let req = requests.prepare(MsgKind::Accept, None, Duration::from_millis(50), 0).await.unwrap();

        assert_eq!(requests.wait(&req).await, RequestState::Expired);
        requests.release(req).await;
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_wait_sees_concurrent_satisfy() {
        let requests = std::sync::Arc::new(requests(1));
        let req = requests.prepare(MsgKind::Start, None, Duration::from_secs(5), 0).await.unwrap();

        let satisfier = {
            let requests = requests.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(30)).await;
                assert!(requests.try_satisfy(MsgKind::Start, test_addr(1), b"").await);
            })
        };

        assert_eq!(requests.wait(&req).await, RequestState::Satisfied(Bytes::new()));
        satisfier.await.unwrap();
        requests.release(req).await;
    }
}
