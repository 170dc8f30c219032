use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::net::host::Host;
use crate::net::net_config::NetConfig;
use crate::net::packet_handler::{PacketEvent, PacketHandler, TRANSFER_HANDLER_ID};
use crate::net::request::RequestState;
use crate::net::transport::{SendTarget, CHANNEL_BULK};
use crate::net::wire::MsgKind;
use crate::transfer::file_crc::FileCrc;
use crate::transfer::file_store::FileStore;
use crate::transfer::transfer_messages::TransferMsg;
use crate::util::random::{Random, RngRandom};


#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum JobKind {
    File,
    Directory,
}

enum JobPhase {
    Queued,
    /// CheckCrc is out, waiting for the SendCrc reply
    CrcPending { local_crc: FileCrc, since: Instant },
}

struct TransferJob {
    source: String,
    dest: String,
    target: SendTarget,
    kind: JobKind,
    phase: JobPhase,
}

struct CrcReply {
    present: bool,
    value: u32,
}

struct TransferState {
    jobs: VecDeque<TransferJob>,
    /// jobs still open per target; reaching zero triggers the trailing AllFilesSent
    batches: FxHashMap<SendTarget, usize>,
    crc_replies: FxHashMap<(SocketAddr, String), CrcReply>,
    all_files_notices: usize,
}

/// The file replication service: an ordered queue of transfer jobs drained by the
///  dispatcher's per-step flush, plus the inbound side that writes received files to
///  disk. Registered on both hosts under [TRANSFER_HANDLER_ID].
///
/// Completion of an entire requested batch is signalled by one trailing AllFilesSent
///  message once every expanded job for that target has been dispatched. Identical
///  namesakes are skipped via a seeded CRC round trip; a mismatch or a missing reply
///  sends the file. Failed sends stay queued, so every flush step doubles as the retry
///  path.
pub struct TransferService {
    config: Arc<NetConfig>,
    fs: Arc<dyn FileStore>,
    state: Mutex<TransferState>,
}

impl TransferService {
    pub fn new(config: Arc<NetConfig>, fs: Arc<dyn FileStore>) -> Arc<TransferService> {
        Arc::new(TransferService {
            config,
            fs,
            state: Mutex::new(TransferState {
                jobs: VecDeque::new(),
                batches: FxHashMap::default(),
                crc_replies: FxHashMap::default(),
                all_files_notices: 0,
            }),
        })
    }

    /// Queues a file for replication; a directory source expands into the
    ///  directory-creation job plus one job per non-hidden child file (subdirectories
    ///  are not recursed into). Expansion is all-or-nothing. Returns the number of jobs
    ///  queued.
    pub async fn enqueue(&self, target: SendTarget, source: &str, dest: &str) -> anyhow::Result<usize> {
        if source.is_empty() || dest.is_empty() {
            bail!("transfer with an empty path");
        }

        let mut staged = Vec::new();
        if self.fs.is_dir(source) {
            staged.push(TransferJob {
                source: source.to_string(),
                dest: dest.to_string(),
                target,
                kind: JobKind::Directory,
                phase: JobPhase::Queued,
            });
            for child in self.fs.list_dir(source)? {
                if child.is_dir || child.name.starts_with('.') {
                    continue;
                }
                staged.push(TransferJob {
                    source: format!("{}/{}", source, child.name),
                    dest: format!("{}/{}", dest, child.name),
                    target,
                    kind: JobKind::File,
                    phase: JobPhase::Queued,
                });
            }
        }
        else {
            staged.push(TransferJob {
                source: source.to_string(),
                dest: dest.to_string(),
                target,
                kind: JobKind::File,
                phase: JobPhase::Queued,
            });
        }

        let count = staged.len();
        let mut state = self.state.lock().await;
        *state.batches.entry(target).or_insert(0) += count;
        state.jobs.extend(staged);
        info!("queued {} transfer job(s) for {:?} -> {:?}", count, source, target);
        Ok(count)
    }

    /// Sends a RequestFile to a remote peer, asking it to replicate its `remote_name`
    ///  to this machine under `local_name`. Pair with [TransferService::wait_all_files]
    ///  to block until the remote signals completion.
    pub async fn request_files(&self, host: &Host, from: SocketAddr, remote_name: &str, local_name: &str) -> anyhow::Result<()> {
        let msg = TransferMsg::RequestFile {
            remote_name: remote_name.to_string(),
            local_name: local_name.to_string(),
        };
        host.send_msg(SendTarget::Peer(from), TRANSFER_HANDLER_ID, &msg, CHANNEL_BULK, true).await
    }

    /// Blocks (by polling) until the peer's trailing AllFilesSent arrives or the
    ///  timeout elapses; returns whether it arrived.
    pub async fn wait_all_files(&self, host: &Host, from: SocketAddr, timeout: Duration) -> anyhow::Result<bool> {
        let request = host.requests().prepare(MsgKind::AllFilesSent, Some(from), timeout, 0).await?;
        let outcome = host.requests().wait(&request).await;
        host.requests().release(request).await;
        Ok(matches!(outcome, RequestState::Satisfied(_)))
    }

    pub async fn pending_jobs(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    /// Number of AllFilesSent messages that arrived outside a blocking wait.
    pub async fn all_files_notices(&self) -> usize {
        self.state.lock().await.all_files_notices
    }

    async fn flush_step(&self, host: &Host) {
        let mut state = self.state.lock().await;
        let jobs = std::mem::take(&mut state.jobs);

        for mut job in jobs {
            if self.advance_job(host, &mut state, &mut job).await {
                Self::finish_one(&mut state, host, job.target).await;
            }
            else {
                state.jobs.push_back(job);
            }
        }
    }

    async fn finish_one(state: &mut TransferState, host: &Host, target: SendTarget) {
        let Some(remaining) = state.batches.get_mut(&target) else {
            return;
        };
        *remaining -= 1;
        if *remaining == 0 {
            state.batches.remove(&target);
            debug!("batch for {:?} complete - signalling all files sent", target);
            let _ = host.send_msg(target, TRANSFER_HANDLER_ID, &TransferMsg::AllFilesSent, CHANNEL_BULK, true).await;
        }
    }

    /// Returns whether the job is finished (successfully or dropped).
    async fn advance_job(&self, host: &Host, state: &mut TransferState, job: &mut TransferJob) -> bool {
        // both ends are the same machine: plain filesystem calls instead of the wire
        if job.target == SendTarget::Peer(host.local_addr()) {
            let result = match job.kind {
                JobKind::Directory => self.fs.mkdir(&job.dest),
                JobKind::File => self.fs.copy(&job.source, &job.dest),
            };
            if let Err(e) = result {
                warn!("loopback transfer of {:?} failed: {}", job.source, e);
            }
            return true;
        }

        match job.kind {
            JobKind::Directory => {
                let msg = TransferMsg::CreateDirectory { name: job.dest.clone() };
                match host.send_msg(job.target, TRANSFER_HANDLER_ID, &msg, CHANNEL_BULK, true).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("create directory send failed, retrying next step: {}", e);
                        false
                    }
                }
            }
            JobKind::File => self.advance_file_job(host, state, job).await,
        }
    }

    async fn advance_file_job(&self, host: &Host, state: &mut TransferState, job: &mut TransferJob) -> bool {
        match &job.phase {
            JobPhase::Queued => {
                if !self.fs.exists(&job.source) {
                    warn!("transfer source {:?} is missing - dropping the job", job.source);
                    return true;
                }
                let SendTarget::Peer(_) = job.target else {
                    // CRC negotiation is point-to-point; broadcasts always send
                    return self.send_file(host, job).await;
                };

                let contents = match self.fs.read(&job.source) {
                    Ok(contents) => contents,
                    Err(e) => {
                        warn!("could not read {:?}: {} - dropping the job", job.source, e);
                        return true;
                    }
                };
                let seed = RngRandom::next_u32();
                let msg = TransferMsg::CheckCrc { seed, name: job.dest.clone() };
                match host.send_msg(job.target, TRANSFER_HANDLER_ID, &msg, CHANNEL_BULK, true).await {
                    Ok(()) => {
                        job.phase = JobPhase::CrcPending {
                            local_crc: FileCrc::new(seed, &contents),
                            since: Instant::now(),
                        };
                    }
                    Err(e) => debug!("crc check send failed, retrying next step: {}", e),
                }
                false
            }
            JobPhase::CrcPending { local_crc, since } => {
                let SendTarget::Peer(peer) = job.target else {
                    return self.send_file(host, job).await;
                };

                if let Some(reply) = state.crc_replies.remove(&(peer, job.dest.clone())) {
                    if reply.present && reply.value == local_crc.0 {
                        debug!("remote {:?} already matches - skipping", job.dest);
                        return true;
                    }
                    return self.send_file(host, job).await;
                }
                if since.elapsed() >= self.config.crc_response_timeout {
                    debug!("no crc reply for {:?} - sending anyway", job.dest);
                    return self.send_file(host, job).await;
                }
                false
            }
        }
    }

    async fn send_file(&self, host: &Host, job: &TransferJob) -> bool {
        let contents = match self.fs.read(&job.source) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("could not read {:?}: {} - dropping the job", job.source, e);
                return true;
            }
        };

        let chunk_size = self.config.max_transfer_chunk;
        let num_chunks = contents.len().div_ceil(chunk_size).max(1);
        if num_chunks > self.config.max_transfer_chunks {
            // an oversized payload is a caller error, not handled here
            error!("{:?} spans {} chunks, more than the allowed {} - dropping the job",
                job.source, num_chunks, self.config.max_transfer_chunks);
            return true;
        }

        let size = contents.len() as u32;
        let mut offset = 0usize;
        loop {
            let end = (offset + chunk_size).min(contents.len());
            let msg = TransferMsg::TransferFile {
                name: job.dest.clone(),
                size,
                offset: offset as u32,
                data: Bytes::copy_from_slice(&contents[offset..end]),
            };
            if let Err(e) = host.send_msg(job.target, TRANSFER_HANDLER_ID, &msg, CHANNEL_BULK, true).await {
                debug!("transfer send failed, job will be retried: {}", e);
                return false;
            }
            if end == contents.len() {
                break;
            }
            offset = end;
        }
        debug!("sent {:?} as {} chunk(s)", job.dest, num_chunks);
        true
    }

    async fn on_msg(&self, host: &Host, from: SocketAddr, msg: TransferMsg) {
        match msg {
            TransferMsg::RequestFile { remote_name, local_name } => {
                if let Err(e) = self.enqueue(SendTarget::Peer(from), &remote_name, &local_name).await {
                    warn!("file request {:?} from {:?} failed: {}", remote_name, from, e);
                }
            }
            TransferMsg::TransferFile { name, size, offset, data } => {
                // reconcile the on-disk length with the announced size before the first chunk
                if offset == 0 {
                    if let Err(e) = self.fs.set_len(&name, size as u64) {
                        warn!("could not reconcile length of {:?}: {}", name, e);
                        return;
                    }
                }
                match self.fs.write_at(&name, offset as u64, &data) {
                    Ok(()) => {
                        let ack = TransferMsg::TransferAck { name };
                        let _ = host.send_msg(SendTarget::Peer(from), TRANSFER_HANDLER_ID, &ack, CHANNEL_BULK, true).await;
                    }
                    Err(e) => warn!("could not write {:?}: {}", name, e),
                }
            }
            TransferMsg::CreateDirectory { name } => {
                if let Err(e) = self.fs.mkdir(&name) {
                    warn!("could not create directory {:?}: {}", name, e);
                }
            }
            TransferMsg::TransferAck { name } => {
                trace!("{:?} acknowledged {:?}", from, name);
            }
            TransferMsg::AllFilesSent => {
                debug!("{:?} signalled all files sent", from);
                self.state.lock().await.all_files_notices += 1;
            }
            TransferMsg::CheckCrc { seed, name } => {
                let ack = TransferMsg::AckCrc { name: name.clone() };
                let _ = host.send_msg(SendTarget::Peer(from), TRANSFER_HANDLER_ID, &ack, CHANNEL_BULK, true).await;

                let reply = match self.fs.read(&name) {
                    Ok(contents) => TransferMsg::SendCrc {
                        present: true,
                        value: FileCrc::new(seed, &contents).0,
                        name,
                    },
                    Err(_) => TransferMsg::SendCrc {
                        present: false,
                        value: 0,
                        name,
                    },
                };
                let _ = host.send_msg(SendTarget::Peer(from), TRANSFER_HANDLER_ID, &reply, CHANNEL_BULK, true).await;
            }
            TransferMsg::AckCrc { name } => {
                trace!("{:?} is computing the crc of {:?}", from, name);
            }
            TransferMsg::SendCrc { present, value, name } => {
                self.state.lock().await.crc_replies.insert((from, name), CrcReply { present, value });
            }
        }
    }
}

#[async_trait::async_trait]
impl PacketHandler for TransferService {
    async fn handle(&self, host: &Host, event: PacketEvent<'_>) -> bool {
        match event {
            PacketEvent::Packet { from, kind, buf } => {
                match TransferMsg::try_deser(kind, buf) {
                    Ok(msg) => {
                        self.on_msg(host, from, msg).await;
                        true
                    }
                    Err(e) => {
                        warn!("error deserializing transfer message from {:?}: {}", from, e);
                        false
                    }
                }
            }
            PacketEvent::PeerConnected { .. } | PacketEvent::PeerDisconnected { .. } => true,
        }
    }

    async fn on_step(&self, host: &Host) {
        self.flush_step(host).await;
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::net::host::Role;
    use crate::test_util::fs::MemFileStore;
    use crate::test_util::transport::{test_addr, InMemHub};

    use super::*;

    struct Fixture {
        sender_host: Arc<Host>,
        receiver_host: Arc<Host>,
        sender: Arc<TransferService>,
        receiver: Arc<TransferService>,
        sender_fs: Arc<MemFileStore>,
        receiver_fs: Arc<MemFileStore>,
    }

    async fn fixture() -> Fixture {
        let hub = InMemHub::new();
        let config = Arc::new(NetConfig::new());

        let sender_host = Host::new(Role::Authority, config.clone(), hub.endpoint(test_addr(1)));
        let receiver_host = Host::new(Role::Participant, config.clone(), hub.endpoint(test_addr(2)));
        sender_host.open().await;
        receiver_host.open().await;

        let sender_fs = MemFileStore::new();
        let receiver_fs = MemFileStore::new();
        let sender = TransferService::new(config.clone(), sender_fs.clone());
        let receiver = TransferService::new(config, receiver_fs.clone());
        sender_host.register_handler(sender.clone(), Some(TRANSFER_HANDLER_ID)).await.unwrap();
        receiver_host.register_handler(receiver.clone(), Some(TRANSFER_HANDLER_ID)).await.unwrap();

        receiver_host.connect_or_reuse(test_addr(1), TRANSFER_HANDLER_ID).await.unwrap();
        sender_host.step().await;
        receiver_host.step().await;

        Fixture {
            sender_host,
            receiver_host,
            sender,
            receiver,
            sender_fs,
            receiver_fs,
        }
    }

    async fn settle(f: &Fixture) {
        for _ in 0..8 {
            f.sender_host.step().await;
            f.receiver_host.step().await;
        }
    }

    #[rstest]
    #[tokio::test]
    async fn test_identical_file_is_skipped_via_crc() {
        let f = fixture().await;
        f.sender_fs.put("mod/a.dat", b"payload");
        f.receiver_fs.put("@modules/a.dat", b"payload");

        assert_eq!(f.sender.enqueue(SendTarget::Peer(test_addr(2)), "mod/a.dat", "@modules/a.dat").await.unwrap(), 1);
        settle(&f).await;

        assert_eq!(f.sender.pending_jobs().await, 0);
        // the matching namesake was never re-sent
        assert_eq!(f.receiver_fs.write_log(), Vec::<String>::new());
        assert_eq!(f.receiver.all_files_notices().await, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_crc_mismatch_sends_exactly_one_transfer() {
        let f = fixture().await;
        f.sender_fs.put("mod/a.dat", b"new payload");
        f.receiver_fs.put("@modules/a.dat", b"stale");

        f.sender.enqueue(SendTarget::Peer(test_addr(2)), "mod/a.dat", "@modules/a.dat").await.unwrap();
        settle(&f).await;

        assert_eq!(f.receiver_fs.write_log(), vec!["modules/a.dat".to_string()]);
        assert_eq!(f.receiver_fs.get("@modules/a.dat").unwrap(), b"new payload");
        assert_eq!(f.receiver.all_files_notices().await, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_absent_remote_file_is_sent() {
        let f = fixture().await;
        f.sender_fs.put("mod/a.dat", b"fresh");

        f.sender.enqueue(SendTarget::Peer(test_addr(2)), "mod/a.dat", "@modules/a.dat").await.unwrap();
        settle(&f).await;

        assert_eq!(f.receiver_fs.get("@modules/a.dat").unwrap(), b"fresh");
    }

    #[rstest]
    #[tokio::test]
    async fn test_directory_expands_to_one_job_per_child_plus_mkdir() {
        let f = fixture().await;
        f.sender_fs.mkdir("mod/town01").unwrap();
        f.sender_fs.put("mod/town01/a.dat", b"aaa");
        f.sender_fs.put("mod/town01/b.dat", b"bbb");
        f.sender_fs.put("mod/town01/c.dat", b"ccc");
        f.sender_fs.put("mod/town01/.hidden", b"xxx");
        f.sender_fs.mkdir("mod/town01/sub").unwrap();

        let queued = f.sender.enqueue(SendTarget::Peer(test_addr(2)), "mod/town01", "@modules/town01").await.unwrap();
        assert_eq!(queued, 4);
        settle(&f).await;

        assert!(f.receiver_fs.is_dir("@modules/town01"));
        assert_eq!(f.receiver_fs.get("@modules/town01/a.dat").unwrap(), b"aaa");
        assert_eq!(f.receiver_fs.get("@modules/town01/b.dat").unwrap(), b"bbb");
        assert_eq!(f.receiver_fs.get("@modules/town01/c.dat").unwrap(), b"ccc");
        assert!(f.receiver_fs.get("@modules/town01/.hidden").is_none());
        // exactly one trailing completion signal for the whole batch
        assert_eq!(f.receiver.all_files_notices().await, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_chunked_transfer_reassembles() {
        let f = fixture().await;
        let mut config = NetConfig::new();
        config.max_transfer_chunk = 4;
        // rebuild the sender with a tiny chunk size
        let sender = TransferService::new(Arc::new(config), f.sender_fs.clone());
        f.sender_host.unregister_handler(TRANSFER_HANDLER_ID).await;
        f.sender_host.register_handler(sender.clone(), Some(TRANSFER_HANDLER_ID)).await.unwrap();

        f.sender_fs.put("mod/big.dat", b"0123456789abcde");
        sender.enqueue(SendTarget::Peer(test_addr(2)), "mod/big.dat", "@modules/big.dat").await.unwrap();
        settle(&f).await;

        assert_eq!(f.receiver_fs.get("@modules/big.dat").unwrap(), b"0123456789abcde");
        // 15 bytes in 4-byte chunks
        assert_eq!(f.receiver_fs.write_log().len(), 4);
    }

    #[rstest]
    #[tokio::test]
    async fn test_oversized_file_is_a_dropped_caller_error() {
        let f = fixture().await;
        let mut config = NetConfig::new();
        config.max_transfer_chunk = 2;
        config.max_transfer_chunks = 2;
        let sender = TransferService::new(Arc::new(config), f.sender_fs.clone());
        f.sender_host.unregister_handler(TRANSFER_HANDLER_ID).await;
        f.sender_host.register_handler(sender.clone(), Some(TRANSFER_HANDLER_ID)).await.unwrap();

        f.sender_fs.put("mod/huge.dat", b"way too much data");
        sender.enqueue(SendTarget::Peer(test_addr(2)), "mod/huge.dat", "@modules/huge.dat").await.unwrap();
        settle(&f).await;

        assert_eq!(sender.pending_jobs().await, 0);
        assert!(f.receiver_fs.get("@modules/huge.dat").is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn test_loopback_copies_without_the_wire() {
        let f = fixture().await;
        f.sender_fs.put("mod/a.dat", b"local");

        f.sender.enqueue(SendTarget::Peer(test_addr(1)), "mod/a.dat", "@modules/a.dat").await.unwrap();
        f.sender_host.step().await;

        assert_eq!(f.sender_fs.get("@modules/a.dat").unwrap(), b"local");
        assert!(f.receiver_fs.get("@modules/a.dat").is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn test_empty_paths_are_rejected() {
        let f = fixture().await;
        assert!(f.sender.enqueue(SendTarget::Peer(test_addr(2)), "", "x").await.is_err());
        assert!(f.sender.enqueue(SendTarget::Peer(test_addr(2)), "x", "").await.is_err());
        assert_eq!(f.sender.pending_jobs().await, 0);
    }

    #[rstest]
    #[tokio::test]
    async fn test_unreadable_directory_queues_nothing() {
        let f = fixture().await;
        // a directory that exists but cannot be listed
        f.sender_fs.mkdir("mod/broken").unwrap();
        f.sender_fs.poison_dir("mod/broken");

        assert!(f.sender.enqueue(SendTarget::Peer(test_addr(2)), "mod/broken", "@modules/broken").await.is_err());
        assert_eq!(f.sender.pending_jobs().await, 0);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_request_files_round_trip_with_blocking_wait() {
        let f = fixture().await;
        f.sender_fs.mkdir("mod/town01").unwrap();
        f.sender_fs.put("mod/town01/a.dat", b"aaa");

        crate::net::driver::spawn_host(f.sender_host.clone());
        crate::net::driver::spawn_host(f.receiver_host.clone());

        f.receiver.request_files(&f.receiver_host, test_addr(1), "mod/town01", "@modules/town01").await.unwrap();
        let arrived = f.receiver.wait_all_files(&f.receiver_host, test_addr(1), Duration::from_secs(2)).await.unwrap();

        assert!(arrived);
        assert_eq!(f.receiver_fs.get("@modules/town01/a.dat").unwrap(), b"aaa");
        assert!(f.receiver_fs.is_dir("@modules/town01"));
    }
}
