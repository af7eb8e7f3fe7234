use super::RetryPolicy;
use crate::error::{BittorrentError, Result};
use crate::hash::Sha1Hash;
use crate::peer::{
    ConnectionState, SessionContext, SessionEvent, SessionHandle, SessionTimeouts,
};
use crate::piece::{BlockOutcome, PieceManager, SelectionStrategy, SessionId};
use crate::storage::StorageManager;
use crate::torrent::Descriptor;
use crate::tracker::generate_peer_id;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Download tuning
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Our peer id in handshakes
    pub peer_id: [u8; 20],
    /// Requests in flight per session
    pub max_outstanding_per_session: usize,
    /// A session holding a request older than this is retired
    pub request_timeout: Duration,
    /// Upper bound on the time between two scheduling passes
    pub tick_interval: Duration,
    /// How long to wait for new addresses once every session is gone
    pub stall_timeout: Duration,
    pub selection: SelectionStrategy,
    pub session: SessionTimeouts,
    pub retry: RetryPolicy,
    /// Concurrent sessions; further addresses wait for a free slot
    pub max_sessions: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            peer_id: generate_peer_id(),
            max_outstanding_per_session: 5,
            request_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_millis(100),
            stall_timeout: Duration::from_secs(30),
            selection: SelectionStrategy::default(),
            session: SessionTimeouts::default(),
            retry: RetryPolicy::default(),
            max_sessions: 50,
        }
    }
}

/// Reported after every piece verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub verified: usize,
    pub total: usize,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.verified as f64 * 100.0 / self.total as f64
    }
}

/// Cloneable trigger that makes a running download return `Interrupted`
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Optional channels connecting a download to its caller
#[derive(Debug, Default)]
pub struct DownloadHooks {
    pub progress: Option<mpsc::UnboundedSender<Progress>>,
    /// Addresses discovered after the start (e.g. re-announces)
    pub addresses: Option<mpsc::UnboundedReceiver<Vec<SocketAddr>>>,
    pub shutdown: ShutdownHandle,
}

/// Control loop binding peer sessions to the piece manager
pub struct Coordinator {
    config: DownloadConfig,
    pieces: Arc<PieceManager>,
    storage: StorageManager,
    context: SessionContext,
    sessions: Vec<SessionHandle>,
    /// Every address ever queued; each is dialed at most once
    known: HashSet<SocketAddr>,
    pending: VecDeque<SocketAddr>,
    next_id: SessionId,
    hooks: DownloadHooks,
    wake: Arc<Notify>,
    /// Since when nothing has been connected or queued
    idle_since: Option<Instant>,
    /// Pieces handed to storage so far
    written: usize,
}

/// Download `descriptor` into `output_dir` from the given peers
pub async fn run(
    descriptor: Descriptor,
    info_hash: Sha1Hash,
    peers: Vec<SocketAddr>,
    output_dir: &Path,
    config: DownloadConfig,
    hooks: DownloadHooks,
) -> Result<()> {
    Coordinator::new(&descriptor, info_hash, output_dir, config, hooks)
        .await?
        .run(peers)
        .await
}

impl Coordinator {
    /// Lay out the output files and set up shared download state
    pub async fn new(
        descriptor: &Descriptor,
        info_hash: Sha1Hash,
        output_dir: &Path,
        config: DownloadConfig,
        hooks: DownloadHooks,
    ) -> Result<Self> {
        let storage = StorageManager::new(output_dir, descriptor).await?;
        let pieces = Arc::new(PieceManager::new(descriptor, config.selection.selector()));
        let wake = Arc::new(Notify::new());

        let context = SessionContext {
            info_hash,
            peer_id: config.peer_id,
            num_pieces: descriptor.piece_count(),
            timeouts: config.session.clone(),
            retry: config.retry.clone(),
            pieces: pieces.clone(),
            wake: wake.clone(),
        };

        Ok(Self {
            config,
            pieces,
            storage,
            context,
            sessions: Vec::new(),
            known: HashSet::new(),
            pending: VecDeque::new(),
            next_id: 0,
            hooks,
            wake,
            idle_since: None,
            written: 0,
        })
    }

    /// Drive the download until every piece is verified and written
    pub async fn run(mut self, peers: Vec<SocketAddr>) -> Result<()> {
        info!(
            "Starting download: {} pieces, {} initial peers",
            self.pieces.piece_count(),
            peers.len()
        );
        self.enqueue(peers);

        loop {
            if self.hooks.shutdown.is_requested() {
                self.close_all();
                let (verified, total) = self.counts();
                info!("Download interrupted at {}/{} pieces", verified, total);
                return Err(BittorrentError::Interrupted { verified, total });
            }

            self.receive_addresses();
            self.dial_pending();
            if let Err(e) = self.schedule().await {
                error!("Download failed: {}", e);
                self.close_all();
                return Err(e);
            }

            // Sessions verify on their own tasks; done only once every piece is on disk
            if self.pieces.is_complete() && self.written == self.pieces.piece_count() {
                self.close_all();
                info!("Download complete: {} pieces verified", self.pieces.piece_count());
                return Ok(());
            }

            if self.is_stalled() {
                self.close_all();
                let (verified, total) = self.counts();
                error!("Download stalled at {}/{} pieces", verified, total);
                return Err(BittorrentError::DownloadStalled { verified, total });
            }

            tokio::select! {
                _ = sleep(self.config.tick_interval) => {}
                _ = self.wake.notified() => {}
                _ = self.hooks.shutdown.notify.notified() => {}
            }
        }
    }

    fn counts(&self) -> (usize, usize) {
        (self.written, self.pieces.piece_count())
    }

    /// Queue addresses not seen before
    fn enqueue(&mut self, addrs: Vec<SocketAddr>) {
        for addr in addrs {
            if self.known.insert(addr) {
                self.pending.push_back(addr);
            }
        }
    }

    fn receive_addresses(&mut self) {
        let mut received = Vec::new();
        if let Some(feed) = self.hooks.addresses.as_mut() {
            loop {
                match feed.try_recv() {
                    Ok(addrs) => received.extend(addrs),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        debug!("Address feed closed");
                        self.hooks.addresses = None;
                        break;
                    }
                }
            }
        }
        self.enqueue(received);
    }

    fn dial_pending(&mut self) {
        while self.sessions.len() < self.config.max_sessions {
            let Some(addr) = self.pending.pop_front() else {
                break;
            };
            let id = self.next_id;
            self.next_id += 1;
            debug!("Opening session {} to {}", id, addr);
            self.sessions
                .push(SessionHandle::spawn(id, addr, self.context.clone()));
        }
    }

    /// One scheduling pass.
    ///
    /// Events are routed before timeouts are judged: a block may have
    /// arrived after its deadline but still be waiting in the queue.
    async fn schedule(&mut self) -> Result<()> {
        self.route_events().await?;
        self.retire_timed_out().await?;
        self.issue_requests();
        Ok(())
    }

    /// Close sessions sitting on a request for too long
    async fn retire_timed_out(&mut self) -> Result<()> {
        let now = Instant::now();
        let limit = self.config.request_timeout;

        let mut index = 0;
        while index < self.sessions.len() {
            if self.sessions[index].timed_out(limit, now) {
                let session = self.sessions.swap_remove(index);
                warn!(
                    "Retiring session to {}: {} requests timed out",
                    session.addr(),
                    session.outstanding_count()
                );
                self.retire(session).await?;
            } else {
                index += 1;
            }
        }
        Ok(())
    }

    /// Fill every ready session's spare request capacity
    fn issue_requests(&mut self) {
        let max = self.config.max_outstanding_per_session;

        for session in &mut self.sessions {
            if !session.is_requestable() {
                continue;
            }
            let spare = session.spare_capacity(max);
            if spare == 0 {
                continue;
            }

            let blocks = self
                .pieces
                .next_needed_blocks(session.bitfield(), spare, session.id());
            for (sent, block) in blocks.iter().enumerate() {
                if let Err(e) = session.request(*block) {
                    debug!("Could not request from {}: {}", session.addr(), e);
                    self.pieces
                        .release(session.id(), blocks[sent..].iter().copied());
                    break;
                }
            }
        }
    }

    /// Apply everything the sessions reported since the last pass
    async fn route_events(&mut self) -> Result<()> {
        // Taken out so each session can be routed against `&mut self`
        let mut sessions = std::mem::take(&mut self.sessions);
        let mut verified = Vec::new();
        let mut routed = Ok(());
        for session in &mut sessions {
            match self.route_session(session).await {
                Ok(pieces) => verified.extend(pieces),
                Err(e) => {
                    routed = Err(e);
                    break;
                }
            }
        }
        self.sessions = sessions;
        routed?;
        self.cancel_redundant(&verified);

        let (closed, open): (Vec<_>, Vec<_>) = std::mem::take(&mut self.sessions)
            .into_iter()
            .partition(|session| session.state() == ConnectionState::Closed);
        self.sessions = open;
        for session in closed {
            self.retire(session).await?;
        }
        Ok(())
    }

    /// Drain one session's queue; returns the pieces it completed
    async fn route_session(&mut self, session: &mut SessionHandle) -> Result<Vec<u32>> {
        let events: Vec<SessionEvent> = session.poll().collect();
        let mut verified = Vec::new();

        for event in events {
            match event {
                SessionEvent::Handshaking => debug!("Handshaking with {}", session.addr()),
                SessionEvent::Ready { peer_id } => {
                    debug!(
                        "Peer {} identifies as {}",
                        session.addr(),
                        String::from_utf8_lossy(&peer_id)
                    );
                }
                SessionEvent::Bitfield(bitfield) => {
                    self.pieces.add_availability(&bitfield);
                    let previous = session.set_bitfield(bitfield);
                    self.pieces.remove_availability(&previous);
                }
                SessionEvent::Have(index) => {
                    if session.add_have(index as usize) {
                        self.pieces.add_have(index as usize);
                    }
                }
                SessionEvent::Choked => {
                    let held = session.take_outstanding();
                    let released = self.pieces.release(session.id(), held);
                    debug!("{} choked us, released {} requests", session.addr(), released);
                }
                SessionEvent::Unchoked => debug!("{} unchoked us", session.addr()),
                SessionEvent::Block { block, outcome } => match outcome {
                    BlockOutcome::Verified(data) => {
                        self.storage
                            .write_verified_piece(block.piece_index, &data)
                            .await?;
                        self.written += 1;
                        verified.push(block.piece_index);
                        let progress = Progress {
                            verified: self.written,
                            total: self.pieces.piece_count(),
                        };
                        if let Some(tx) = &self.hooks.progress {
                            let _ = tx.send(progress);
                        }
                    }
                    // The piece is already back in the pool
                    BlockOutcome::HashMismatch => warn!(
                        "Piece {} from {} failed its hash check",
                        block.piece_index,
                        session.addr()
                    ),
                    BlockOutcome::InProgress | BlockOutcome::Redundant => {}
                },
                SessionEvent::Closed(reason) => match reason {
                    BittorrentError::HandshakeMismatch { .. }
                    | BittorrentError::Connect { .. } => {
                        info!("Dropping peer {}: {}", session.addr(), reason)
                    }
                    _ => warn!("Session to {} closed: {}", session.addr(), reason),
                },
            }
        }
        Ok(verified)
    }

    /// Withdraw requests other sessions still hold for completed pieces
    fn cancel_redundant(&mut self, completed: &[u32]) {
        if completed.is_empty() {
            return;
        }
        for session in &mut self.sessions {
            let stale: Vec<_> = session
                .outstanding()
                .filter(|block| completed.contains(&block.piece_index))
                .collect();
            for block in &stale {
                session.cancel(*block);
            }
            let released = self.pieces.release(session.id(), stale);
            if released > 0 {
                debug!("Cancelled {} redundant requests to {}", released, session.addr());
            }
        }
    }

    /// Undo a session's availability and return its requests to the pool.
    ///
    /// The task is stopped first and its queue routed, so a piece verified
    /// just before retirement is still written.
    async fn retire(&mut self, mut session: SessionHandle) -> Result<()> {
        session.stop().await;
        let verified = self.route_session(&mut session).await?;
        self.cancel_redundant(&verified);

        self.pieces.remove_availability(session.bitfield());
        let id = session.id();
        let released = self.pieces.release(id, session.close());
        if released > 0 {
            debug!("Released {} requests of session {}", released, id);
        }
        Ok(())
    }

    /// Drop every session without routing what is left in their queues
    fn close_all(&mut self) {
        for session in std::mem::take(&mut self.sessions) {
            self.pieces.remove_availability(session.bitfield());
            let id = session.id();
            self.pieces.release(id, session.close());
        }
    }

    /// No session, nothing queued, and no more addresses coming in time
    fn is_stalled(&mut self) -> bool {
        if !self.sessions.is_empty() || !self.pending.is_empty() {
            self.idle_since = None;
            return false;
        }
        if self.hooks.addresses.is_none() {
            return true;
        }
        let since = *self.idle_since.get_or_insert_with(Instant::now);
        since.elapsed() >= self.config.stall_timeout
    }
}
