use super::{Bitfield, BlockRequest, PeerConnection, PeerMessage, SessionTimeouts};
use crate::download::RetryPolicy;
use crate::error::{BittorrentError, Result};
use crate::hash::Sha1Hash;
use crate::piece::{BlockOutcome, PieceManager, SessionId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

/// Lifecycle of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Ready,
    Closed,
}

/// Work handed from the coordinator to a session task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Request(BlockRequest),
    Cancel(BlockRequest),
}

/// What a session task reports back
#[derive(Debug)]
pub enum SessionEvent {
    /// Transport is up, greeting in progress
    Handshaking,
    Ready { peer_id: [u8; 20] },
    /// Replaces whatever the peer announced before
    Bitfield(Bitfield),
    Have(u32),
    Choked,
    Unchoked,
    /// A block was handed to the piece manager
    Block {
        block: BlockRequest,
        outcome: BlockOutcome,
    },
    /// Always the last event of a session
    Closed(BittorrentError),
}

/// Everything a session task needs besides its address
#[derive(Clone)]
pub struct SessionContext {
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
    pub num_pieces: usize,
    pub timeouts: SessionTimeouts,
    pub retry: RetryPolicy,
    pub pieces: Arc<PieceManager>,
    /// Signalled after every event so the coordinator can react before its next tick
    pub wake: Arc<Notify>,
}

/// Coordinator-side view of one peer session.
///
/// The network I/O runs on its own task; the handle tracks what the
/// coordinator needs for scheduling (state, bitfield, outstanding requests)
/// from the events that task emits. Dropping the handle aborts the task.
pub struct SessionHandle {
    id: SessionId,
    addr: SocketAddr,
    state: ConnectionState,
    peer_choking: bool,
    bitfield: Bitfield,
    outstanding: HashMap<BlockRequest, Instant>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    /// Taken once the task has been stopped and joined
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Start dialing `addr` on a new task
    pub fn spawn(id: SessionId, addr: SocketAddr, context: SessionContext) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::new(context.num_pieces);

        let task = tokio::spawn(run_session(addr, context, command_rx, event_tx));

        Self {
            id,
            addr,
            state: ConnectionState::Connecting,
            peer_choking: true,
            bitfield,
            outstanding: HashMap::new(),
            commands: command_tx,
            events: event_rx,
            task: Some(task),
        }
    }

    /// Drain the events received so far.
    ///
    /// The sequence ends when nothing more is queued; it ends for good once
    /// the session has closed, after yielding its `Closed` event.
    pub fn poll(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        std::iter::from_fn(move || {
            if self.state == ConnectionState::Closed {
                return None;
            }

            let event = match self.events.try_recv() {
                Ok(event) => event,
                Err(mpsc::error::TryRecvError::Empty) => return None,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    SessionEvent::Closed(BittorrentError::SessionClosed(self.addr))
                }
            };
            self.observe(&event);
            Some(event)
        })
    }

    fn observe(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Handshaking => self.state = ConnectionState::Handshaking,
            SessionEvent::Ready { .. } => self.state = ConnectionState::Ready,
            SessionEvent::Choked => self.peer_choking = true,
            SessionEvent::Unchoked => self.peer_choking = false,
            SessionEvent::Block { block, .. } => {
                self.outstanding.remove(block);
            }
            SessionEvent::Closed(_) => self.state = ConnectionState::Closed,
            SessionEvent::Bitfield(_) | SessionEvent::Have(_) => {}
        }
    }

    /// Ask the peer for `block`
    pub fn request(&mut self, block: BlockRequest) -> Result<()> {
        if self.state != ConnectionState::Ready {
            return Err(BittorrentError::SessionClosed(self.addr));
        }
        self.commands
            .send(SessionCommand::Request(block))
            .map_err(|_| BittorrentError::SessionClosed(self.addr))?;
        self.outstanding.insert(block, Instant::now());
        Ok(())
    }

    /// Withdraw an outstanding request; returns whether it was outstanding
    pub fn cancel(&mut self, block: BlockRequest) -> bool {
        if self.outstanding.remove(&block).is_none() {
            return false;
        }
        // A dead task has nothing left to cancel
        let _ = self.commands.send(SessionCommand::Cancel(block));
        true
    }

    /// Stop the task and wait until it has exited.
    ///
    /// Events it emitted before stopping stay queued for `poll`, so nothing
    /// it reported (a verified piece in particular) is lost.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // Cancelled or finished, either way it emits nothing more
            let _ = task.await;
        }
    }

    /// Tear the session down, returning the requests it still held
    pub fn close(mut self) -> Vec<BlockRequest> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state = ConnectionState::Closed;
        self.take_outstanding()
    }

    /// Forget every outstanding request (the peer will not answer them)
    pub fn take_outstanding(&mut self) -> Vec<BlockRequest> {
        self.outstanding.drain().map(|(block, _)| block).collect()
    }

    /// Replace the peer's bitfield, returning the previous one
    pub fn set_bitfield(&mut self, bitfield: Bitfield) -> Bitfield {
        std::mem::replace(&mut self.bitfield, bitfield)
    }

    /// Record one more piece; returns whether it was new
    pub fn add_have(&mut self, index: usize) -> bool {
        self.bitfield.set(index)
    }

    /// Whether some request has been outstanding longer than `limit`
    pub fn timed_out(&self, limit: Duration, now: Instant) -> bool {
        self.outstanding
            .values()
            .any(|&issued| now.saturating_duration_since(issued) >= limit)
    }

    /// Ready and unchoked: requests will be served
    pub fn is_requestable(&self) -> bool {
        self.state == ConnectionState::Ready && !self.peer_choking
    }

    pub fn spare_capacity(&self, max_outstanding: usize) -> usize {
        max_outstanding.saturating_sub(self.outstanding.len())
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Requests still awaiting a block
    pub fn outstanding(&self) -> impl Iterator<Item = BlockRequest> + '_ {
        self.outstanding.keys().copied()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

struct EventSink {
    events: mpsc::UnboundedSender<SessionEvent>,
    wake: Arc<Notify>,
}

impl EventSink {
    fn emit(&self, event: SessionEvent) {
        // The coordinator may already have dropped the handle
        let _ = self.events.send(event);
        self.wake.notify_one();
    }
}

async fn run_session(
    addr: SocketAddr,
    context: SessionContext,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let sink = EventSink {
        events,
        wake: context.wake.clone(),
    };

    let reason = match drive(addr, &context, &mut commands, &sink).await {
        Ok(()) => BittorrentError::SessionClosed(addr),
        Err(e) => e,
    };
    debug!("Session with {} ended: {}", addr, reason);
    sink.emit(SessionEvent::Closed(reason));
}

/// Dial under the retry policy; only transport failures are retried
async fn dial(
    addr: SocketAddr,
    context: &SessionContext,
    sink: &EventSink,
) -> Result<PeerConnection> {
    let mut attempt = 1;
    loop {
        sleep(context.retry.jitter()).await;

        let result = async {
            let stream = PeerConnection::connect(addr, context.timeouts.connect).await?;
            sink.emit(SessionEvent::Handshaking);
            PeerConnection::handshake(
                addr,
                stream,
                context.info_hash,
                context.peer_id,
                &context.timeouts,
            )
            .await
        }
        .await;

        match result {
            Ok(conn) => return Ok(conn),
            Err(e) if context.retry.should_retry(attempt, &e) => {
                let delay = context.retry.backoff_after(attempt);
                warn!(
                    "Attempt {}/{} to {} failed ({}), retrying in {:?}",
                    attempt, context.retry.max_attempts, addr, e, delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn drive(
    addr: SocketAddr,
    context: &SessionContext,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    sink: &EventSink,
) -> Result<()> {
    let mut conn = dial(addr, context, sink).await?;
    info!("Session ready with {}", addr);
    sink.emit(SessionEvent::Ready {
        peer_id: *conn.peer_id(),
    });
    conn.send_interested().await?;

    loop {
        let idle_deadline = conn.last_received() + context.timeouts.idle;
        let keep_alive_at = conn.last_sent() + context.timeouts.keep_alive;

        tokio::select! {
            message = conn.read_message() => match message? {
                Some(message) => handle_message(message, context, sink)?,
                None => {
                    return Err(BittorrentError::Protocol(format!(
                        "{} closed the connection",
                        addr
                    )))
                }
            },
            command = commands.recv() => match command {
                Some(SessionCommand::Request(block)) => conn.send_request(block).await?,
                Some(SessionCommand::Cancel(block)) => conn.send_cancel(block).await?,
                // Handle dropped
                None => return Ok(()),
            },
            _ = sleep_until(idle_deadline) => {
                return Err(BittorrentError::Protocol(format!("{} idle timeout", addr)));
            }
            _ = sleep_until(keep_alive_at) => {
                conn.send_message(&PeerMessage::KeepAlive).await?;
            }
        }
    }
}

fn handle_message(
    message: PeerMessage,
    context: &SessionContext,
    sink: &EventSink,
) -> Result<()> {
    match message {
        PeerMessage::KeepAlive => {}
        PeerMessage::Choke => sink.emit(SessionEvent::Choked),
        PeerMessage::Unchoke => sink.emit(SessionEvent::Unchoked),
        // We do not upload
        PeerMessage::Interested
        | PeerMessage::NotInterested
        | PeerMessage::Request { .. }
        | PeerMessage::Cancel { .. } => {
            debug!("Ignoring {:?}", message);
        }
        PeerMessage::Have { piece_index } => {
            if piece_index as usize >= context.num_pieces {
                return Err(BittorrentError::Protocol(format!(
                    "Have for piece {} of {}",
                    piece_index, context.num_pieces
                )));
            }
            sink.emit(SessionEvent::Have(piece_index));
        }
        PeerMessage::Bitfield { bitfield } => {
            let bitfield = Bitfield::from_payload(&bitfield, context.num_pieces)?;
            sink.emit(SessionEvent::Bitfield(bitfield));
        }
        PeerMessage::Piece {
            piece_index,
            offset,
            data,
        } => {
            let outcome = context
                .pieces
                .on_block_delivered(piece_index, offset, &data)?;
            sink.emit(SessionEvent::Block {
                block: BlockRequest::new(piece_index, offset, data.len() as u32),
                outcome,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::RarestFirst;
    use crate::testing::{descriptor_for, FakeSeeder, SeederBehavior};

    const OUR_ID: [u8; 20] = *b"-BF0001-abcdefghijkl";

    fn context(data: &[u8], piece_length: u64) -> SessionContext {
        let descriptor = descriptor_for(data, piece_length);
        SessionContext {
            info_hash: crate::testing::info_hash_for(&descriptor),
            peer_id: OUR_ID,
            num_pieces: descriptor.piece_count(),
            timeouts: SessionTimeouts {
                connect: Duration::from_secs(2),
                handshake: Duration::from_secs(2),
                ..SessionTimeouts::default()
            },
            retry: RetryPolicy::no_retry(),
            pieces: Arc::new(PieceManager::new(&descriptor, Box::new(RarestFirst))),
            wake: Arc::new(Notify::new()),
        }
    }

    async fn next_event(handle: &mut SessionHandle, wake: &Notify) -> SessionEvent {
        loop {
            if let Some(event) = handle.poll().next() {
                return event;
            }
            tokio::time::timeout(Duration::from_secs(5), wake.notified())
                .await
                .expect("session went quiet");
        }
    }

    #[tokio::test]
    async fn test_session_downloads_block() {
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let ctx = context(&data, 1024);
        let seeder = FakeSeeder::start(&data, 1024, ctx.info_hash, SeederBehavior::Honest).await;
        let wake = ctx.wake.clone();
        let pieces = ctx.pieces.clone();

        let mut handle = SessionHandle::spawn(1, seeder.addr(), ctx);
        assert_eq!(handle.state(), ConnectionState::Connecting);
        assert!(handle.request(BlockRequest::new(0, 0, 1024)).is_err());

        assert!(matches!(
            next_event(&mut handle, &wake).await,
            SessionEvent::Handshaking
        ));
        assert!(matches!(
            next_event(&mut handle, &wake).await,
            SessionEvent::Ready { .. }
        ));
        assert_eq!(handle.state(), ConnectionState::Ready);

        match next_event(&mut handle, &wake).await {
            SessionEvent::Bitfield(bitfield) => assert_eq!(bitfield.count(), 3),
            other => panic!("expected bitfield, got {:?}", other),
        }
        assert!(matches!(
            next_event(&mut handle, &wake).await,
            SessionEvent::Unchoked
        ));
        assert!(handle.is_requestable());

        let blocks = pieces.next_needed_blocks(&Bitfield::full(3), 1, handle.id());
        handle.request(blocks[0]).unwrap();
        assert_eq!(handle.outstanding_count(), 1);

        match next_event(&mut handle, &wake).await {
            SessionEvent::Block { block, outcome } => {
                assert_eq!(block, blocks[0]);
                assert_eq!(outcome, BlockOutcome::Verified(data[..1024].to_vec()));
            }
            other => panic!("expected block, got {:?}", other),
        }
        assert_eq!(handle.outstanding_count(), 0);
        assert_eq!(pieces.verified_count(), 1);
    }

    #[tokio::test]
    async fn test_handshake_mismatch_closes_session() {
        let data = vec![9u8; 2048];
        let ctx = context(&data, 1024);
        let seeder =
            FakeSeeder::start(&data, 1024, ctx.info_hash, SeederBehavior::WrongInfoHash).await;
        let wake = ctx.wake.clone();

        let mut handle = SessionHandle::spawn(7, seeder.addr(), ctx);

        let closed = loop {
            match next_event(&mut handle, &wake).await {
                SessionEvent::Closed(reason) => break reason,
                SessionEvent::Handshaking => continue,
                other => panic!("unexpected event {:?}", other),
            }
        };

        assert!(matches!(closed, BittorrentError::HandshakeMismatch { .. }));
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert_eq!(handle.bitfield().count(), 0);
        assert!(handle.poll().next().is_none());
    }

    #[tokio::test]
    async fn test_close_returns_outstanding() {
        let data = vec![1u8; 4096];
        let ctx = context(&data, 1024);
        let seeder = FakeSeeder::start(&data, 1024, ctx.info_hash, SeederBehavior::Silent).await;
        let wake = ctx.wake.clone();

        let mut handle = SessionHandle::spawn(3, seeder.addr(), ctx);
        while handle.state() != ConnectionState::Ready {
            next_event(&mut handle, &wake).await;
        }

        for index in 0..3 {
            handle.request(BlockRequest::new(index, 0, 1024)).unwrap();
        }
        assert!(handle.cancel(BlockRequest::new(2, 0, 1024)));
        assert!(!handle.cancel(BlockRequest::new(2, 0, 1024)));
        assert!(handle.timed_out(Duration::ZERO, Instant::now()));
        assert!(!handle.timed_out(Duration::from_secs(60), Instant::now()));

        let mut released = handle.close();
        released.sort();

        assert_eq!(
            released,
            vec![BlockRequest::new(0, 0, 1024), BlockRequest::new(1, 0, 1024)]
        );
    }

    #[tokio::test]
    async fn test_stop_keeps_queued_events() {
        let data: Vec<u8> = (0..2048u32).map(|i| (i % 13) as u8).collect();
        let ctx = context(&data, 1024);
        let seeder = FakeSeeder::start(&data, 1024, ctx.info_hash, SeederBehavior::Honest).await;
        let wake = ctx.wake.clone();
        let pieces = ctx.pieces.clone();

        let mut handle = SessionHandle::spawn(4, seeder.addr(), ctx);
        while !handle.is_requestable() {
            next_event(&mut handle, &wake).await;
        }
        handle.request(BlockRequest::new(0, 0, 1024)).unwrap();

        // The block is verified on the session task; leave its event unread
        tokio::time::timeout(Duration::from_secs(5), async {
            while pieces.verified_count() == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("block never arrived");
        handle.stop().await;

        let events: Vec<SessionEvent> = handle.poll().collect();
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::Block {
                outcome: BlockOutcome::Verified(_),
                ..
            }
        )));
        assert!(matches!(events.last(), Some(SessionEvent::Closed(_))));
        assert_eq!(handle.outstanding_count(), 0);
        assert!(handle.close().is_empty());
    }

    #[tokio::test]
    async fn test_refused_connection_closes() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let ctx = context(&[0u8; 10], 1024);
        let wake = ctx.wake.clone();

        let mut handle = SessionHandle::spawn(5, addr, ctx);

        match next_event(&mut handle, &wake).await {
            SessionEvent::Closed(reason) => {
                assert!(matches!(reason, BittorrentError::Connect { .. }))
            }
            other => panic!("expected close, got {:?}", other),
        }
    }
}
