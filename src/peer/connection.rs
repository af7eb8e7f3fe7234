use super::{BlockRequest, Handshake, PeerMessage, HANDSHAKE_LEN};
use crate::error::{BittorrentError, Result};
use crate::hash::Sha1Hash;
use bytes::BytesMut;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

const READ_CHUNK: usize = 32 * 1024;

/// Bounds on every blocking network operation of a session
#[derive(Debug, Clone)]
pub struct SessionTimeouts {
    pub connect: Duration,
    pub handshake: Duration,
    pub write: Duration,
    /// Close the session after this long without receiving anything
    pub idle: Duration,
    /// Send a keep-alive after this long without sending anything
    pub keep_alive: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            handshake: Duration::from_secs(10),
            write: Duration::from_secs(30),
            idle: Duration::from_secs(180),
            keep_alive: Duration::from_secs(120),
        }
    }
}

/// An established, handshaken connection to one peer
pub struct PeerConnection<S = TcpStream> {
    addr: SocketAddr,
    stream: S,
    read_buf: BytesMut,
    peer_id: [u8; 20],
    write_timeout: Duration,
    last_received: Instant,
    last_sent: Instant,
}

impl PeerConnection<TcpStream> {
    /// Connect to a peer and perform the handshake
    pub async fn connect_and_handshake(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        our_peer_id: [u8; 20],
        timeouts: &SessionTimeouts,
    ) -> Result<Self> {
        let stream = Self::connect(addr, timeouts.connect).await?;
        Self::handshake(addr, stream, info_hash, our_peer_id, timeouts).await
    }

    /// Open the transport connection
    pub async fn connect(addr: SocketAddr, limit: Duration) -> Result<TcpStream> {
        debug!("Connecting to peer: {}", addr);

        let connect_error = |reason: String| BittorrentError::Connect { addr, reason };
        let stream = timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| connect_error("timed out".to_string()))?
            .map_err(|e| connect_error(e.to_string()))?;

        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Exchange greetings over an already-open stream.
    ///
    /// Transport failures surface as `Connect` so the dialer may retry; a
    /// greeting for another torrent is a `HandshakeMismatch`.
    pub async fn handshake(
        addr: SocketAddr,
        mut stream: S,
        info_hash: Sha1Hash,
        our_peer_id: [u8; 20],
        timeouts: &SessionTimeouts,
    ) -> Result<Self> {
        let transport_error = |reason: String| BittorrentError::Connect { addr, reason };

        let exchange = async {
            stream
                .write_all(&Handshake::new(info_hash, our_peer_id).to_bytes())
                .await?;
            let mut reply = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut reply).await?;
            Ok::<_, std::io::Error>(reply)
        };

        let reply = timeout(timeouts.handshake, exchange)
            .await
            .map_err(|_| transport_error("handshake timed out".to_string()))?
            .map_err(|e| transport_error(format!("handshake failed: {}", e)))?;

        let remote = Handshake::validate(&reply, &info_hash, addr)?;
        info!("Handshake complete with peer: {}", addr);

        let now = Instant::now();
        Ok(Self {
            addr,
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            peer_id: remote.peer_id,
            write_timeout: timeouts.write,
            last_received: now,
            last_sent: now,
        })
    }

    pub async fn send_message(&mut self, message: &PeerMessage) -> Result<()> {
        let bytes = message.to_bytes();
        let addr = self.addr;
        bounded_write(addr, self.write_timeout, self.stream.write_all(&bytes)).await?;
        self.last_sent = Instant::now();

        debug!("Sent message to {}: {:?}", addr, message);
        Ok(())
    }

    pub async fn send_interested(&mut self) -> Result<()> {
        self.send_message(&PeerMessage::Interested).await
    }

    pub async fn send_request(&mut self, block: BlockRequest) -> Result<()> {
        self.send_message(&PeerMessage::Request { block }).await
    }

    pub async fn send_cancel(&mut self, block: BlockRequest) -> Result<()> {
        self.send_message(&PeerMessage::Cancel { block }).await
    }

    /// Next inbound message, or `None` once the peer closed the stream.
    ///
    /// Cancel-safe: bytes already read stay buffered across calls, so this
    /// can sit in a `select!` next to command handling.
    pub async fn read_message(&mut self) -> Result<Option<PeerMessage>> {
        loop {
            if let Some(message) = PeerMessage::decode_frame(&mut self.read_buf)? {
                self.last_received = Instant::now();
                return Ok(Some(message));
            }

            self.read_buf.reserve(READ_CHUNK);
            let n = self.stream.read_buf(&mut self.read_buf).await.map_err(|e| {
                BittorrentError::Protocol(format!("read from {} failed: {}", self.addr, e))
            })?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(BittorrentError::Protocol(format!(
                    "{} closed the connection mid-message",
                    self.addr
                )));
            }
            self.last_received = Instant::now();
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    pub fn last_sent(&self) -> Instant {
        self.last_sent
    }
}

async fn bounded_write<F>(addr: SocketAddr, limit: Duration, write: F) -> Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    match timeout(limit, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(BittorrentError::Protocol(format!(
            "write to {} failed: {}",
            addr, e
        ))),
        Err(_) => Err(BittorrentError::Protocol(format!(
            "write to {} timed out",
            addr
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{descriptor_for, info_hash_for, FakeSeeder, SeederBehavior};
    use tokio_test::io::Builder;

    const INFO_HASH: [u8; 20] = [7u8; 20];
    const OUR_ID: [u8; 20] = *b"-BF0001-000000000000";
    const THEIR_ID: [u8; 20] = *b"-XX0001-111111111111";

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    fn greeting(info_hash: [u8; 20], peer_id: [u8; 20]) -> [u8; HANDSHAKE_LEN] {
        Handshake::new(Sha1Hash::new(info_hash), peer_id).to_bytes()
    }

    #[tokio::test]
    async fn test_handshake_then_messages() {
        let mock = Builder::new()
            .write(&greeting(INFO_HASH, OUR_ID))
            .read(&greeting(INFO_HASH, THEIR_ID))
            .write(&PeerMessage::Interested.to_bytes())
            // keep-alive, then a Have split across two reads
            .read(&[0, 0, 0, 0, 0, 0, 0, 5])
            .read(&[4, 0, 0, 0, 3])
            .build();

        let mut conn = PeerConnection::handshake(
            addr(),
            mock,
            Sha1Hash::new(INFO_HASH),
            OUR_ID,
            &SessionTimeouts::default(),
        )
        .await
        .unwrap();

        assert_eq!(conn.peer_id(), &THEIR_ID);

        conn.send_interested().await.unwrap();
        assert_eq!(
            conn.read_message().await.unwrap(),
            Some(PeerMessage::KeepAlive)
        );
        assert_eq!(
            conn.read_message().await.unwrap(),
            Some(PeerMessage::Have { piece_index: 3 })
        );
        assert_eq!(conn.read_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_handshake_mismatch() {
        let mock = Builder::new()
            .write(&greeting(INFO_HASH, OUR_ID))
            .read(&greeting([8u8; 20], THEIR_ID))
            .build();

        let result = PeerConnection::handshake(
            addr(),
            mock,
            Sha1Hash::new(INFO_HASH),
            OUR_ID,
            &SessionTimeouts::default(),
        )
        .await;

        assert!(matches!(
            result,
            Err(BittorrentError::HandshakeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_protocol_error() {
        let mock = Builder::new()
            .write(&greeting(INFO_HASH, OUR_ID))
            .read(&greeting(INFO_HASH, THEIR_ID))
            .read(&[0, 0, 0, 13, 7, 0])
            .build();

        let mut conn = PeerConnection::handshake(
            addr(),
            mock,
            Sha1Hash::new(INFO_HASH),
            OUR_ID,
            &SessionTimeouts::default(),
        )
        .await
        .unwrap();

        assert!(matches!(
            conn.read_message().await,
            Err(BittorrentError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = PeerConnection::connect(addr, Duration::from_secs(2)).await;

        assert!(matches!(result, Err(BittorrentError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_connect_and_handshake_over_loopback() {
        let data = vec![3u8; 2048];
        let descriptor = descriptor_for(&data, 1024);
        let info_hash = info_hash_for(&descriptor);
        let seeder = FakeSeeder::start(&data, 1024, info_hash, SeederBehavior::Honest).await;

        let mut conn = PeerConnection::connect_and_handshake(
            seeder.addr(),
            info_hash,
            OUR_ID,
            &SessionTimeouts::default(),
        )
        .await
        .unwrap();

        assert_eq!(conn.addr(), seeder.addr());
        assert_eq!(conn.peer_id(), b"-FS0001-seedseedseed");
        assert!(matches!(
            conn.read_message().await.unwrap(),
            Some(PeerMessage::Bitfield { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_and_handshake_wrong_torrent() {
        let data = vec![3u8; 2048];
        let descriptor = descriptor_for(&data, 1024);
        let info_hash = info_hash_for(&descriptor);
        let seeder =
            FakeSeeder::start(&data, 1024, info_hash, SeederBehavior::WrongInfoHash).await;

        let result = PeerConnection::connect_and_handshake(
            seeder.addr(),
            info_hash,
            OUR_ID,
            &SessionTimeouts::default(),
        )
        .await;

        assert!(matches!(
            result,
            Err(BittorrentError::HandshakeMismatch { .. })
        ));
    }
}
