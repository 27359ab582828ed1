//! Bidirectional byte bridging between a requester and a data connection

use backhaul_proto::ChannelId;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const BRIDGE_BUFFER_SIZE: usize = 16 * 1024;

/// Any duplex byte stream that can be moved between tasks
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// A data connection opened by an agent for one channel
pub struct DataConnection {
    pub channel_id: ChannelId,
    pub connection_id: String,
    pub remote_addr: Option<SocketAddr>,
    /// Control session the agent opened this connection for, if it said
    pub session_id: Option<String>,
    stream: BoxedStream,
}

impl std::fmt::Debug for DataConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataConnection")
            .field("channel_id", &self.channel_id)
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl DataConnection {
    pub fn new<S>(channel_id: ChannelId, remote_addr: Option<SocketAddr>, stream: S) -> Self
    where
        S: ByteStream + 'static,
    {
        Self {
            channel_id,
            connection_id: format!("data-{}", uuid::Uuid::new_v4()),
            remote_addr,
            session_id: None,
            stream: Box::new(stream),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn into_stream(self) -> BoxedStream {
        self.stream
    }

    /// Close the connection without transferring anything
    pub async fn shutdown(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("[{}] Shutdown failed: {}", self.connection_id, e);
        }
    }
}

/// Which side of a bridge ended it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeSide {
    /// First argument to [`bridge`] (reading from it hit EOF or failed)
    A,
    /// Second argument to [`bridge`]
    B,
}

/// Transfer statistics of a finished bridge
#[derive(Debug)]
pub struct BridgeResult {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub terminated_by: BridgeSide,
    pub error: Option<io::Error>,
}

impl BridgeResult {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Copy bytes in both directions until either side closes or fails
///
/// The first EOF or error in either direction ends the bridge; both streams
/// are then shut down. Never retries.
pub async fn bridge<A, B>(a: A, b: B) -> BridgeResult
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let (terminated_by, error) = {
        let forward = pump(&mut a_read, &mut b_write, &mut a_to_b);
        let backward = pump(&mut b_read, &mut a_write, &mut b_to_a);

        tokio::select! {
            result = forward => (BridgeSide::A, result.err()),
            result = backward => (BridgeSide::B, result.err()),
        }
    };

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    BridgeResult {
        a_to_b,
        b_to_a,
        terminated_by,
        error,
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, transferred: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BRIDGE_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        *transferred += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    #[tokio::test]
    async fn test_bridge_forwards_both_directions() {
        let (mut left, left_bridge) = tokio::io::duplex(1024);
        let (right_bridge, mut right) = tokio::io::duplex(1024);

        let task = tokio::spawn(bridge(left_bridge, right_bridge));

        left.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        right.write_all(b"response!").await.unwrap();
        let mut buf = [0u8; 9];
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response!");

        left.shutdown().await.unwrap();
        drop(left);

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.a_to_b, 7);
        assert_eq!(result.b_to_a, 9);
        assert_eq!(result.terminated_by, BridgeSide::A);
        assert!(result.is_clean());

        // The other side observes the close
        let mut rest = Vec::new();
        right.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_megabyte_with_random_chunks_is_byte_exact() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let payload: Vec<u8> = (0..1024 * 1024).map(|_| rng.gen()).collect();
        let chunks: Vec<usize> = {
            let mut sizes = Vec::new();
            let mut total = 0;
            while total < payload.len() {
                let size = rng.gen_range(1..=8192).min(payload.len() - total);
                sizes.push(size);
                total += size;
            }
            sizes
        };

        let (mut left, left_bridge) = tokio::io::duplex(4096);
        let (right_bridge, mut right) = tokio::io::duplex(4096);
        let task = tokio::spawn(bridge(left_bridge, right_bridge));

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            let mut offset = 0;
            for size in chunks {
                left.write_all(&payload[offset..offset + size]).await.unwrap();
                offset += size;
            }
            left.shutdown().await.unwrap();
            left
        });

        let mut received = Vec::new();
        right.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), expected.len());
        assert!(received == expected, "payload corrupted in transit");

        let _left = writer.await.unwrap();
        let result = task.await.unwrap();
        assert_eq!(result.a_to_b, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_data_connection_shutdown_closes_stream() {
        let (local, mut remote) = tokio::io::duplex(64);
        let conn = DataConnection::new(7, None, local);
        assert_eq!(conn.channel_id, 7);
        assert!(conn.connection_id.starts_with("data-"));

        conn.shutdown().await;

        let mut buf = Vec::new();
        remote.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }
}
