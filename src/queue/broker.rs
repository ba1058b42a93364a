//! Minimal beanstalk-protocol client.
//!
//! Speaks just the subset the queue engine needs: `use`/`put`, `watch` +
//! `reserve-with-timeout 0`, `delete` and `stats-tube`, over a fresh TCP
//! connection per operation. The broker is an optional accelerator, so every
//! error here is soft; callers fall back to the snapshot queue.

use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_PORT: u16 = 11300;

/// Tube for an explicitly brokered location queue.
pub fn location_tube(location: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(location.as_bytes());
    format!("wpt.work.{}", hex::encode(hasher.finalize()))
}

/// Per-priority tube mirroring a local work directory.
pub fn priority_tube(work_dir: &str, priority: usize) -> String {
    let mut hasher = Sha1::new();
    hasher.update(work_dir.as_bytes());
    format!("wpt.{}.{priority}", hex::encode(hasher.finalize()))
}

pub struct BrokerClient {
    addr: String,
}

pub struct ReservedJob {
    pub id: u64,
    pub payload: Vec<u8>,
}

impl BrokerClient {
    pub fn new(addr: &str) -> Self {
        let addr = if addr.contains(':') {
            addr.to_string()
        } else {
            format!("{addr}:{DEFAULT_PORT}")
        };
        Self { addr }
    }

    async fn connect(&self) -> std::io::Result<BufReader<TcpStream>> {
        Ok(BufReader::new(TcpStream::connect(&self.addr).await?))
    }

    async fn read_line(stream: &mut BufReader<TcpStream>) -> std::io::Result<String> {
        let mut line = String::new();
        stream.read_line(&mut line).await?;
        Ok(line.trim_end().to_string())
    }

    /// Put a job into a tube. Returns false on any protocol or IO failure.
    pub async fn put(&self, tube: &str, priority: u32, payload: &[u8]) -> bool {
        let result: std::io::Result<bool> = async {
            let mut stream = self.connect().await?;
            stream
                .get_mut()
                .write_all(format!("use {tube}\r\n").as_bytes())
                .await?;
            let using = Self::read_line(&mut stream).await?;
            if !using.starts_with("USING") {
                return Ok(false);
            }
            let mut command =
                format!("put {priority} 0 3600 {}\r\n", payload.len()).into_bytes();
            command.extend_from_slice(payload);
            command.extend_from_slice(b"\r\n");
            stream.get_mut().write_all(&command).await?;
            let reply = Self::read_line(&mut stream).await?;
            Ok(reply.starts_with("INSERTED"))
        }
        .await;
        match result {
            Ok(ok) => ok,
            Err(err) => {
                tracing::warn!(addr = %self.addr, %tube, %err, "broker put failed");
                false
            }
        }
    }

    /// Reserve a ready job from a tube without blocking, deleting it on
    /// success.
    pub async fn take(&self, tube: &str) -> Option<Vec<u8>> {
        let job = self.reserve(tube).await?;
        self.delete(job.id).await;
        Some(job.payload)
    }

    async fn reserve(&self, tube: &str) -> Option<ReservedJob> {
        let result: std::io::Result<Option<ReservedJob>> = async {
            let mut stream = self.connect().await?;
            stream
                .get_mut()
                .write_all(format!("watch {tube}\r\nignore default\r\n").as_bytes())
                .await?;
            let _watching = Self::read_line(&mut stream).await?;
            let _ignored = Self::read_line(&mut stream).await?;
            stream
                .get_mut()
                .write_all(b"reserve-with-timeout 0\r\n")
                .await?;
            let reply = Self::read_line(&mut stream).await?;
            let mut parts = reply.split_whitespace();
            if parts.next() != Some("RESERVED") {
                return Ok(None);
            }
            let id: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let len: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let mut payload = vec![0u8; len + 2];
            stream.read_exact(&mut payload).await?;
            payload.truncate(len);
            Ok(Some(ReservedJob { id, payload }))
        }
        .await;
        match result {
            Ok(job) => job,
            Err(err) => {
                tracing::warn!(addr = %self.addr, %tube, %err, "broker reserve failed");
                None
            }
        }
    }

    async fn delete(&self, id: u64) {
        let result: std::io::Result<()> = async {
            let mut stream = self.connect().await?;
            stream
                .get_mut()
                .write_all(format!("delete {id}\r\n").as_bytes())
                .await?;
            let _ = Self::read_line(&mut stream).await?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            tracing::warn!(addr = %self.addr, id, %err, "broker delete failed");
        }
    }

    /// Number of ready jobs in a tube, zero when unavailable.
    pub async fn ready_count(&self, tube: &str) -> u64 {
        let result: std::io::Result<u64> = async {
            let mut stream = self.connect().await?;
            stream
                .get_mut()
                .write_all(format!("stats-tube {tube}\r\n").as_bytes())
                .await?;
            let reply = Self::read_line(&mut stream).await?;
            let mut parts = reply.split_whitespace();
            if parts.next() != Some("OK") {
                return Ok(0);
            }
            let len: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let mut body = vec![0u8; len + 2];
            stream.read_exact(&mut body).await?;
            let text = String::from_utf8_lossy(&body);
            for line in text.lines() {
                if let Some(rest) = line.strip_prefix("current-jobs-ready:") {
                    return Ok(rest.trim().parse().unwrap_or(0));
                }
            }
            Ok(0)
        }
        .await;
        result.unwrap_or(0)
    }
}
