//! Memcached text-protocol backend.
//!
//! Holds one lazily-opened connection. It is only returned to the slot after
//! a complete reply, so errors and cancelled calls leave the next call to
//! reconnect.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::error::CacheError;
use super::store::{CacheStore, StoreFlags};

const MAX_KEY_LEN: usize = 250;
/// Memcached reads relative expiries above this as absolute unix times.
const RELATIVE_EXPIRY_LIMIT_SECS: u64 = 60 * 60 * 24 * 30;

pub struct MemcachedStore {
    addr: String,
    conn: Mutex<Option<BufStream<TcpStream>>>,
}

impl MemcachedStore {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: Mutex::new(None),
        }
    }

    /// Send `request` and read its reply.
    ///
    /// The connection is taken out of the slot for the duration of the
    /// exchange and only returned after a complete reply, so a call that is
    /// cancelled or fails mid-exchange never leaves an unread reply behind
    /// for the next caller.
    async fn round_trip(&self, request: &[u8], expect: Expect<'_>) -> Result<Reply, CacheError> {
        let mut guard = self.conn.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => {
                debug!(addr = %self.addr, "connecting to memcached");
                let stream = TcpStream::connect(&self.addr)
                    .await
                    .map_err(CacheError::store)?;
                BufStream::new(stream)
            }
        };

        let reply = exchange(&mut conn, request, expect).await?;
        *guard = Some(conn);
        Ok(reply)
    }

    async fn status(&self, request: &[u8]) -> Result<String, CacheError> {
        match self.round_trip(request, Expect::Status).await? {
            Reply::Status(line) => Ok(line),
            Reply::Value(_) => Err(CacheError::store("unexpected value reply")),
        }
    }
}

#[derive(Clone, Copy)]
enum Expect<'a> {
    Status,
    /// A `get` reply for this wire key.
    Value(&'a str),
}

enum Reply {
    Status(String),
    Value(Option<Bytes>),
}

#[async_trait]
impl CacheStore for MemcachedStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let key = wire_key(key);
        let request = format!("get {key}\r\n");
        match self.round_trip(request.as_bytes(), Expect::Value(&key)).await? {
            Reply::Value(value) => Ok(value),
            Reply::Status(line) => Err(CacheError::store(format!("unexpected reply `{line}`"))),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        flags: StoreFlags,
    ) -> Result<(), CacheError> {
        let mut request = format!(
            "set {} {} {} {}\r\n",
            wire_key(key),
            flags.bits(),
            expiry_field(ttl, OffsetDateTime::now_utc()),
            value.len()
        )
        .into_bytes();
        request.extend_from_slice(&value);
        request.extend_from_slice(b"\r\n");

        match self.status(&request).await?.as_str() {
            "STORED" => Ok(()),
            other => Err(CacheError::store(format!("set rejected: `{other}`"))),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let request = format!("delete {}\r\n", wire_key(key));
        match self.status(request.as_bytes()).await?.as_str() {
            "DELETED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            other => Err(CacheError::store(format!("delete rejected: `{other}`"))),
        }
    }

    async fn keys(&self) -> Result<Option<Vec<String>>, CacheError> {
        Ok(None)
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        match self.status(b"flush_all\r\n").await?.as_str() {
            "OK" => Ok(()),
            other => Err(CacheError::store(format!("flush_all rejected: `{other}`"))),
        }
    }
}

async fn exchange(
    conn: &mut BufStream<TcpStream>,
    request: &[u8],
    expect: Expect<'_>,
) -> Result<Reply, CacheError> {
    conn.write_all(request).await.map_err(CacheError::store)?;
    conn.flush().await.map_err(CacheError::store)?;

    let header = read_line(conn).await?;
    match expect {
        Expect::Status => Ok(Reply::Status(header)),
        Expect::Value(_) if header == "END" => Ok(Reply::Value(None)),
        Expect::Value(expected) => {
            let (key, len) = parse_value_header(&header)?;
            if key != expected {
                return Err(CacheError::store(format!(
                    "reply for `{key}` while reading `{expected}`"
                )));
            }
            let mut data = vec![0u8; len + 2];
            conn.read_exact(&mut data).await.map_err(CacheError::store)?;
            data.truncate(len);
            let end = read_line(conn).await?;
            if end != "END" {
                return Err(CacheError::store(format!("unexpected reply `{end}`")));
            }
            Ok(Reply::Value(Some(Bytes::from(data))))
        }
    }
}

async fn read_line(conn: &mut BufStream<TcpStream>) -> Result<String, CacheError> {
    let mut line = String::new();
    let read = conn.read_line(&mut line).await.map_err(CacheError::store)?;
    if read == 0 {
        return Err(CacheError::store("memcached closed the connection"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Parse `VALUE <key> <flags> <bytes>` into the key and payload length.
fn parse_value_header(line: &str) -> Result<(&str, usize), CacheError> {
    let mut parts = line.split(' ');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("VALUE"), Some(key), Some(_flags), Some(len)) => len
            .parse()
            .map(|len| (key, len))
            .map_err(|_| CacheError::store(format!("bad value length in `{line}`"))),
        _ => Err(CacheError::store(format!("unexpected reply `{line}`"))),
    }
}

/// Keys that memcached would reject are replaced by their digest.
fn wire_key(key: &str) -> String {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.bytes().all(|b| b.is_ascii_graphic());
    if valid {
        key.to_string()
    } else {
        format!("h:{}", hex::encode(Sha256::digest(key.as_bytes())))
    }
}

fn expiry_field(ttl: Duration, now: OffsetDateTime) -> u64 {
    let secs = ttl.as_secs();
    if secs > RELATIVE_EXPIRY_LIMIT_SECS {
        now.unix_timestamp().max(0) as u64 + secs
    } else {
        secs
    }
}
