//! Chunked block object loader.
//!
//! Blocks are served by the node's object endpoint: `/obj/info?q={hash}`
//! reports the serialized size, `/obj/chunk?q=&chunk_index=&chunk_size=`
//! returns one slice. The destination file is preallocated and every chunk
//! is written at `chunk_index * chunk_size`, so chunks may land in any order.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::config::NodeConfig;
use crate::error::TransportError;
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
struct ObjectInfo {
    #[serde(default)]
    size: u64,
}

/// Byte range covered by one chunk request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: u64,
    pub offset: u64,
    pub len: u64,
}

/// Split an object of `size` bytes into `chunk_size` slices; the last one
/// may be shorter.
pub fn chunk_plan(size: u64, chunk_size: u64) -> Vec<ChunkRange> {
    let chunk_size = chunk_size.max(1);
    (0..size.div_ceil(chunk_size))
        .map(|index| {
            let offset = index * chunk_size;
            ChunkRange {
                index,
                offset,
                len: chunk_size.min(size - offset),
            }
        })
        .collect()
}

/// Write `bytes` at `offset` of an existing file.
pub async fn write_chunk_at(path: &Path, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(bytes).await?;
    file.flush().await
}

pub struct ObjectLoader {
    base_url: String,
    user: String,
    password: String,
    http: reqwest::Client,
    chunk_size: u64,
    concurrency: usize,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ObjectLoader {
    pub fn new(config: &NodeConfig, http: reqwest::Client) -> Self {
        Self {
            base_url: config.object_base().to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
            http,
            chunk_size: config.chunk_size.max(1),
            concurrency: config.chunk_concurrency.max(1),
            retry: RetryPolicy::new(config.retry.clone()),
            timeout: config.chunk_timeout(),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{path}", self.base_url))
            .basic_auth(&self.user, Some(&self.password))
            .timeout(self.timeout)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, TransportError> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(e, timeout_ms))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }
        Ok(resp)
    }

    /// Serialized size of the object. Zero means the node does not have it.
    pub async fn object_size(&self, q: &str) -> Result<u64, TransportError> {
        let resp = self.send(self.get("/obj/info").query(&[("q", q)])).await?;
        let timeout_ms = self.timeout.as_millis() as u64;
        let info: ObjectInfo = resp
            .json()
            .await
            .map_err(|e| TransportError::from_reqwest(e, timeout_ms))?;
        Ok(info.size)
    }

    async fn fetch_chunk(&self, q: &str, range: ChunkRange) -> Result<Vec<u8>, TransportError> {
        let req = self.get("/obj/chunk").query(&[
            ("q", q.to_string()),
            ("chunk_index", range.index.to_string()),
            ("chunk_size", self.chunk_size.to_string()),
        ]);
        let resp = self.send(req).await?;
        let timeout_ms = self.timeout.as_millis() as u64;
        let mut bytes = resp
            .bytes()
            .await
            .map_err(|e| TransportError::from_reqwest(e, timeout_ms))?
            .to_vec();
        if (bytes.len() as u64) < range.len {
            return Err(TransportError::ShortChunk {
                index: range.index,
                expected: range.len,
                got: bytes.len() as u64,
            });
        }
        bytes.truncate(range.len as usize);
        Ok(bytes)
    }

    /// Download object `q` into `dest`. Returns its size in bytes. A failed
    /// download leaves no file behind.
    pub async fn download_to_file(&self, q: &str, dest: &Path) -> Result<u64, TransportError> {
        let size = self.retry.run("obj/info", move || self.object_size(q)).await?;
        if size == 0 {
            return Err(TransportError::NotFound(q.to_string()));
        }

        let file = tokio::fs::File::create(dest).await?;
        file.set_len(size).await?;
        drop(file);

        let plan = chunk_plan(size, self.chunk_size);
        let chunks = plan.len();
        let result: Result<Vec<()>, TransportError> = stream::iter(plan)
            .map(|range| async move {
                let bytes = self
                    .retry
                    .run("obj/chunk", move || self.fetch_chunk(q, range))
                    .await?;
                write_chunk_at(dest, range.offset, &bytes).await?;
                Ok(())
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await;

        if let Err(e) = result {
            if let Err(rm) = tokio::fs::remove_file(dest).await {
                tracing::debug!(path = %dest.display(), error = %rm, "partial download not removed");
            }
            return Err(e);
        }
        tracing::debug!(object = q, size, chunks, "object downloaded");
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_covers_object_exactly() {
        let plan = chunk_plan(1_600_000, 750_000);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[1], ChunkRange { index: 1, offset: 750_000, len: 750_000 });
        assert_eq!(plan[2], ChunkRange { index: 2, offset: 1_500_000, len: 100_000 });
        assert_eq!(plan.iter().map(|r| r.len).sum::<u64>(), 1_600_000);

        assert_eq!(chunk_plan(750_000, 750_000).len(), 1);
        assert!(chunk_plan(0, 750_000).is_empty());
    }

    #[tokio::test]
    async fn out_of_order_chunks_assemble() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.bin");
        let file = tokio::fs::File::create(&path).await.unwrap();
        file.set_len(10).await.unwrap();
        drop(file);

        write_chunk_at(&path, 8, b"ij").await.unwrap();
        write_chunk_at(&path, 0, b"abcd").await.unwrap();
        write_chunk_at(&path, 4, b"efgh").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcdefghij");
    }

    #[tokio::test]
    async fn unreachable_object_service_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        let config = NodeConfig {
            // port 9 (discard) on loopback is not served
            object_url: "http://127.0.0.1:9".into(),
            retry: crate::retry::RetryConfig {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let loader = ObjectLoader::new(&config, reqwest::Client::new());
        let err = loader.download_to_file("00ab", &path).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!path.exists());
    }
}
