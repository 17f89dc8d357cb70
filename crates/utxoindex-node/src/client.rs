//! HTTP client for a bitcoind-family full node.
//!
//! - JSON-RPC 1.0 calls over `POST rpc_url` with Basic auth
//! - raw transactions over the unauthenticated REST interface
//!   (`GET /rest/tx/{txid}.hex`)
//! - block bodies through the chunked object loader
//!
//! Transient failures (connection errors, timeouts, 5xx) are retried with
//! exponential backoff; JSON-RPC errors are returned as-is.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use utxoindex_core::node::NodeClient;
use utxoindex_core::types::{BlockHeader, BlockchainInfo, MempoolInfo};
use utxoindex_core::IndexerError;

use crate::config::NodeConfig;
use crate::error::TransportError;
use crate::loader::ObjectLoader;
use crate::request::{JsonRpcRequest, JsonRpcResponse};
use crate::retry::RetryPolicy;

/// Decode a hex payload, tolerating surrounding whitespace.
pub fn decode_hex_payload(text: &str) -> Result<Vec<u8>, TransportError> {
    hex::decode(text.trim()).map_err(|e| TransportError::Decode(e.to_string()))
}

pub struct NodeRpcClient {
    config: NodeConfig,
    http: reqwest::Client,
    retry: RetryPolicy,
    loader: ObjectLoader,
    next_id: AtomicU64,
}

impl NodeRpcClient {
    pub fn new(config: NodeConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let loader = ObjectLoader::new(&config, http.clone());
        Ok(Self {
            retry: RetryPolicy::new(config.retry.clone()),
            loader,
            http,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn timeout_ms(&self) -> u64 {
        self.config.request_timeout_ms
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<Value, TransportError> {
        let resp = self
            .http
            .post(self.config.rpc_base())
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(req)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(e, self.timeout_ms()))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::from_reqwest(e, self.timeout_ms()))?;

        // Nodes answer RPC errors with HTTP 500 and a JSON body.
        match serde_json::from_slice::<JsonRpcResponse>(&body) {
            Ok(parsed) => {
                let value = parsed.into_result().map_err(TransportError::Rpc)?;
                if status.is_success() {
                    Ok(value)
                } else {
                    Err(TransportError::Status {
                        status: status.as_u16(),
                        body: String::from_utf8_lossy(&body).into_owned(),
                    })
                }
            }
            Err(_) if !status.is_success() => Err(TransportError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            }),
            Err(e) => Err(TransportError::Deserialization(e)),
        }
    }

    /// Call `method` and deserialize its result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let req = &req;
        let value = self.retry.run(method, move || self.send_once(req)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Submit a signed transaction; returns its txid.
    pub async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, TransportError> {
        self.call("sendrawtransaction", vec![Value::String(hex::encode(raw))])
            .await
    }

    async fn rest_hex(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        let url = format!("{}{path}", self.config.rpc_base());
        let url = &url;
        let text = self
            .retry
            .run("rest", move || async move {
                let resp = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| TransportError::from_reqwest(e, self.timeout_ms()))?;
                if !resp.status().is_success() {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(TransportError::Status { status, body });
                }
                resp.text()
                    .await
                    .map_err(|e| TransportError::from_reqwest(e, self.timeout_ms()))
            })
            .await?;
        decode_hex_payload(&text)
    }
}

#[async_trait]
impl NodeClient for NodeRpcClient {
    async fn best_block_hash(&self) -> Result<String, IndexerError> {
        Ok(self.call("getbestblockhash", vec![]).await?)
    }

    async fn block_header(&self, hash: &str) -> Result<BlockHeader, IndexerError> {
        Ok(self.call("getblockheader", vec![json!(hash), json!(true)]).await?)
    }

    async fn raw_mempool(&self) -> Result<Vec<String>, IndexerError> {
        Ok(self.call("getrawmempool", vec![]).await?)
    }

    async fn mempool_info(&self) -> Result<MempoolInfo, IndexerError> {
        Ok(self.call("getmempoolinfo", vec![]).await?)
    }

    async fn blockchain_info(&self) -> Result<BlockchainInfo, IndexerError> {
        Ok(self.call("getblockchaininfo", vec![]).await?)
    }

    async fn raw_transaction_rest(&self, txid: &str) -> Result<Vec<u8>, IndexerError> {
        self.rest_hex(&format!("/rest/tx/{txid}.hex"))
            .await
            .map_err(TransportError::into_rest)
    }

    async fn raw_transaction(&self, txid: &str) -> Result<Vec<u8>, IndexerError> {
        let hex: String = self
            .call("getrawtransaction", vec![json!(txid), json!(0)])
            .await?;
        Ok(decode_hex_payload(&hex)?)
    }

    async fn download_block(&self, hash: &str, dest: &Path) -> Result<u64, IndexerError> {
        self.loader
            .download_to_file(hash, dest)
            .await
            .map_err(TransportError::into_rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;

    fn offline_client() -> NodeRpcClient {
        NodeRpcClient::new(NodeConfig {
            rpc_url: "http://127.0.0.1:9".into(),
            object_url: "http://127.0.0.1:9".into(),
            request_timeout_ms: 2_000,
            retry: RetryConfig {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn hex_payloads_are_trimmed() {
        assert_eq!(decode_hex_payload("0a0b\n").unwrap(), vec![0x0a, 0x0b]);
        assert!(matches!(
            decode_hex_payload("0a0"),
            Err(TransportError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_node_is_transient() {
        let client = offline_client();
        let err = client.best_block_hash().await.unwrap_err();
        assert!(matches!(err, IndexerError::Rpc(_)));
        assert!(err.is_transient());

        let err = client.raw_transaction_rest("00").await.unwrap_err();
        assert!(matches!(err, IndexerError::Rest(_)));
    }
}
