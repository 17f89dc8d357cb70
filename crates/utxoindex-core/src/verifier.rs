//! Token provenance verifier.
//!
//! A fungible-token output is legitimate when it descends from its declared
//! genesis. An output passes when any token output its transaction consumed
//! - carries the same `(code_hash, genesis, sensible_id)`, or
//! - carries the legitimate `(genesis, code_hash)` pair, taken from the
//!   transaction that spent the genesis output, or
//! - belongs to the genesis transaction itself.
//!
//! Outputs whose genesis cannot be resolved yet stay `Uncheck` and are
//! retried; the scan is paged by cursor so they never block newer outputs.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::config::IndexerConfig;
use crate::error::IndexerError;
use crate::script::{is_zero_sensible_id, parse_sensible_id};
use crate::store::IndexStore;
use crate::types::{outpoint_key, FtRecord, TokenCheck, TxOutRecord};

/// Totals for one verifier pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub scanned: usize,
    pub passed: usize,
    pub failed: usize,
    pub unresolved: usize,
}

pub struct TokenVerifier {
    store: Arc<dyn IndexStore>,
    batch: usize,
    concurrency: usize,
    cursor: AtomicI64,
}

impl TokenVerifier {
    pub fn new(config: &IndexerConfig, store: Arc<dyn IndexStore>) -> Self {
        Self {
            store,
            batch: config.verify_batch.max(1),
            concurrency: config.verify_concurrency.max(1),
            cursor: AtomicI64::new(0),
        }
    }

    /// Verify the next page of unchecked outputs.
    pub async fn run_pass(&self) -> Result<VerifyReport, IndexerError> {
        let after = self.cursor.load(Ordering::Relaxed);
        let page = self.store.unchecked_ft_outputs(after, self.batch).await?;

        let next = match page.last() {
            Some((last, _)) if page.len() == self.batch => last.cursor_id,
            _ => 0,
        };
        self.cursor.store(next, Ordering::Relaxed);

        let mut report = VerifyReport {
            scanned: page.len(),
            ..Default::default()
        };
        if page.is_empty() {
            return Ok(report);
        }

        let verdicts: Vec<(String, TokenCheck)> = stream::iter(page)
            .map(|(out, ft)| async move {
                let verdict = match self.verify_output(&out, &ft).await {
                    Ok(verdict) => verdict,
                    Err(e) => {
                        tracing::warn!(outpoint = %out.outpoint, error = %e, "token lookup failed");
                        TokenCheck::Uncheck
                    }
                };
                (out.outpoint, verdict)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut decided = Vec::with_capacity(verdicts.len());
        for (outpoint, verdict) in verdicts {
            match verdict {
                TokenCheck::Passed => report.passed += 1,
                TokenCheck::Failed => {
                    tracing::debug!(%outpoint, "token output failed provenance check");
                    report.failed += 1;
                }
                TokenCheck::Uncheck => {
                    report.unresolved += 1;
                    continue;
                }
            }
            decided.push((outpoint, TokenCheck::Uncheck.transition(verdict)?));
        }
        if !decided.is_empty() {
            self.store.set_token_checks(&decided).await?;
        }

        tracing::debug!(
            scanned = report.scanned,
            passed = report.passed,
            failed = report.failed,
            unresolved = report.unresolved,
            "token verification pass"
        );
        Ok(report)
    }

    /// Verdict for one output. `Uncheck` means "not decidable yet".
    pub async fn verify_output(
        &self,
        out: &TxOutRecord,
        ft: &FtRecord,
    ) -> Result<TokenCheck, IndexerError> {
        if is_zero_sensible_id(&ft.sensible_id) {
            return Ok(TokenCheck::Passed);
        }
        let (genesis_txid, genesis_index) = match parse_sensible_id(&ft.sensible_id) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(outpoint = %out.outpoint, error = %e, "unparsable sensible id");
                return Ok(TokenCheck::Uncheck);
            }
        };

        let consumed: Vec<String> = self
            .store
            .tx_ins_of(&out.txid)
            .await?
            .into_iter()
            .map(|input| input.outpoint)
            .collect();
        let sources = self.store.ft_outputs(&consumed).await?;

        let inherited = sources.iter().any(|src| {
            src.txid == genesis_txid
                || (src.code_hash == ft.code_hash
                    && src.genesis == ft.genesis
                    && src.sensible_id == ft.sensible_id)
        });
        if inherited {
            return Ok(TokenCheck::Passed);
        }

        let Some((genesis, code_hash)) = self
            .legitimate_identity(&outpoint_key(&genesis_txid, genesis_index), &ft.code_hash)
            .await?
        else {
            return Ok(TokenCheck::Uncheck);
        };
        let legitimate = sources
            .iter()
            .any(|src| src.genesis == genesis && src.code_hash == code_hash);
        Ok(if legitimate {
            TokenCheck::Passed
        } else {
            TokenCheck::Failed
        })
    }

    /// `(genesis, code_hash)` of the first issue: the token output with
    /// `code_hash` created by the transaction that spent the genesis output.
    async fn legitimate_identity(
        &self,
        genesis_outpoint: &str,
        code_hash: &str,
    ) -> Result<Option<(String, String)>, IndexerError> {
        let genesis = self
            .store
            .ft_outputs(std::slice::from_ref(&genesis_outpoint.to_string()))
            .await?;
        if genesis.is_empty() {
            return Ok(None);
        }
        let Some(spender) = self.store.spender(genesis_outpoint).await? else {
            return Ok(None);
        };
        Ok(self
            .store
            .ft_outputs_of_tx(&spender.txid)
            .await?
            .into_iter()
            .find(|issued| issued.code_hash == code_hash)
            .map(|issued| (issued.genesis, issued.code_hash)))
    }
}
