//! Durable, single-document persistence for the active [`RebalanceJob`].
//!
//! `save` is write-then-atomic-replace: the document is written to a temp file in the same
//! directory as the live path, then renamed over it, so a reader never observes a partial write
//! and a crash mid-write leaves the previous document intact. `archive` moves the current
//! document into `<archive_dir>/rebalance-<unix-ms>.json` and removes the live document.
//!
//! Big-integer fields serialize as decimal strings (resolved per SPEC_FULL.md §9: the original's
//! serializer/deserializer asymmetry does not reoccur here because both directions are owned by
//! this module's `serde_json` round-trip through [`Amount`]'s own `Serialize`/`Deserialize`).

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::StoreError;
use crate::state::{now_unix_ms, RebalanceJob};

/// Current on-disk schema version. Bumped if the document shape changes incompatibly.
const STATE_DOCUMENT_VERSION: u32 = 1;

#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct Document {
    version: u32,
    job: RebalanceJob,
}

#[derive(Clone)]
pub struct StateStore {
    state_file_path: PathBuf,
    archive_dir_path: PathBuf,
}

impl StateStore {
    pub fn new(state_file_path: impl Into<PathBuf>, archive_dir_path: impl Into<PathBuf>) -> Self {
        StateStore {
            state_file_path: state_file_path.into(),
            archive_dir_path: archive_dir_path.into(),
        }
    }

    /// Loads the persisted job, if any. Absence of the file means no job is in flight.
    pub async fn load(&self) -> Result<Option<RebalanceJob>, StoreError> {
        let bytes = match tokio::fs::read(&self.state_file_path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let doc: Document = serde_json::from_slice(&bytes)?;
        if doc.version != STATE_DOCUMENT_VERSION {
            return Err(StoreError::Version(doc.version));
        }
        Ok(Some(doc.job))
    }

    /// Persists `job`, replacing any previously saved document atomically.
    pub async fn save(&self, job: &RebalanceJob) -> Result<(), StoreError> {
        let doc = Document {
            version: STATE_DOCUMENT_VERSION,
            job: job.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        if let Some(parent) = self.state_file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let parent = self
            .state_file_path
            .parent()
            .unwrap_or_else(|| Path::new("."));

        let tmp = tempfile::NamedTempFile::new_in(parent)?;
        tokio::fs::write(tmp.path(), &bytes).await?;
        tmp.persist(&self.state_file_path)
            .map_err(|e| StoreError::Io(e.error))?;

        debug!(phase = job.phase.name(), "persisted rebalance job");
        Ok(())
    }

    /// Blocking counterpart to [`Self::save`], for the one call site that cannot await: the
    /// pre-broadcast checkpoint [`crate::adapters::TxBroadcastCallback`] the engine hands to
    /// `SwapContract::send_and_confirm`, which per its signature is a plain `Fn`, not a future.
    pub fn save_sync(&self, job: &RebalanceJob) -> Result<(), StoreError> {
        let doc = Document {
            version: STATE_DOCUMENT_VERSION,
            job: job.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        if let Some(parent) = self.state_file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let parent = self
            .state_file_path
            .parent()
            .unwrap_or_else(|| Path::new("."));

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        std::io::Write::write_all(&mut tmp, &bytes)?;
        tmp.persist(&self.state_file_path)
            .map_err(|e| StoreError::Io(e.error))?;

        debug!(phase = job.phase.name(), "checkpointed rebalance job pre-broadcast");
        Ok(())
    }

    /// Moves the live document into the archive directory, keyed by the current unix-ms
    /// timestamp, and removes the live document. Called on reaching `FINISHED`.
    pub async fn archive(&self, job: &RebalanceJob) -> Result<PathBuf, StoreError> {
        tokio::fs::create_dir_all(&self.archive_dir_path).await?;
        let archived_path = self
            .archive_dir_path
            .join(format!("rebalance-{}.json", now_unix_ms()));

        let doc = Document {
            version: STATE_DOCUMENT_VERSION,
            job: job.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        tokio::fs::write(&archived_path, &bytes).await?;

        match tokio::fs::remove_file(&self.state_file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(path = %archived_path.display(), "archived finished rebalance job");
        Ok(archived_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::token::Token;

    fn tmp_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"), dir.path().join("archive"));
        (dir, store)
    }

    #[tokio::test]
    async fn load_with_no_file_returns_none() {
        let (_dir, store) = tmp_store();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_round_trips_big_integer_amounts_as_decimal() {
        let (_dir, store) = tmp_store();
        let job = RebalanceJob::new_triggered(
            Token::Btc,
            None,
            Token::Usdc,
            Some("0xusdc".into()),
            Amount::from_u64(123_456_789_012_345),
        );
        store.save(&job).await.unwrap();

        let raw = tokio::fs::read_to_string(&store.state_file_path).await.unwrap();
        assert!(raw.contains("\"123456789012345\""), "expected decimal string encoding: {raw}");

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.amount_out, job.amount_out);
    }

    #[tokio::test]
    async fn save_sync_is_readable_by_the_async_load_path() {
        let (_dir, store) = tmp_store();
        let job = RebalanceJob::new_triggered(
            Token::Btc,
            None,
            Token::Usdc,
            Some("0xusdc".into()),
            Amount::from_u64(42),
        );
        store.save_sync(&job).unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.amount_out, job.amount_out);
    }

    #[tokio::test]
    async fn archive_removes_live_document_and_writes_timestamped_copy() {
        let (_dir, store) = tmp_store();
        let mut job = RebalanceJob::new_triggered(
            Token::Btc,
            None,
            Token::Usdc,
            Some("0xusdc".into()),
            Amount::from_u64(1),
        );
        job.phase = crate::state::Phase::Finished;
        store.save(&job).await.unwrap();

        let archived_path = store.archive(&job).await.unwrap();
        assert!(tokio::fs::metadata(&archived_path).await.is_ok());
        assert!(store.load().await.unwrap().is_none());
    }
}
