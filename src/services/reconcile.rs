//! Move journal and the offline reconciliation pass.
//!
//! A rename or move is a copy followed by a delete. Before the copy, the
//! intent is written to `_system/journal/{id}.json`; it is removed once the
//! source is gone. Intents that survive (crash, failed delete) are finished or
//! dropped by [`Reconciler::run`].

use crate::services::{
    gateway::{StorageError, StorageGateway, StorageResult},
    paths::SYSTEM_PREFIX,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub const JOURNAL_PREFIX: &str = "_system/journal/";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MoveIntent {
    pub id: Uuid,
    pub src: String,
    pub dst: String,
    pub src_etag: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MoveIntent {
    fn journal_key(&self) -> String {
        format!("{JOURNAL_PREFIX}{}.json", self.id)
    }
}

#[derive(Clone)]
pub struct MoveJournal {
    gateway: StorageGateway,
}

impl MoveJournal {
    pub fn new(gateway: StorageGateway) -> Self {
        Self { gateway }
    }

    pub async fn record(
        &self,
        src: &str,
        dst: &str,
        src_etag: Option<&str>,
    ) -> StorageResult<MoveIntent> {
        let intent = MoveIntent {
            id: Uuid::new_v4(),
            src: src.to_string(),
            dst: dst.to_string(),
            src_etag: src_etag.map(str::to_string),
            created_at: Utc::now(),
        };
        let body = serde_json::to_vec(&intent)
            .map_err(|err| StorageError::Backend(format!("encoding move intent: {err}")))?;
        self.gateway
            .put(&intent.journal_key(), Bytes::from(body), Some("application/json"))
            .await?;
        Ok(intent)
    }

    pub async fn clear(&self, intent: &MoveIntent) -> StorageResult<()> {
        self.gateway.delete(&intent.journal_key()).await
    }

    /// Every intent still in the journal. Unreadable records are skipped with
    /// a warning.
    pub async fn pending(&self) -> StorageResult<Vec<MoveIntent>> {
        let listing = self.gateway.list_recursive(JOURNAL_PREFIX).await?;
        if listing.truncated {
            warn!("move journal listing truncated; remaining intents wait for the next pass");
        }
        let mut intents = Vec::new();
        for item in listing.files() {
            let Some(body) = self.gateway.get(&item.key).await? else {
                continue;
            };
            match serde_json::from_slice::<MoveIntent>(&body.bytes) {
                Ok(intent) => intents.push(intent),
                Err(err) => warn!(key = %item.key, error = %err, "skipping unreadable move intent"),
            }
        }
        intents.sort_by_key(|intent| intent.created_at);
        Ok(intents)
    }
}

/// Counts of what one reconciliation pass did.
#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Copy had landed; the stale source was removed.
    pub completed: usize,
    /// Copy had not landed; it was replayed and the source removed.
    pub replayed: usize,
    /// Source changed since the intent was written; both keys left alone.
    pub conflicts: usize,
    /// Could not be settled this time; the intent stays.
    pub failed: usize,
}

enum Settlement {
    Completed,
    Replayed,
    Conflict,
}

pub struct Reconciler {
    gateway: StorageGateway,
    journal: MoveJournal,
}

impl Reconciler {
    pub fn new(gateway: StorageGateway) -> Self {
        let journal = MoveJournal::new(gateway.clone());
        Self { gateway, journal }
    }

    pub async fn run(&self) -> StorageResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for intent in self.journal.pending().await? {
            match self.settle(&intent).await {
                Ok(settlement) => {
                    match settlement {
                        Settlement::Completed => report.completed += 1,
                        Settlement::Replayed => report.replayed += 1,
                        Settlement::Conflict => report.conflicts += 1,
                    }
                    if let Err(err) = self.journal.clear(&intent).await {
                        warn!(id = %intent.id, error = %err, "settled intent could not be cleared");
                    }
                }
                Err(err) => {
                    warn!(id = %intent.id, src = %intent.src, dst = %intent.dst, error = %err, "move intent left for a later pass");
                    report.failed += 1;
                }
            }
        }
        info!(?report, "reconciliation pass finished");
        Ok(report)
    }

    async fn settle(&self, intent: &MoveIntent) -> StorageResult<Settlement> {
        if intent.src.starts_with(SYSTEM_PREFIX) || intent.dst.starts_with(SYSTEM_PREFIX) {
            warn!(id = %intent.id, "intent targets the system prefix; dropping");
            return Ok(Settlement::Conflict);
        }

        let Some(src) = self.gateway.head(&intent.src).await? else {
            return Ok(Settlement::Completed);
        };
        if intent.src_etag.is_some() && src.etag != intent.src_etag {
            warn!(id = %intent.id, src = %intent.src, "source changed after the move started");
            return Ok(Settlement::Conflict);
        }

        let dst = self.gateway.head(&intent.dst).await?;
        let landed = dst.is_some_and(|dst| dst.etag.is_some() && dst.etag == src.etag);
        if !landed {
            self.gateway
                .copy(&intent.src, &intent.dst, src.etag.as_deref())
                .await?;
        }

        let removed = match src.etag.as_deref() {
            Some(etag) => self.gateway.delete_if_match(&intent.src, etag).await,
            None => self.gateway.delete(&intent.src).await,
        };
        match removed {
            Ok(()) => {}
            Err(StorageError::PreconditionFailed { .. }) => return Ok(Settlement::Conflict),
            Err(err) => return Err(err),
        }

        info!(src = %intent.src, dst = %intent.dst, replayed = !landed, "interrupted move settled");
        Ok(if landed {
            Settlement::Completed
        } else {
            Settlement::Replayed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_store::MemoryObjectStore;
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryObjectStore>, StorageGateway) {
        let store = Arc::new(MemoryObjectStore::new());
        let gateway = StorageGateway::new(store.clone(), 0, 10);
        (store, gateway)
    }

    #[tokio::test]
    async fn journal_records_and_clears() {
        let (store, gateway) = setup();
        let journal = MoveJournal::new(gateway);

        let intent = journal.record("a", "b", Some("e1")).await.unwrap();
        assert_eq!(journal.pending().await.unwrap(), vec![intent.clone()]);
        assert!(store.keys()[0].starts_with(JOURNAL_PREFIX));

        journal.clear(&intent).await.unwrap();
        assert!(journal.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replays_a_move_whose_copy_never_landed() {
        let (store, gateway) = setup();
        let src = "websites/demo/public_html/a.txt";
        let dst = "websites/demo/public_html/b.txt";
        let meta = store.seed(src, b"hello", Some("text/plain"));
        MoveJournal::new(gateway.clone())
            .record(src, dst, meta.etag.as_deref())
            .await
            .unwrap();

        let report = Reconciler::new(gateway).run().await.unwrap();

        assert_eq!(report.replayed, 1);
        assert_eq!(store.bytes_of(dst).unwrap().as_ref(), b"hello");
        assert!(store.bytes_of(src).is_none());
        assert_eq!(store.keys(), vec![dst.to_string()]);
    }

    #[tokio::test]
    async fn finishes_a_move_whose_delete_failed() {
        let (store, gateway) = setup();
        let src = "websites/demo/public_html/a.txt";
        let dst = "websites/demo/public_html/b.txt";
        let meta = store.seed(src, b"hello", None);
        store.seed(dst, b"hello", None);
        MoveJournal::new(gateway.clone())
            .record(src, dst, meta.etag.as_deref())
            .await
            .unwrap();

        let report = Reconciler::new(gateway).run().await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(store.keys(), vec![dst.to_string()]);
        assert_eq!(store.calls("copy"), 0);
    }

    #[tokio::test]
    async fn leaves_changed_sources_alone() {
        let (store, gateway) = setup();
        let src = "websites/demo/public_html/a.txt";
        let dst = "websites/demo/public_html/b.txt";
        let meta = store.seed(src, b"old", None);
        MoveJournal::new(gateway.clone())
            .record(src, dst, meta.etag.as_deref())
            .await
            .unwrap();
        store.seed(src, b"new content", None);

        let report = Reconciler::new(gateway).run().await.unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(store.bytes_of(src).unwrap().as_ref(), b"new content");
        assert!(store.bytes_of(dst).is_none());
        assert_eq!(store.keys(), vec![src.to_string()]);
    }

    #[tokio::test]
    async fn keeps_intents_that_cannot_be_settled() {
        let (store, gateway) = setup();
        let src = "websites/demo/public_html/a.txt";
        let meta = store.seed(src, b"hello", None);
        store.fail_on("copy", src);
        MoveJournal::new(gateway.clone())
            .record(src, "websites/demo/public_html/b.txt", meta.etag.as_deref())
            .await
            .unwrap();

        let report = Reconciler::new(gateway.clone()).run().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(MoveJournal::new(gateway).pending().await.unwrap().len(), 1);
    }
}
