use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ReportRecord, ReportStore, StoreError};
use crate::entitlement::AdjustmentPayload;
use crate::pipeline::valuation::ValuationResult;

/// Single-process store used when no database is configured, and in tests.
/// Each guarded write checks its guard under the write lock.
#[derive(Default)]
pub struct MemoryReportStore {
    records: RwLock<HashMap<Uuid, ReportRecord>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn owned_by<'a>(
    records: &'a mut HashMap<Uuid, ReportRecord>,
    id: Uuid,
    owner: &str,
) -> Option<&'a mut ReportRecord> {
    records.get_mut(&id).filter(|r| r.owner_id == owner)
}

#[async_trait::async_trait]
impl ReportStore for MemoryReportStore {
    #[tracing::instrument(name = "db.reports.insert", skip_all)]
    async fn insert(&self, record: &ReportRecord) -> Result<(), StoreError> {
        self.records.write().await.insert(record.id, record.clone());
        Ok(())
    }

    #[tracing::instrument(name = "db.reports.get", skip(self, owner))]
    async fn get(&self, id: Uuid, owner: &str) -> Result<Option<ReportRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(&id)
            .filter(|r| r.owner_id == owner)
            .cloned())
    }

    #[tracing::instrument(name = "db.reports.list", skip(self, owner))]
    async fn list(
        &self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReportRecord>, StoreError> {
        let records = self.records.read().await;
        let mut owned: Vec<&ReportRecord> =
            records.values().filter(|r| r.owner_id == owner).collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(owned
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    #[tracing::instrument(name = "db.reports.apply_adjustment", skip_all)]
    async fn apply_adjustment(
        &self,
        id: Uuid,
        owner: &str,
        valuation: &ValuationResult,
        payload: &AdjustmentPayload,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let Some(record) = owned_by(&mut records, id, owner) else {
            return Ok(false);
        };
        if record.entitlement.adjustment_used {
            return Ok(false);
        }

        record.valuation = valuation.clone();
        record.adjustment = Some(payload.clone());
        record.entitlement.adjustment_used = true;
        Ok(true)
    }

    #[tracing::instrument(name = "db.reports.confirm", skip(self, owner))]
    async fn confirm(&self, id: Uuid, owner: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let Some(record) = owned_by(&mut records, id, owner) else {
            return Ok(false);
        };
        if record.entitlement.confirmed_at.is_some() {
            return Ok(false);
        }

        record.final_report = Some(record.draft_report.clone());
        record.entitlement.confirmed_at = Some(at);
        Ok(true)
    }

    #[tracing::instrument(name = "db.reports.record_download", skip(self, owner))]
    async fn record_download(
        &self,
        id: Uuid,
        owner: &str,
        expected_used: u32,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let Some(record) = owned_by(&mut records, id, owner) else {
            return Ok(false);
        };
        let state = &mut record.entitlement;
        if state.downloads_used != expected_used || !state.can_download() {
            return Ok(false);
        }

        state.downloads_used += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::sample_record;

    #[tokio::test]
    async fn test_get_is_scoped_to_owner() {
        let store = MemoryReportStore::new();
        let record = sample_record("user-1", 3);
        store.insert(&record).await.unwrap();

        assert_eq!(store.get(record.id, "user-1").await.unwrap(), Some(record.clone()));
        assert_eq!(store.get(record.id, "user-2").await.unwrap(), None);
        assert!(!store.confirm(record.id, "user-2", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_newest_first_with_paging() {
        let store = MemoryReportStore::new();
        let mut ids = Vec::new();
        for minutes in 0..4 {
            let mut record = sample_record("user-1", 3);
            record.created_at = Utc::now() - chrono::Duration::minutes(minutes);
            ids.push(record.id);
            store.insert(&record).await.unwrap();
        }
        store.insert(&sample_record("user-2", 3)).await.unwrap();

        let page = store.list("user-1", 2, 1).await.unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), ids[1..3].to_vec());
        assert_eq!(store.list("user-1", 10, 0).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_guarded_writes() {
        let store = MemoryReportStore::new();
        let record = sample_record("user-1", 1);
        store.insert(&record).await.unwrap();
        let payload = AdjustmentPayload {
            percent_current: 100.0,
            unit_price: 9_000_000,
            adjusted_at: Utc::now(),
        };

        assert!(!store.record_download(record.id, "user-1", 0).await.unwrap());

        assert!(store.apply_adjustment(record.id, "user-1", &record.valuation, &payload).await.unwrap());
        assert!(!store.apply_adjustment(record.id, "user-1", &record.valuation, &payload).await.unwrap());

        let at = Utc::now();
        assert!(store.confirm(record.id, "user-1", at).await.unwrap());
        assert!(!store.confirm(record.id, "user-1", at).await.unwrap());

        assert!(!store.record_download(record.id, "user-1", 1).await.unwrap());
        assert!(store.record_download(record.id, "user-1", 0).await.unwrap());
        assert!(!store.record_download(record.id, "user-1", 1).await.unwrap());

        let stored = store.get(record.id, "user-1").await.unwrap().unwrap();
        assert_eq!(stored.final_report, Some(record.draft_report));
        assert_eq!(stored.entitlement.confirmed_at, Some(at));
        assert_eq!(stored.entitlement.downloads_used, 1);
    }
}
