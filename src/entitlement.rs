use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{ReportRecord, ReportStore};
use crate::error::{AppError, AppResult};
use crate::telemetry::metrics::ENTITLEMENT_TRANSITIONS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EntitlementError {
    #[error("adjustment already used")]
    AdjustmentAlreadyUsed,

    #[error("already confirmed")]
    AlreadyConfirmed,

    #[error("not confirmed")]
    NotConfirmed,

    #[error("download not allowed")]
    DownloadNotAllowed,
}

impl EntitlementError {
    pub fn code(&self) -> &'static str {
        match self {
            EntitlementError::AdjustmentAlreadyUsed => "adjustment_already_used",
            EntitlementError::AlreadyConfirmed => "already_confirmed",
            EntitlementError::NotConfirmed => "not_confirmed",
            EntitlementError::DownloadNotAllowed => "download_not_allowed",
        }
    }
}

/// Per-report permissions. `downloads_used` never exceeds `download_limit`,
/// and `adjustment_used` never returns to false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementState {
    pub adjustment_used: bool,
    pub download_limit: u32,
    pub downloads_used: u32,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl EntitlementState {
    pub fn new(download_limit: u32) -> Self {
        Self {
            adjustment_used: false,
            download_limit,
            downloads_used: 0,
            confirmed_at: None,
        }
    }

    pub fn can_adjust(&self) -> bool {
        !self.adjustment_used
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }

    pub fn can_download(&self) -> bool {
        self.is_confirmed() && self.downloads_used < self.download_limit
    }

    pub fn remaining_downloads(&self) -> u32 {
        self.download_limit.saturating_sub(self.downloads_used)
    }

    pub fn apply_adjustment(self) -> Result<Self, EntitlementError> {
        if !self.can_adjust() {
            return Err(EntitlementError::AdjustmentAlreadyUsed);
        }
        Ok(Self {
            adjustment_used: true,
            ..self
        })
    }

    pub fn confirm(self, at: DateTime<Utc>) -> Result<Self, EntitlementError> {
        if self.is_confirmed() {
            return Err(EntitlementError::AlreadyConfirmed);
        }
        Ok(Self {
            confirmed_at: Some(at),
            ..self
        })
    }

    /// Not confirmed wins over an exhausted quota.
    pub fn register_download(self) -> Result<Self, EntitlementError> {
        if !self.is_confirmed() {
            return Err(EntitlementError::NotConfirmed);
        }
        if !self.can_download() {
            return Err(EntitlementError::DownloadNotAllowed);
        }
        Ok(Self {
            downloads_used: self.downloads_used + 1,
            ..self
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentPayload {
    pub percent_current: f64,
    pub unit_price: i64,
    pub adjusted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub report: ReportRecord,
    pub remaining_downloads: u32,
}

fn record_transition(op: &'static str, outcome: &'static str) {
    ENTITLEMENT_TRANSITIONS.add(
        1,
        &[
            KeyValue::new("entitlement.op", op),
            KeyValue::new("entitlement.outcome", outcome),
        ],
    );
}

fn reject(op: &'static str, err: EntitlementError) -> AppError {
    tracing::info!(op, reason = err.code(), "Entitlement transition refused");
    record_transition(op, err.code());
    AppError::Entitlement(err)
}

/// Guarded transitions over the report store. A guarded write that touches
/// no row means another request already made the transition.
#[derive(Clone)]
pub struct EntitlementService {
    store: Arc<dyn ReportStore>,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn ReportStore>) -> Self {
        Self { store }
    }

    async fn load(&self, id: Uuid, owner: &str) -> AppResult<ReportRecord> {
        self.store
            .get(id, owner)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("report {id} not found")))
    }

    #[tracing::instrument(name = "entitlement.adjust", skip(self, owner))]
    pub async fn adjust(
        &self,
        id: Uuid,
        owner: &str,
        current_percent: f64,
        fair_unit_price: f64,
    ) -> AppResult<ReportRecord> {
        if !current_percent.is_finite() || current_percent < 0.0 {
            return Err(AppError::InvalidInput(
                "currentPercent must be a finite number of at least 0".to_string(),
            ));
        }
        if !fair_unit_price.is_finite() || fair_unit_price <= 0.0 {
            return Err(AppError::InvalidInput(
                "fairUnitPrice must be a finite number above 0".to_string(),
            ));
        }

        let record = self.load(id, owner).await?;
        let entitlement = record
            .entitlement
            .apply_adjustment()
            .map_err(|e| reject("adjust", e))?;

        let valuation = record
            .valuation
            .adjusted(current_percent, fair_unit_price.round() as i64);
        let payload = AdjustmentPayload {
            percent_current: valuation.current_percent.unwrap_or(current_percent),
            unit_price: fair_unit_price.round() as i64,
            adjusted_at: Utc::now(),
        };

        if !self
            .store
            .apply_adjustment(id, owner, &valuation, &payload)
            .await?
        {
            return Err(reject("adjust", EntitlementError::AdjustmentAlreadyUsed));
        }

        record_transition("adjust", "ok");
        tracing::info!(report.id = %id, "Valuation adjusted");

        Ok(ReportRecord {
            valuation,
            adjustment: Some(payload),
            entitlement,
            ..record
        })
    }

    #[tracing::instrument(name = "entitlement.confirm", skip(self, owner))]
    pub async fn confirm(&self, id: Uuid, owner: &str) -> AppResult<ReportRecord> {
        let record = self.load(id, owner).await?;
        let at = Utc::now();
        let entitlement = record
            .entitlement
            .confirm(at)
            .map_err(|e| reject("confirm", e))?;

        if !self.store.confirm(id, owner, at).await? {
            return Err(reject("confirm", EntitlementError::AlreadyConfirmed));
        }

        record_transition("confirm", "ok");
        tracing::info!(report.id = %id, "Report confirmed");

        Ok(ReportRecord {
            final_report: Some(record.draft_report.clone()),
            entitlement,
            ..record
        })
    }

    /// Compare-and-set on the download counter. A lost race means another
    /// download landed, so the state is re-read and only a fresh state without
    /// quota rejects.
    #[tracing::instrument(name = "entitlement.download", skip(self, owner))]
    pub async fn download(&self, id: Uuid, owner: &str) -> AppResult<Download> {
        loop {
            let record = self.load(id, owner).await?;
            let expected_used = record.entitlement.downloads_used;
            let entitlement = record
                .entitlement
                .register_download()
                .map_err(|e| reject("download", e))?;

            if self.store.record_download(id, owner, expected_used).await? {
                record_transition("download", "ok");
                tracing::info!(
                    report.id = %id,
                    downloads_used = entitlement.downloads_used,
                    "Report downloaded"
                );
                return Ok(Download {
                    remaining_downloads: entitlement.remaining_downloads(),
                    report: ReportRecord {
                        entitlement,
                        ..record
                    },
                });
            }

            tracing::debug!(report.id = %id, expected_used, "Download counter moved, retrying");
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryReportStore;
    use crate::db::tests::sample_record;

    const OWNER: &str = "user-1";

    async fn service_with_record(limit: u32) -> (EntitlementService, Arc<MemoryReportStore>, Uuid) {
        let store = Arc::new(MemoryReportStore::new());
        let record = sample_record(OWNER, limit);
        let id = record.id;
        store.insert(&record).await.unwrap();
        (EntitlementService::new(store.clone()), store, id)
    }

    fn code(err: AppError) -> &'static str {
        err.code()
    }

    #[test]
    fn test_pure_transitions() {
        let fresh = EntitlementState::new(2);
        assert!(fresh.can_adjust());
        assert!(!fresh.can_download());

        let adjusted = fresh.apply_adjustment().unwrap();
        assert_eq!(
            adjusted.apply_adjustment(),
            Err(EntitlementError::AdjustmentAlreadyUsed)
        );

        assert_eq!(fresh.register_download(), Err(EntitlementError::NotConfirmed));

        let confirmed = fresh.confirm(Utc::now()).unwrap();
        assert_eq!(
            confirmed.confirm(Utc::now()),
            Err(EntitlementError::AlreadyConfirmed)
        );

        let once = confirmed.register_download().unwrap();
        let twice = once.register_download().unwrap();
        assert_eq!(twice.downloads_used, 2);
        assert_eq!(twice.remaining_downloads(), 0);
        assert_eq!(
            twice.register_download(),
            Err(EntitlementError::DownloadNotAllowed)
        );
    }

    #[test]
    fn test_unconfirmed_beats_exhausted_quota() {
        let state = EntitlementState::new(0);
        assert_eq!(state.register_download(), Err(EntitlementError::NotConfirmed));
    }

    #[tokio::test]
    async fn test_adjust_succeeds_once() {
        let (service, _, id) = service_with_record(3).await;

        let adjusted = service.adjust(id, OWNER, 105.04, 9_000_000.4).await.unwrap();
        assert_eq!(adjusted.valuation.fair_unit_price, Some(9_000_000));
        assert_eq!(adjusted.valuation.current_percent, Some(105.0));
        assert_eq!(adjusted.valuation.estimated_value, Some(756_000_000));
        assert!(adjusted.entitlement.adjustment_used);

        let stored = service.load(id, OWNER).await.unwrap();
        assert_eq!(stored.valuation, adjusted.valuation);
        assert_eq!(stored.adjustment.map(|a| a.unit_price), Some(9_000_000));

        let second = service.adjust(id, OWNER, 90.0, 8_000_000.0).await.unwrap_err();
        assert_eq!(code(second), "adjustment_already_used");
    }

    #[tokio::test]
    async fn test_adjust_rejects_bad_numbers() {
        let (service, _, id) = service_with_record(3).await;
        let cases = vec![
            (-1.0, 9_000_000.0),
            (f64::NAN, 9_000_000.0),
            (100.0, 0.0),
            (100.0, f64::INFINITY),
        ];

        for (percent, price) in cases {
            let err = service.adjust(id, OWNER, percent, price).await.unwrap_err();
            assert_eq!(code(err), "invalid_input", "percent {percent} price {price}");
        }
        assert!(service.adjust(id, OWNER, 0.0, 1.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_download_requires_confirmation_and_respects_limit() {
        let (service, _, id) = service_with_record(2).await;

        let err = service.download(id, OWNER).await.unwrap_err();
        assert_eq!(code(err), "not_confirmed");

        let confirmed = service.confirm(id, OWNER).await.unwrap();
        assert!(confirmed.entitlement.confirmed_at.is_some());

        let first = service.download(id, OWNER).await.unwrap();
        assert_eq!(first.remaining_downloads, 1);
        let second = service.download(id, OWNER).await.unwrap();
        assert_eq!(second.remaining_downloads, 0);

        let err = service.download(id, OWNER).await.unwrap_err();
        assert_eq!(code(err), "download_not_allowed");

        let err = service.confirm(id, OWNER).await.unwrap_err();
        assert_eq!(code(err), "already_confirmed");
    }

    #[tokio::test]
    async fn test_final_snapshot_survives_later_adjustment() {
        let (service, _, id) = service_with_record(1).await;
        let draft = service.load(id, OWNER).await.unwrap().draft_report;

        service.confirm(id, OWNER).await.unwrap();
        service.adjust(id, OWNER, 80.0, 7_000_000.0).await.unwrap();
        assert!(service.adjust(id, OWNER, 81.0, 7_000_000.0).await.is_err());

        let download = service.download(id, OWNER).await.unwrap();
        assert_eq!(download.report.final_report, Some(draft));
    }

    #[tokio::test]
    async fn test_concurrent_downloads_never_exceed_limit() {
        let (service, store, id) = service_with_record(3).await;
        service.confirm(id, OWNER).await.unwrap();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.download(id, OWNER).await.is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                admitted += 1;
            }
        }

        let stored = store.get(id, OWNER).await.unwrap().unwrap();
        assert_eq!(admitted, 3);
        assert_eq!(stored.entitlement.downloads_used, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_downloads_within_quota_all_succeed() {
        let cases = vec![(32, 32), (32, 1000), (8, 9)];

        for (tasks, limit) in cases {
            for _ in 0..5 {
                let (service, store, id) = service_with_record(limit).await;
                service.confirm(id, OWNER).await.unwrap();

                let attempts: Vec<_> = (0..tasks)
                    .map(|_| {
                        let service = service.clone();
                        tokio::spawn(async move { service.download(id, OWNER).await })
                    })
                    .collect();

                for attempt in attempts {
                    let result = attempt.await.unwrap();
                    assert!(result.is_ok(), "tasks {tasks} limit {limit}: {:?}", result.err());
                }

                let stored = store.get(id, OWNER).await.unwrap().unwrap();
                assert_eq!(stored.entitlement.downloads_used, tasks);
            }
        }
    }

    #[tokio::test]
    async fn test_other_owner_sees_not_found() {
        let (service, _, id) = service_with_record(3).await;
        let err = service.confirm(id, "someone-else").await.unwrap_err();
        assert_eq!(code(err), "not_found");
    }
}
