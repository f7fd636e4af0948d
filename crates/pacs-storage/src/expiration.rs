//! 检查过期与大小计算的认领协议
//!
//! 认领是一次条件更新，受影响行数为 0 表示其它工作者已经拥有该检查，
//! 调用方直接跳过而不是重试。

use crate::retention::{RetentionContext, RetentionPolicyMatcher};
use chrono::{DateTime, NaiveDate, Utc};
use pacs_core::models::{ExpirationState, Pk, Study};
use pacs_core::{Attributes, PacsError, Result};
use pacs_database::{ArchiveStore, ArchiveTx};
use tracing::{debug, info};

/// 认领结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// 其它工作者已认领，不是错误
    Lost,
}

impl ClaimOutcome {
    fn from_rows(rows: u64) -> Self {
        if rows == 1 {
            ClaimOutcome::Claimed
        } else {
            ClaimOutcome::Lost
        }
    }
}

/// 过期认领
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpirationClaimer;

impl ExpirationClaimer {
    /// 过期日期不晚于 `today` 且仍为 `UPDATEABLE` 的检查
    pub async fn find_expired(&self, tx: &mut dyn ArchiveTx, today: NaiveDate, limit: usize) -> Result<Vec<Study>> {
        tx.find_expired_studies(today, &[ExpirationState::Updateable], limit).await
    }

    pub async fn claim(
        &self,
        tx: &mut dyn ArchiveTx,
        study_pk: Pk,
        expected: ExpirationState,
        target: ExpirationState,
    ) -> Result<ClaimOutcome> {
        let outcome = ClaimOutcome::from_rows(tx.claim_expiration_state(study_pk, expected, target).await?);
        debug!(study_pk, from = %expected, to = %target, ?outcome, "Expiration claim");
        Ok(outcome)
    }

    /// 入库时按保留策略设置过期日期，只作用于 `UPDATEABLE` 的检查
    pub async fn apply_retention(
        &self,
        tx: &mut dyn ArchiveTx,
        study_pk: Pk,
        matcher: &RetentionPolicyMatcher,
        ctx: &RetentionContext,
        attrs: &Attributes,
        today: NaiveDate,
    ) -> Result<Option<NaiveDate>> {
        let study = tx
            .get_study(study_pk)
            .await?
            .ok_or_else(|| PacsError::not_found(format!("study {}", study_pk)))?;
        if study.expiration_state != ExpirationState::Updateable {
            return Ok(study.expiration_date);
        }
        let Some(date) = matcher.expiration_date(ctx, attrs, today) else {
            return Ok(study.expiration_date);
        };
        // 只会延后，不会提前
        if study.expiration_date.map_or(true, |current| date > current) {
            tx.update_study_expiration(study_pk, Some(date), ExpirationState::Updateable).await?;
            return Ok(Some(date));
        }
        Ok(study.expiration_date)
    }
}

/// 一轮大小计算的结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SizeReport {
    pub calculated: usize,
    pub skipped: usize,
}

/// 检查大小计算
#[derive(Debug, Default, Clone, Copy)]
pub struct StudySizeCalculator;

impl StudySizeCalculator {
    /// 找出大小未知的检查，逐个认领后计算；每个检查一个工作单元
    pub async fn calculate(
        &self,
        store: &dyn ArchiveStore,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<SizeReport> {
        let candidates = {
            let mut tx = store.begin().await?;
            let studies = tx.find_studies_with_unknown_size(updated_before, limit).await?;
            tx.rollback().await?;
            studies
        };

        let mut report = SizeReport::default();
        for study in candidates {
            let mut tx = store.begin().await?;
            match self.calculate_one(tx.as_mut(), study.pk).await? {
                Some(size) => {
                    tx.commit().await?;
                    debug!(study_pk = study.pk, size, "Study size calculated");
                    report.calculated += 1;
                }
                None => {
                    tx.rollback().await?;
                    report.skipped += 1;
                }
            }
        }

        if report.calculated > 0 || report.skipped > 0 {
            info!(calculated = report.calculated, skipped = report.skipped, "Study size calculation finished");
        }
        Ok(report)
    }

    /// 认领失败时返回 None
    pub async fn calculate_one(&self, tx: &mut dyn ArchiveTx, study_pk: Pk) -> Result<Option<i64>> {
        if tx.claim_unknown_size_study(study_pk).await? == 0 {
            return Ok(None);
        }
        let size = tx.sum_location_size_of_study(study_pk).await?;
        if tx.set_study_size_if_claimed(study_pk, size).await? == 0 {
            return Ok(None);
        }
        Ok(Some(size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retention::{Conditions, StudyRetentionPolicy};
    use pacs_database::fixtures::TreeBuilder;
    use pacs_database::MemoryArchiveStore;

    #[tokio::test]
    async fn test_claimed_study_cannot_be_claimed_again() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let tree = TreeBuilder::new(tx.as_mut(), "fs1").study_tree("P1", &[1]).await.unwrap();
        tx.commit().await.unwrap();

        let claimer = ExpirationClaimer;
        let mut first = store.begin().await.unwrap();
        let won = claimer
            .claim(first.as_mut(), tree.study_pk, ExpirationState::Updateable, ExpirationState::Rejected)
            .await
            .unwrap();
        first.commit().await.unwrap();

        let mut second = store.begin().await.unwrap();
        let lost = claimer
            .claim(second.as_mut(), tree.study_pk, ExpirationState::Updateable, ExpirationState::Rejected)
            .await
            .unwrap();
        assert_eq!(won, ClaimOutcome::Claimed);
        assert_eq!(lost, ClaimOutcome::Lost);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_claimers_race_for_one_study() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let tree = TreeBuilder::new(tx.as_mut(), "fs1").study_tree("P1", &[1]).await.unwrap();
        tx.commit().await.unwrap();

        let claim = |store: MemoryArchiveStore, study_pk: Pk| {
            tokio::spawn(async move {
                let mut tx = store.begin().await?;
                let outcome = ExpirationClaimer
                    .claim(tx.as_mut(), study_pk, ExpirationState::Updateable, ExpirationState::Rejected)
                    .await?;
                tx.commit().await?;
                Ok::<_, PacsError>(outcome)
            })
        };
        let (a, b) = tokio::join!(claim(store.clone(), tree.study_pk), claim(store.clone(), tree.study_pk));
        let mut outcomes = vec![a.unwrap().unwrap(), b.unwrap().unwrap()];
        outcomes.sort_by_key(|outcome| *outcome == ClaimOutcome::Lost);
        assert_eq!(outcomes, vec![ClaimOutcome::Claimed, ClaimOutcome::Lost]);

        let mut tx = store.begin().await.unwrap();
        let study = tx.get_study(tree.study_pk).await.unwrap().unwrap();
        assert_eq!(study.expiration_state, ExpirationState::Rejected);
    }

    #[tokio::test]
    async fn test_find_expired() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let tree = TreeBuilder::new(tx.as_mut(), "fs1").study_tree("P1", &[1]).await.unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        tx.update_study_expiration(tree.study_pk, Some(day), ExpirationState::Updateable)
            .await
            .unwrap();

        let claimer = ExpirationClaimer;
        let before = NaiveDate::from_ymd_opt(2024, 5, 31).unwrap();
        assert!(claimer.find_expired(tx.as_mut(), before, 10).await.unwrap().is_empty());
        assert_eq!(claimer.find_expired(tx.as_mut(), day, 10).await.unwrap().len(), 1);

        tx.claim_expiration_state(tree.study_pk, ExpirationState::Updateable, ExpirationState::Frozen)
            .await
            .unwrap();
        assert!(claimer.find_expired(tx.as_mut(), day, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_retention_only_extends() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let tree = TreeBuilder::new(tx.as_mut(), "fs1").study_tree("P1", &[1]).await.unwrap();
        let matcher = RetentionPolicyMatcher::new(vec![StudyRetentionPolicy {
            common_name: "short".to_string(),
            priority: 0,
            conditions: Conditions::default(),
            retention_period: "P30D".parse().unwrap(),
        }])
        .unwrap();
        let ctx = RetentionContext::default();
        let attrs = Attributes::new();
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

        let claimer = ExpirationClaimer;
        let first = claimer
            .apply_retention(tx.as_mut(), tree.study_pk, &matcher, &ctx, &attrs, today)
            .await
            .unwrap();
        assert_eq!(first, NaiveDate::from_ymd_opt(2024, 1, 31));

        let earlier = NaiveDate::from_ymd_opt(2023, 12, 1).unwrap();
        let second = claimer
            .apply_retention(tx.as_mut(), tree.study_pk, &matcher, &ctx, &attrs, earlier)
            .await
            .unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_size_calculation_claims_once() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let tree = TreeBuilder::new(tx.as_mut(), "fs1")
            .object_size(500)
            .study_tree("P1", &[2, 1])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let calculator = StudySizeCalculator;
        let report = calculator
            .calculate(&store, Utc::now() + chrono::Duration::seconds(1), 10)
            .await
            .unwrap();
        assert_eq!(report, SizeReport { calculated: 1, skipped: 0 });

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get_study(tree.study_pk).await.unwrap().unwrap().size, 1500);
        // 已计算，不能再认领
        assert_eq!(calculator.calculate_one(tx.as_mut(), tree.study_pk).await.unwrap(), None);
    }
}
