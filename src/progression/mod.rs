//! Progression ledger
//!
//! Append-only experience accounting with a per-user summary
//! projection. Counter movement happens at the store level (atomic
//! increments); this component owns validation, event construction and
//! the lesson idempotency flow.

use crate::error::CompanionError;
use crate::models::{
    ExperienceEvent, ExperienceEventType, LessonXpOutcome, ProgressionAccount,
    ProgressionSnapshot, XpAward,
};
use crate::store::CompanionStore;
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub mod level;

/// Fixed grant for reading a lesson.
pub const LESSON_XP: i64 = 25;

pub struct ProgressionLedger {
    store: Arc<dyn CompanionStore>,
}

impl ProgressionLedger {
    pub fn new(store: Arc<dyn CompanionStore>) -> Self {
        Self { store }
    }

    /// Current progression, creating a zeroed account on first touch.
    pub async fn get_progression(&self, user_id: Uuid) -> Result<ProgressionSnapshot> {
        let account = self.store.progression(user_id).await?;
        Ok(snapshot(&account))
    }

    /// Append one experience event and move the counters.
    ///
    /// Not idempotent by itself: callers that need at-most-once
    /// issuance (lessons, daily streak checks) gate before calling.
    pub async fn award_xp(
        &self,
        user_id: Uuid,
        event_type: ExperienceEventType,
        amount: i64,
        description: &str,
        metadata: serde_json::Value,
    ) -> Result<XpAward> {
        if amount < 0 {
            return Err(CompanionError::Validation(format!(
                "XP amount must be >= 0, got {}",
                amount
            )));
        }

        let event = ExperienceEvent {
            id: Uuid::new_v4(),
            user_id,
            event_type,
            amount,
            description: description.to_string(),
            metadata,
            created_at: Utc::now(),
        };

        let award = self.store.append_experience(&event).await?;

        info!(
            user_id = %user_id,
            event_type = %event_type,
            amount,
            new_level = award.new_level,
            leveled_up = award.leveled_up,
            "Experience awarded"
        );

        Ok(award)
    }

    /// Mark a lesson read and grant its XP at most once per
    /// (user, lesson). The read-mark stands even when the grant fails;
    /// the unflipped flag lets a retry re-issue the grant.
    pub async fn award_lesson_xp(
        &self,
        user_id: Uuid,
        lesson_id: &str,
        lesson_title: &str,
    ) -> Result<LessonXpOutcome> {
        let record = self
            .store
            .ensure_lesson_record(user_id, lesson_id, lesson_title)
            .await?;

        if record.xp_awarded {
            return Ok(LessonXpOutcome {
                lesson_id: lesson_id.to_string(),
                xp_awarded: false,
                already_read: true,
                xp_error: None,
                award: None,
            });
        }

        let event = ExperienceEvent {
            id: Uuid::new_v4(),
            user_id,
            event_type: ExperienceEventType::LessonRead,
            amount: LESSON_XP,
            description: format!("Read lesson: {}", lesson_title),
            metadata: serde_json::json!({ "lesson_id": lesson_id }),
            created_at: Utc::now(),
        };

        match self.store.grant_lesson_xp(&event, lesson_id).await {
            Ok(Some(award)) => Ok(LessonXpOutcome {
                lesson_id: lesson_id.to_string(),
                xp_awarded: true,
                already_read: false,
                xp_error: None,
                award: Some(award),
            }),
            // A concurrent request claimed the grant first.
            Ok(None) => Ok(LessonXpOutcome {
                lesson_id: lesson_id.to_string(),
                xp_awarded: false,
                already_read: true,
                xp_error: None,
                award: None,
            }),
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    lesson_id,
                    error = %e,
                    "Lesson XP grant failed; lesson remains marked read"
                );
                Ok(LessonXpOutcome {
                    lesson_id: lesson_id.to_string(),
                    xp_awarded: false,
                    already_read: false,
                    xp_error: Some(e.to_string()),
                    award: None,
                })
            }
        }
    }

    /// Administrative override for operator tooling. Bypasses the level
    /// curve; nothing else in the system sets the level directly.
    pub async fn set_level(
        &self,
        user_id: Uuid,
        level_value: i32,
        total_xp: i64,
        current_xp: i64,
    ) -> Result<ProgressionSnapshot> {
        if !(1..=level::MAX_LEVEL).contains(&level_value) {
            return Err(CompanionError::Validation(format!(
                "Level must be in [1, {}], got {}",
                level::MAX_LEVEL,
                level_value
            )));
        }

        let account = self
            .store
            .overwrite_progression(user_id, level_value, total_xp, current_xp)
            .await?;

        warn!(
            user_id = %user_id,
            level = level_value,
            total_xp,
            "Progression overwritten by administrative override"
        );

        Ok(snapshot(&account))
    }
}

fn snapshot(account: &ProgressionAccount) -> ProgressionSnapshot {
    ProgressionSnapshot {
        user_id: account.user_id,
        current_level: account.current_level,
        total_xp: account.total_xp,
        current_xp: account.current_xp,
        consecutive_happy_days: account.consecutive_happy_days,
        lessons_read: account.lessons_read,
        xp_for_next_level: level::xp_for_next_level(account.total_xp),
        progress_percent: level::progress_percent(account.total_xp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn ledger() -> (ProgressionLedger, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (ProgressionLedger::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_get_progression_lazily_creates() {
        let (ledger, _) = ledger();
        let user_id = Uuid::new_v4();

        let snapshot = ledger.get_progression(user_id).await.unwrap();
        assert_eq!(snapshot.current_level, 1);
        assert_eq!(snapshot.total_xp, 0);
        assert_eq!(snapshot.xp_for_next_level, 50);
        assert_eq!(snapshot.progress_percent, 0.0);
    }

    #[tokio::test]
    async fn test_award_xp_rejects_negative() {
        let (ledger, _) = ledger();

        let result = ledger
            .award_xp(
                Uuid::new_v4(),
                ExperienceEventType::DailyBonus,
                -5,
                "bad",
                serde_json::json!({}),
            )
            .await;

        assert!(matches!(result, Err(CompanionError::Validation(_))));
    }

    #[tokio::test]
    async fn test_award_xp_reports_level_crossing() {
        let (ledger, _) = ledger();
        let user_id = Uuid::new_v4();

        let first = ledger
            .award_xp(
                user_id,
                ExperienceEventType::GoalAchieved,
                40,
                "goal",
                serde_json::json!({}),
            )
            .await
            .unwrap();
        assert!(!first.leveled_up);

        let second = ledger
            .award_xp(
                user_id,
                ExperienceEventType::GoalAchieved,
                20,
                "goal",
                serde_json::json!({}),
            )
            .await
            .unwrap();
        assert!(second.leveled_up);
        assert_eq!(second.previous_level, 1);
        assert_eq!(second.new_level, 2);
    }

    #[tokio::test]
    async fn test_lesson_xp_awarded_exactly_once() {
        let (ledger, _) = ledger();
        let user_id = Uuid::new_v4();

        let first = ledger
            .award_lesson_xp(user_id, "lesson-1", "Budgeting 101")
            .await
            .unwrap();
        assert!(first.xp_awarded);
        assert_eq!(first.award.as_ref().unwrap().total_xp, LESSON_XP);

        let second = ledger
            .award_lesson_xp(user_id, "lesson-1", "Budgeting 101")
            .await
            .unwrap();
        assert!(!second.xp_awarded);
        assert!(second.already_read);

        let snapshot = ledger.get_progression(user_id).await.unwrap();
        assert_eq!(snapshot.total_xp, LESSON_XP);
        assert_eq!(snapshot.lessons_read, 1);
    }

    #[tokio::test]
    async fn test_different_lessons_award_separately() {
        let (ledger, _) = ledger();
        let user_id = Uuid::new_v4();

        ledger
            .award_lesson_xp(user_id, "lesson-1", "Budgeting 101")
            .await
            .unwrap();
        ledger
            .award_lesson_xp(user_id, "lesson-2", "Saving 102")
            .await
            .unwrap();

        let snapshot = ledger.get_progression(user_id).await.unwrap();
        assert_eq!(snapshot.total_xp, 2 * LESSON_XP);
        assert_eq!(snapshot.lessons_read, 2);
    }

    #[tokio::test]
    async fn test_set_level_override() {
        let (ledger, _) = ledger();
        let user_id = Uuid::new_v4();

        let snapshot = ledger.set_level(user_id, 10, 450, 450).await.unwrap();
        assert_eq!(snapshot.current_level, 10);
        assert_eq!(snapshot.total_xp, 450);

        assert!(ledger.set_level(user_id, 51, 0, 0).await.is_err());
        assert!(ledger.set_level(user_id, 0, 0, 0).await.is_err());
    }
}
