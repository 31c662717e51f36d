//! Happiness streak tracking
//!
//! One mood check per calendar day, gated on a logical-day key rather
//! than timestamp arithmetic. The day check and the streak write are a
//! single conditional store update, retried on conflict, so the daily
//! bonus is issued at most once per day.

use crate::error::CompanionError;
use crate::models::{ExperienceEventType, Mood, StreakUpdate};
use crate::progression::ProgressionLedger;
use crate::store::CompanionStore;
use crate::Result;
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_CONFLICT_RETRIES: usize = 3;

/// Milestone schedule for consecutive happy days.
pub fn milestone_bonus(streak_day: i64) -> i64 {
    match streak_day {
        1 => 10,
        3 => 20,
        7 => 50,
        14 => 100,
        30 => 200,
        d if d > 0 && d % 7 == 0 => 25,
        _ => 5,
    }
}

pub struct StreakTracker {
    store: Arc<dyn CompanionStore>,
    progression: Arc<ProgressionLedger>,
}

impl StreakTracker {
    pub fn new(store: Arc<dyn CompanionStore>, progression: Arc<ProgressionLedger>) -> Self {
        Self { store, progression }
    }

    /// Apply today's mood check.
    pub async fn update_happiness_streak(
        &self,
        user_id: Uuid,
        mood: Mood,
    ) -> Result<StreakUpdate> {
        self.check_streak_on(user_id, mood, Utc::now().date_naive())
            .await
    }

    async fn check_streak_on(
        &self,
        user_id: Uuid,
        mood: Mood,
        today: NaiveDate,
    ) -> Result<StreakUpdate> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let account = self.store.progression(user_id).await?;

            if account.last_happiness_check == Some(today) {
                return Ok(StreakUpdate {
                    consecutive_happy_days: account.consecutive_happy_days,
                    bonus_xp: 0,
                    updated: false,
                    xp_awarded: false,
                    award: None,
                });
            }

            let new_streak = if mood.is_happy() {
                account.consecutive_happy_days + 1
            } else {
                0
            };

            let advanced = self
                .store
                .try_advance_streak(user_id, account.last_happiness_check, today, new_streak)
                .await?;

            if !advanced {
                // Lost the conditional write; re-read and try again.
                continue;
            }

            if !mood.is_happy() {
                info!(user_id = %user_id, "Happiness streak reset");
                return Ok(StreakUpdate {
                    consecutive_happy_days: 0,
                    bonus_xp: 0,
                    updated: true,
                    xp_awarded: false,
                    award: None,
                });
            }

            let bonus = milestone_bonus(new_streak);
            let description = format!("Happiness streak: day {}", new_streak);
            let metadata = serde_json::json!({ "streak_day": new_streak });

            return match self
                .progression
                .award_xp(
                    user_id,
                    ExperienceEventType::HappinessStreak,
                    bonus,
                    &description,
                    metadata,
                )
                .await
            {
                Ok(award) => Ok(StreakUpdate {
                    consecutive_happy_days: new_streak,
                    bonus_xp: bonus,
                    updated: true,
                    xp_awarded: true,
                    award: Some(award),
                }),
                Err(e) => {
                    // The streak advance stands; only the grant failed.
                    warn!(user_id = %user_id, error = %e, "Streak bonus grant failed");
                    Ok(StreakUpdate {
                        consecutive_happy_days: new_streak,
                        bonus_xp: 0,
                        updated: true,
                        xp_awarded: false,
                        award: None,
                    })
                }
            };
        }

        Err(CompanionError::Conflict(format!(
            "Streak check for user {} kept losing the conditional update",
            user_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn tracker() -> (StreakTracker, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let progression = Arc::new(ProgressionLedger::new(store.clone()));
        (StreakTracker::new(store.clone(), progression), store)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, d).unwrap()
    }

    #[test]
    fn test_milestone_schedule() {
        let cases = vec![
            (1, 10),
            (2, 5),
            (3, 20),
            (7, 50),
            (14, 100),
            (21, 25),
            (28, 25),
            (30, 200),
            (35, 25),
            (100, 5),
        ];
        for (streak_day, expected) in cases {
            assert_eq!(milestone_bonus(streak_day), expected, "day {}", streak_day);
        }
    }

    #[tokio::test]
    async fn test_happy_day_awards_bonus() {
        let (tracker, store) = tracker();
        let user_id = Uuid::new_v4();

        let update = tracker
            .check_streak_on(user_id, Mood::Happy, day(1))
            .await
            .unwrap();

        assert!(update.updated);
        assert_eq!(update.consecutive_happy_days, 1);
        assert_eq!(update.bonus_xp, 10);
        assert!(update.xp_awarded);

        let account = store.progression(user_id).await.unwrap();
        assert_eq!(account.total_xp, 10);
        assert_eq!(account.last_happiness_check, Some(day(1)));
    }

    #[tokio::test]
    async fn test_second_check_same_day_is_noop() {
        let (tracker, store) = tracker();
        let user_id = Uuid::new_v4();

        tracker
            .check_streak_on(user_id, Mood::Happy, day(1))
            .await
            .unwrap();
        let second = tracker
            .check_streak_on(user_id, Mood::Happy, day(1))
            .await
            .unwrap();

        assert!(!second.updated);
        assert!(!second.xp_awarded);
        assert_eq!(second.consecutive_happy_days, 1);

        let account = store.progression(user_id).await.unwrap();
        assert_eq!(account.consecutive_happy_days, 1);
        assert_eq!(account.total_xp, 10);
    }

    #[tokio::test]
    async fn test_streak_accumulates_across_days() {
        let (tracker, _) = tracker();
        let user_id = Uuid::new_v4();

        for d in 1..=3 {
            tracker
                .check_streak_on(user_id, Mood::Happy, day(d))
                .await
                .unwrap();
        }

        let update = tracker
            .check_streak_on(user_id, Mood::Happy, day(4))
            .await
            .unwrap();
        assert_eq!(update.consecutive_happy_days, 4);
        // Day 1: 10, day 2: 5, day 3: 20, day 4: 5.
        assert_eq!(update.award.unwrap().total_xp, 40);
    }

    #[tokio::test]
    async fn test_unhappy_mood_resets_without_xp() {
        let (tracker, store) = tracker();
        let user_id = Uuid::new_v4();

        // Seed a 5-day streak checked yesterday.
        store
            .try_advance_streak(user_id, None, day(5), 5)
            .await
            .unwrap();

        let update = tracker
            .check_streak_on(user_id, Mood::Sad, day(6))
            .await
            .unwrap();

        assert!(update.updated);
        assert_eq!(update.consecutive_happy_days, 0);
        assert_eq!(update.bonus_xp, 0);
        assert!(!update.xp_awarded);

        let account = store.progression(user_id).await.unwrap();
        assert_eq!(account.consecutive_happy_days, 0);
        assert_eq!(account.total_xp, 0);
    }

    #[tokio::test]
    async fn test_gap_does_not_reset_but_continues() {
        // A missed day leaves the counter where it was; only an
        // explicit unhappy check resets it.
        let (tracker, _) = tracker();
        let user_id = Uuid::new_v4();

        tracker
            .check_streak_on(user_id, Mood::Happy, day(1))
            .await
            .unwrap();
        let update = tracker
            .check_streak_on(user_id, Mood::Happy, day(10))
            .await
            .unwrap();

        assert_eq!(update.consecutive_happy_days, 2);
    }
}
