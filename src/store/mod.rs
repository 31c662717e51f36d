//! Persistence layer
//!
//! One trait covering every aggregate the core touches. The store is an
//! opaque transactional engine to the rest of the crate; the contract it
//! must honor is atomicity of the marked operations:
//!
//! - `post_to_account` and `append_experience` are atomic increments,
//!   never read-modify-write in application memory
//! - `resolve_justification` and `try_advance_streak` are conditional
//!   writes that report whether the guard held
//! - `grant_lesson_xp` and `record_badge_unlock` are insert-or-detect,
//!   the uniqueness constraint lives in the store
//! - `reconcile_weekly_budget` runs its read-sum-compare-write as one
//!   unit per user

use crate::models::{
    BadgeUnlockRecord, BudgetAdjustment, Classification, ExperienceEvent, JustificationStatus,
    LessonReadRecord, ProgressionAccount, Transaction, XpAward,
};
use crate::Result;
use chrono::NaiveDate;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Terminal update applied to a pending transaction.
#[derive(Debug, Clone)]
pub struct JustificationResolution {
    pub status: JustificationStatus,
    pub classification: Classification,
    pub final_classification: Classification,
    pub justification: String,
    /// Replaces the stored reflection when present.
    pub reflection: Option<String>,
}

#[async_trait::async_trait]
pub trait CompanionStore: Send + Sync {
    // =============================
    // Transactions & Accounts
    // =============================

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<()>;

    async fn transaction(&self, id: Uuid) -> Result<Option<Transaction>>;

    /// All transactions for a user, newest first.
    async fn transactions_for_user(&self, user_id: Uuid) -> Result<Vec<Transaction>>;

    /// Apply a terminal justification outcome, guarded on the row still
    /// being pending. Returns false when the guard did not hold (the
    /// transaction was resolved concurrently or was never pending).
    async fn resolve_justification(
        &self,
        id: Uuid,
        resolution: &JustificationResolution,
    ) -> Result<bool>;

    async fn account_balance(&self, user_id: Uuid) -> Result<Option<f64>>;

    /// Atomically add `delta` to the user's balance (creating the
    /// account at zero if needed) and return the new balance.
    async fn post_to_account(&self, user_id: Uuid, delta: f64) -> Result<f64>;

    // =============================
    // Weekly Budget
    // =============================

    async fn weekly_budget(&self, user_id: Uuid) -> Result<Option<f64>>;

    /// Explicit (user-initiated) budget write. Not the automatic path.
    async fn set_weekly_budget(&self, user_id: Uuid, weekly_budget: f64) -> Result<()>;

    /// Atomic read-sum-compare-write: sum the user's non-income spend
    /// since `week_start`, and raise the budget to the inflation target
    /// when the spend exceeds it. Returns the adjustment, or None when
    /// no change was warranted (or no budget profile exists).
    async fn reconcile_weekly_budget(
        &self,
        user_id: Uuid,
        week_start: NaiveDate,
    ) -> Result<Option<BudgetAdjustment>>;

    // =============================
    // Progression
    // =============================

    /// Fetch the progression account, lazily creating a zeroed one.
    async fn progression(&self, user_id: Uuid) -> Result<ProgressionAccount>;

    /// Append an experience event and atomically move the counters and
    /// level in the same step. Assumes `event.amount >= 0` (validated
    /// by the caller).
    async fn append_experience(&self, event: &ExperienceEvent) -> Result<XpAward>;

    /// Event log for a user, oldest first (audit read).
    async fn experience_events(&self, user_id: Uuid) -> Result<Vec<ExperienceEvent>>;

    /// Insert-or-detect the lesson read record. Returns the record as
    /// stored (existing one on conflict).
    async fn ensure_lesson_record(
        &self,
        user_id: Uuid,
        lesson_id: &str,
        lesson_title: &str,
    ) -> Result<LessonReadRecord>;

    /// Claim and issue the lesson grant in one atomic step: flip
    /// `xp_awarded` false→true, append the event, move the counters and
    /// bump `lessons_read`. Returns None when the flag was already set
    /// (a concurrent or earlier grant won).
    async fn grant_lesson_xp(
        &self,
        event: &ExperienceEvent,
        lesson_id: &str,
    ) -> Result<Option<XpAward>>;

    /// Conditional streak write keyed on the observed day marker:
    /// applies the new streak value and today's date only if
    /// `last_happiness_check` still equals `observed`. Returns false on
    /// a lost race so the caller can re-read and retry.
    async fn try_advance_streak(
        &self,
        user_id: Uuid,
        observed: Option<NaiveDate>,
        today: NaiveDate,
        new_streak: i64,
    ) -> Result<bool>;

    /// Administrative override used by operator tooling. Bypasses the
    /// level curve on purpose.
    async fn overwrite_progression(
        &self,
        user_id: Uuid,
        level: i32,
        total_xp: i64,
        current_xp: i64,
    ) -> Result<ProgressionAccount>;

    // =============================
    // Badges
    // =============================

    async fn badge_unlocks(&self, user_id: Uuid) -> Result<Vec<BadgeUnlockRecord>>;

    /// Insert-or-detect the unlock record. True iff this call created it.
    async fn record_badge_unlock(&self, user_id: Uuid, badge_id: &str) -> Result<bool>;
}
