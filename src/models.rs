//! Core data models for the finance companion

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Classification =================
//

/// Behavioral label attached to a transaction.
///
/// Unifies the two historical vocabularies: `borderline` is accepted as
/// an alias for `neutral` and `impulsive` as an alias for `irresponsible`.
/// `Income` marks credits so budget reconciliation can exclude them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Responsible,
    #[serde(alias = "borderline")]
    Neutral,
    #[serde(alias = "impulsive")]
    Irresponsible,
    Income,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Responsible => "responsible",
            Self::Neutral => "neutral",
            Self::Irresponsible => "irresponsible",
            Self::Income => "income",
        }
    }

    /// A freshly classified transaction enters the justification queue
    /// only when the verdict is unfavorable.
    pub fn requires_justification(&self) -> bool {
        matches!(self, Self::Irresponsible | Self::Neutral)
    }
}

impl std::str::FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "responsible" => Ok(Self::Responsible),
            "neutral" | "borderline" => Ok(Self::Neutral),
            "irresponsible" | "impulsive" => Ok(Self::Irresponsible),
            "income" => Ok(Self::Income),
            _ => Err(format!("Unknown classification: {}", s)),
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//
// ================= Justification =================
//

/// Lifecycle state of the contest process.
///
/// `None` is terminal (the transaction was never contestable).
/// `Pending` may move to `Justified` or `Rejected`, both terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JustificationStatus {
    None,
    Pending,
    Justified,
    Rejected,
}

impl JustificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Justified => "justified",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::str::FromStr for JustificationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "pending" => Ok(Self::Pending),
            "justified" => Ok(Self::Justified),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Unknown justification status: {}", s)),
        }
    }
}

impl fmt::Display for JustificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//
// ================= Mood =================
//

/// Daily mood signal feeding the happiness streak.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Happy,
    Neutral,
    Sad,
}

impl Mood {
    pub fn is_happy(&self) -> bool {
        matches!(self, Self::Happy)
    }
}

impl std::str::FromStr for Mood {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "happy" => Ok(Self::Happy),
            "neutral" | "ok" => Ok(Self::Neutral),
            "sad" | "unhappy" => Ok(Self::Sad),
            _ => Err(format!("Unknown mood: {}", s)),
        }
    }
}

//
// ================= Transaction =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: f64,
    pub merchant: String,
    pub category: String,
    pub description: String,
    /// Current working classification.
    pub classification: Classification,
    /// Verdict at creation time. Write-once.
    pub original_classification: Classification,
    /// Set only when the justification process reaches a terminal outcome.
    pub final_classification: Option<Classification>,
    pub justification_status: JustificationStatus,
    pub justification: Option<String>,
    /// Short narrative reflection shown alongside the classification.
    pub reflection: String,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// The classification budget math and badges should see:
    /// the terminal verdict when one exists, the working value otherwise.
    pub fn effective_classification(&self) -> Classification {
        self.final_classification.unwrap_or(self.classification)
    }
}

/// Input for transaction creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    pub user_id: Uuid,
    pub merchant: String,
    pub amount: f64,
    pub category: String,
    #[serde(default)]
    pub description: String,
}

/// Result of transaction creation. `balance_posted = false` flags the
/// partial state where the transaction was inserted but the account
/// balance update failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction: Transaction,
    pub balance_posted: bool,
    pub new_balance: Option<f64>,
}

/// Result of a justification submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JustificationOutcome {
    pub transaction: Transaction,
    pub accepted: bool,
    pub reasoning: String,
    /// Present when acceptance triggered a budget raise.
    pub budget_adjustment: Option<BudgetAdjustment>,
    /// False when the responsible-purchase grant failed or did not apply.
    pub xp_awarded: bool,
}

//
// ================= Accounts & Budget =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub user_id: Uuid,
    pub balance: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBudgetProfile {
    pub user_id: Uuid,
    pub weekly_budget: f64,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of an automatic weekly-budget raise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAdjustment {
    pub previous_budget: f64,
    pub new_budget: f64,
    /// Non-income spend for the week that triggered the raise.
    pub weekly_spend: f64,
}

//
// ================= Progression =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressionAccount {
    pub user_id: Uuid,
    pub current_level: i32,
    pub total_xp: i64,
    pub current_xp: i64,
    pub consecutive_happy_days: i64,
    pub lessons_read: i64,
    /// Logical-day key of the last streak evaluation. Compared as a
    /// discrete date, never as a timestamp delta.
    pub last_happiness_check: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl ProgressionAccount {
    pub fn zeroed(user_id: Uuid) -> Self {
        Self {
            user_id,
            current_level: 1,
            total_xp: 0,
            current_xp: 0,
            consecutive_happy_days: 0,
            lessons_read: 0,
            last_happiness_check: None,
            created_at: Utc::now(),
        }
    }
}

/// Why experience was granted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperienceEventType {
    HappinessStreak,
    LessonRead,
    ResponsiblePurchase,
    GoalAchieved,
    DailyBonus,
}

impl ExperienceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HappinessStreak => "happiness_streak",
            Self::LessonRead => "lesson_read",
            Self::ResponsiblePurchase => "responsible_purchase",
            Self::GoalAchieved => "goal_achieved",
            Self::DailyBonus => "daily_bonus",
        }
    }
}

impl std::str::FromStr for ExperienceEventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "happiness_streak" => Ok(Self::HappinessStreak),
            "lesson_read" => Ok(Self::LessonRead),
            "responsible_purchase" => Ok(Self::ResponsiblePurchase),
            "goal_achieved" => Ok(Self::GoalAchieved),
            "daily_bonus" => Ok(Self::DailyBonus),
            _ => Err(format!("Unknown experience event type: {}", s)),
        }
    }
}

impl fmt::Display for ExperienceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable append-only grant record. The progression account is a
/// materialized projection over these; the log is the audit source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: ExperienceEventType,
    pub amount: i64,
    pub description: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Counter movement produced by appending one experience event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XpAward {
    pub previous_level: i32,
    pub new_level: i32,
    pub leveled_up: bool,
    pub total_xp: i64,
}

/// Snapshot returned to callers: stored counters plus curve-derived fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressionSnapshot {
    pub user_id: Uuid,
    pub current_level: i32,
    pub total_xp: i64,
    pub current_xp: i64,
    pub consecutive_happy_days: i64,
    pub lessons_read: i64,
    pub xp_for_next_level: i64,
    pub progress_percent: f64,
}

//
// ================= Lessons =================
//

/// Idempotency guard for lesson XP: unique per (user, lesson).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonReadRecord {
    pub user_id: Uuid,
    pub lesson_id: String,
    pub lesson_title: String,
    pub xp_awarded: bool,
    pub created_at: DateTime<Utc>,
}

/// Result of marking a lesson read. The lesson counts as read even when
/// the XP grant failed; `xp_error` carries the grant failure if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonXpOutcome {
    pub lesson_id: String,
    pub xp_awarded: bool,
    pub already_read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xp_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub award: Option<XpAward>,
}

//
// ================= Streak =================
//

/// Result of a daily happiness check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreakUpdate {
    pub consecutive_happy_days: i64,
    /// Bonus granted by this check; 0 on no-op, reset, or grant failure.
    pub bonus_xp: i64,
    /// False when today's check already happened and nothing changed.
    pub updated: bool,
    pub xp_awarded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub award: Option<XpAward>,
}

//
// ================= Badges =================
//

/// First-unlock marker, unique per (user, badge).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeUnlockRecord {
    pub user_id: Uuid,
    pub badge_id: String,
    pub unlocked_at: DateTime<Utc>,
}

/// Evaluation output for one badge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeStatus {
    pub badge_id: String,
    pub name: String,
    pub description: String,
    pub earned: bool,
    /// True exactly once: the evaluation that created the unlock record.
    pub newly_earned: bool,
}
