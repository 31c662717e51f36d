//! Postgres store backend
//!
//! The production store. Schema is bootstrapped on first use; the
//! atomicity contract is carried by SQL: single-statement increments,
//! `ON CONFLICT` claims, conditional `UPDATE ... WHERE` guards, and an
//! explicit transaction with a row lock for budget reconciliation.

use crate::budget::inflation_target;
use crate::error::CompanionError;
use crate::models::{
    BadgeUnlockRecord, BudgetAdjustment, ExperienceEvent, LessonReadRecord, ProgressionAccount,
    Transaction, XpAward,
};
use crate::progression::level;
use crate::store::{CompanionStore, JustificationResolution};
use crate::Result;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

pub struct PostgresStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresStore {
    /// Connect lazily; the pool dials on first query.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;

        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    /// Build from POSTGRES_URL / DATABASE_URL when either is set.
    pub fn from_env() -> Option<Self> {
        let url = env::var("POSTGRES_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()?;

        match Self::connect_lazy(&url) {
            Ok(store) => {
                info!("Companion store backend: postgres");
                Some(store)
            }
            Err(error) => {
                tracing::warn!("Failed to initialize postgres store: {}", error);
                None
            }
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                let statements = [
                    r#"
                    CREATE TABLE IF NOT EXISTS transactions (
                      id UUID PRIMARY KEY,
                      user_id UUID NOT NULL,
                      amount DOUBLE PRECISION NOT NULL,
                      merchant TEXT NOT NULL,
                      category TEXT NOT NULL,
                      description TEXT NOT NULL,
                      classification TEXT NOT NULL,
                      original_classification TEXT NOT NULL,
                      final_classification TEXT,
                      justification_status TEXT NOT NULL,
                      justification TEXT,
                      reflection TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL
                    );
                    "#,
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_transactions_user_time
                    ON transactions (user_id, created_at);
                    "#,
                    r#"
                    CREATE TABLE IF NOT EXISTS accounts (
                      user_id UUID PRIMARY KEY,
                      balance DOUBLE PRECISION NOT NULL DEFAULT 0,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                    r#"
                    CREATE TABLE IF NOT EXISTS budget_profiles (
                      user_id UUID PRIMARY KEY,
                      weekly_budget DOUBLE PRECISION NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                    r#"
                    CREATE TABLE IF NOT EXISTS progression_accounts (
                      user_id UUID PRIMARY KEY,
                      current_level INTEGER NOT NULL DEFAULT 1,
                      total_xp BIGINT NOT NULL DEFAULT 0,
                      current_xp BIGINT NOT NULL DEFAULT 0,
                      consecutive_happy_days BIGINT NOT NULL DEFAULT 0,
                      lessons_read BIGINT NOT NULL DEFAULT 0,
                      last_happiness_check DATE,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                    r#"
                    CREATE TABLE IF NOT EXISTS experience_events (
                      id UUID PRIMARY KEY,
                      user_id UUID NOT NULL,
                      event_type TEXT NOT NULL,
                      amount BIGINT NOT NULL,
                      description TEXT NOT NULL,
                      metadata TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL
                    );
                    "#,
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_experience_events_user_time
                    ON experience_events (user_id, created_at);
                    "#,
                    r#"
                    CREATE TABLE IF NOT EXISTS lesson_read_records (
                      user_id UUID NOT NULL,
                      lesson_id TEXT NOT NULL,
                      lesson_title TEXT NOT NULL,
                      xp_awarded BOOLEAN NOT NULL DEFAULT FALSE,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      PRIMARY KEY (user_id, lesson_id)
                    );
                    "#,
                    r#"
                    CREATE TABLE IF NOT EXISTS badge_unlocks (
                      user_id UUID NOT NULL,
                      badge_id TEXT NOT NULL,
                      unlocked_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      PRIMARY KEY (user_id, badge_id)
                    );
                    "#,
                ];

                for statement in statements {
                    sqlx::query(statement).execute(&self.pool).await?;
                }

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                CompanionError::Persistence(format!("Failed to initialize store schema: {}", e))
            })?;

        Ok(())
    }

    /// Create the zeroed progression row if it is missing.
    async fn ensure_progression_row(&self, user_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO progression_accounts (user_id, created_at)
            VALUES ($1, NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_transaction(row: &PgRow) -> Result<Transaction> {
    let classification: String = row.try_get("classification")?;
    let original: String = row.try_get("original_classification")?;
    let final_classification: Option<String> = row.try_get("final_classification")?;
    let status: String = row.try_get("justification_status")?;

    Ok(Transaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        merchant: row.try_get("merchant")?,
        category: row.try_get("category")?,
        description: row.try_get("description")?,
        classification: FromStr::from_str(&classification).map_err(CompanionError::Persistence)?,
        original_classification: FromStr::from_str(&original)
            .map_err(CompanionError::Persistence)?,
        final_classification: final_classification
            .map(|s| FromStr::from_str(&s).map_err(CompanionError::Persistence))
            .transpose()?,
        justification_status: FromStr::from_str(&status).map_err(CompanionError::Persistence)?,
        justification: row.try_get("justification")?,
        reflection: row.try_get("reflection")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_progression(row: &PgRow) -> Result<ProgressionAccount> {
    Ok(ProgressionAccount {
        user_id: row.try_get("user_id")?,
        current_level: row.try_get("current_level")?,
        total_xp: row.try_get("total_xp")?,
        current_xp: row.try_get("current_xp")?,
        consecutive_happy_days: row.try_get("consecutive_happy_days")?,
        lessons_read: row.try_get("lessons_read")?,
        last_happiness_check: row.try_get("last_happiness_check")?,
        created_at: row.try_get("created_at")?,
    })
}

fn week_start_utc(week_start: NaiveDate) -> DateTime<Utc> {
    week_start
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
}

#[async_trait::async_trait]
impl CompanionStore for PostgresStore {

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO transactions
              (id, user_id, amount, merchant, category, description,
               classification, original_classification, final_classification,
               justification_status, justification, reflection, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.user_id)
        .bind(transaction.amount)
        .bind(&transaction.merchant)
        .bind(&transaction.category)
        .bind(&transaction.description)
        .bind(transaction.classification.as_str())
        .bind(transaction.original_classification.as_str())
        .bind(transaction.final_classification.map(|c| c.as_str()))
        .bind(transaction.justification_status.as_str())
        .bind(&transaction.justification)
        .bind(&transaction.reflection)
        .bind(transaction.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        self.ensure_schema().await?;

        let row = sqlx::query("SELECT * FROM transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_transaction(&r)).transpose()
    }

    async fn transactions_for_user(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_transaction).collect()
    }

    async fn resolve_justification(
        &self,
        id: Uuid,
        resolution: &JustificationResolution,
    ) -> Result<bool> {
        self.ensure_schema().await?;

        // Guarded terminal transition: only a pending row moves.
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET justification_status = $2,
                classification = $3,
                final_classification = $4,
                justification = $5,
                reflection = COALESCE($6, reflection)
            WHERE id = $1 AND justification_status = 'pending'
            "#,
        )
        .bind(id)
        .bind(resolution.status.as_str())
        .bind(resolution.classification.as_str())
        .bind(resolution.final_classification.as_str())
        .bind(&resolution.justification)
        .bind(&resolution.reflection)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn account_balance(&self, user_id: Uuid) -> Result<Option<f64>> {
        self.ensure_schema().await?;

        let row = sqlx::query("SELECT balance FROM accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.try_get("balance")).transpose()?)
    }

    async fn post_to_account(&self, user_id: Uuid, delta: f64) -> Result<f64> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO accounts (user_id, balance, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id)
            DO UPDATE SET balance = accounts.balance + EXCLUDED.balance,
                          updated_at = NOW()
            RETURNING balance
            "#,
        )
        .bind(user_id)
        .bind(delta)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("balance")?)
    }

    async fn weekly_budget(&self, user_id: Uuid) -> Result<Option<f64>> {
        self.ensure_schema().await?;

        let row = sqlx::query("SELECT weekly_budget FROM budget_profiles WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.try_get("weekly_budget")).transpose()?)
    }

    async fn set_weekly_budget(&self, user_id: Uuid, weekly_budget: f64) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO budget_profiles (user_id, weekly_budget, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id)
            DO UPDATE SET weekly_budget = EXCLUDED.weekly_budget, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(weekly_budget)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reconcile_weekly_budget(
        &self,
        user_id: Uuid,
        week_start: NaiveDate,
    ) -> Result<Option<BudgetAdjustment>> {
        self.ensure_schema().await?;

        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent reconciles for this user.
        let budget_row = sqlx::query(
            "SELECT weekly_budget FROM budget_profiles WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(budget_row) = budget_row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let current_budget: f64 = budget_row.try_get("weekly_budget")?;

        let sum_row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount), 0) AS weekly_spend
            FROM transactions
            WHERE user_id = $1
              AND created_at >= $2
              AND COALESCE(final_classification, classification) <> 'income'
            "#,
        )
        .bind(user_id)
        .bind(week_start_utc(week_start))
        .fetch_one(&mut *tx)
        .await?;
        let weekly_spend: f64 = sum_row.try_get("weekly_spend")?;

        if weekly_spend <= current_budget {
            tx.rollback().await?;
            return Ok(None);
        }

        let new_budget = inflation_target(weekly_spend);

        sqlx::query(
            "UPDATE budget_profiles SET weekly_budget = $2, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(new_budget)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(BudgetAdjustment {
            previous_budget: current_budget,
            new_budget,
            weekly_spend,
        }))
    }

    async fn progression(&self, user_id: Uuid) -> Result<ProgressionAccount> {
        self.ensure_schema().await?;
        self.ensure_progression_row(user_id).await?;

        let row = sqlx::query("SELECT * FROM progression_accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        row_to_progression(&row)
    }

    async fn append_experience(&self, event: &ExperienceEvent) -> Result<XpAward> {
        self.ensure_schema().await?;
        self.ensure_progression_row(event.user_id).await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO experience_events
              (id, user_id, event_type, amount, description, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(event.amount)
        .bind(&event.description)
        .bind(serde_json::to_string(&event.metadata)?)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await?;

        // Counters and level move in one statement; `total_xp` on the
        // right-hand side is the pre-update value, so the level is
        // derived from the post-increment total atomically.
        let row = sqlx::query(
            r#"
            UPDATE progression_accounts
            SET total_xp = total_xp + $2,
                current_xp = current_xp + $2,
                current_level = LEAST((total_xp + $2) / 50 + 1, 50)::INT
            WHERE user_id = $1
            RETURNING total_xp, current_level
            "#,
        )
        .bind(event.user_id)
        .bind(event.amount)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let total_xp: i64 = row.try_get("total_xp")?;
        let new_level: i32 = row.try_get("current_level")?;
        let previous_level = level::level_for_xp(total_xp - event.amount);

        Ok(XpAward {
            previous_level,
            new_level,
            leveled_up: new_level > previous_level,
            total_xp,
        })
    }

    async fn experience_events(&self, user_id: Uuid) -> Result<Vec<ExperienceEvent>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            "SELECT * FROM experience_events WHERE user_id = $1 ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let event_type: String = row.try_get("event_type")?;
                let metadata: String = row.try_get("metadata")?;

                Ok(ExperienceEvent {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    event_type: FromStr::from_str(&event_type)
                        .map_err(CompanionError::Persistence)?,
                    amount: row.try_get("amount")?,
                    description: row.try_get("description")?,
                    metadata: serde_json::from_str(&metadata)?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn ensure_lesson_record(
        &self,
        user_id: Uuid,
        lesson_id: &str,
        lesson_title: &str,
    ) -> Result<LessonReadRecord> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO lesson_read_records (user_id, lesson_id, lesson_title, xp_awarded)
            VALUES ($1, $2, $3, FALSE)
            ON CONFLICT (user_id, lesson_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(lesson_id)
        .bind(lesson_title)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM lesson_read_records WHERE user_id = $1 AND lesson_id = $2",
        )
        .bind(user_id)
        .bind(lesson_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(LessonReadRecord {
            user_id: row.try_get("user_id")?,
            lesson_id: row.try_get("lesson_id")?,
            lesson_title: row.try_get("lesson_title")?,
            xp_awarded: row.try_get("xp_awarded")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn grant_lesson_xp(
        &self,
        event: &ExperienceEvent,
        lesson_id: &str,
    ) -> Result<Option<XpAward>> {
        self.ensure_schema().await?;
        self.ensure_progression_row(event.user_id).await?;

        let mut tx = self.pool.begin().await?;

        // Claim the grant: only one caller flips the flag.
        let claim = sqlx::query(
            r#"
            UPDATE lesson_read_records
            SET xp_awarded = TRUE
            WHERE user_id = $1 AND lesson_id = $2 AND xp_awarded = FALSE
            "#,
        )
        .bind(event.user_id)
        .bind(lesson_id)
        .execute(&mut *tx)
        .await?;

        if claim.rows_affected() == 0 {
            tx.rollback().await?;

            let exists = sqlx::query(
                "SELECT 1 FROM lesson_read_records WHERE user_id = $1 AND lesson_id = $2",
            )
            .bind(event.user_id)
            .bind(lesson_id)
            .fetch_optional(&self.pool)
            .await?;

            return if exists.is_some() {
                Ok(None)
            } else {
                Err(CompanionError::NotFound(format!(
                    "Lesson record {} for user {}",
                    lesson_id, event.user_id
                )))
            };
        }

        sqlx::query(
            r#"
            INSERT INTO experience_events
              (id, user_id, event_type, amount, description, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(event.amount)
        .bind(&event.description)
        .bind(serde_json::to_string(&event.metadata)?)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            UPDATE progression_accounts
            SET total_xp = total_xp + $2,
                current_xp = current_xp + $2,
                lessons_read = lessons_read + 1,
                current_level = LEAST((total_xp + $2) / 50 + 1, 50)::INT
            WHERE user_id = $1
            RETURNING total_xp, current_level
            "#,
        )
        .bind(event.user_id)
        .bind(event.amount)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let total_xp: i64 = row.try_get("total_xp")?;
        let new_level: i32 = row.try_get("current_level")?;
        let previous_level = level::level_for_xp(total_xp - event.amount);

        Ok(Some(XpAward {
            previous_level,
            new_level,
            leveled_up: new_level > previous_level,
            total_xp,
        }))
    }

    async fn try_advance_streak(
        &self,
        user_id: Uuid,
        observed: Option<NaiveDate>,
        today: NaiveDate,
        new_streak: i64,
    ) -> Result<bool> {
        self.ensure_schema().await?;
        self.ensure_progression_row(user_id).await?;

        // Conditional write keyed on the day marker we read; a lost
        // race leaves the row untouched and the caller re-reads.
        let result = sqlx::query(
            r#"
            UPDATE progression_accounts
            SET consecutive_happy_days = $3,
                last_happiness_check = $4
            WHERE user_id = $1
              AND last_happiness_check IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(user_id)
        .bind(observed)
        .bind(new_streak)
        .bind(today)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn overwrite_progression(
        &self,
        user_id: Uuid,
        level_value: i32,
        total_xp: i64,
        current_xp: i64,
    ) -> Result<ProgressionAccount> {
        self.ensure_schema().await?;
        self.ensure_progression_row(user_id).await?;

        let row = sqlx::query(
            r#"
            UPDATE progression_accounts
            SET current_level = $2, total_xp = $3, current_xp = $4
            WHERE user_id = $1
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(level_value)
        .bind(total_xp)
        .bind(current_xp)
        .fetch_one(&self.pool)
        .await?;

        row_to_progression(&row)
    }

    async fn badge_unlocks(&self, user_id: Uuid) -> Result<Vec<BadgeUnlockRecord>> {
        self.ensure_schema().await?;

        let rows = sqlx::query("SELECT * FROM badge_unlocks WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(BadgeUnlockRecord {
                    user_id: row.try_get("user_id")?,
                    badge_id: row.try_get("badge_id")?,
                    unlocked_at: row.try_get("unlocked_at")?,
                })
            })
            .collect()
    }

    async fn record_badge_unlock(&self, user_id: Uuid, badge_id: &str) -> Result<bool> {
        self.ensure_schema().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO badge_unlocks (user_id, badge_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id, badge_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(badge_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
