//! PostgreSQL ledger implementation
//!
//! Every balance mutation happens inside one transaction that also writes the
//! matching reservation and message rows. Transactions run with
//! `lock_timeout`/`statement_timeout` set locally and under a client-side
//! deadline; an expired deadline drops the transaction, which rolls it back
//! and releases its row locks.

use crate::errors::classify_sqlx_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use smsgate_core::{
    models::{
        ClaimOutcome, LedgerReserve, Message, MessageStatus, PrivilegedSettlement,
        ReclaimedReservation, Reservation, User, UserId,
    },
    traits::LedgerStore,
    AppError, AppResult,
};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// PostgreSQL implementation of LedgerStore
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
    tx_timeout: Duration,
}

impl PgLedger {
    /// Create a new ledger over `pool`; every transaction is bounded by `tx_timeout`
    pub fn new(pool: PgPool, tx_timeout: Duration) -> Self {
        Self { pool, tx_timeout }
    }

    /// Insert or overwrite a user (seeding and administration)
    #[instrument(skip(self))]
    pub async fn upsert_user(&self, user: &User) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, balance, is_privileged)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET balance = EXCLUDED.balance,
                is_privileged = EXCLUDED.is_privileged,
                updated_at = NOW()
            "#,
        )
        .bind(user.id)
        .bind(user.balance)
        .bind(user.is_privileged)
        .execute(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("upsert user", e))?;

        Ok(())
    }

    /// Run `fut` under the transaction deadline
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        match tokio::time::timeout(self.tx_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, "Ledger transaction exceeded its deadline");
                Err(AppError::LedgerTimeout(self.tx_timeout.as_millis() as u64))
            }
        }
    }

    async fn begin(&self) -> AppResult<Transaction<'static, Postgres>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify_sqlx_error("begin transaction", e))?;

        let millis = self.tx_timeout.as_millis();
        let lock_timeout = format!("SET LOCAL lock_timeout = '{}ms'", millis);
        let statement_timeout = format!("SET LOCAL statement_timeout = '{}ms'", millis);
        for stmt in [&lock_timeout, &statement_timeout] {
            sqlx::query(stmt)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_sqlx_error("set transaction timeouts", e))?;
        }

        Ok(tx)
    }

    async fn commit(tx: Transaction<'static, Postgres>) -> AppResult<()> {
        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            match classify_sqlx_error("commit", e) {
                retryable @ AppError::ConflictRetryable(_) => retryable,
                other => AppError::Transaction(other.to_string()),
            }
        })
    }

    async fn message_status(
        conn: &mut PgConnection,
        message_id: Uuid,
    ) -> AppResult<Option<MessageStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM messages WHERE message_id = $1")
                .bind(message_id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| classify_sqlx_error("read message status", e))?;

        status.map(|s| parse_status(&s)).transpose()
    }

    async fn insert_reservation(
        conn: &mut PgConnection,
        reservation: &Reservation,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reservations (id, user_id, amount, used, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(reservation.id)
        .bind(reservation.user_id)
        .bind(reservation.amount)
        .bind(reservation.used)
        .bind(reservation.expires_at)
        .bind(reservation.created_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| classify_sqlx_error("insert reservation", e))?;

        Ok(())
    }

    /// Insert a message row; `false` when the id already exists
    async fn insert_message(
        conn: &mut PgConnection,
        message: &Message,
        reservation_id: Option<Uuid>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (
                message_id, user_id, phone, body, cost, status,
                reservation_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(message.message_id)
        .bind(message.user_id)
        .bind(&message.phone)
        .bind(&message.body)
        .bind(message.cost)
        .bind(message.status.as_str())
        .bind(reservation_id)
        .bind(message.created_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| classify_sqlx_error("insert message", e))?;

        Ok(result.rows_affected() > 0)
    }

    /// Debit, hold and insert inside an open transaction once funds are known
    /// to cover the cost
    async fn hold_and_record(
        tx: &mut Transaction<'static, Postgres>,
        message: &Message,
        ttl: chrono::Duration,
    ) -> AppResult<Option<Reservation>> {
        let reservation = Reservation::new(message.user_id, message.cost, ttl);
        Self::insert_reservation(tx, &reservation).await?;

        let mut queued = message.clone();
        queued.status = MessageStatus::Queued;
        if !Self::insert_message(tx, &queued, Some(reservation.id)).await? {
            return Ok(None);
        }

        Ok(Some(reservation))
    }

    async fn duplicate_status(&self, message_id: Uuid) -> AppResult<LedgerReserve> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| classify_sqlx_error("acquire connection", e))?;
        let status = Self::message_status(&mut conn, message_id)
            .await?
            .unwrap_or(MessageStatus::Queued);
        Ok(LedgerReserve::Duplicate { status })
    }
}

fn parse_status(raw: &str) -> AppResult<MessageStatus> {
    MessageStatus::from_str(raw)
        .ok_or_else(|| AppError::Database(format!("Unknown message status '{}'", raw)))
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    message_id: Uuid,
    user_id: Uuid,
    phone: String,
    body: String,
    cost: i64,
    status: String,
    reservation_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = AppError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            message_id: row.message_id,
            user_id: row.user_id,
            phone: row.phone,
            body: row.body,
            cost: row.cost,
            status: parse_status(&row.status)?,
            reservation_id: row.reservation_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SettlementRow {
    user_id: Uuid,
    cost: i64,
    status: String,
    reservation_id: Option<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct ExpiredRow {
    id: Uuid,
    user_id: Uuid,
    amount: i64,
    expires_at: DateTime<Utc>,
}

#[async_trait]
impl LedgerStore for PgLedger {
    #[instrument(skip(self))]
    async fn get_user(&self, user_id: UserId) -> AppResult<Option<User>> {
        debug!("Finding user by id: {}", user_id);

        let row: Option<(Uuid, i64, bool)> =
            sqlx::query_as("SELECT id, balance, is_privileged FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| classify_sqlx_error("find user", e))?;

        Ok(row.map(|(id, balance, is_privileged)| User::new(id, balance, is_privileged)))
    }

    #[instrument(skip(self))]
    async fn get_balance(&self, user_id: UserId) -> AppResult<i64> {
        let balance: Option<i64> = sqlx::query_scalar("SELECT balance FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("read balance", e))?;

        balance.ok_or_else(|| AppError::UserNotFound(user_id.to_string()))
    }

    #[instrument(skip(self))]
    async fn get_message(&self, message_id: Uuid) -> AppResult<Option<Message>> {
        let row = sqlx::query_as::<sqlx::Postgres, MessageRow>(
            r#"
            SELECT message_id, user_id, phone, body, cost, status,
                   reservation_id, created_at, updated_at
            FROM messages
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("find message", e))?;

        row.map(Message::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn get_message_status(&self, message_id: Uuid) -> AppResult<Option<MessageStatus>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| classify_sqlx_error("acquire connection", e))?;
        Self::message_status(&mut conn, message_id).await
    }

    #[instrument(skip(self, message), fields(message_id = %message.message_id, user_id = %message.user_id))]
    async fn reserve_conditional(
        &self,
        message: &Message,
        ttl: chrono::Duration,
    ) -> AppResult<LedgerReserve> {
        self.bounded("reserve_conditional", async {
            let mut tx = self.begin().await?;

            if let Some(status) = Self::message_status(&mut tx, message.message_id).await? {
                return Ok(LedgerReserve::Duplicate { status });
            }

            let debited: Option<i64> = sqlx::query_scalar(
                r#"
                UPDATE users
                SET balance = balance - $2,
                    updated_at = NOW()
                WHERE id = $1 AND balance >= $2
                RETURNING balance
                "#,
            )
            .bind(message.user_id)
            .bind(message.cost)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| classify_sqlx_error("conditional debit", e))?;

            let Some(balance_after) = debited else {
                let balance: Option<i64> =
                    sqlx::query_scalar("SELECT balance FROM users WHERE id = $1")
                        .bind(message.user_id)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| classify_sqlx_error("read balance", e))?;
                return match balance {
                    Some(balance) => Ok(LedgerReserve::Insufficient { balance }),
                    None => Err(AppError::UserNotFound(message.user_id.to_string())),
                };
            };

            let Some(reservation) = Self::hold_and_record(&mut tx, message, ttl).await? else {
                drop(tx);
                return self.duplicate_status(message.message_id).await;
            };

            Self::commit(tx).await?;

            debug!(
                "Reserved {} for message {} (balance now {})",
                message.cost, message.message_id, balance_after
            );

            Ok(LedgerReserve::Reserved {
                reservation,
                balance_after,
            })
        })
        .await
    }

    #[instrument(skip(self, message), fields(message_id = %message.message_id, user_id = %message.user_id))]
    async fn reserve_locked(
        &self,
        message: &Message,
        ttl: chrono::Duration,
    ) -> AppResult<LedgerReserve> {
        self.bounded("reserve_locked", async {
            let mut tx = self.begin().await?;

            // Lock user row
            let balance: i64 =
                sqlx::query_scalar("SELECT balance FROM users WHERE id = $1 FOR UPDATE")
                    .bind(message.user_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| classify_sqlx_error("lock user", e))?
                    .ok_or_else(|| AppError::UserNotFound(message.user_id.to_string()))?;

            if let Some(status) = Self::message_status(&mut tx, message.message_id).await? {
                return Ok(LedgerReserve::Duplicate { status });
            }

            if balance < message.cost {
                debug!(
                    "Insufficient balance for user {}: required {}, available {}",
                    message.user_id, message.cost, balance
                );
                return Ok(LedgerReserve::Insufficient { balance });
            }

            sqlx::query(
                r#"
                UPDATE users
                SET balance = balance - $2,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(message.user_id)
            .bind(message.cost)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify_sqlx_error("debit balance", e))?;

            let Some(reservation) = Self::hold_and_record(&mut tx, message, ttl).await? else {
                drop(tx);
                return self.duplicate_status(message.message_id).await;
            };

            Self::commit(tx).await?;

            Ok(LedgerReserve::Reserved {
                reservation,
                balance_after: balance - message.cost,
            })
        })
        .await
    }

    #[instrument(skip(self, message), fields(message_id = %message.message_id, status = %message.status))]
    async fn record_message(&self, message: &Message) -> AppResult<Option<MessageStatus>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| classify_sqlx_error("acquire connection", e))?;

        if Self::insert_message(&mut conn, message, message.reservation_id).await? {
            return Ok(None);
        }

        let existing = Self::message_status(&mut conn, message.message_id)
            .await?
            .unwrap_or(MessageStatus::Queued);
        Ok(Some(existing))
    }

    #[instrument(skip(self))]
    async fn release_reservation(&self, reservation_id: Uuid) -> AppResult<i64> {
        self.bounded("release_reservation", async {
            let mut tx = self.begin().await?;

            let row: Option<(Uuid, i64, bool)> = sqlx::query_as(
                "SELECT user_id, amount, used FROM reservations WHERE id = $1 FOR UPDATE",
            )
            .bind(reservation_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| classify_sqlx_error("lock reservation", e))?;

            let Some((user_id, amount, used)) = row else {
                debug!("Reservation {} already gone; nothing to release", reservation_id);
                return Ok(0);
            };
            if used {
                warn!("Reservation {} already consumed; not releasing", reservation_id);
                return Ok(0);
            }

            sqlx::query("UPDATE users SET balance = balance + $2, updated_at = NOW() WHERE id = $1")
                .bind(user_id)
                .bind(amount)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_sqlx_error("credit balance", e))?;

            sqlx::query("DELETE FROM reservations WHERE id = $1")
                .bind(reservation_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_sqlx_error("delete reservation", e))?;

            Self::commit(tx).await?;

            info!(
                "Released reservation {}: credited {} to user {}",
                reservation_id, amount, user_id
            );
            Ok(amount)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn update_message_status(
        &self,
        message_id: Uuid,
        status: MessageStatus,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = $2,
                updated_at = NOW()
            WHERE message_id = $1 AND status = 'queued'
            "#,
        )
        .bind(message_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error("update message status", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn claim_reservation(
        &self,
        message_id: Uuid,
        ttl: chrono::Duration,
    ) -> AppResult<ClaimOutcome> {
        self.bounded("claim_reservation", async {
            let mut tx = self.begin().await?;

            let row = sqlx::query_as::<sqlx::Postgres, SettlementRow>(
                r#"
                SELECT user_id, cost, status, reservation_id
                FROM messages
                WHERE message_id = $1
                FOR UPDATE
                "#,
            )
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| classify_sqlx_error("lock message", e))?
            .ok_or_else(|| AppError::MessageNotFound(message_id.to_string()))?;

            let status = parse_status(&row.status)?;
            if status.is_terminal() {
                return Ok(ClaimOutcome::NotQueued { status });
            }

            if let Some(reservation_id) = row.reservation_id {
                let used: Option<bool> =
                    sqlx::query_scalar("SELECT used FROM reservations WHERE id = $1 FOR UPDATE")
                        .bind(reservation_id)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| classify_sqlx_error("lock reservation", e))?;

                match used {
                    Some(true) => return Ok(ClaimOutcome::AlreadyClaimed { reservation_id }),
                    Some(false) => {
                        sqlx::query("UPDATE reservations SET used = TRUE WHERE id = $1")
                            .bind(reservation_id)
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| classify_sqlx_error("claim reservation", e))?;
                        Self::commit(tx).await?;
                        return Ok(ClaimOutcome::Claimed { reservation_id });
                    }
                    None => {
                        warn!(
                            "Reservation {} for message {} was reclaimed; re-debiting",
                            reservation_id, message_id
                        );
                    }
                }
            }

            let balance: i64 =
                sqlx::query_scalar("SELECT balance FROM users WHERE id = $1 FOR UPDATE")
                    .bind(row.user_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| classify_sqlx_error("lock user", e))?
                    .ok_or_else(|| AppError::UserNotFound(row.user_id.to_string()))?;

            if balance < row.cost {
                return Ok(ClaimOutcome::Insufficient { balance });
            }

            sqlx::query("UPDATE users SET balance = balance - $2, updated_at = NOW() WHERE id = $1")
                .bind(row.user_id)
                .bind(row.cost)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_sqlx_error("debit balance", e))?;

            let mut reservation = Reservation::new(row.user_id, row.cost, ttl);
            reservation.used = true;
            Self::insert_reservation(&mut tx, &reservation).await?;

            sqlx::query(
                "UPDATE messages SET reservation_id = $2, updated_at = NOW() WHERE message_id = $1",
            )
            .bind(message_id)
            .bind(reservation.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify_sqlx_error("attach reservation", e))?;

            Self::commit(tx).await?;

            Ok(ClaimOutcome::Rebilled {
                reservation_id: reservation.id,
            })
        })
        .await
    }

    #[instrument(skip(self))]
    async fn finalize_standard(&self, message_id: Uuid, status: MessageStatus) -> AppResult<bool> {
        self.bounded("finalize_standard", async {
            let mut tx = self.begin().await?;

            let updated: Option<Option<Uuid>> = sqlx::query_scalar(
                r#"
                UPDATE messages
                SET status = $2,
                    updated_at = NOW()
                WHERE message_id = $1 AND status = 'queued'
                RETURNING reservation_id
                "#,
            )
            .bind(message_id)
            .bind(status.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| classify_sqlx_error("finalize message", e))?;

            let Some(reservation_id) = updated else {
                return Ok(false);
            };

            if let Some(reservation_id) = reservation_id {
                sqlx::query("DELETE FROM reservations WHERE id = $1")
                    .bind(reservation_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| classify_sqlx_error("delete reservation", e))?;
            }

            Self::commit(tx).await?;
            Ok(true)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn settle_privileged(&self, message_id: Uuid) -> AppResult<PrivilegedSettlement> {
        self.bounded("settle_privileged", async {
            let mut tx = self.begin().await?;

            let row = sqlx::query_as::<sqlx::Postgres, SettlementRow>(
                r#"
                SELECT user_id, cost, status, reservation_id
                FROM messages
                WHERE message_id = $1
                FOR UPDATE
                "#,
            )
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| classify_sqlx_error("lock message", e))?
            .ok_or_else(|| AppError::MessageNotFound(message_id.to_string()))?;

            let status = parse_status(&row.status)?;
            if status.is_terminal() {
                return Ok(PrivilegedSettlement::AlreadyTerminal { status });
            }

            let balance: i64 =
                sqlx::query_scalar("SELECT balance FROM users WHERE id = $1 FOR UPDATE")
                    .bind(row.user_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| classify_sqlx_error("lock user", e))?
                    .ok_or_else(|| AppError::UserNotFound(row.user_id.to_string()))?;

            let (outcome, final_status) = if balance >= row.cost {
                sqlx::query(
                    "UPDATE users SET balance = balance - $2, updated_at = NOW() WHERE id = $1",
                )
                .bind(row.user_id)
                .bind(row.cost)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_sqlx_error("debit balance", e))?;

                (
                    PrivilegedSettlement::Settled {
                        balance_after: balance - row.cost,
                    },
                    MessageStatus::Sent,
                )
            } else {
                warn!(
                    "Privileged user {} cannot cover delivered message {}: balance {}, cost {}",
                    row.user_id, message_id, balance, row.cost
                );
                (
                    PrivilegedSettlement::BillingFailed { balance },
                    MessageStatus::Error,
                )
            };

            sqlx::query("UPDATE messages SET status = $2, updated_at = NOW() WHERE message_id = $1")
                .bind(message_id)
                .bind(final_status.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_sqlx_error("settle message", e))?;

            Self::commit(tx).await?;
            Ok(outcome)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn reclaim_expired(
        &self,
        batch: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<ReclaimedReservation>> {
        self.bounded("reclaim_expired", async {
            let mut tx = self.begin().await?;

            let expired = sqlx::query_as::<sqlx::Postgres, ExpiredRow>(
                r#"
                SELECT id, user_id, amount, expires_at
                FROM reservations
                WHERE used = FALSE AND expires_at <= $1
                ORDER BY expires_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(now)
            .bind(batch)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| classify_sqlx_error("select expired reservations", e))?;

            if expired.is_empty() {
                return Ok(Vec::new());
            }

            // Credit per user in a stable order to keep lock acquisition consistent
            let mut credits: BTreeMap<Uuid, i64> = BTreeMap::new();
            for row in &expired {
                *credits.entry(row.user_id).or_insert(0) += row.amount;
            }

            for (user_id, amount) in &credits {
                sqlx::query(
                    "UPDATE users SET balance = balance + $2, updated_at = NOW() WHERE id = $1",
                )
                .bind(user_id)
                .bind(amount)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_sqlx_error("credit balance", e))?;
            }

            let ids: Vec<Uuid> = expired.iter().map(|row| row.id).collect();
            sqlx::query("DELETE FROM reservations WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_sqlx_error("delete reservations", e))?;

            Self::commit(tx).await?;

            info!(
                "Reclaimed {} expired reservations across {} users",
                expired.len(),
                credits.len()
            );

            Ok(expired
                .into_iter()
                .map(|row| ReclaimedReservation {
                    reservation_id: row.id,
                    user_id: row.user_id,
                    amount: row.amount,
                    expired_at: row.expires_at,
                })
                .collect())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, run_migrations};
    use smsgate_core::config::DatabaseConfig;

    async fn ledger() -> PgLedger {
        let mut config = DatabaseConfig::default();
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.url = url;
        }
        let pool = create_pool(&config).await.unwrap();
        run_migrations(&pool).await.unwrap();
        PgLedger::new(pool, Duration::from_secs(2))
    }

    fn message_for(user_id: Uuid) -> Message {
        Message::new(
            Uuid::new_v4(),
            user_id,
            "5551234567",
            "hello",
            1,
            MessageStatus::Queued,
        )
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_conditional_reserve_debits_once() {
        let ledger = ledger().await;
        let user = User::new(Uuid::new_v4(), 1, false);
        ledger.upsert_user(&user).await.unwrap();

        let first = ledger
            .reserve_conditional(&message_for(user.id), chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(matches!(first, LedgerReserve::Reserved { balance_after: 0, .. }));

        let second = ledger
            .reserve_conditional(&message_for(user.id), chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(second, LedgerReserve::Insufficient { balance: 0 });
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_reclaim_restores_balance() {
        let ledger = ledger().await;
        let user = User::new(Uuid::new_v4(), 3, false);
        ledger.upsert_user(&user).await.unwrap();

        ledger
            .reserve_locked(&message_for(user.id), chrono::Duration::seconds(-1))
            .await
            .unwrap();
        assert_eq!(ledger.get_balance(user.id).await.unwrap(), 2);

        let reclaimed = ledger.reclaim_expired(100, Utc::now()).await.unwrap();
        assert!(reclaimed.iter().any(|r| r.user_id == user.id));
        assert_eq!(ledger.get_balance(user.id).await.unwrap(), 3);
    }
}
