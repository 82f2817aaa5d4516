//! Persistence gateway (spec §4.1) — C1
//!
//! Every balance-changing operation below is exactly one database
//! transaction. Rows are locked in a fixed order (Room, then User sorted by
//! id) before any write, mirroring the corpus's own ledger code
//! (`other_examples/.../tinylvt__api-src-store-currency.rs`) which sorts
//! debited accounts by id and takes `SELECT ... FOR UPDATE` before checking
//! balances. The `balance >= 0` invariant is enforced twice: by the
//! conditional `UPDATE ... WHERE balance >= $amount` predicate here, and by
//! a `CHECK (balance >= 0)` constraint at the schema level as the backstop
//! for §7's "fatal invariants".

use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{
    HexDigest, Participation, ParticipationId, Room, RoomId, Round, RoundId, TransactionId,
    TransactionType, UserId, PLATFORM_USER_ID,
};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("user not found")]
    UserNotFound,
    #[error("round not found")]
    RoundNotFound,
    #[error("user is not participating in this round")]
    NotParticipating,
    #[error("round is locked past Waiting")]
    RoundLocked,
    #[error("duplicate external deposit id")]
    DuplicateExternalId,
    #[error("database operation timed out")]
    Timeout,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub struct JoinResult {
    pub new_balance: Decimal,
    pub participation_id: ParticipationId,
    pub transaction_id: TransactionId,
}

#[derive(Clone)]
pub struct Ledger {
    pool: PgPool,
    db_timeout: std::time::Duration,
}

impl Ledger {
    pub fn new(pool: PgPool, db_timeout: std::time::Duration) -> Self {
        Self { pool, db_timeout }
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, LedgerError> {
        match tokio::time::timeout(self.db_timeout, fut).await {
            Ok(result) => result.map_err(LedgerError::from),
            Err(_) => Err(LedgerError::Timeout),
        }
    }

    /// Create the `game_rounds` row backing a fresh round, committing to
    /// `server_seed_hash` before any participant can join it (spec §4.4:
    /// the commitment must exist before the first bet it could bias).
    pub async fn create_round(
        &self,
        round_id: RoundId,
        room_id: RoomId,
        server_seed_hash: &HexDigest,
    ) -> Result<(), LedgerError> {
        self.with_timeout(async {
            sqlx::query(
                r#"
                INSERT INTO game_rounds (id, room_id, server_seed_hash, prize_pool, winner_ids, created_at)
                VALUES ($1, $2, $3, 0, ARRAY[]::uuid[], now())
                "#,
            )
            .bind(round_id.0)
            .bind(room_id.0)
            .bind(server_seed_hash.0.clone())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Reveal the server seed and the aggregated client seed once a round's
    /// draw has been computed, so the commitment published at round start
    /// can be checked against the result (spec §4.4).
    pub async fn reveal_round(
        &self,
        round_id: RoundId,
        server_seed: &HexDigest,
        client_seed: &HexDigest,
    ) -> Result<(), LedgerError> {
        self.with_timeout(async {
            sqlx::query("UPDATE game_rounds SET server_seed = $1, client_seed = $2 WHERE id = $3")
                .bind(server_seed.0.clone())
                .bind(client_seed.0.clone())
                .bind(round_id.0)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// Deduct `amount` from `user_id`'s balance to join `round_id`, splitting
    /// the bet into a prize-pool contribution and a platform commission
    /// (spec §4.1, §9 "commission recorded per-bet"). Room row is locked
    /// first to serialize joiners for that room.
    pub async fn deduct_for_join(
        &self,
        user_id: UserId,
        room: &Room,
        round_id: RoundId,
        amount: Decimal,
    ) -> Result<JoinResult, LedgerError> {
        self.with_timeout(async {
            let mut tx = self.pool.begin().await?;

            sqlx::query("SELECT 1 FROM rooms WHERE id = $1 FOR UPDATE")
                .bind(room.id.0)
                .execute(&mut *tx)
                .await?;

            let new_balance: Option<Decimal> = sqlx::query_scalar(
                r#"
                UPDATE users SET balance = balance - $1
                WHERE id = $2 AND balance >= $1
                RETURNING balance
                "#,
            )
            .bind(amount)
            .bind(user_id.0)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(new_balance) = new_balance else {
                return Ok(Err(LedgerError::InsufficientFunds));
            };

            let participation_id = ParticipationId::new();
            sqlx::query(
                r#"
                INSERT INTO round_participants (id, round_id, user_id, bet_amount, join_timestamp)
                VALUES ($1, $2, $3, $4, now())
                "#,
            )
            .bind(participation_id.0)
            .bind(round_id.0)
            .bind(user_id.0)
            .bind(amount)
            .execute(&mut *tx)
            .await?;

            let bet_tx_id = insert_transaction(
                &mut tx,
                user_id,
                TransactionType::Bet,
                -amount,
                "bet placed",
            )
            .await?;

            let commission = amount * room.commission_rate;
            let pool_contribution = amount - commission;

            sqlx::query("UPDATE game_rounds SET prize_pool = prize_pool + $1 WHERE id = $2")
                .bind(pool_contribution)
                .bind(round_id.0)
                .execute(&mut *tx)
                .await?;

            sqlx::query("UPDATE users SET balance = balance + $1 WHERE id = $2")
                .bind(commission)
                .bind(PLATFORM_USER_ID.0)
                .execute(&mut *tx)
                .await?;

            insert_transaction(
                &mut tx,
                PLATFORM_USER_ID,
                TransactionType::Adjustment,
                commission,
                "platform commission",
            )
            .await?;

            tx.commit().await?;

            Ok(Ok(JoinResult {
                new_balance,
                participation_id,
                transaction_id: bet_tx_id,
            }))
        })
        .await?
    }

    /// Refund a user's bet if the round is still in `Waiting` (checked by
    /// the caller holding the scheduler's state; here we only check the
    /// participation still exists and the round has not archived).
    pub async fn refund_on_leave(
        &self,
        user_id: UserId,
        round_id: RoundId,
        room: &Room,
    ) -> Result<Decimal, LedgerError> {
        self.with_timeout(async {
            let mut tx = self.pool.begin().await?;

            let participation: Option<(ParticipationId, Decimal)> = sqlx::query_as(
                "SELECT id, bet_amount FROM round_participants WHERE round_id = $1 AND user_id = $2",
            )
            .bind(round_id.0)
            .bind(user_id.0)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((participation_id, bet_amount)) = participation else {
                return Ok(Err(LedgerError::NotParticipating));
            };

            let archived: Option<bool> = sqlx::query_scalar(
                "SELECT archived_at IS NOT NULL FROM game_rounds WHERE id = $1",
            )
            .bind(round_id.0)
            .fetch_optional(&mut *tx)
            .await?;

            if archived.unwrap_or(true) {
                return Ok(Err(LedgerError::RoundLocked));
            }

            sqlx::query("DELETE FROM round_participants WHERE id = $1")
                .bind(participation_id.0)
                .execute(&mut *tx)
                .await?;

            let new_balance: Decimal = sqlx::query_scalar(
                "UPDATE users SET balance = balance + $1 WHERE id = $2 RETURNING balance",
            )
            .bind(bet_amount)
            .bind(user_id.0)
            .fetch_one(&mut *tx)
            .await?;

            insert_transaction(&mut tx, user_id, TransactionType::Refund, bet_amount, "leave refund")
                .await?;

            // Reverse exactly the pool contribution credited at join time
            // (bet minus commission), plus the matching commission reversal,
            // so the prize pool and platform ledger both reconcile to zero
            // net effect for this participation.
            let commission = bet_amount * room.commission_rate;
            let pool_contribution = bet_amount - commission;

            sqlx::query("UPDATE game_rounds SET prize_pool = prize_pool - $1 WHERE id = $2")
                .bind(pool_contribution)
                .bind(round_id.0)
                .execute(&mut *tx)
                .await?;

            sqlx::query("UPDATE users SET balance = balance - $1 WHERE id = $2")
                .bind(commission)
                .bind(PLATFORM_USER_ID.0)
                .execute(&mut *tx)
                .await?;

            insert_transaction(
                &mut tx,
                PLATFORM_USER_ID,
                TransactionType::Adjustment,
                -commission,
                "platform commission reversal",
            )
            .await?;

            tx.commit().await?;
            Ok(Ok(new_balance))
        })
        .await?
    }

    /// Credit a winner and mark the round Completed (spec §4.1).
    pub async fn credit_winner(
        &self,
        user_id: UserId,
        round_id: RoundId,
        amount: Decimal,
    ) -> Result<Decimal, LedgerError> {
        self.with_timeout(async {
            let mut tx = self.pool.begin().await?;

            let new_balance: Decimal = sqlx::query_scalar(
                "UPDATE users SET balance = balance + $1 WHERE id = $2 RETURNING balance",
            )
            .bind(amount)
            .bind(user_id.0)
            .fetch_one(&mut *tx)
            .await?;

            insert_transaction(&mut tx, user_id, TransactionType::Win, amount, "round win")
                .await?;

            sqlx::query(
                r#"
                UPDATE game_rounds
                SET winner_ids = array_append(winner_ids, $1), completed_at = now()
                WHERE id = $2
                "#,
            )
            .bind(user_id.0)
            .bind(round_id.0)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(new_balance)
        })
        .await
    }

    /// Admin balance adjustment (spec §4.1); rejected if it would drive
    /// balance below zero.
    pub async fn admin_adjust(
        &self,
        user_id: UserId,
        delta: Decimal,
        description: &str,
    ) -> Result<Decimal, LedgerError> {
        self.with_timeout(async {
            let mut tx = self.pool.begin().await?;

            let new_balance: Option<Decimal> = sqlx::query_scalar(
                r#"
                UPDATE users SET balance = balance + $1
                WHERE id = $2 AND balance + $1 >= 0
                RETURNING balance
                "#,
            )
            .bind(delta)
            .bind(user_id.0)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(new_balance) = new_balance else {
                return Ok(Err(LedgerError::InsufficientFunds));
            };

            insert_transaction(&mut tx, user_id, TransactionType::Adjustment, delta, description)
                .await?;

            tx.commit().await?;
            Ok(Ok(new_balance))
        })
        .await?
    }

    /// Credit a crypto deposit. Duplicate `(provider, external_id)` pairs are
    /// a no-op success (spec §4.1/§6).
    pub async fn credit_crypto_deposit(
        &self,
        user_id: UserId,
        provider: &str,
        external_id: &str,
        amount: Decimal,
    ) -> Result<Decimal, LedgerError> {
        self.with_timeout(async {
            let mut tx = self.pool.begin().await?;

            let existing: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM crypto_deposits WHERE provider = $1 AND external_id = $2",
            )
            .bind(provider)
            .bind(external_id)
            .fetch_optional(&mut *tx)
            .await?;

            if existing.is_some() {
                let current: Decimal =
                    sqlx::query_scalar("SELECT balance FROM users WHERE id = $1")
                        .bind(user_id.0)
                        .fetch_one(&mut *tx)
                        .await?;
                return Ok(current);
            }

            sqlx::query(
                "INSERT INTO crypto_deposits (provider, external_id, user_id) VALUES ($1, $2, $3)",
            )
            .bind(provider)
            .bind(external_id)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await?;

            let new_balance: Decimal = sqlx::query_scalar(
                "UPDATE users SET balance = balance + $1 WHERE id = $2 RETURNING balance",
            )
            .bind(amount)
            .bind(user_id.0)
            .fetch_one(&mut *tx)
            .await?;

            insert_transaction(
                &mut tx,
                user_id,
                TransactionType::CryptoDeposit,
                amount,
                &format!("crypto deposit via {provider}"),
            )
            .await?;

            tx.commit().await?;
            Ok(new_balance)
        })
        .await
    }

    pub async fn get_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<crate::models::User>, LedgerError> {
        self.with_timeout(async {
            sqlx::query_as::<_, crate::models::User>("SELECT * FROM users WHERE id = $1")
                .bind(user_id.0)
                .fetch_optional(&self.pool)
                .await
        })
        .await
    }

    pub async fn get_room(&self, room_id: RoomId) -> Result<Option<Room>, LedgerError> {
        self.with_timeout(async {
            sqlx::query_as::<_, Room>("SELECT * FROM rooms WHERE id = $1")
                .bind(room_id.0)
                .fetch_optional(&self.pool)
                .await
        })
        .await
    }

    pub async fn read_round(&self, room_id: RoomId) -> Result<Option<Round>, LedgerError> {
        self.with_timeout(async {
            sqlx::query_as::<_, Round>(
                r#"
                SELECT * FROM game_rounds
                WHERE room_id = $1 AND archived_at IS NULL
                ORDER BY created_at DESC LIMIT 1
                "#,
            )
            .bind(room_id.0)
            .fetch_optional(&self.pool)
            .await
        })
        .await
    }

    pub async fn list_participants(
        &self,
        round_id: RoundId,
    ) -> Result<Vec<Participation>, LedgerError> {
        self.with_timeout(async {
            sqlx::query_as::<_, Participation>(
                "SELECT * FROM round_participants WHERE round_id = $1 ORDER BY join_timestamp",
            )
            .bind(round_id.0)
            .fetch_all(&self.pool)
            .await
        })
        .await
    }

    pub async fn read_balance(&self, user_id: UserId) -> Result<Decimal, LedgerError> {
        self.with_timeout(async {
            sqlx::query_scalar("SELECT balance FROM users WHERE id = $1")
                .bind(user_id.0)
                .fetch_one(&self.pool)
                .await
        })
        .await
    }
}

async fn insert_transaction(
    tx: &mut Transaction<'_, Postgres>,
    user_id: UserId,
    kind: TransactionType,
    amount: Decimal,
    description: &str,
) -> Result<TransactionId, sqlx::Error> {
    let id = TransactionId::new();
    sqlx::query(
        r#"
        INSERT INTO transactions (id, user_id, tx_type, amount, status, description, created_at)
        VALUES ($1, $2, $3, $4, 'completed', $5, now())
        "#,
    )
    .bind(id.0)
    .bind(user_id.0)
    .bind(kind)
    .bind(amount)
    .bind(description)
    .execute(&mut **tx)
    .await?;
    Ok(id)
}
