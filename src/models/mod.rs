//! Data model (spec §3)
//!
//! Plain Rust types mirroring the entities of the spec: `User`, `Room`,
//! `Round`, `Participation`, `Transaction`, `IdempotencyRecord`,
//! `AccountLockout`, `TokenRevocation`. Money is `rust_decimal::Decimal`
//! fixed at 2 fractional digits, never a float — the same representation
//! the ledger code this is grounded on uses throughout.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
        )]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(UserId);
uuid_id!(RoomId);
uuid_id!(RoundId);
uuid_id!(ParticipationId);
uuid_id!(TransactionId);

/// The platform's own treasury account, seeded by the initial migration.
/// Commission transactions debited from a joining player (spec §4.1's
/// "commission-accounting transaction for the platform account") are
/// credited here, so `balance = Σ signed(Completed transactions)` holds
/// for every account, including the platform's.
pub const PLATFORM_USER_ID: UserId = UserId(Uuid::from_u128(1));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Role {
    Player,
    Admin,
    Platform,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub balance: Decimal,
    pub role: Role,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum RoomStatus {
    Waiting,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub entry_fee: Decimal,
    pub min_participants: i32,
    pub max_participants: i32,
    pub winner_count: i32,
    /// Platform commission rate in [0, 1).
    pub commission_rate: Decimal,
    pub status: RoomStatus,
}

/// 64-lowercase-hex-encoded SHA-256 digest / HMAC output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct HexDigest(pub String);

impl HexDigest {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }
}

impl TryFrom<String> for HexDigest {
    type Error = &'static str;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.len() != 64
            || !value.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            return Err("expected 64 lowercase hex characters");
        }
        Ok(Self(value))
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Round {
    pub id: RoundId,
    pub room_id: RoomId,
    /// Secret until reveal. Never serialized to a client before payout.
    #[serde(skip_serializing)]
    pub server_seed: Option<HexDigest>,
    pub server_seed_hash: HexDigest,
    pub client_seed: Option<HexDigest>,
    pub prize_pool: Decimal,
    pub winner_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Participation {
    pub id: ParticipationId,
    pub round_id: RoundId,
    pub user_id: UserId,
    pub bet_amount: Decimal,
    pub join_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Bet,
    Win,
    Refund,
    Adjustment,
    CryptoDeposit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    #[sqlx(rename = "tx_type")]
    pub kind: TransactionType,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub user_id: UserId,
    pub client_key: String,
    pub status: u16,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct AccountLockout {
    pub attempts: u32,
    pub locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(pub Uuid);

/// Validate a client-supplied idempotency key per spec §4.2/§6: 16-128 chars.
pub fn validate_idempotency_key(key: &str) -> Result<(), &'static str> {
    if (16..=128).contains(&key.len()) {
        Ok(())
    } else {
        Err("idempotency key must be 16-128 characters")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_boundaries() {
        assert!(validate_idempotency_key(&"a".repeat(15)).is_err());
        assert!(validate_idempotency_key(&"a".repeat(16)).is_ok());
        assert!(validate_idempotency_key(&"a".repeat(128)).is_ok());
        assert!(validate_idempotency_key(&"a".repeat(129)).is_err());
    }

    #[test]
    fn hex_digest_rejects_bad_format() {
        assert!(HexDigest::try_from("a".repeat(64)).is_ok());
        assert!(HexDigest::try_from("A".repeat(64)).is_err());
        assert!(HexDigest::try_from("a".repeat(63)).is_err());
    }
}
