//! PostgreSQL ledger store
//!
//! One `sqlx` transaction per [`LedgerTx`]. Concurrency control:
//! - `SELECT ... FOR UPDATE` on wallet rows, always in ascending id order
//! - unique constraints on idempotency keys, withdrawal codes and reversal
//!   targets, written with `ON CONFLICT DO NOTHING`
//! - CAS updates (`WHERE status = $expected`) for every status transition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Postgres, Row, Transaction};
use std::time::Duration;

use super::{LedgerStore, LedgerTx, schema};
use crate::core_types::{
    CardId, CardTxId, Currency, DepositId, TransferId, UserId, WalletId, WithdrawalId, parse_id,
};
use crate::error::LedgerError;
use crate::ledger::{EntryLink, EntryType, LedgerEntry};
use crate::models::{
    Card, CardTransaction, CardTxStatus, Deposit, FxLeg, Reversal, ReversalKind,
    ReversalTarget, ReviewInfo, Transfer, TransferStatus, Wallet, WalletKind, Withdrawal,
    WithdrawalStatus,
};

/// PostgreSQL-backed [`LedgerStore`]
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and make sure the schema exists
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        tracing::info!("PostgreSQL connection pool established");

        schema::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx: Some(tx) }))
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        self.health_check().await
    }
}

struct PgLedgerTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgLedgerTx {
    fn conn(&mut self) -> Result<&mut PgConnection, LedgerError> {
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(LedgerError::System("Transaction already committed".into())),
        }
    }
}

// ============================================================================
// Row mapping
// ============================================================================

const WALLET_COLUMNS: &str = "wallet_id, owner_id, currency, kind, created_at";

const ENTRY_COLUMNS: &str = "entry_id, wallet_id, amount, entry_type, link_kind, link_id, \
     reference, idempotency_key, created_at";

const TRANSFER_COLUMNS: &str = "transfer_id, from_wallet, to_wallet, amount, currency, status, \
     idempotency_key, fx_rate, fx_currency, risk_ref, reviewer, review_note, reviewed_at, \
     created_at, updated_at";

const DEPOSIT_COLUMNS: &str = "deposit_id, wallet_id, amount, currency, source, external_ref, \
     idempotency_key, created_at";

const WITHDRAWAL_COLUMNS: &str = "withdrawal_id, user_id, wallet_id, amount, currency, code, \
     idempotency_key, expires_at, status, agent_id, float_wallet_id, fee_amount, net_amount, created_at, \
     completed_at";

const REVERSAL_COLUMNS: &str =
    "reversal_id, target_type, target_id, reason, idempotency_key, created_at";

const CARD_TX_COLUMNS: &str = "card_tx_id, card_id, wallet_id, amount, currency, status, \
     capture_amount, hold_entry_id, merchant, decline_reason, idempotency_key, created_at, \
     updated_at";

fn currency_col(row: &PgRow, col: &str) -> Result<Currency, LedgerError> {
    let raw: String = row.try_get(col)?;
    Currency::new(&raw).map_err(|_| LedgerError::System(format!("Invalid {}: {}", col, raw)))
}

fn opt_id<T: std::str::FromStr>(row: &PgRow, col: &str) -> Result<Option<T>, LedgerError> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| parse_id(&s, col)).transpose()
}

fn row_to_wallet(row: &PgRow) -> Result<Wallet, LedgerError> {
    Ok(Wallet {
        wallet_id: parse_id(&row.try_get::<String, _>("wallet_id")?, "wallet_id")?,
        owner_id: row.try_get("owner_id")?,
        currency: currency_col(row, "currency")?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_entry(row: &PgRow) -> Result<LedgerEntry, LedgerError> {
    let link_kind: Option<String> = row.try_get("link_kind")?;
    let link_id: Option<String> = row.try_get("link_id")?;
    let link = match (link_kind, link_id) {
        (Some(kind), Some(id)) => Some(EntryLink::from_parts(&kind, &id)?),
        _ => None,
    };
    Ok(LedgerEntry {
        entry_id: parse_id(&row.try_get::<String, _>("entry_id")?, "entry_id")?,
        wallet_id: parse_id(&row.try_get::<String, _>("wallet_id")?, "wallet_id")?,
        amount: row.try_get("amount")?,
        entry_type: row.try_get::<String, _>("entry_type")?.parse()?,
        link,
        reference: row.try_get("reference")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_transfer(row: &PgRow) -> Result<Transfer, LedgerError> {
    let fx_rate: Option<Decimal> = row.try_get("fx_rate")?;
    let fx = match fx_rate {
        Some(rate) => Some(FxLeg {
            rate,
            to_currency: currency_col(row, "fx_currency")?,
        }),
        None => None,
    };
    let reviewer: Option<String> = row.try_get("reviewer")?;
    let review = match reviewer {
        Some(reviewer) => Some(ReviewInfo {
            reviewer,
            note: row.try_get("review_note")?,
            reviewed_at: row.try_get("reviewed_at")?,
        }),
        None => None,
    };
    Ok(Transfer {
        transfer_id: parse_id(&row.try_get::<String, _>("transfer_id")?, "transfer_id")?,
        from_wallet: parse_id(&row.try_get::<String, _>("from_wallet")?, "from_wallet")?,
        to_wallet: parse_id(&row.try_get::<String, _>("to_wallet")?, "to_wallet")?,
        amount: row.try_get("amount")?,
        currency: currency_col(row, "currency")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        idempotency_key: row.try_get("idempotency_key")?,
        fx,
        risk_ref: row.try_get("risk_ref")?,
        review,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_deposit(row: &PgRow) -> Result<Deposit, LedgerError> {
    Ok(Deposit {
        deposit_id: parse_id(&row.try_get::<String, _>("deposit_id")?, "deposit_id")?,
        wallet_id: parse_id(&row.try_get::<String, _>("wallet_id")?, "wallet_id")?,
        amount: row.try_get("amount")?,
        currency: currency_col(row, "currency")?,
        source: row.try_get("source")?,
        external_ref: row.try_get("external_ref")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_withdrawal(row: &PgRow) -> Result<Withdrawal, LedgerError> {
    Ok(Withdrawal {
        withdrawal_id: parse_id(&row.try_get::<String, _>("withdrawal_id")?, "withdrawal_id")?,
        user_id: row.try_get("user_id")?,
        wallet_id: parse_id(&row.try_get::<String, _>("wallet_id")?, "wallet_id")?,
        amount: row.try_get("amount")?,
        currency: currency_col(row, "currency")?,
        code: row.try_get("code")?,
        idempotency_key: row.try_get("idempotency_key")?,
        expires_at: row.try_get("expires_at")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        agent_id: row.try_get("agent_id")?,
        float_wallet_id: opt_id(row, "float_wallet_id")?,
        fee_amount: row.try_get("fee_amount")?,
        net_amount: row.try_get("net_amount")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn row_to_reversal(row: &PgRow) -> Result<Reversal, LedgerError> {
    let kind: ReversalKind = row.try_get::<String, _>("target_type")?.parse()?;
    let target_id: String = row.try_get("target_id")?;
    Ok(Reversal {
        reversal_id: parse_id(&row.try_get::<String, _>("reversal_id")?, "reversal_id")?,
        target: ReversalTarget::from_parts(kind, &target_id)?,
        reason: row.try_get("reason")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_card(row: &PgRow) -> Result<Card, LedgerError> {
    Ok(Card {
        card_id: parse_id(&row.try_get::<String, _>("card_id")?, "card_id")?,
        wallet_id: parse_id(&row.try_get::<String, _>("wallet_id")?, "wallet_id")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_card_tx(row: &PgRow) -> Result<CardTransaction, LedgerError> {
    Ok(CardTransaction {
        card_tx_id: parse_id(&row.try_get::<String, _>("card_tx_id")?, "card_tx_id")?,
        card_id: parse_id(&row.try_get::<String, _>("card_id")?, "card_id")?,
        wallet_id: parse_id(&row.try_get::<String, _>("wallet_id")?, "wallet_id")?,
        amount: row.try_get("amount")?,
        currency: currency_col(row, "currency")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        capture_amount: row.try_get("capture_amount")?,
        hold_entry_id: opt_id(row, "hold_entry_id")?,
        merchant: row.try_get("merchant")?,
        decline_reason: row.try_get("decline_reason")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ============================================================================
// LedgerTx
// ============================================================================

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn insert_wallet(&mut self, wallet: &Wallet) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO wallets (wallet_id, owner_id, currency, kind, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(wallet.wallet_id.to_string())
        .bind(wallet.owner_id)
        .bind(wallet.currency.as_str())
        .bind(wallet.kind.as_str())
        .bind(wallet.created_at)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn wallet(&mut self, id: WalletId) -> Result<Option<Wallet>, LedgerError> {
        let sql = format!("SELECT {} FROM wallets WHERE wallet_id = $1", WALLET_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_wallet).transpose()
    }

    async fn find_wallet(
        &mut self,
        owner: UserId,
        currency: &Currency,
        kind: WalletKind,
    ) -> Result<Option<Wallet>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM wallets WHERE owner_id = $1 AND currency = $2 AND kind = $3",
            WALLET_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(owner)
            .bind(currency.as_str())
            .bind(kind.as_str())
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_wallet).transpose()
    }

    async fn lock_wallets(&mut self, ids: &[WalletId]) -> Result<Vec<Wallet>, LedgerError> {
        let mut sorted: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        sorted.sort();
        sorted.dedup();

        // ORDER BY makes Postgres take the row locks in ascending id order
        let sql = format!(
            "SELECT {} FROM wallets WHERE wallet_id = ANY($1) ORDER BY wallet_id FOR UPDATE",
            WALLET_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(sorted)
            .fetch_all(self.conn()?)
            .await?;
        let locked = rows
            .iter()
            .map(row_to_wallet)
            .collect::<Result<Vec<_>, _>>()?;

        ids.iter()
            .map(|id| {
                locked
                    .iter()
                    .find(|w| w.wallet_id == *id)
                    .cloned()
                    .ok_or_else(|| LedgerError::NotFound(format!("wallet {}", id)))
            })
            .collect()
    }

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (entry_id, wallet_id, amount, entry_type, link_kind, link_id,
                 reference, idempotency_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.entry_id.to_string())
        .bind(entry.wallet_id.to_string())
        .bind(entry.amount)
        .bind(entry.entry_type.as_str())
        .bind(entry.link.map(|l| l.kind()))
        .bind(entry.link.map(|l| l.id_string()))
        .bind(&entry.reference)
        .bind(&entry.idempotency_key)
        .bind(entry.created_at)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn entry_totals(
        &mut self,
        wallet: WalletId,
    ) -> Result<Vec<(EntryType, Decimal)>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT entry_type, SUM(amount) AS total
            FROM ledger_entries
            WHERE wallet_id = $1
            GROUP BY entry_type
            "#,
        )
        .bind(wallet.to_string())
        .fetch_all(self.conn()?)
        .await?;

        rows.iter()
            .map(|row| {
                let t: EntryType = row.try_get::<String, _>("entry_type")?.parse()?;
                let total: Decimal = row.try_get("total")?;
                Ok((t, total))
            })
            .collect()
    }

    async fn entries_for_wallet(
        &mut self,
        wallet: WalletId,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE wallet_id = $1 ORDER BY seq",
            ENTRY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(wallet.to_string())
            .fetch_all(self.conn()?)
            .await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn entries_for_link(&mut self, link: EntryLink) -> Result<Vec<LedgerEntry>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE link_kind = $1 AND link_id = $2 ORDER BY seq",
            ENTRY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(link.kind())
            .bind(link.id_string())
            .fetch_all(self.conn()?)
            .await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn entry_by_key(&mut self, key: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE idempotency_key = $1",
            ENTRY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_entry).transpose()
    }

    async fn insert_transfer(&mut self, t: &Transfer) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfers
                (transfer_id, from_wallet, to_wallet, amount, currency, status,
                 idempotency_key, fx_rate, fx_currency, risk_ref, reviewer, review_note,
                 reviewed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(t.transfer_id.to_string())
        .bind(t.from_wallet.to_string())
        .bind(t.to_wallet.to_string())
        .bind(t.amount)
        .bind(t.currency.as_str())
        .bind(t.status.as_str())
        .bind(&t.idempotency_key)
        .bind(t.fx.as_ref().map(|fx| fx.rate))
        .bind(t.fx.as_ref().map(|fx| fx.to_currency.to_string()))
        .bind(&t.risk_ref)
        .bind(t.review.as_ref().map(|r| r.reviewer.clone()))
        .bind(t.review.as_ref().and_then(|r| r.note.clone()))
        .bind(t.review.as_ref().map(|r| r.reviewed_at))
        .bind(t.created_at)
        .bind(t.updated_at)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn transfer(&mut self, id: TransferId) -> Result<Option<Transfer>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM transfers WHERE transfer_id = $1",
            TRANSFER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn transfer_by_key(&mut self, key: &str) -> Result<Option<Transfer>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM transfers WHERE idempotency_key = $1",
            TRANSFER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn update_transfer_status(
        &mut self,
        id: TransferId,
        expected: TransferStatus,
        new_status: TransferStatus,
        review: Option<&ReviewInfo>,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET status = $1,
                reviewer = COALESCE($2, reviewer),
                review_note = COALESCE($3, review_note),
                reviewed_at = COALESCE($4, reviewed_at),
                updated_at = $5
            WHERE transfer_id = $6 AND status = $7
            "#,
        )
        .bind(new_status.as_str())
        .bind(review.map(|r| r.reviewer.clone()))
        .bind(review.and_then(|r| r.note.clone()))
        .bind(review.map(|r| r.reviewed_at))
        .bind(now)
        .bind(id.to_string())
        .bind(expected.as_str())
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_deposit(&mut self, d: &Deposit) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO deposits
                (deposit_id, wallet_id, amount, currency, source, external_ref,
                 idempotency_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(d.deposit_id.to_string())
        .bind(d.wallet_id.to_string())
        .bind(d.amount)
        .bind(d.currency.as_str())
        .bind(&d.source)
        .bind(&d.external_ref)
        .bind(&d.idempotency_key)
        .bind(d.created_at)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn deposit(&mut self, id: DepositId) -> Result<Option<Deposit>, LedgerError> {
        let sql = format!("SELECT {} FROM deposits WHERE deposit_id = $1", DEPOSIT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_deposit).transpose()
    }

    async fn deposit_by_key(&mut self, key: &str) -> Result<Option<Deposit>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM deposits WHERE idempotency_key = $1",
            DEPOSIT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_deposit).transpose()
    }

    async fn insert_withdrawal(&mut self, w: &Withdrawal) -> Result<bool, LedgerError> {
        // No conflict target: a taken code and a taken key both skip the row
        let result = sqlx::query(
            r#"
            INSERT INTO withdrawals
                (withdrawal_id, user_id, wallet_id, amount, currency, code, idempotency_key,
                 expires_at, status, agent_id, float_wallet_id, fee_amount, net_amount,
                 created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(w.withdrawal_id.to_string())
        .bind(w.user_id)
        .bind(w.wallet_id.to_string())
        .bind(w.amount)
        .bind(w.currency.as_str())
        .bind(&w.code)
        .bind(&w.idempotency_key)
        .bind(w.expires_at)
        .bind(w.status.as_str())
        .bind(w.agent_id)
        .bind(w.float_wallet_id.map(|id| id.to_string()))
        .bind(w.fee_amount)
        .bind(w.net_amount)
        .bind(w.created_at)
        .bind(w.completed_at)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn withdrawal(&mut self, id: WithdrawalId) -> Result<Option<Withdrawal>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM withdrawals WHERE withdrawal_id = $1",
            WITHDRAWAL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_withdrawal).transpose()
    }

    async fn withdrawal_by_key(&mut self, key: &str) -> Result<Option<Withdrawal>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM withdrawals WHERE idempotency_key = $1",
            WITHDRAWAL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_withdrawal).transpose()
    }

    async fn withdrawal_by_code(&mut self, code: &str) -> Result<Option<Withdrawal>, LedgerError> {
        // Row lock: two agents racing on one code serialize here
        let sql = format!(
            "SELECT {} FROM withdrawals WHERE code = $1 FOR UPDATE",
            WITHDRAWAL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(code)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_withdrawal).transpose()
    }

    async fn update_withdrawal(
        &mut self,
        w: &Withdrawal,
        expected: WithdrawalStatus,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE withdrawals
            SET status = $1, agent_id = $2, float_wallet_id = $3, fee_amount = $4,
                net_amount = $5, completed_at = $6
            WHERE withdrawal_id = $7 AND status = $8
            "#,
        )
        .bind(w.status.as_str())
        .bind(w.agent_id)
        .bind(w.float_wallet_id.map(|id| id.to_string()))
        .bind(w.fee_amount)
        .bind(w.net_amount)
        .bind(w.completed_at)
        .bind(w.withdrawal_id.to_string())
        .bind(expected.as_str())
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expired_withdrawals(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Withdrawal>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM withdrawals WHERE status = 'pending' AND expires_at < $1 \
             ORDER BY expires_at LIMIT $2",
            WITHDRAWAL_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(self.conn()?)
            .await?;
        rows.iter().map(row_to_withdrawal).collect()
    }

    async fn insert_reversal(&mut self, r: &Reversal) -> Result<bool, LedgerError> {
        // No conflict target: either the key or the (target_type, target_id)
        // constraint suppresses the insert
        let result = sqlx::query(
            r#"
            INSERT INTO reversals
                (reversal_id, target_type, target_id, reason, idempotency_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(r.reversal_id.to_string())
        .bind(r.target.kind().as_str())
        .bind(r.target.id_string())
        .bind(&r.reason)
        .bind(&r.idempotency_key)
        .bind(r.created_at)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reversal_by_key(&mut self, key: &str) -> Result<Option<Reversal>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM reversals WHERE idempotency_key = $1",
            REVERSAL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_reversal).transpose()
    }

    async fn reversal_for_target(
        &mut self,
        target: ReversalTarget,
    ) -> Result<Option<Reversal>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM reversals WHERE target_type = $1 AND target_id = $2",
            REVERSAL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(target.kind().as_str())
            .bind(target.id_string())
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_reversal).transpose()
    }

    async fn insert_card(&mut self, card: &Card) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO cards (card_id, wallet_id, active, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(card.card_id.to_string())
        .bind(card.wallet_id.to_string())
        .bind(card.active)
        .bind(card.created_at)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn card(&mut self, id: CardId) -> Result<Option<Card>, LedgerError> {
        let row = sqlx::query(
            "SELECT card_id, wallet_id, active, created_at FROM cards WHERE card_id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(self.conn()?)
        .await?;
        row.as_ref().map(row_to_card).transpose()
    }

    async fn insert_card_tx(&mut self, c: &CardTransaction) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO card_transactions
                (card_tx_id, card_id, wallet_id, amount, currency, status, capture_amount,
                 hold_entry_id, merchant, decline_reason, idempotency_key, created_at,
                 updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(c.card_tx_id.to_string())
        .bind(c.card_id.to_string())
        .bind(c.wallet_id.to_string())
        .bind(c.amount)
        .bind(c.currency.as_str())
        .bind(c.status.as_str())
        .bind(c.capture_amount)
        .bind(c.hold_entry_id.map(|id| id.to_string()))
        .bind(&c.merchant)
        .bind(&c.decline_reason)
        .bind(&c.idempotency_key)
        .bind(c.created_at)
        .bind(c.updated_at)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn card_tx(&mut self, id: CardTxId) -> Result<Option<CardTransaction>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM card_transactions WHERE card_tx_id = $1 FOR UPDATE",
            CARD_TX_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_card_tx).transpose()
    }

    async fn card_tx_by_key(&mut self, key: &str) -> Result<Option<CardTransaction>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM card_transactions WHERE idempotency_key = $1",
            CARD_TX_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(self.conn()?)
            .await?;
        row.as_ref().map(row_to_card_tx).transpose()
    }

    async fn update_card_tx(
        &mut self,
        c: &CardTransaction,
        expected: CardTxStatus,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE card_transactions
            SET status = $1, capture_amount = $2, updated_at = $3
            WHERE card_tx_id = $4 AND status = $5
            "#,
        )
        .bind(c.status.as_str())
        .bind(c.capture_amount)
        .bind(c.updated_at)
        .bind(c.card_tx_id.to_string())
        .bind(expected.as_str())
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(&mut self) -> Result<(), LedgerError> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(LedgerError::System("Transaction already committed".into())),
        }
    }
}
