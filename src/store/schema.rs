//! PostgreSQL schema
//!
//! Applied idempotently at startup by [`init_schema`]. Ids are ULID TEXT,
//! amounts are unconstrained NUMERIC so stored values round-trip exactly.

use sqlx::PgPool;

use crate::error::LedgerError;

/// Create all ledger tables if missing
pub async fn init_schema(pool: &PgPool) -> Result<(), LedgerError> {
    for (name, ddl) in SCHEMA {
        sqlx::query(ddl).execute(pool).await.map_err(|e| {
            tracing::error!(step = name, error = %e, "Schema setup failed");
            LedgerError::from(e)
        })?;
    }
    tracing::info!("Ledger schema ready");
    Ok(())
}

const SCHEMA: &[(&str, &str)] = &[
    ("wallets", CREATE_WALLETS_TABLE),
    ("ledger_entries", CREATE_LEDGER_ENTRIES_TABLE),
    ("ledger_entries_wallet_idx", CREATE_LEDGER_ENTRIES_WALLET_INDEX),
    ("ledger_entries_link_idx", CREATE_LEDGER_ENTRIES_LINK_INDEX),
    ("append_only_fn", CREATE_APPEND_ONLY_FUNCTION),
    ("append_only_trigger_drop", DROP_APPEND_ONLY_TRIGGER),
    ("append_only_trigger", CREATE_APPEND_ONLY_TRIGGER),
    ("transfers", CREATE_TRANSFERS_TABLE),
    ("deposits", CREATE_DEPOSITS_TABLE),
    ("withdrawals", CREATE_WITHDRAWALS_TABLE),
    ("withdrawals_expiry_idx", CREATE_WITHDRAWALS_EXPIRY_INDEX),
    ("reversals", CREATE_REVERSALS_TABLE),
    ("cards", CREATE_CARDS_TABLE),
    ("card_transactions", CREATE_CARD_TRANSACTIONS_TABLE),
];

const CREATE_WALLETS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS wallets (
    wallet_id   TEXT PRIMARY KEY,
    owner_id    BIGINT NOT NULL,
    currency    TEXT NOT NULL,
    kind        TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    UNIQUE (owner_id, currency, kind)
)
"#;

const CREATE_LEDGER_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_entries (
    seq              BIGSERIAL,
    entry_id         TEXT PRIMARY KEY,
    wallet_id        TEXT NOT NULL REFERENCES wallets (wallet_id),
    amount           NUMERIC NOT NULL,
    entry_type       TEXT NOT NULL,
    link_kind        TEXT,
    link_id          TEXT,
    reference        TEXT,
    idempotency_key  TEXT UNIQUE,
    created_at       TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_LEDGER_ENTRIES_WALLET_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS ledger_entries_wallet_idx ON ledger_entries (wallet_id, seq)
"#;

const CREATE_LEDGER_ENTRIES_LINK_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS ledger_entries_link_idx ON ledger_entries (link_kind, link_id)
"#;

const CREATE_APPEND_ONLY_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION ledger_entries_append_only() RETURNS trigger AS $$
BEGIN
    RAISE EXCEPTION 'ledger_entries is append-only';
END;
$$ LANGUAGE plpgsql
"#;

const DROP_APPEND_ONLY_TRIGGER: &str = r#"
DROP TRIGGER IF EXISTS ledger_entries_no_mutation ON ledger_entries
"#;

const CREATE_APPEND_ONLY_TRIGGER: &str = r#"
CREATE TRIGGER ledger_entries_no_mutation
    BEFORE UPDATE OR DELETE ON ledger_entries
    FOR EACH ROW EXECUTE FUNCTION ledger_entries_append_only()
"#;

const CREATE_TRANSFERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transfers (
    transfer_id      TEXT PRIMARY KEY,
    from_wallet      TEXT NOT NULL REFERENCES wallets (wallet_id),
    to_wallet        TEXT NOT NULL REFERENCES wallets (wallet_id),
    amount           NUMERIC NOT NULL,
    currency         TEXT NOT NULL,
    status           TEXT NOT NULL,
    idempotency_key  TEXT NOT NULL UNIQUE,
    fx_rate          NUMERIC,
    fx_currency      TEXT,
    risk_ref         TEXT,
    reviewer         TEXT,
    review_note      TEXT,
    reviewed_at      TIMESTAMPTZ,
    created_at       TIMESTAMPTZ NOT NULL,
    updated_at       TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_DEPOSITS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS deposits (
    deposit_id       TEXT PRIMARY KEY,
    wallet_id        TEXT NOT NULL REFERENCES wallets (wallet_id),
    amount           NUMERIC NOT NULL,
    currency         TEXT NOT NULL,
    source           TEXT NOT NULL,
    external_ref     TEXT NOT NULL,
    idempotency_key  TEXT NOT NULL UNIQUE,
    created_at       TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_WITHDRAWALS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS withdrawals (
    withdrawal_id    TEXT PRIMARY KEY,
    user_id          BIGINT NOT NULL,
    wallet_id        TEXT NOT NULL REFERENCES wallets (wallet_id),
    amount           NUMERIC NOT NULL,
    currency         TEXT NOT NULL,
    code             TEXT NOT NULL UNIQUE,
    idempotency_key  TEXT NOT NULL UNIQUE,
    expires_at       TIMESTAMPTZ NOT NULL,
    status           TEXT NOT NULL,
    agent_id         BIGINT,
    float_wallet_id  TEXT REFERENCES wallets (wallet_id),
    fee_amount       NUMERIC,
    net_amount       NUMERIC,
    created_at       TIMESTAMPTZ NOT NULL,
    completed_at     TIMESTAMPTZ
)
"#;

const CREATE_WITHDRAWALS_EXPIRY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS withdrawals_pending_expiry_idx
    ON withdrawals (expires_at) WHERE status = 'pending'
"#;

const CREATE_REVERSALS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS reversals (
    reversal_id      TEXT PRIMARY KEY,
    target_type      TEXT NOT NULL,
    target_id        TEXT NOT NULL,
    reason           TEXT NOT NULL,
    idempotency_key  TEXT NOT NULL UNIQUE,
    created_at       TIMESTAMPTZ NOT NULL,
    UNIQUE (target_type, target_id)
)
"#;

const CREATE_CARDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS cards (
    card_id     TEXT PRIMARY KEY,
    wallet_id   TEXT NOT NULL REFERENCES wallets (wallet_id),
    active      BOOLEAN NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_CARD_TRANSACTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS card_transactions (
    card_tx_id      TEXT PRIMARY KEY,
    card_id         TEXT NOT NULL REFERENCES cards (card_id),
    wallet_id       TEXT NOT NULL REFERENCES wallets (wallet_id),
    amount          NUMERIC NOT NULL,
    currency        TEXT NOT NULL,
    status          TEXT NOT NULL,
    capture_amount  NUMERIC,
    hold_entry_id   TEXT,
    merchant        TEXT,
    decline_reason  TEXT,
    idempotency_key TEXT NOT NULL UNIQUE,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL
)
"#;
