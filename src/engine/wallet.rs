//! Wallet provisioning and read-side queries

use rust_decimal::Decimal;
use tracing::info;

use super::{LedgerEngine, balance_in};
use crate::core_types::{
    CardId, CardTxId, Currency, DepositId, TransferId, UserId, WalletId, WithdrawalId,
};
use crate::error::LedgerError;
use crate::idempotency::Guarded;
use crate::ledger::{Balance, EntryLink, LedgerEntry};
use crate::models::{Card, CardTransaction, Deposit, Transfer, Wallet, WalletKind, Withdrawal};

impl LedgerEngine {
    /// Open the `(owner, currency, kind)` wallet; replays if it already exists
    pub async fn open_wallet(
        &self,
        owner: UserId,
        currency: Currency,
        kind: WalletKind,
    ) -> Result<Guarded<Wallet>, LedgerError> {
        let mut tx = self.begin().await?;
        if let Some(existing) = tx.find_wallet(owner, &currency, kind).await? {
            return Ok(Guarded::replay(existing));
        }

        let wallet = Wallet {
            wallet_id: WalletId::new(),
            owner_id: owner,
            currency,
            kind,
            created_at: self.now(),
        };
        if !tx.insert_wallet(&wallet).await? {
            drop(tx);
            let mut tx = self.begin().await?;
            return tx
                .find_wallet(owner, &wallet.currency, kind)
                .await?
                .map(Guarded::replay)
                .ok_or_else(|| LedgerError::System("wallet vanished after conflict".into()));
        }
        tx.commit().await?;

        info!(
            wallet_id = %wallet.wallet_id,
            owner_id = owner,
            currency = %wallet.currency,
            kind = %wallet.kind,
            "Wallet opened"
        );
        Ok(Guarded::fresh(wallet))
    }

    /// Issue a card against an existing wallet
    pub async fn register_card(&self, wallet_id: WalletId) -> Result<Card, LedgerError> {
        let mut tx = self.begin().await?;
        if tx.wallet(wallet_id).await?.is_none() {
            return Err(LedgerError::NotFound(format!("wallet {}", wallet_id)));
        }
        let card = Card {
            card_id: CardId::new(),
            wallet_id,
            active: true,
            created_at: self.now(),
        };
        tx.insert_card(&card).await?;
        tx.commit().await?;
        info!(card_id = %card.card_id, wallet_id = %wallet_id, "Card registered");
        Ok(card)
    }

    pub async fn get_wallet(&self, wallet_id: WalletId) -> Result<Wallet, LedgerError> {
        let mut tx = self.begin().await?;
        tx.wallet(wallet_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("wallet {}", wallet_id)))
    }

    /// Replay the wallet's entries into `{total, held, available}`.
    /// Always authoritative; refreshes the cached total as a side effect.
    pub async fn compute_balance(&self, wallet_id: WalletId) -> Result<Balance, LedgerError> {
        let seen = self.cache.generation(wallet_id);
        let mut tx = self.begin().await?;
        if tx.wallet(wallet_id).await?.is_none() {
            return Err(LedgerError::NotFound(format!("wallet {}", wallet_id)));
        }
        let balance = balance_in(tx.as_mut(), wallet_id).await?;
        drop(tx);
        self.cache.put(wallet_id, seen, balance.total);
        Ok(balance)
    }

    /// `total` for read-mostly paths; may be up to one TTL stale unless a
    /// write through this engine invalidated it
    pub async fn cached_total(&self, wallet_id: WalletId) -> Result<Decimal, LedgerError> {
        if let Some(total) = self.cache.get(wallet_id) {
            return Ok(total);
        }
        Ok(self.compute_balance(wallet_id).await?.total)
    }

    /// All entries of a wallet, oldest first
    pub async fn wallet_statement(
        &self,
        wallet_id: WalletId,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut tx = self.begin().await?;
        if tx.wallet(wallet_id).await?.is_none() {
            return Err(LedgerError::NotFound(format!("wallet {}", wallet_id)));
        }
        tx.entries_for_wallet(wallet_id).await
    }

    pub async fn get_transfer(&self, transfer_id: TransferId) -> Result<Transfer, LedgerError> {
        let mut tx = self.begin().await?;
        tx.transfer(transfer_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("transfer {}", transfer_id)))
    }

    /// Every entry linked to a transfer, compensations included
    pub async fn transfer_entries(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut tx = self.begin().await?;
        if tx.transfer(transfer_id).await?.is_none() {
            return Err(LedgerError::NotFound(format!("transfer {}", transfer_id)));
        }
        tx.entries_for_link(EntryLink::Transfer(transfer_id)).await
    }

    pub async fn get_deposit(&self, deposit_id: DepositId) -> Result<Deposit, LedgerError> {
        let mut tx = self.begin().await?;
        tx.deposit(deposit_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("deposit {}", deposit_id)))
    }

    pub async fn get_withdrawal(
        &self,
        withdrawal_id: WithdrawalId,
    ) -> Result<Withdrawal, LedgerError> {
        let mut tx = self.begin().await?;
        tx.withdrawal(withdrawal_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("withdrawal {}", withdrawal_id)))
    }

    pub async fn get_card_transaction(
        &self,
        card_tx_id: CardTxId,
    ) -> Result<CardTransaction, LedgerError> {
        let mut tx = self.begin().await?;
        tx.card_tx(card_tx_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("card transaction {}", card_tx_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_open_wallet_is_idempotent() {
        let h = harness();
        let first = h.engine.open_wallet(5, usd(), WalletKind::User).await.unwrap();
        let second = h.engine.open_wallet(5, usd(), WalletKind::User).await.unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.value, second.value);

        let float = h
            .engine
            .open_wallet(5, usd(), WalletKind::DistributorFloat)
            .await
            .unwrap();
        assert_ne!(float.value.wallet_id, first.value.wallet_id);
    }

    #[tokio::test]
    async fn test_unknown_wallet() {
        let h = harness();
        let missing = WalletId::new();
        assert!(matches!(
            h.engine.compute_balance(missing).await,
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            h.engine.register_card(missing).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_wallet_balance() {
        let h = harness();
        let w = h.funded(9, Decimal::ZERO).await;
        assert_eq!(h.engine.compute_balance(w).await.unwrap(), Balance::default());
        assert!(h.engine.wallet_statement(w).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cached_total_refreshes_after_write() {
        let h = harness();
        let w = h.funded(1, dec!(25)).await;
        assert_eq!(h.engine.cached_total(w).await.unwrap(), dec!(25));

        h.engine
            .post_deposit(crate::engine::DepositRequest {
                wallet_id: w,
                amount: dec!(5),
                currency: usd(),
                source: "bank".into(),
                external_ref: "r-2".into(),
                idempotency_key: None,
            })
            .await
            .unwrap();
        assert_eq!(h.engine.cached_total(w).await.unwrap(), dec!(30));
    }
}
