mod common;

use std::sync::Arc;

use common::{ccy, key, world, world_with};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use ledger_engine::config::EngineConfig;
use ledger_engine::engine::{
    FxTransferRequest, ReversalRequest, ReviewDecision, TransferRequest, WithdrawalRequest,
};
use ledger_engine::error::LedgerError;
use ledger_engine::events::names;
use ledger_engine::models::{ReversalTarget, TransferStatus, WalletKind, WithdrawalStatus};
use ledger_engine::ports::RiskVerdict;
use ledger_engine::worker::MaintenanceWorker;

fn reversal(target: ReversalTarget, k: &str) -> ReversalRequest {
    ReversalRequest {
        target,
        reason: "operator correction".into(),
        idempotency_key: key(k),
    }
}

fn decision(reviewer: &str) -> ReviewDecision {
    ReviewDecision {
        reviewer: reviewer.into(),
        note: None,
    }
}

// ============================================================================
// Reversals
// ============================================================================

#[tokio::test]
async fn qa_tc_transfer_reversed_at_most_once() {
    let w = world();
    let a = w.funded(1, "USD", dec!(100)).await;
    let b = w.funded(2, "USD", Decimal::ZERO).await;
    let t = w
        .engine
        .post_transfer(TransferRequest {
            from_wallet: a,
            to_wallet: b,
            amount: dec!(40),
            currency: ccy("USD"),
            idempotency_key: key("t-1"),
        })
        .await
        .unwrap()
        .value;

    let target = ReversalTarget::Transfer(t.transfer_id);
    let first = w.engine.reverse(reversal(target, "rev-1")).await.unwrap();
    let again = w.engine.reverse(reversal(target, "rev-1")).await.unwrap();
    assert!(!first.replayed);
    assert!(again.replayed, "same key replays the recorded reversal");
    assert_eq!(first.value.reversal_id, again.value.reversal_id);

    let err = w.engine.reverse(reversal(target, "rev-2")).await.unwrap_err();
    assert!(err.is_invalid_state(), "different key must not reverse twice");

    let entries = w.engine.transfer_entries(t.transfer_id).await.unwrap();
    assert_eq!(entries.len(), 4, "two originals plus one compensating pair");
    assert_eq!(w.total(a).await, dec!(100));
    assert_eq!(w.total(b).await, Decimal::ZERO);
}

#[tokio::test]
async fn qa_tc_fx_reversal_unsupported() {
    let w = world();
    w.rates.set_rate(&ccy("USD"), &ccy("HTG"), dec!(130));
    w.funded(1, "USD", dec!(10)).await;
    w.wallet(2, "HTG", WalletKind::User).await;
    let receipt = w
        .engine
        .post_fx_transfer(FxTransferRequest {
            sender_user: 1,
            recipient_user: 2,
            source_currency: ccy("USD"),
            dest_currency: ccy("HTG"),
            amount_source: dec!(5),
            idempotency_key: key("fx"),
        })
        .await
        .unwrap();

    let err = w
        .engine
        .reverse(reversal(ReversalTarget::Transfer(receipt.transfer_id), "fx-rev"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        LedgerError::InvalidState("fx transfer reversal unsupported".to_string())
    );
    assert_eq!(
        w.engine
            .transfer_entries(receipt.transfer_id)
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn qa_tc_withdrawal_reversal_keeps_commission() {
    let w = world();
    let user = w.funded(1, "HTG", dec!(5000)).await;
    let float = w.wallet(77, "HTG", WalletKind::DistributorFloat).await;
    w.fund(float, "HTG", dec!(20000)).await;

    let ticket = w
        .engine
        .request_withdrawal(WithdrawalRequest {
            user_id: 1,
            wallet_id: user,
            amount: dec!(1000),
            currency: ccy("HTG"),
            idempotency_key: key("wd-1"),
        })
        .await
        .unwrap()
        .value;
    w.engine.approve_withdrawal(77, &ticket.code).await.unwrap();

    w.engine
        .reverse(reversal(
            ReversalTarget::Withdrawal(ticket.withdrawal_id),
            "wd-rev",
        ))
        .await
        .unwrap();

    assert_eq!(w.total(user).await, dec!(5000), "user made whole");
    assert_eq!(w.total(float).await, dec!(19010), "agent keeps commission");
    assert_eq!(
        w.engine
            .get_withdrawal(ticket.withdrawal_id)
            .await
            .unwrap()
            .status,
        WithdrawalStatus::Reversed
    );
}

#[tokio::test]
async fn qa_tc_deposit_reversal_blocked_when_spent() {
    let w = world();
    let wallet = w.wallet(1, "USD", WalletKind::User).await;
    let other = w.wallet(2, "USD", WalletKind::User).await;
    let deposit = w
        .engine
        .post_deposit(ledger_engine::engine::DepositRequest {
            wallet_id: wallet,
            amount: dec!(50),
            currency: ccy("USD"),
            source: "bank".into(),
            external_ref: "wire-991".into(),
            idempotency_key: None,
        })
        .await
        .unwrap()
        .value;
    w.engine
        .post_transfer(TransferRequest {
            from_wallet: wallet,
            to_wallet: other,
            amount: dec!(30),
            currency: ccy("USD"),
            idempotency_key: key("spend"),
        })
        .await
        .unwrap();

    assert_eq!(
        w.engine
            .reverse(reversal(ReversalTarget::Deposit(deposit.deposit_id), "dep-rev"))
            .await,
        Err(LedgerError::InsufficientFunds(wallet))
    );
    assert_eq!(w.total(wallet).await, dec!(20));
}

// ============================================================================
// Manual review
// ============================================================================

#[tokio::test]
async fn qa_tc_review_approve_then_reverse() {
    let w = world();
    let a = w.funded(1, "USD", dec!(100)).await;
    let b = w.funded(2, "USD", Decimal::ZERO).await;
    w.risk.set(RiskVerdict::Review, &["velocity"]);

    let pending = w
        .engine
        .post_transfer(TransferRequest {
            from_wallet: a,
            to_wallet: b,
            amount: dec!(70),
            currency: ccy("USD"),
            idempotency_key: key("review-1"),
        })
        .await
        .unwrap()
        .value;
    assert_eq!(pending.status, TransferStatus::PendingReview);
    assert_eq!(w.total(a).await, dec!(100), "nothing moves during review");
    assert!(w.engine.transfer_entries(pending.transfer_id).await.unwrap().is_empty());

    let approved = w
        .engine
        .approve_review(pending.transfer_id, decision("ops-1"))
        .await
        .unwrap();
    assert_eq!(approved.status, TransferStatus::Completed);
    assert_eq!(approved.review.as_ref().map(|r| r.reviewer.as_str()), Some("ops-1"));
    assert_eq!(w.total(b).await, dec!(70));

    // An approved transfer is an ordinary completed transfer
    w.engine
        .reverse(reversal(ReversalTarget::Transfer(pending.transfer_id), "after-review"))
        .await
        .unwrap();
    assert_eq!(w.total(a).await, dec!(100));

    let names = w.sink.names();
    assert!(names.contains(&names::TRANSFER_PENDING_REVIEW.to_string()));
    assert!(names.contains(&names::TRANSFER_APPROVED.to_string()));
}

#[tokio::test]
async fn qa_tc_review_reject_releases_escrow() {
    let w = world_with(EngineConfig {
        review_escrow_hold: true,
        ..EngineConfig::default()
    });
    let a = w.funded(1, "USD", dec!(100)).await;
    let b = w.funded(2, "USD", Decimal::ZERO).await;
    w.risk.set(RiskVerdict::Review, &["amount"]);

    let pending = w
        .engine
        .post_transfer(TransferRequest {
            from_wallet: a,
            to_wallet: b,
            amount: dec!(90),
            currency: ccy("USD"),
            idempotency_key: key("escrowed"),
        })
        .await
        .unwrap()
        .value;
    assert_eq!(w.available(a).await, dec!(10), "escrow reserves the amount");

    let rejected = w
        .engine
        .reject_review(pending.transfer_id, decision("ops-2"))
        .await
        .unwrap();
    assert_eq!(rejected.status, TransferStatus::Blocked);
    let balance = w.engine.compute_balance(a).await.unwrap();
    assert_eq!((balance.total, balance.held), (dec!(100), Decimal::ZERO));
    assert_eq!(w.total(b).await, Decimal::ZERO);

    assert!(
        w.engine
            .approve_review(pending.transfer_id, decision("ops-3"))
            .await
            .unwrap_err()
            .is_invalid_state()
    );
}

// ============================================================================
// Outbox + maintenance
// ============================================================================

#[tokio::test]
async fn qa_tc_worker_redelivers_parked_events() {
    let w = world();
    w.sink.set_failing(true);
    let a = w.funded(1, "USD", dec!(30)).await;
    let b = w.funded(2, "USD", Decimal::ZERO).await;
    w.engine
        .post_transfer(TransferRequest {
            from_wallet: a,
            to_wallet: b,
            amount: dec!(30),
            currency: ccy("USD"),
            idempotency_key: key("parked"),
        })
        .await
        .unwrap();
    assert!(w.sink.names().is_empty());
    let parked = w.engine.events().outbox().len();
    assert_eq!(parked, 2, "deposit and transfer events parked");

    let worker = MaintenanceWorker::with_defaults(Arc::clone(&w.engine));
    w.sink.set_failing(false);
    let stats = worker.run_once().await;
    assert_eq!(stats.events.delivered, parked);
    assert_eq!(
        w.sink.names(),
        vec![
            names::DEPOSIT_POSTED.to_string(),
            names::TRANSFER_POSTED.to_string()
        ]
    );
}

#[tokio::test]
async fn qa_tc_outbox_drops_after_max_attempts() {
    let w = world();
    w.sink.set_failing(true);
    w.funded(1, "USD", dec!(5)).await;
    assert_eq!(w.engine.events().outbox().len(), 1);

    // The fixture allows three attempts; the first was the inline publish
    let first = w.engine.events().drain(10).await;
    assert_eq!(first.requeued, 1);
    let second = w.engine.events().drain(10).await;
    assert_eq!(second.dropped, 1);
    assert!(w.engine.events().outbox().is_empty());
}
