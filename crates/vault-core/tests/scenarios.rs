//! End-to-end wallet scenarios against the deterministic adapters.

use chrono::Duration;
use std::collections::BTreeSet;
use std::sync::Arc;
use vault_adapters::{AlwaysFailConnector, MockCkbtcMinter, MockSuite};
use vault_core::*;

struct Harness {
    wallet: Wallet,
    clock: SimulatedTimeSource,
    mocks: MockSuite,
}

fn alice() -> SignerId {
    SignerId::from("alice")
}

fn bob() -> SignerId {
    SignerId::from("bob")
}

fn carol() -> SignerId {
    SignerId::from("carol")
}

fn admin() -> RoleId {
    RoleId::new(ADMIN_ROLE)
}

fn expect_processed(view: OperationView) -> ProcessedOperation {
    match view {
        OperationView::Processed(record) => record,
        other => panic!("expected a processed record, got {other:?}"),
    }
}

/// Request as `voters[0]`, then confirm with every voter in order.
async fn approve(wallet: &mut Wallet, voters: &[SignerId], operation: Operation) -> ProcessedOperation {
    let id = wallet
        .request(&voters[0], operation, "scenario", None)
        .await
        .unwrap();
    let mut last = None;
    for voter in voters {
        last = Some(wallet.response(voter, id, Vote::Confirm).await.unwrap());
    }
    expect_processed(last.expect("at least one voter"))
}

/// Alice, Bob and Carol all hold the admin role with threshold 2.
async fn harness() -> Harness {
    let clock = SimulatedTimeSource::from_recent();
    let mocks = MockSuite::default();
    let config = WalletConfig {
        default_role_threshold: 2,
        ..WalletConfig::default()
    };
    let mut wallet = Wallet::new("alice", config, mocks.registry(), Arc::new(clock.clone())).unwrap();

    // a lone signer's threshold is clamped to the single eligible voter
    let added = approve(
        &mut wallet,
        &[alice()],
        Operation::AddSigner {
            signer_id: bob(),
            name: "Bob".into(),
            role_id: admin(),
            threshold: None,
            expires_at: None,
        },
    )
    .await;
    assert_eq!(added.status, OperationStatus::Success);

    let added = approve(
        &mut wallet,
        &[alice(), bob()],
        Operation::AddSigner {
            signer_id: carol(),
            name: "Carol".into(),
            role_id: admin(),
            threshold: None,
            expires_at: None,
        },
    )
    .await;
    assert_eq!(added.status, OperationStatus::Success);
    assert_eq!(wallet.registry().signer_count(), 3);

    Harness {
        wallet,
        clock,
        mocks,
    }
}

async fn funded_account(h: &mut Harness, chains: &[(ChainType, u128)]) -> AccountId {
    let created = approve(
        &mut h.wallet,
        &[alice(), bob()],
        Operation::CreateAccount {
            name: "Treasury".into(),
        },
    )
    .await;
    let Some(OperationResult::AccountCreated { account_id }) = created.result else {
        panic!("unexpected result {:?}", created.result);
    };

    for (chain, amount) in chains {
        let record = approve(
            &mut h.wallet,
            &[alice(), bob()],
            Operation::CreateAddress {
                account_id: account_id.clone(),
                chain: chain.clone(),
            },
        )
        .await;
        let Some(OperationResult::AddressCreated { address, .. }) = record.result else {
            panic!("address creation failed: {:?}", record.error);
        };
        if *amount > 0 {
            h.mocks
                .ledger(chain.family())
                .fund(chain, &address, *amount)
                .unwrap();
            let synced = h
                .wallet
                .account_sync_balance(&alice(), &account_id, chain)
                .await
                .unwrap();
            assert_eq!(synced, *amount);
        }
    }
    account_id
}

#[tokio::test]
async fn btc_transfer_executes_once_threshold_is_reached() {
    let mut h = harness().await;
    let account_id = funded_account(&mut h, &[(ChainType::Btc, 100_000)]).await;

    let id = h
        .wallet
        .request(
            &alice(),
            Operation::SendBtc {
                account_id: account_id.clone(),
                to: "bc1qdestination".into(),
                amount: 40_000,
            },
            "pay supplier",
            None,
        )
        .await
        .unwrap();

    let after_alice = h.wallet.response(&alice(), id, Vote::Confirm).await.unwrap();
    assert_eq!(after_alice.status(), OperationStatus::Pending);
    assert!(h.mocks.btc.transfers().unwrap().is_empty());

    let record = expect_processed(h.wallet.response(&bob(), id, Vote::Confirm).await.unwrap());
    assert_eq!(record.status, OperationStatus::Success);
    assert!(matches!(record.result, Some(OperationResult::BtcSent { .. })));
    assert_eq!(
        h.wallet
            .account_balance(&alice(), &account_id, &ChainType::Btc)
            .unwrap(),
        60_000
    );
    assert_eq!(h.mocks.btc.transfers().unwrap().len(), 1);

    let late = h.wallet.response(&carol(), id, Vote::Confirm).await;
    assert!(matches!(late, Err(VaultError::AlreadyResolved { .. })));
}

#[tokio::test]
async fn rejected_operation_is_never_executed() {
    let mut h = harness().await;
    let account_id = funded_account(&mut h, &[(ChainType::Btc, 100_000)]).await;

    let id = h
        .wallet
        .request(
            &alice(),
            Operation::SendBtc {
                account_id: account_id.clone(),
                to: "bc1qdestination".into(),
                amount: 40_000,
            },
            "",
            None,
        )
        .await
        .unwrap();
    h.wallet.response(&alice(), id, Vote::Confirm).await.unwrap();
    let still_open = h.wallet.response(&bob(), id, Vote::Reject).await.unwrap();
    assert_eq!(still_open.status(), OperationStatus::Pending);

    let record = expect_processed(h.wallet.response(&carol(), id, Vote::Reject).await.unwrap());
    assert_eq!(record.status, OperationStatus::Fail);
    assert!(record.result.is_none());
    assert!(h.mocks.btc.transfers().unwrap().is_empty());
    assert_eq!(
        h.wallet
            .account_balance(&alice(), &account_id, &ChainType::Btc)
            .unwrap(),
        100_000
    );
}

#[tokio::test]
async fn signers_added_later_cannot_vote_on_open_operations() {
    let mut h = harness().await;
    let open = h
        .wallet
        .request(
            &alice(),
            Operation::CreateAccount {
                name: "Ops".into(),
            },
            "",
            None,
        )
        .await
        .unwrap();

    approve(
        &mut h.wallet,
        &[alice(), bob()],
        Operation::AddSigner {
            signer_id: SignerId::from("dave"),
            name: "Dave".into(),
            role_id: admin(),
            threshold: None,
            expires_at: None,
        },
    )
    .await;

    let vote = h
        .wallet
        .response(&SignerId::from("dave"), open, Vote::Confirm)
        .await;
    assert!(matches!(vote, Err(VaultError::NotEligibleVoter { .. })));
    let OperationView::Pending(pending) = h.wallet.get_operation(open).unwrap() else {
        panic!("operation should still be pending");
    };
    assert_eq!(pending.allowed_signers.len(), 3);
}

#[tokio::test]
async fn every_resolution_lands_in_the_audit_log() {
    let mut h = harness().await;
    let account_id = funded_account(&mut h, &[(ChainType::Btc, 1_000)]).await;
    let before = h.wallet.get_processed_list().unwrap().len();

    // execution failure: more than the book balance
    let failed = approve(
        &mut h.wallet,
        &[alice(), bob()],
        Operation::SendBtc {
            account_id: account_id.clone(),
            to: "bc1qdestination".into(),
            amount: 5_000,
        },
    )
    .await;
    assert_eq!(failed.status, OperationStatus::Fail);
    assert!(failed.error.as_deref().unwrap_or_default().contains("Insufficient funds"));

    // rejected by vote
    let rejected = h
        .wallet
        .request(&bob(), Operation::CreateAccount { name: "X".into() }, "", None)
        .await
        .unwrap();
    h.wallet.response(&alice(), rejected, Vote::Reject).await.unwrap();
    h.wallet.response(&bob(), rejected, Vote::Reject).await.unwrap();

    // expired
    let deadline = h.clock.now() + Duration::hours(1);
    let expired = h
        .wallet
        .request(
            &carol(),
            Operation::CreateAccount { name: "Y".into() },
            "",
            Some(deadline),
        )
        .await
        .unwrap();
    h.clock.advance(Duration::hours(2));
    assert!(h.wallet.get_pending_list().unwrap().is_empty());
    assert!(matches!(
        h.wallet.response(&alice(), expired, Vote::Confirm).await,
        Err(VaultError::DeadlineExpired(_))
    ));

    let log = h.wallet.get_processed_list().unwrap();
    let statuses: Vec<_> = log[before..].iter().map(|record| record.status).collect();
    assert_eq!(
        statuses,
        vec![
            OperationStatus::Fail,
            OperationStatus::Fail,
            OperationStatus::Expired
        ]
    );
    let ids: BTreeSet<_> = log.iter().map(ProcessedOperation::id).collect();
    assert_eq!(ids.len(), log.len());
    assert!(h.wallet.wallet_status().unwrap().processed_chain_valid);
}

#[tokio::test]
async fn minted_deposit_is_credited_exactly_once() {
    let mut h = harness().await;
    let account_id =
        funded_account(&mut h, &[(ChainType::Btc, 200_000), (ChainType::Ckbtc, 0)]).await;

    let swapped = approve(
        &mut h.wallet,
        &[alice(), bob()],
        Operation::SwapBtcToCkbtc {
            account_id: account_id.clone(),
            amount: 50_000,
        },
    )
    .await;
    let Some(OperationResult::BtcSwapped { txid }) = swapped.result else {
        panic!("swap failed: {:?}", swapped.error);
    };

    let owner = h
        .wallet
        .account(&alice(), &account_id)
        .unwrap()
        .ledger
        .chain(&ChainType::Ckbtc)
        .unwrap()
        .address
        .clone();
    let deposit = MockCkbtcMinter::deposit_address(&owner);
    assert_eq!(h.mocks.btc.transfers().unwrap()[0].to, deposit);

    h.mocks
        .minter
        .report_utxo(
            &owner,
            UtxoStatus::Minted {
                block_index: 7,
                minted_amount: 49_990,
                txid,
            },
        )
        .unwrap();

    let first = h
        .wallet
        .account_update_balance(&bob(), &account_id)
        .await
        .unwrap();
    assert_eq!(first.minted, 49_990);
    assert_eq!(first.remaining, 0);

    let second = h
        .wallet
        .account_check_pending(&bob(), &account_id, &ChainType::Btc)
        .await
        .unwrap();
    assert_eq!(second.minted, 0);
    assert_eq!(
        h.wallet
            .account_balance(&alice(), &account_id, &ChainType::Ckbtc)
            .unwrap(),
        49_990
    );
}

#[tokio::test]
async fn ckbtc_retrieval_stays_pending_until_confirmed() {
    let mut h = harness().await;
    let account_id = funded_account(&mut h, &[(ChainType::Ckbtc, 80_000)]).await;

    let swapped = approve(
        &mut h.wallet,
        &[alice(), bob()],
        Operation::SwapCkbtcToBtc {
            account_id: account_id.clone(),
            btc_address: "bc1qpayout".into(),
            amount: 30_000,
        },
    )
    .await;
    let Some(OperationResult::CkbtcSwapped { block_index }) = swapped.result else {
        panic!("swap failed: {:?}", swapped.error);
    };

    let status = h
        .wallet
        .retrieve_btc_status(&alice(), &account_id, block_index)
        .await
        .unwrap();
    assert_eq!(status, RetrieveBtcStatus::Pending);

    h.mocks
        .minter
        .set_retrieve_status(block_index, RetrieveBtcStatus::Confirmed { txid: "payout".into() })
        .unwrap();
    let report = h
        .wallet
        .account_check_pending(&alice(), &account_id, &ChainType::Ckbtc)
        .await
        .unwrap();
    assert_eq!(report.resolved.len(), 1);
    assert_eq!(
        h.wallet
            .account_balance(&alice(), &account_id, &ChainType::Ckbtc)
            .unwrap(),
        50_000
    );
}

#[tokio::test]
async fn evm_pending_clears_after_confirmations() {
    let mut h = harness().await;
    let chain = ChainType::Evm(1);
    let account_id = funded_account(&mut h, &[(chain.clone(), 1_000_000)]).await;

    let sent = approve(
        &mut h.wallet,
        &[alice(), bob()],
        Operation::SendEvmNative {
            account_id: account_id.clone(),
            chain_id: 1,
            to: "0x000000000000000000000000000000000000dead".into(),
            amount: 250_000,
        },
    )
    .await;
    assert!(matches!(sent.result, Some(OperationResult::EvmSent { .. })));

    let early = h
        .wallet
        .account_check_pending(&alice(), &account_id, &chain)
        .await
        .unwrap();
    assert_eq!((early.resolved.len(), early.remaining), (0, 1));

    h.mocks.evm.mine(12).unwrap();
    let settled = h
        .wallet
        .account_check_pending(&alice(), &account_id, &chain)
        .await
        .unwrap();
    assert_eq!((settled.resolved.len(), settled.remaining), (1, 0));
}

#[tokio::test]
async fn upgrade_requires_the_published_hash() {
    let mut h = harness().await;
    let module = b"\0asm release two".to_vec();
    for chunk in module.chunks(4) {
        h.wallet.load_wasm(&alice(), chunk).unwrap();
    }
    h.mocks
        .releases
        .publish("custody-wallet", "2.0.0", &module)
        .unwrap();

    let upgraded = approve(
        &mut h.wallet,
        &[alice(), bob()],
        Operation::UpgradeCode {
            version: "2.0.0".into(),
        },
    )
    .await;
    assert_eq!(upgraded.status, OperationStatus::Success);
    assert_eq!(
        h.wallet.running_module().map(|module| module.version.as_str()),
        Some("2.0.0")
    );

    h.wallet.load_wasm(&alice(), b"tampered module").unwrap();
    h.mocks
        .releases
        .publish("custody-wallet", "3.0.0", b"genuine module")
        .unwrap();
    let rejected = approve(
        &mut h.wallet,
        &[alice(), bob()],
        Operation::UpgradeCode {
            version: "3.0.0".into(),
        },
    )
    .await;
    assert_eq!(rejected.status, OperationStatus::Fail);
    assert!(rejected.error.as_deref().unwrap_or_default().contains("hash mismatch"));
    assert_eq!(
        h.wallet.running_module().map(|module| module.version.as_str()),
        Some("2.0.0")
    );
    assert_eq!(h.wallet.wasm_len(), b"tampered module".len());
}

#[tokio::test]
async fn connector_outages_fail_the_operation_not_the_call() {
    let clock = SimulatedTimeSource::from_recent();
    let connectors = ConnectorRegistry::new()
        .with_chain(Arc::new(AlwaysFailConnector::new(ChainFamily::Icp, "node offline")));
    let mut wallet = Wallet::new("alice", WalletConfig::default(), connectors, Arc::new(clock)).unwrap();

    let created = approve(&mut wallet, &[alice()], Operation::CreateAccount { name: "Ops".into() }).await;
    let Some(OperationResult::AccountCreated { account_id }) = created.result else {
        panic!("unexpected result {:?}", created.result);
    };

    let record = approve(
        &mut wallet,
        &[alice()],
        Operation::CreateAddress {
            account_id: account_id.clone(),
            chain: ChainType::Icp,
        },
    )
    .await;
    assert_eq!(record.status, OperationStatus::Fail);
    assert!(record.error.as_deref().unwrap_or_default().contains("node offline"));
    assert!(wallet
        .account(&alice(), &account_id)
        .unwrap()
        .ledger
        .chain(&ChainType::Icp)
        .is_err());
}
