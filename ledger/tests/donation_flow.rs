use std::{sync::Arc, time::Duration};

use assert_matches::assert_matches;
use donation_ledger::{
    merkle::{
        empty_root, node_hash, zero_value, DonationRecord, MemNodeStore, MerkleError, MerkleProof,
    },
    verifiers::PublicInputsVerifier,
    CampaignKey, ConflictPolicy, DonationLedger, Error, ErrorCategory, InMemoryExternalLedger,
    LedgerConfig, ProofError, PublicInputs, ValidityProof,
};

const CONFIG: &str = r#"
default_height = 2

[retry]
max_retries = 2
base_delay = "50ms"
max_delay = "1s"
strategy = "linear"

[cache]
max_age = "10s"

[coordinator]
conflict_policy = "queue"
call_timeout = "2s"
"#;

fn ledger_with(external: Arc<InMemoryExternalLedger>) -> DonationLedger {
    let config = LedgerConfig::from_toml(CONFIG).unwrap();
    assert_eq!(config.coordinator.conflict_policy, ConflictPolicy::Queue);
    DonationLedger::new(
        config,
        Arc::new(MemNodeStore::new()),
        Arc::new(PublicInputsVerifier),
        external,
    )
    .unwrap()
}

fn donation(donor: u8, amount: u64) -> DonationRecord {
    DonationRecord::new([donor; 32], amount, 1_700_000_000 + donor as i64, 1)
}

fn validity(record: &DonationRecord) -> Option<Vec<u8>> {
    let payload = PublicInputsVerifier::attest(&PublicInputs::for_record(record));
    Some(ValidityProof::for_record(record, payload).to_bytes())
}

#[tokio::test]
async fn height_two_walkthrough() {
    let external = Arc::new(InMemoryExternalLedger::new());
    let ledger = ledger_with(external.clone());
    let campaign = CampaignKey::new([1; 32], 1);
    let tree_id = campaign.tree_id();

    let opened = ledger.open_campaign(campaign, None).unwrap();
    assert_eq!(opened.height(), 2);
    assert_eq!(opened.root(), &empty_root(2));

    let z = zero_value();
    let r0 = donation(1, 300);
    let r1 = donation(2, 700);
    let l0 = *r0.leaf().unwrap().digest();
    let l1 = *r1.leaf().unwrap().digest();

    let first = ledger.donate(&campaign, &r0, validity(&r0), None).await.unwrap();
    assert_eq!(first.root, node_hash(&node_hash(&l0, &z), &node_hash(&z, &z)));

    let second = ledger.donate(&campaign, &r1, validity(&r1), None).await.unwrap();
    assert_eq!(second.root, node_hash(&node_hash(&l0, &l1), &node_hash(&z, &z)));

    let proof = ledger.proof(&tree_id, 0, true).await.unwrap();
    assert_eq!(proof.siblings, vec![l1, node_hash(&z, &z)]);
    assert!(proof.verify());

    // A proof from before the second donation no longer matches the root.
    assert_matches!(
        first.proof.verify_against_root(&second.root),
        Err(MerkleError::InvalidProof(_))
    );

    let exported = proof.to_json().unwrap();
    assert_eq!(MerkleProof::from_json(&exported).unwrap(), proof);
    assert_eq!(ledger.external_proof(&tree_id, 0).await.unwrap(), proof);

    let tally = ledger.tally(&campaign).unwrap();
    assert_eq!(tally.total_donation_received, 1_000);
    assert_eq!(tally.donation_count, 2);
    assert_eq!(tally.latest_root, second.root);
    assert_eq!(external.submissions(), 2);
}

#[tokio::test]
async fn capacity_is_enforced_end_to_end() {
    let external = Arc::new(InMemoryExternalLedger::new());
    let ledger = ledger_with(external.clone());
    let campaign = CampaignKey::new([1; 32], 1);
    ledger.open_campaign(campaign, None).unwrap();

    for donor in 1..=4 {
        let record = donation(donor, 10);
        ledger
            .donate(&campaign, &record, validity(&record), None)
            .await
            .unwrap();
    }
    let record = donation(5, 10);
    let err = ledger
        .donate(&campaign, &record, validity(&record), None)
        .await
        .unwrap_err();
    assert_matches!(err, Error::Merkle(MerkleError::TreeFull { capacity: 4, .. }));
    assert_eq!(err.category(), ErrorCategory::Structural);
    assert_eq!(external.submissions(), 4);
}

#[tokio::test]
async fn validity_proof_for_another_record_is_refused() {
    let external = Arc::new(InMemoryExternalLedger::new());
    let ledger = ledger_with(external.clone());
    let campaign = CampaignKey::new([1; 32], 1);
    ledger.open_campaign(campaign, None).unwrap();

    let record = donation(1, 10);
    let other = donation(1, 11);
    let err = ledger
        .donate(&campaign, &record, validity(&other), None)
        .await
        .unwrap_err();
    assert_matches!(err, Error::Proof(ProofError::InvalidProof(_)));
    assert_eq!(err.category(), ErrorCategory::InvalidProof);
    assert!(!err.is_transient());
    assert_eq!(external.submissions(), 0);
    assert_eq!(ledger.tally(&campaign).unwrap().donation_count, 0);
}

#[tokio::test(start_paused = true)]
async fn outage_is_retried_and_reconciled() {
    let external = Arc::new(InMemoryExternalLedger::new());
    let ledger = ledger_with(external.clone());
    let campaign = CampaignKey::new([1; 32], 1);
    ledger.open_campaign(campaign, None).unwrap();

    external.fail_next(1);
    external.lose_next_responses(1);
    let record = donation(1, 10);
    let receipt = ledger
        .donate(&campaign, &record, validity(&record), None)
        .await
        .unwrap();

    // The second submission was applied; its lost response is recovered
    // from the ledger's state instead of being resent.
    assert_eq!(external.submissions(), 2);
    assert_eq!(
        external.state(&campaign.tree_id()).map(|s| *s.root()),
        Some(receipt.root)
    );
    assert_eq!(ledger.tally(&campaign).unwrap().donation_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_donors_get_distinct_leaves() {
    let external = Arc::new(InMemoryExternalLedger::new());
    let ledger = Arc::new(ledger_with(external.clone()));
    let campaign = CampaignKey::new([1; 32], 1);
    ledger.open_campaign(campaign, Some(4)).unwrap();
    let mut events = ledger.subscribe();

    let tasks: Vec<_> = (1..=8u8)
        .map(|donor| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let record = donation(donor, donor as u64);
                ledger
                    .donate(&campaign, &record, validity(&record), Some(Duration::from_secs(5)))
                    .await
            })
        })
        .collect();

    let mut indices = Vec::new();
    for task in tasks {
        indices.push(task.await.unwrap().unwrap().leaf_index);
    }
    indices.sort_unstable();
    assert_eq!(indices, (0..8).collect::<Vec<u64>>());

    let tally = ledger.tally(&campaign).unwrap();
    assert_eq!(tally.donation_count, 8);
    assert_eq!(tally.total_donation_received, 36);

    let mut seen = Vec::new();
    for _ in 0..8 {
        seen.push(events.recv().await.unwrap().leaf_index);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..8).collect::<Vec<u64>>());

    let state = ledger.state(&campaign.tree_id(), true).await.unwrap();
    for leaf_index in 0..8 {
        let proof = ledger.proof(&campaign.tree_id(), leaf_index, false).await.unwrap();
        proof.verify_against_root(state.root()).unwrap();
    }
}
