use std::{sync::Arc, time::Duration};

use donation_ledger::{
    verifiers::PublicInputsVerifier, CampaignKey, DonationLedger, InMemoryExternalLedger,
    LedgerConfig, PublicInputs, ValidityProof,
};
use donation_ledger_merkle::{hex_digest, DonationRecord, MemNodeStore};
use rand::Rng;
use tracing_subscriber::EnvFilter;

const CAMPAIGN_ID: u64 = 1;

#[tokio::main]
async fn main() {
    // Run with RUST_LOG=debug to see every submission.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // The external ledger holds the authoritative roots. Here it lives in
    // memory and simulates an outage on the first submission.
    let external = Arc::new(InMemoryExternalLedger::new());
    external.fail_next(1);

    let mut config = LedgerConfig::default();
    config.default_height = 4;
    config.retry.base_delay = Duration::from_millis(20);

    let ledger = DonationLedger::new(
        config,
        Arc::new(MemNodeStore::new()),
        Arc::new(PublicInputsVerifier),
        external.clone(),
    )
    .expect("valid configuration");

    let mut rng = rand::thread_rng();
    let campaign = CampaignKey::new(rng.gen(), CAMPAIGN_ID);
    let opened = ledger
        .open_campaign(campaign, None)
        .expect("campaign opened");
    println!(
        "Opened campaign tree {} with capacity {}",
        campaign.tree_id(),
        opened.capacity()
    );

    let mut events = ledger.subscribe();

    for i in 0..5i64 {
        let record = DonationRecord::new(
            rng.gen(),
            rng.gen_range(1..1_000),
            1_700_000_000 + i * 60,
            CAMPAIGN_ID,
        );
        // A real donor would attach a zero-knowledge proof here.
        let payload = PublicInputsVerifier::attest(&PublicInputs::for_record(&record));
        let validity = ValidityProof::for_record(&record, payload).to_bytes();

        let receipt = ledger
            .donate(&campaign, &record, Some(validity), None)
            .await
            .expect("donation recorded");
        println!(
            "Donation of {} stored at leaf {}, root is now {}",
            record.amount(),
            receipt.leaf_index,
            hex_digest(&receipt.root)
        );
    }

    while let Ok(event) = events.try_recv() {
        println!(
            "event: leaf {} from donor 0x{}...",
            event.leaf_index,
            hex::encode(&event.donor_id[..4])
        );
    }

    let tally = ledger.tally(&campaign).expect("campaign is open");
    println!(
        "Campaign received {} in {} donations ({} submissions sent)",
        tally.total_donation_received,
        tally.donation_count,
        external.submissions()
    );

    // Anyone holding the root can check a single donation.
    let proof = ledger
        .external_proof(&campaign.tree_id(), 2)
        .await
        .expect("proof of leaf 2");
    println!("Proof of leaf 2:\n{}", proof.to_json().expect("json export"));
    println!("Does the proof match the ledger root? {}", proof.verify());
}
