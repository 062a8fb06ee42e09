use donation_ledger_merkle::{
    hex_digest, DonationRecord, MemNodeStore, MerkleProof, MerkleState, TreeId,
};

fn main() {
    let store = MemNodeStore::new();
    // A tree of height 3 holds 8 donations.
    let mut state = MerkleState::initialize(TreeId::for_campaign(&[1; 32], 7), 3).unwrap();

    for donor in 0u8..5 {
        let record = DonationRecord::new([donor; 32], 100 * (donor as u64 + 1), 1_700_000_000, 7);
        let leaf = record.leaf().unwrap();
        state = state.append(leaf, &store).unwrap().unwrap().state;
    }
    println!(
        "{} leaves, root {}",
        state.leaf_count(),
        hex_digest(state.root())
    );

    // Generate a proof for the third donation.
    let proof = MerkleProof::generate(&state, 2, &store).unwrap().unwrap();
    println!("Proof has {} siblings", proof.siblings.len());

    // Proofs travel as bytes or JSON.
    let bytes = proof.encode_to_vec().unwrap();
    let decoded = MerkleProof::decode_from_slice(&bytes).unwrap();
    println!("Does the decoded proof verify? {}", decoded.verify());

    // Appending moves the root, so the old proof goes stale.
    let record = DonationRecord::new([9; 32], 1, 1_700_000_100, 7);
    state = state
        .append(record.leaf().unwrap(), &store)
        .unwrap()
        .unwrap()
        .state;
    match proof.verify_against_root(state.root()) {
        Ok(()) => println!("Old proof still matches"),
        Err(e) => println!("Old proof rejected: {e}"),
    }
}
