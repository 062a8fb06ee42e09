use assert_matches::assert_matches;
use proptest::prelude::*;

use super::*;

fn leaf(n: u8) -> Leaf {
    DonationRecord::new([n; 32], 1 + n as u64, n as i64, 3)
        .leaf()
        .expect("valid record")
}

fn tree_id() -> TreeId {
    TreeId::new([1u8; 32])
}

#[test]
fn test_empty_roots_chain_from_zero_value() {
    let z = zero_value();
    assert_eq!(z, *blake3::hash(&[0u8; 64]).as_bytes());
    assert_eq!(empty_root(0), z);
    assert_eq!(empty_root(1), node_hash(&z, &z));
    assert_eq!(empty_root(2), node_hash(&empty_root(1), &empty_root(1)));
    assert_eq!(empty_root(MAX_HEIGHT + 5), empty_root(MAX_HEIGHT));

    let state = MerkleState::initialize(tree_id(), 2).unwrap();
    assert_eq!(root_of(&state), empty_root(2));
    assert_eq!(state.leaf_count(), 0);
    assert_eq!(state.node_count(), 0);
}

#[test]
fn test_hex_digest_is_prefixed_lowercase() {
    let mut digest = [0u8; 32];
    digest[0] = 0xAB;
    digest[31] = 0x0F;
    let text = hex_digest(&digest);
    assert_eq!(text.len(), 66);
    assert!(text.starts_with("0xab"));
    assert!(text.ends_with("0f"));
    assert_eq!(text, text.to_lowercase());
    assert_eq!(hex_serde::parse_digest(&text), Ok(digest));
}

#[test]
fn test_invalid_heights() {
    assert_matches!(
        MerkleState::initialize(tree_id(), 0),
        Err(MerkleError::InvalidHeight { height: 0, max: 32 })
    );
    assert_matches!(
        MerkleState::initialize(tree_id(), MAX_HEIGHT + 1),
        Err(MerkleError::InvalidHeight { height: 33, .. })
    );
    assert!(MerkleState::initialize(tree_id(), MAX_HEIGHT).is_ok());
}

#[test]
fn test_height_two_walkthrough() {
    let store = MemNodeStore::new();
    let z = zero_value();
    let zz = node_hash(&z, &z);
    let (l0, l1) = (leaf(0), leaf(1));

    let state = MerkleState::initialize(tree_id(), 2).unwrap();

    let first = state.append(l0, &store).unwrap().unwrap();
    assert_eq!(first.leaf_index, 0);
    assert_eq!(
        first.state.root(),
        &node_hash(&node_hash(l0.digest(), &z), &zz)
    );
    assert_eq!(first.audit_path, vec![z, zz]);

    let second = first.state.append(l1, &store).unwrap().unwrap();
    assert_eq!(second.leaf_index, 1);
    assert_eq!(second.state.leaf_count(), 2);
    assert_eq!(
        second.state.root(),
        &node_hash(&node_hash(l0.digest(), l1.digest()), &zz)
    );
    assert_eq!(second.audit_path, vec![*l0.digest(), zz]);

    let proof = MerkleProof::generate(&second.state, 0, &store)
        .unwrap()
        .unwrap();
    assert_eq!(proof.siblings, vec![*l1.digest(), zz]);
    assert!(proof.verify());
}

#[test]
fn test_capacity_boundary() {
    let store = MemNodeStore::new();
    let mut state = MerkleState::initialize(tree_id(), 2).unwrap();
    for n in 0..4 {
        state = state.append(leaf(n), &store).unwrap().unwrap().state;
    }
    assert!(state.is_full());
    assert_eq!(state.capacity(), 4);

    assert_matches!(
        state.append(leaf(4), &store).unwrap(),
        Err(MerkleError::TreeFull { capacity: 4, .. })
    );
    assert_eq!(state.leaf_count(), 4);
}

#[test]
fn test_node_count_tracks_materialized_nodes() {
    let store = MemNodeStore::new();
    let mut state = MerkleState::initialize(tree_id(), 2).unwrap();
    for n in 0..4 {
        state = state.append(leaf(n), &store).unwrap().unwrap().state;
        assert_eq!(state.node_count() as usize, store.len());
    }
    // 4 leaves, 2 inner nodes, 1 root.
    assert_eq!(state.node_count(), 7);
}

#[test]
fn test_uncommitted_append_leaves_store_untouched() {
    let store = MemNodeStore::new();
    let state = MerkleState::initialize(tree_id(), 3).unwrap();
    let state = state.append(leaf(0), &store).unwrap().unwrap().state;
    let nodes_before = store.len();

    let prepared = state.prepare_append(leaf(1), &store).unwrap().unwrap();
    assert_eq!(prepared.previous_root(), state.root());
    assert_eq!(prepared.leaf_index(), 1);
    assert!(prepared.proof().verify());
    drop(prepared);

    assert_eq!(store.len(), nodes_before);
    let proof = MerkleProof::generate(&state, 0, &store).unwrap().unwrap();
    proof.verify_against_root(state.root()).unwrap();

    let committed = state.append(leaf(1), &store).unwrap().unwrap();
    assert_eq!(committed.leaf_index, 1);
}

#[test]
fn test_append_reports_cost() {
    let store = MemNodeStore::new();
    let state = MerkleState::initialize(tree_id(), 4).unwrap();
    let state = state.append(leaf(0), &store).unwrap().unwrap().state;

    let result = state.append(leaf(1), &store);
    assert_eq!(result.cost.hash_node_calls, 4);
    // Only the left sibling at level 0 is read.
    assert_eq!(result.cost.seek_count, 1);
    assert!(result.cost.storage_written_bytes > 0);
    result.value.unwrap();
}

#[test]
fn test_trees_are_isolated_in_shared_store() {
    let store = MemNodeStore::new();
    let a = MerkleState::initialize(TreeId::for_campaign(&[1u8; 32], 1), 2).unwrap();
    let b = MerkleState::initialize(TreeId::for_campaign(&[1u8; 32], 2), 2).unwrap();
    assert_ne!(a.tree_id(), b.tree_id());

    let a = a.append(leaf(0), &store).unwrap().unwrap().state;
    let b = b.append(leaf(5), &store).unwrap().unwrap().state;
    let b = b.append(leaf(6), &store).unwrap().unwrap().state;

    assert!(MerkleProof::generate(&a, 0, &store).unwrap().unwrap().verify());
    assert!(MerkleProof::generate(&b, 1, &store).unwrap().unwrap().verify());
}

#[test]
fn test_state_serde_round_trip() {
    let store = MemNodeStore::new();
    let state = MerkleState::initialize(tree_id(), 3).unwrap();
    let state = state.append(leaf(2), &store).unwrap().unwrap().state;

    let json = serde_json::to_value(state).unwrap();
    assert_eq!(json["root"], hex_digest(state.root()));
    let back: MerkleState = serde_json::from_value(json).unwrap();
    assert_eq!(back, state);

    let rebuilt = MerkleState::from_parts(
        *state.tree_id(),
        state.height(),
        *state.root(),
        state.leaf_count(),
        state.node_count(),
    )
    .unwrap();
    assert_eq!(rebuilt, state);
    assert_matches!(
        MerkleState::from_parts(*state.tree_id(), 1, *state.root(), 3, 0),
        Err(MerkleError::CorruptedData(_))
    );
}

proptest! {
    #[test]
    fn prop_append_is_deterministic(seeds in prop::collection::vec(any::<u8>(), 0..16)) {
        let leaves: Vec<Leaf> = seeds.iter().map(|s| leaf(*s)).collect();
        let run = || {
            let store = MemNodeStore::new();
            let mut state = MerkleState::initialize(tree_id(), 4).unwrap();
            for l in &leaves {
                state = state.append(*l, &store).unwrap().unwrap().state;
            }
            *state.root()
        };
        prop_assert_eq!(run(), run());
    }

    #[test]
    fn prop_every_index_proves(count in 1usize..=16, seed in any::<u8>()) {
        let store = MemNodeStore::new();
        let mut state = MerkleState::initialize(tree_id(), 4).unwrap();
        for n in 0..count {
            state = state
                .append(leaf(seed.wrapping_add(n as u8)), &store)
                .unwrap()
                .unwrap()
                .state;
        }
        for index in 0..count as u64 {
            let proof = MerkleProof::generate(&state, index, &store).unwrap().unwrap();
            prop_assert!(proof.verify());
            prop_assert_eq!(&proof.root, state.root());
        }
    }
}
