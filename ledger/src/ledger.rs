//! Campaign-level facade over the coordinator.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use donation_ledger_merkle::{
    hex_digest, Digest, DonationRecord, MerkleError, MerkleProof, MerkleState, NodeStore, TreeId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    cache::StateCache,
    config::LedgerConfig,
    coordinator::{UpdateCoordinator, UpdatePhase},
    pipeline::{ProofPipeline, ValidityVerifier},
    submitter::{ExternalLedger, RecordSubmitter},
    Error, Result,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A campaign: its creator and the creator's campaign number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CampaignKey {
    #[serde(with = "donation_ledger_merkle::hex_serde")]
    pub creator: [u8; 32],
    pub campaign_id: u64,
}

impl CampaignKey {
    pub fn new(creator: [u8; 32], campaign_id: u64) -> Self {
        Self {
            creator,
            campaign_id,
        }
    }

    /// The campaign's donation tree.
    pub fn tree_id(&self) -> TreeId {
        TreeId::for_campaign(&self.creator, self.campaign_id)
    }
}

/// Running totals of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignTally {
    pub total_donation_received: u64,
    pub donation_count: u64,
    /// Timestamp of the latest donation, 0 before the first.
    pub last_update_time: i64,
    #[serde(with = "donation_ledger_merkle::hex_serde")]
    pub latest_root: Digest,
}

impl CampaignTally {
    fn empty(root: Digest) -> Self {
        Self {
            total_donation_received: 0,
            donation_count: 0,
            last_update_time: 0,
            latest_root: root,
        }
    }
}

/// Emitted once per accepted donation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationEvent {
    pub campaign_id: u64,
    pub tree_id: TreeId,
    #[serde(with = "donation_ledger_merkle::hex_serde")]
    pub donor_id: [u8; 32],
    pub amount: u64,
    pub timestamp: i64,
    pub leaf_index: u64,
    #[serde(with = "donation_ledger_merkle::hex_serde")]
    pub merkle_root: Digest,
}

/// What a successful donation returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonationReceipt {
    pub leaf_index: u64,
    pub root: Digest,
    /// Inclusion proof of the donation against `root`.
    pub proof: MerkleProof,
    pub event: DonationEvent,
}

#[derive(Debug)]
struct Campaign {
    tree_id: TreeId,
    tally: CampaignTally,
    /// Leaf count of the tree at `tally.latest_root`.
    root_leaf_count: u64,
    /// Donations admitted but not yet committed or abandoned.
    reserved_amount: u64,
    reserved_count: u64,
}

impl Campaign {
    fn reserve(&mut self, amount: u64) -> Result<()> {
        let total = self
            .tally
            .total_donation_received
            .checked_add(self.reserved_amount)
            .and_then(|t| t.checked_add(amount));
        if total.is_none() {
            return Err(Error::ArithmeticOverflow(format!(
                "total {} + pending {} + donation {} exceeds u64",
                self.tally.total_donation_received, self.reserved_amount, amount
            )));
        }
        let count = self
            .tally
            .donation_count
            .checked_add(self.reserved_count)
            .and_then(|c| c.checked_add(1));
        if count.is_none() {
            return Err(Error::ArithmeticOverflow("donation count exceeds u64".to_string()));
        }
        self.reserved_amount += amount;
        self.reserved_count += 1;
        Ok(())
    }

    fn release(&mut self, amount: u64) {
        self.reserved_amount = self.reserved_amount.saturating_sub(amount);
        self.reserved_count = self.reserved_count.saturating_sub(1);
    }
}

/// Room in a campaign's tally held for one donation while it is appended.
/// Dropping it without [`TallyReservation::settle`] gives the room back.
struct TallyReservation<'a> {
    campaigns: &'a RwLock<HashMap<CampaignKey, Campaign>>,
    campaign: CampaignKey,
    amount: u64,
    settled: bool,
}

impl TallyReservation<'_> {
    /// Count the committed donation into the tally.
    fn settle(mut self, record: &DonationRecord, state: &MerkleState) {
        self.settled = true;
        let mut campaigns = self.campaigns.write().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = campaigns.get_mut(&self.campaign) else {
            return;
        };
        entry.release(self.amount);
        // Both fit: the reservation was checked against the same totals.
        entry.tally.total_donation_received =
            entry.tally.total_donation_received.saturating_add(self.amount);
        entry.tally.donation_count = entry.tally.donation_count.saturating_add(1);
        // Concurrent donors may settle out of leaf order.
        if state.leaf_count() > entry.root_leaf_count {
            entry.root_leaf_count = state.leaf_count();
            entry.tally.latest_root = *state.root();
            entry.tally.last_update_time = record.timestamp();
        }
    }
}

impl Drop for TallyReservation<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut campaigns = self.campaigns.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = campaigns.get_mut(&self.campaign) {
            entry.release(self.amount);
        }
    }
}

/// Donation ledger: one append-only tree per campaign, proofs checked
/// before submission, tallies and events on every accepted donation.
pub struct DonationLedger {
    config: LedgerConfig,
    coordinator: UpdateCoordinator,
    cache: Arc<StateCache>,
    campaigns: RwLock<HashMap<CampaignKey, Campaign>>,
    events: broadcast::Sender<DonationEvent>,
}

impl std::fmt::Debug for DonationLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DonationLedger")
            .field("config", &self.config)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl DonationLedger {
    /// Wire a ledger over `store`, `verifier` and `external`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` does not validate.
    pub fn new(
        config: LedgerConfig,
        store: Arc<dyn NodeStore>,
        verifier: Arc<dyn ValidityVerifier>,
        external: Arc<dyn ExternalLedger>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(StateCache::new(config.cache.max_age));
        let coordinator = UpdateCoordinator::new(
            &config,
            store,
            cache.clone(),
            ProofPipeline::new(verifier),
            RecordSubmitter::new(external),
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            coordinator,
            cache,
            campaigns: RwLock::new(HashMap::new()),
            events,
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// The underlying coordinator.
    pub fn coordinator(&self) -> &UpdateCoordinator {
        &self.coordinator
    }

    /// Receive every donation accepted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DonationEvent> {
        self.events.subscribe()
    }

    fn campaign_tree(&self, campaign: &CampaignKey) -> Result<TreeId> {
        self.campaigns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(campaign)
            .map(|c| c.tree_id)
            .ok_or_else(|| Error::UnknownTree(campaign.tree_id()))
    }

    /// Hold room for `amount` in the tally of `campaign`, so that whatever
    /// reaches the tree can always be counted.
    fn reserve(
        &self,
        campaign: &CampaignKey,
        amount: u64,
    ) -> Result<(TreeId, TallyReservation<'_>)> {
        let mut campaigns = self.campaigns.write().unwrap_or_else(|e| e.into_inner());
        let entry = campaigns
            .get_mut(campaign)
            .ok_or_else(|| Error::UnknownTree(campaign.tree_id()))?;
        entry.reserve(amount)?;
        Ok((
            entry.tree_id,
            TallyReservation {
                campaigns: &self.campaigns,
                campaign: *campaign,
                amount,
                settled: false,
            },
        ))
    }

    /// Create the donation tree of `campaign`.
    ///
    /// `height` defaults to the configured `default_height`.
    pub fn open_campaign(&self, campaign: CampaignKey, height: Option<u8>) -> Result<MerkleState> {
        let tree_id = campaign.tree_id();
        let state = MerkleState::initialize(tree_id, height.unwrap_or(self.config.default_height))?;

        let mut campaigns = self.campaigns.write().unwrap_or_else(|e| e.into_inner());
        if campaigns.contains_key(&campaign) {
            return Err(Error::TreeAlreadyRegistered(tree_id));
        }
        self.coordinator.register(state)?;
        campaigns.insert(
            campaign,
            Campaign {
                tree_id,
                tally: CampaignTally::empty(*state.root()),
                root_leaf_count: 0,
                reserved_amount: 0,
                reserved_count: 0,
            },
        );
        info!(
            tree_id = %tree_id,
            campaign_id = campaign.campaign_id,
            height = state.height(),
            "campaign opened"
        );
        Ok(state)
    }

    /// Stop accepting donations to `campaign`. Its tree and tally stay
    /// readable.
    pub async fn close_campaign(&self, campaign: &CampaignKey) -> Result<()> {
        let tree_id = self.campaign_tree(campaign)?;
        self.coordinator.close(&tree_id).await
    }

    /// Record a donation to `campaign`.
    ///
    /// `validity_proof` is an encoded validity proof envelope whose public
    /// inputs must match `record`. `deadline` bounds each external call.
    pub async fn donate(
        &self,
        campaign: &CampaignKey,
        record: &DonationRecord,
        validity_proof: Option<Vec<u8>>,
        deadline: Option<Duration>,
    ) -> Result<DonationReceipt> {
        if record.campaign_id() != campaign.campaign_id {
            return Err(Error::CampaignMismatch {
                expected: campaign.campaign_id,
                actual: record.campaign_id(),
            });
        }
        let (tree_id, reservation) = self.reserve(campaign, record.amount())?;

        let outcome = self
            .coordinator
            .append(&tree_id, record, validity_proof, deadline)
            .await?;
        let root = *outcome.state.root();
        reservation.settle(record, &outcome.state);

        let event = DonationEvent {
            campaign_id: campaign.campaign_id,
            tree_id,
            donor_id: *record.donor_id(),
            amount: record.amount(),
            timestamp: record.timestamp(),
            leaf_index: outcome.leaf_index,
            merkle_root: root,
        };
        // No subscribers is not an error.
        let _ = self.events.send(event.clone());
        info!(
            tree_id = %tree_id,
            campaign_id = campaign.campaign_id,
            leaf_index = outcome.leaf_index,
            amount = record.amount(),
            root = %hex_digest(&root),
            "donation recorded"
        );

        Ok(DonationReceipt {
            leaf_index: outcome.leaf_index,
            root,
            proof: outcome.proof,
            event,
        })
    }

    /// Running totals of `campaign`.
    pub fn tally(&self, campaign: &CampaignKey) -> Result<CampaignTally> {
        self.campaigns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(campaign)
            .map(|c| c.tally)
            .ok_or_else(|| Error::UnknownTree(campaign.tree_id()))
    }

    /// Snapshot of `tree_id`, served from cache unless `force_refresh`.
    pub async fn state(&self, tree_id: &TreeId, force_refresh: bool) -> Result<MerkleState> {
        self.cache
            .state_or_fetch(tree_id, force_refresh, async {
                self.coordinator.state(tree_id)
            })
            .await
    }

    /// Inclusion proof of `leaf_index`, served from cache unless
    /// `force_refresh`.
    pub async fn proof(
        &self,
        tree_id: &TreeId,
        leaf_index: u64,
        force_refresh: bool,
    ) -> Result<MerkleProof> {
        self.cache
            .proof_or_fetch(tree_id, leaf_index, force_refresh, async {
                self.coordinator.proof(tree_id, leaf_index)
            })
            .await
    }

    /// Fetch the external ledger's proof of `leaf_index` and check it
    /// against the local root.
    pub async fn external_proof(&self, tree_id: &TreeId, leaf_index: u64) -> Result<MerkleProof> {
        let state = self.coordinator.state(tree_id)?;
        let proof = self
            .coordinator
            .submitter()
            .query_proof(tree_id, leaf_index, self.coordinator.call_timeout())
            .await?
            .ok_or_else(|| MerkleError::IndexOutOfRange {
                tree_id: *tree_id,
                leaf_index,
                leaf_count: state.leaf_count(),
            })?;
        proof.verify_against_root(state.root())?;
        Ok(proof)
    }

    pub fn phase(&self, tree_id: &TreeId) -> Result<UpdatePhase> {
        self.coordinator.phase(tree_id)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use donation_ledger_merkle::{MemNodeStore, empty_root};

    use super::*;
    use crate::{memory::InMemoryExternalLedger, verifiers::AcceptAllVerifier, ErrorCategory};

    const CREATOR: [u8; 32] = [42; 32];

    fn ledger() -> (DonationLedger, Arc<InMemoryExternalLedger>) {
        let external = Arc::new(InMemoryExternalLedger::new());
        let ledger = DonationLedger::new(
            LedgerConfig::default(),
            Arc::new(MemNodeStore::new()),
            Arc::new(AcceptAllVerifier),
            external.clone(),
        )
        .unwrap();
        (ledger, external)
    }

    fn donation(donor: u8, amount: u64, campaign_id: u64) -> DonationRecord {
        DonationRecord::new([donor; 32], amount, 1_700_000_000 + donor as i64, campaign_id)
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let mut config = LedgerConfig::default();
        config.default_height = 0;
        let result = DonationLedger::new(
            config,
            Arc::new(MemNodeStore::new()),
            Arc::new(AcceptAllVerifier),
            Arc::new(InMemoryExternalLedger::new()),
        );
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[test]
    fn test_open_campaign() {
        let (ledger, _) = ledger();
        let campaign = CampaignKey::new(CREATOR, 1);
        let state = ledger.open_campaign(campaign, Some(4)).unwrap();
        assert_eq!(state.tree_id(), &campaign.tree_id());
        assert_eq!(state.root(), &empty_root(4));

        let tally = ledger.tally(&campaign).unwrap();
        assert_eq!(tally.donation_count, 0);
        assert_eq!(tally.latest_root, empty_root(4));

        assert_matches!(
            ledger.open_campaign(campaign, None),
            Err(Error::TreeAlreadyRegistered(id)) if id == campaign.tree_id()
        );
        let default_height = ledger.open_campaign(CampaignKey::new(CREATOR, 2), None).unwrap();
        assert_eq!(default_height.height(), ledger.config().default_height);
    }

    #[tokio::test]
    async fn test_donate_updates_tally_and_emits_event() {
        let (ledger, external) = ledger();
        let campaign = CampaignKey::new(CREATOR, 1);
        ledger.open_campaign(campaign, Some(3)).unwrap();
        let mut events = ledger.subscribe();

        let first = ledger
            .donate(&campaign, &donation(1, 500, 1), None, None)
            .await
            .unwrap();
        let second = ledger
            .donate(&campaign, &donation(2, 250, 1), None, None)
            .await
            .unwrap();

        assert_eq!(first.leaf_index, 0);
        assert_eq!(second.leaf_index, 1);
        assert!(second.proof.verify());

        let tally = ledger.tally(&campaign).unwrap();
        assert_eq!(tally.total_donation_received, 750);
        assert_eq!(tally.donation_count, 2);
        assert_eq!(tally.last_update_time, 1_700_000_002);
        assert_eq!(tally.latest_root, second.root);
        assert_eq!(
            external.state(&campaign.tree_id()).map(|s| *s.root()),
            Some(second.root)
        );

        assert_eq!(events.recv().await.unwrap(), first.event);
        let event = events.recv().await.unwrap();
        assert_eq!(event.amount, 250);
        assert_eq!(event.donor_id, [2; 32]);
        assert_eq!(event.leaf_index, 1);
        assert_eq!(event.merkle_root, second.root);
    }

    #[tokio::test]
    async fn test_donate_to_wrong_campaign() {
        let (ledger, external) = ledger();
        let campaign = CampaignKey::new(CREATOR, 1);
        ledger.open_campaign(campaign, Some(3)).unwrap();

        assert_matches!(
            ledger.donate(&campaign, &donation(1, 10, 9), None, None).await,
            Err(Error::CampaignMismatch { expected: 1, actual: 9 })
        );
        let unknown = CampaignKey::new(CREATOR, 9);
        assert_matches!(
            ledger.donate(&unknown, &donation(1, 10, 9), None, None).await,
            Err(Error::UnknownTree(id)) if id == unknown.tree_id()
        );
        assert_eq!(external.submissions(), 0);
    }

    #[tokio::test]
    async fn test_tally_overflow_is_refused_before_submission() {
        let (ledger, external) = ledger();
        let campaign = CampaignKey::new(CREATOR, 1);
        ledger.open_campaign(campaign, Some(3)).unwrap();

        ledger
            .donate(&campaign, &donation(1, u64::MAX, 1), None, None)
            .await
            .unwrap();
        let err = ledger
            .donate(&campaign, &donation(2, 1, 1), None, None)
            .await
            .unwrap_err();

        assert_matches!(err, Error::ArithmeticOverflow(_));
        assert_eq!(external.submissions(), 1);
        let tally = ledger.tally(&campaign).unwrap();
        assert_eq!(tally.total_donation_received, u64::MAX);
        assert_eq!(tally.donation_count, 1);
        assert_eq!(
            ledger
                .coordinator()
                .state(&campaign.tree_id())
                .unwrap()
                .leaf_count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_donations_cannot_overrun_tally() {
        let (ledger, external) = ledger();
        let campaign = CampaignKey::new(CREATOR, 1);
        ledger.open_campaign(campaign, Some(3)).unwrap();
        external.set_latency(Duration::from_millis(10));
        let mut events = ledger.subscribe();

        let first = donation(1, u64::MAX / 2 + 1, 1);
        let second = donation(2, u64::MAX / 2 + 1, 1);
        let (a, b) = tokio::join!(
            ledger.donate(&campaign, &first, None, None),
            ledger.donate(&campaign, &second, None, None),
        );

        let receipt = a.unwrap();
        let err = b.unwrap_err();
        assert_matches!(err, Error::ArithmeticOverflow(_));
        assert_eq!(err.category(), ErrorCategory::InvalidData);

        // Only the admitted donation reached either tree.
        assert_eq!(external.submissions(), 1);
        assert_eq!(
            external.state(&campaign.tree_id()).unwrap().leaf_count(),
            1
        );
        assert_eq!(
            ledger
                .coordinator()
                .state(&campaign.tree_id())
                .unwrap()
                .leaf_count(),
            1
        );
        let tally = ledger.tally(&campaign).unwrap();
        assert_eq!(tally.donation_count, 1);
        assert_eq!(tally.total_donation_received, u64::MAX / 2 + 1);
        assert_eq!(tally.latest_root, receipt.root);
        assert_eq!(events.recv().await.unwrap(), receipt.event);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_donation_releases_its_reservation() {
        let (ledger, external) = ledger();
        let campaign = CampaignKey::new(CREATOR, 1);
        ledger.open_campaign(campaign, Some(3)).unwrap();

        external.reject_next("insufficient funds");
        assert_matches!(
            ledger
                .donate(&campaign, &donation(1, u64::MAX, 1), None, None)
                .await,
            Err(Error::Rejected(_))
        );

        let receipt = ledger
            .donate(&campaign, &donation(2, u64::MAX, 1), None, None)
            .await
            .unwrap();
        assert_eq!(receipt.leaf_index, 0);
        let tally = ledger.tally(&campaign).unwrap();
        assert_eq!(tally.total_donation_received, u64::MAX);
        assert_eq!(tally.donation_count, 1);
    }

    #[tokio::test]
    async fn test_state_served_from_cache_until_refresh() {
        let (ledger, _) = ledger();
        let campaign = CampaignKey::new(CREATOR, 1);
        let tree_id = campaign.tree_id();
        let opened = ledger.open_campaign(campaign, Some(3)).unwrap();

        assert_eq!(ledger.state(&tree_id, false).await.unwrap(), opened);
        let receipt = ledger
            .donate(&campaign, &donation(1, 10, 1), None, None)
            .await
            .unwrap();
        // The commit dropped the cached snapshot.
        let state = ledger.state(&tree_id, false).await.unwrap();
        assert_eq!(state.root(), &receipt.root);

        ledger.cache.put_state(opened);
        assert_eq!(ledger.state(&tree_id, false).await.unwrap(), opened);
        assert_eq!(ledger.state(&tree_id, true).await.unwrap(), state);
        assert_eq!(ledger.state(&tree_id, false).await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_proofs_from_cache_and_external_ledger() {
        let (ledger, _) = ledger();
        let campaign = CampaignKey::new(CREATOR, 1);
        let tree_id = campaign.tree_id();
        ledger.open_campaign(campaign, Some(3)).unwrap();
        for donor in 1..=3 {
            ledger
                .donate(&campaign, &donation(donor, 10, 1), None, None)
                .await
                .unwrap();
        }

        let local = ledger.proof(&tree_id, 1, false).await.unwrap();
        assert_eq!(ledger.proof(&tree_id, 1, false).await.unwrap(), local);
        assert_eq!(ledger.external_proof(&tree_id, 1).await.unwrap(), local);

        assert_matches!(
            ledger.proof(&tree_id, 3, false).await,
            Err(Error::Merkle(MerkleError::IndexOutOfRange { leaf_index: 3, .. }))
        );
        assert_matches!(
            ledger.external_proof(&tree_id, 3).await,
            Err(Error::Merkle(MerkleError::IndexOutOfRange { leaf_count: 3, .. }))
        );
    }

    #[tokio::test]
    async fn test_closed_campaign_keeps_history() {
        let (ledger, _) = ledger();
        let campaign = CampaignKey::new(CREATOR, 1);
        ledger.open_campaign(campaign, Some(3)).unwrap();
        let receipt = ledger
            .donate(&campaign, &donation(1, 10, 1), None, None)
            .await
            .unwrap();

        ledger.close_campaign(&campaign).await.unwrap();

        assert_matches!(
            ledger.donate(&campaign, &donation(2, 10, 1), None, None).await,
            Err(Error::TreeClosed(_))
        );
        assert_eq!(ledger.tally(&campaign).unwrap().donation_count, 1);
        assert_eq!(
            ledger.proof(&campaign.tree_id(), 0, true).await.unwrap(),
            receipt.proof
        );
    }

    #[test]
    fn test_event_json() {
        let event = DonationEvent {
            campaign_id: 3,
            tree_id: TreeId::new([1; 32]),
            donor_id: [2; 32],
            amount: 10,
            timestamp: 5,
            leaf_index: 0,
            merkle_root: [3; 32],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["amount"], 10);
        assert_eq!(json["donor_id"], format!("0x{}", "02".repeat(32)));
        assert_eq!(json["tree_id"], format!("0x{}", "01".repeat(32)));
        let back: DonationEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
