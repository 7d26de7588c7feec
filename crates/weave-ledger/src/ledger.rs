//! The event ledger.
//!
//! The ledger owns the event DAG: every accepted event, the current tips
//! (events no other event names as a parent), the checkpoint list, and the
//! counter that drives automatic checkpointing. Local events enter through
//! [`Ledger::append`]; everything sourced elsewhere enters through
//! [`Ledger::validate_and_insert`].

use crate::checkpoint::Checkpoint;
use crate::clock::{HybridClock, Hlc};
use crate::config::LedgerConfig;
use crate::crypto::{self, AgentId, AgentKeypair};
use crate::error::{LedgerError, Result, ValidationError};
use crate::event::{EventEnvelope, EventKind, EventPayload, LedgerEvent};
use crate::hash::{EventId, Hasher};
use crate::merkle::{MerkleProof, MerkleTree};
use crate::storage::{FileStore, LedgerStore, MemoryStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

const KEY_FILE: &str = "agent.key";

/// Result of running an event through admission checks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventValidation {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub signature_valid: bool,
    pub causality_valid: bool,
    pub parents_exist: bool,
    /// The event was already stored; nothing changed.
    pub already_present: bool,
}

impl EventValidation {
    fn duplicate() -> Self {
        EventValidation {
            valid: true,
            errors: Vec::new(),
            signature_valid: true,
            causality_valid: true,
            parents_exist: true,
            already_present: true,
        }
    }

    /// Valid and newly stored.
    pub fn is_new(&self) -> bool {
        self.valid && !self.already_present
    }
}

/// Filters for [`Ledger::query_events`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventQueryOptions {
    pub kind: Option<EventKind>,
    pub author: Option<AgentId>,
    /// Inclusive lower bound on physical time (ms).
    pub since: Option<u64>,
    /// Inclusive upper bound on physical time (ms).
    pub until: Option<u64>,
    pub limit: Option<usize>,
    pub include_proof: bool,
}

impl EventQueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn author(mut self, author: AgentId) -> Self {
        self.author = Some(author);
        self
    }

    pub fn since(mut self, ms: u64) -> Self {
        self.since = Some(ms);
        self
    }

    pub fn until(mut self, ms: u64) -> Self {
        self.until = Some(ms);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_proofs(mut self) -> Self {
        self.include_proof = true;
        self
    }

    fn matches(&self, event: &LedgerEvent) -> bool {
        let hlc = event.hlc();
        self.kind.map_or(true, |kind| event.kind() == kind)
            && self.author.map_or(true, |author| *event.author() == author)
            && self.since.map_or(true, |since| hlc.physical_ms >= since)
            && self.until.map_or(true, |until| hlc.physical_ms <= until)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventQueryResult {
    pub events: Vec<LedgerEvent>,
    pub proofs: Option<Vec<MerkleProof>>,
    pub total_count: usize,
    pub has_more: bool,
}

/// Aggregate ledger statistics. Also the input to a checkpoint's state root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStats {
    pub total_events: u64,
    /// Height of the latest checkpoint, if any.
    pub checkpoint_height: Option<u32>,
    pub unique_authors: u64,
    pub events_by_type: BTreeMap<EventKind, u64>,
    pub last_event_time: Option<Hlc>,
    pub tip_count: u64,
}

/// A full snapshot of ledger contents.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerExport {
    pub events: Vec<LedgerEvent>,
    pub checkpoints: Vec<Checkpoint>,
    pub tips: Vec<EventId>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    pub imported: usize,
    pub rejected: usize,
    pub already_present: usize,
    pub checkpoints_replaced: bool,
}

/// The append-only event DAG.
pub struct Ledger {
    config: LedgerConfig,
    keypair: AgentKeypair,
    clock: HybridClock,
    events: HashMap<EventId, LedgerEvent>,
    tips: BTreeSet<EventId>,
    /// Reverse index: parent -> children.
    children_index: HashMap<EventId, HashSet<EventId>>,
    checkpoints: Vec<Checkpoint>,
    /// Tree over exactly the IDs the latest checkpoint covers.
    sealed: Option<MerkleTree>,
    events_since_checkpoint: u64,
    store: Box<dyn LedgerStore>,
}

impl Ledger {
    /// Open a ledger from configuration.
    ///
    /// With a `data_dir` the agent key and event journal live there and any
    /// existing state is restored; otherwise a fresh in-memory ledger with a
    /// newly generated key is returned.
    pub fn new(config: LedgerConfig) -> Result<Self> {
        let config = config.sanitized();
        match config.data_dir.clone() {
            Some(dir) => {
                let keypair = AgentKeypair::load_or_generate(&dir.join(KEY_FILE))?;
                let store = FileStore::open(&dir)?;
                Self::open(config, keypair, HybridClock::new(), Box::new(store))
            }
            None => Ok(Self::in_memory(config, AgentKeypair::generate())),
        }
    }

    /// A memory-only ledger driven by the system clock.
    pub fn in_memory(config: LedgerConfig, keypair: AgentKeypair) -> Self {
        Self::empty(config.sanitized(), keypair, HybridClock::new(), Box::new(MemoryStore))
    }

    /// Assemble a ledger from explicit parts, restoring whatever `store` holds.
    pub fn open(
        config: LedgerConfig,
        keypair: AgentKeypair,
        clock: HybridClock,
        store: Box<dyn LedgerStore>,
    ) -> Result<Self> {
        let state = store.load()?;
        let mut ledger = Self::empty(config.sanitized(), keypair, clock, store);
        ledger.restore(state.events, state.checkpoints);
        Ok(ledger)
    }

    fn empty(
        config: LedgerConfig,
        keypair: AgentKeypair,
        clock: HybridClock,
        store: Box<dyn LedgerStore>,
    ) -> Self {
        Ledger {
            config,
            keypair,
            clock,
            events: HashMap::new(),
            tips: BTreeSet::new(),
            children_index: HashMap::new(),
            checkpoints: Vec::new(),
            sealed: None,
            events_since_checkpoint: 0,
            store,
        }
    }

    fn restore(&mut self, events: Vec<LedgerEvent>, checkpoints: Vec<Checkpoint>) {
        let total = events.len();
        let mut max_hlc: Option<Hlc> = None;

        // Same admission checks as `validate_and_insert`; the clock is merged
        // once at the end instead of per event.
        for event in causal_order(events) {
            let validation = self.validate(&event);
            if !validation.valid {
                tracing::warn!(
                    event_id = %event.id.short(),
                    errors = ?validation.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
                    "dropping unverifiable event from storage"
                );
                continue;
            }
            max_hlc = max_hlc.max(Some(event.hlc()));
            self.index_event(event);
        }

        if let Some(hlc) = max_hlc {
            self.clock.receive(hlc);
        }
        self.checkpoints = checkpoints;
        self.refresh_sealed_tree();
        self.recount_since_checkpoint();

        if total > 0 {
            tracing::info!(
                events = self.events.len(),
                dropped = total - self.events.len(),
                checkpoints = self.checkpoints.len(),
                "restored ledger from storage"
            );
        }
    }

    fn refresh_sealed_tree(&mut self) {
        let sealed = self
            .latest_checkpoint()
            .and_then(|checkpoint| self.sealed_tree_for(checkpoint));
        if sealed.is_none() && !self.checkpoints.is_empty() {
            tracing::warn!("latest checkpoint does not match any stored event set, proofs unavailable");
        }
        self.sealed = sealed;
    }

    /// Recover the ID set a checkpoint was taken over.
    ///
    /// The `CheckpointCreated` announcement names every tip at checkpoint
    /// time as a parent, so its ancestry is exactly the covered set.
    fn sealed_tree_for(&self, checkpoint: &Checkpoint) -> Option<MerkleTree> {
        self.events
            .values()
            .filter(|e| {
                matches!(
                    &e.envelope.payload,
                    EventPayload::CheckpointCreated { height, event_root, .. }
                        if *height == checkpoint.height && *event_root == checkpoint.event_root
                )
            })
            .map(|e| MerkleTree::from_ids(self.ancestors(&e.id)))
            .chain(std::iter::once_with(|| self.current_tree()))
            .find(|tree| tree.root() == checkpoint.event_root)
    }

    fn recount_since_checkpoint(&mut self) {
        let covered = self.checkpoints.last().map_or(0, |c| c.event_count);
        self.events_since_checkpoint = (self.events.len() as u64).saturating_sub(covered);
    }

    pub fn agent_id(&self) -> AgentId {
        self.keypair.agent_id()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// The latest HLC issued or merged by the local clock.
    pub fn clock_time(&self) -> Hlc {
        self.clock.last()
    }

    pub fn get_event(&self, id: &EventId) -> Option<&LedgerEvent> {
        self.events.get(id)
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.events.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Current DAG tips, sorted.
    pub fn tips(&self) -> Vec<EventId> {
        self.tips.iter().copied().collect()
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    pub fn events_since_checkpoint(&self) -> u64 {
        self.events_since_checkpoint
    }

    /// Append a locally authored event on top of the current tips.
    pub fn append(&mut self, payload: EventPayload) -> Result<LedgerEvent> {
        let parents = self.tips();
        self.append_with_parents(payload, parents)
    }

    /// Append a locally authored event with an explicit parent set.
    ///
    /// An empty set starts a new root. Every parent must already be stored.
    pub fn append_with_parents(
        &mut self,
        payload: EventPayload,
        parents: Vec<EventId>,
    ) -> Result<LedgerEvent> {
        if let Some(missing) = parents.iter().find(|p| !self.events.contains_key(p)) {
            return Err(LedgerError::EventNotFound(*missing));
        }
        let event = self.seal_local(payload, parents)?;
        self.commit(event.clone())?;
        tracing::debug!(event_id = %event.id.short(), kind = %event.kind(), "appended event");

        if self.events_since_checkpoint >= self.config.checkpoint_interval {
            // The event is already durable; a failed checkpoint is retried on
            // the next append.
            if let Err(err) = self.create_checkpoint() {
                tracing::error!(error = %err, "automatic checkpoint failed");
            }
        }
        Ok(event)
    }

    fn seal_local(&mut self, payload: EventPayload, parents: Vec<EventId>) -> Result<LedgerEvent> {
        let envelope = EventEnvelope {
            parents,
            hlc: self.clock.tick(),
            author: self.keypair.agent_id(),
            payload,
        };
        Ok(LedgerEvent::seal(envelope, &self.keypair)?)
    }

    /// Persist, then index. Nothing in memory changes if persisting fails.
    fn commit(&mut self, event: LedgerEvent) -> Result<()> {
        self.store.append_event(&event)?;
        self.index_event(event);
        self.events_since_checkpoint += 1;
        Ok(())
    }

    fn index_event(&mut self, event: LedgerEvent) {
        let id = event.id;
        for parent in event.parents() {
            self.tips.remove(parent);
            self.children_index.entry(*parent).or_default().insert(id);
        }
        if !self.children_index.contains_key(&id) {
            self.tips.insert(id);
        }
        self.events.insert(id, event);
    }

    /// Check an externally sourced event and store it only if every check
    /// passes.
    pub fn validate_and_insert(&mut self, event: LedgerEvent) -> Result<EventValidation> {
        if self.events.contains_key(&event.id) {
            return Ok(EventValidation::duplicate());
        }

        let validation = self.validate(&event);
        if !validation.valid {
            tracing::warn!(
                event_id = %event.id.short(),
                author = %event.author().short(),
                errors = ?validation.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
                "rejected event"
            );
            return Ok(validation);
        }

        let hlc = event.hlc();
        let id = event.id;
        self.commit(event)?;
        self.clock.receive(hlc);
        tracing::debug!(event_id = %id.short(), %hlc, "accepted event");
        Ok(validation)
    }

    fn validate(&self, event: &LedgerEvent) -> EventValidation {
        let mut errors = Vec::new();

        let signature_valid = if !crypto::is_valid_agent(event.author()) {
            errors.push(ValidationError::UnknownAuthorKey(event.author().to_hex()));
            false
        } else if !event.verify_signature() {
            errors.push(ValidationError::InvalidSignature(event.id));
            false
        } else {
            true
        };

        let mut parents_exist = true;
        let mut causality_valid = true;
        for parent_id in event.parents() {
            match self.events.get(parent_id) {
                None => {
                    parents_exist = false;
                    errors.push(ValidationError::ParentNotFound(*parent_id));
                }
                Some(parent) if event.hlc() <= parent.hlc() => {
                    causality_valid = false;
                    errors.push(ValidationError::CausalityViolation(*parent_id));
                }
                Some(_) => {}
            }
        }

        match event.envelope.compute_id() {
            Ok(computed) if computed == event.id => {}
            Ok(computed) => errors.push(ValidationError::IdMismatch {
                claimed: event.id,
                computed,
            }),
            Err(err) => errors.push(ValidationError::Serialization(err.to_string())),
        }

        EventValidation {
            valid: errors.is_empty(),
            errors,
            signature_valid,
            causality_valid,
            parents_exist,
            already_present: false,
        }
    }

    /// Seal the current state into a new checkpoint and announce it with a
    /// `CheckpointCreated` event.
    ///
    /// The announcement is itself part of the DAG and is covered by the next
    /// checkpoint, not this one.
    pub fn create_checkpoint(&mut self) -> Result<Checkpoint> {
        let tree = self.current_tree();
        let event_root = tree.root();
        let state_root = Hasher::hash(&serde_json::to_vec(&serde_json::to_value(self.get_stats())?)?);
        let height = self.checkpoints.len() as u32;

        let checkpoint = Checkpoint::new(
            height,
            event_root,
            state_root,
            self.clock.last(),
            self.events.len() as u64,
            &self.keypair,
        );
        let announcement = self.seal_local(
            EventPayload::CheckpointCreated {
                height,
                event_root,
                state_root,
            },
            self.tips(),
        )?;

        // Checkpoint and announcement land together or not at all.
        self.checkpoints.push(checkpoint.clone());
        if let Err(err) = self.store.write_checkpoints(&self.checkpoints) {
            self.checkpoints.pop();
            return Err(err);
        }
        if let Err(err) = self.store.append_event(&announcement) {
            self.checkpoints.pop();
            if let Err(rollback) = self.store.write_checkpoints(&self.checkpoints) {
                tracing::error!(error = %rollback, height, "failed to roll back persisted checkpoint");
            }
            return Err(err);
        }

        self.index_event(announcement);
        self.sealed = Some(tree);
        // The announcement is the first event of the next interval.
        self.events_since_checkpoint = 1;
        tracing::info!(height, event_root = %event_root.short(), events = checkpoint.event_count, "created checkpoint");
        Ok(checkpoint)
    }

    /// Verify a checkpoint's validator signatures.
    pub fn verify_checkpoint(&self, checkpoint: &Checkpoint) -> bool {
        checkpoint.verify_signatures()
    }

    /// Filter, order by HLC and page through stored events.
    pub fn query_events(&self, options: &EventQueryOptions) -> EventQueryResult {
        let mut matched: Vec<&LedgerEvent> =
            self.events.values().filter(|e| options.matches(e)).collect();
        matched.sort_by(|a, b| a.hlc().cmp(&b.hlc()).then(a.id.cmp(&b.id)));

        let total_count = matched.len();
        let limit = options
            .limit
            .unwrap_or(self.config.default_query_limit)
            .min(self.config.max_query_limit);
        let has_more = total_count > limit;
        matched.truncate(limit);

        // Checkpointed events prove against the latest checkpoint; newer ones
        // only against the current unsealed set.
        let proofs = options.include_proof.then(|| {
            let mut current: Option<MerkleTree> = None;
            matched
                .iter()
                .filter_map(|e| {
                    self.sealed
                        .as_ref()
                        .and_then(|tree| tree.proof(&e.id))
                        .or_else(|| current.get_or_insert_with(|| self.current_tree()).proof(&e.id))
                })
                .collect()
        });

        EventQueryResult {
            events: matched.into_iter().cloned().collect(),
            proofs,
            total_count,
            has_more,
        }
    }

    fn current_tree(&self) -> MerkleTree {
        MerkleTree::from_ids(self.events.keys().copied())
    }

    /// Inclusion proof for an event against the latest checkpoint.
    ///
    /// `None` if there is no checkpoint yet or the event arrived after it.
    pub fn generate_merkle_proof(&self, id: &EventId) -> Option<MerkleProof> {
        self.sealed.as_ref()?.proof(id)
    }

    /// Inclusion proof against the current, not yet checkpointed, event set.
    pub fn generate_unsealed_proof(&self, id: &EventId) -> Option<MerkleProof> {
        self.current_tree().proof(id)
    }

    /// A proof is accepted only against the latest checkpoint's event root.
    pub fn verify_merkle_proof(&self, proof: &MerkleProof) -> bool {
        self.latest_checkpoint()
            .map_or(false, |checkpoint| proof.verify_against(&checkpoint.event_root))
    }

    pub fn get_stats(&self) -> ChainStats {
        let mut events_by_type = BTreeMap::new();
        let mut authors = HashSet::new();
        let mut last_event_time: Option<Hlc> = None;

        for event in self.events.values() {
            *events_by_type.entry(event.kind()).or_insert(0) += 1;
            authors.insert(*event.author());
            last_event_time = last_event_time.max(Some(event.hlc()));
        }

        ChainStats {
            total_events: self.events.len() as u64,
            checkpoint_height: self.latest_checkpoint().map(|c| c.height),
            unique_authors: authors.len() as u64,
            events_by_type,
            last_event_time,
            tip_count: self.tips.len() as u64,
        }
    }

    /// All ancestors of an event (transitive closure over parents).
    pub fn ancestors(&self, id: &EventId) -> HashSet<EventId> {
        let mut result = HashSet::new();
        let mut queue = VecDeque::new();

        if let Some(event) = self.events.get(id) {
            queue.extend(event.parents().iter().copied());
        }

        while let Some(current) = queue.pop_front() {
            if result.insert(current) {
                if let Some(event) = self.events.get(&current) {
                    queue.extend(event.parents().iter().copied());
                }
            }
        }

        result
    }

    /// Every stored event ID, parents before children.
    pub fn topological_order(&self) -> Vec<EventId> {
        causal_sort(self.events.values().collect())
            .into_iter()
            .map(|e| e.id)
            .collect()
    }

    /// Events not reachable from `frontier`, in causal order, capped at
    /// `limit`. The flag reports whether more were left out.
    ///
    /// Frontier IDs this ledger has never seen are ignored.
    pub fn events_unknown_to(&self, frontier: &[EventId], limit: usize) -> (Vec<LedgerEvent>, bool) {
        let known = self.collect_known(frontier);
        let unknown: Vec<&LedgerEvent> = self
            .events
            .values()
            .filter(|e| !known.contains(&e.id))
            .collect();

        let mut ordered = causal_sort(unknown);
        let has_more = ordered.len() > limit;
        ordered.truncate(limit);
        (ordered.into_iter().cloned().collect(), has_more)
    }

    /// The stored IDs in `ids` that are not ancestors of another ID in the
    /// set, sorted. Unknown IDs are dropped.
    pub fn frontier_of(&self, ids: &[EventId]) -> Vec<EventId> {
        let held: BTreeSet<EventId> = ids
            .iter()
            .filter(|id| self.events.contains_key(id))
            .copied()
            .collect();
        let parents: Vec<EventId> = held
            .iter()
            .filter_map(|id| self.events.get(id))
            .flat_map(|e| e.parents().iter().copied())
            .collect();
        let covered = self.collect_known(&parents);
        held.into_iter().filter(|id| !covered.contains(id)).collect()
    }

    fn collect_known(&self, frontier: &[EventId]) -> HashSet<EventId> {
        let mut known = HashSet::new();
        let mut queue: VecDeque<EventId> = frontier
            .iter()
            .filter(|id| self.events.contains_key(id))
            .copied()
            .collect();

        while let Some(id) = queue.pop_front() {
            if known.insert(id) {
                if let Some(event) = self.events.get(&id) {
                    queue.extend(event.parents().iter().copied());
                }
            }
        }

        known
    }

    pub fn export(&self) -> LedgerExport {
        LedgerExport {
            events: causal_sort(self.events.values().collect())
                .into_iter()
                .cloned()
                .collect(),
            checkpoints: self.checkpoints.clone(),
            tips: self.tips(),
        }
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.export())?)
    }

    /// Re-validate and admit every event in `data`.
    ///
    /// Events are replayed parents-first with HLC as the tie-break, so skewed
    /// peer clocks cannot make a child arrive before its parent. Imported
    /// checkpoints replace the local list only if they form a well-formed,
    /// fully signed chain.
    pub fn import(&mut self, data: LedgerExport) -> Result<ImportResult> {
        let mut result = ImportResult::default();

        for event in causal_order(data.events) {
            let validation = self.validate_and_insert(event)?;
            if validation.already_present {
                result.already_present += 1;
            } else if validation.valid {
                result.imported += 1;
            } else {
                result.rejected += 1;
            }
        }

        if !data.checkpoints.is_empty() {
            if checkpoint_chain_is_valid(&data.checkpoints) {
                self.store.write_checkpoints(&data.checkpoints)?;
                self.checkpoints = data.checkpoints;
                self.refresh_sealed_tree();
                self.recount_since_checkpoint();
                result.checkpoints_replaced = true;
            } else {
                tracing::warn!(
                    count = data.checkpoints.len(),
                    "ignoring imported checkpoints with bad heights or signatures"
                );
            }
        }

        tracing::info!(
            imported = result.imported,
            rejected = result.rejected,
            already_present = result.already_present,
            "import finished"
        );
        Ok(result)
    }

    pub fn import_json(&mut self, json: &str) -> Result<ImportResult> {
        let data: LedgerExport = serde_json::from_str(json)?;
        self.import(data)
    }

    /// Look up an event or fail with [`LedgerError::EventNotFound`].
    pub fn require_event(&self, id: &EventId) -> Result<&LedgerEvent> {
        self.events.get(id).ok_or(LedgerError::EventNotFound(*id))
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("agent_id", &self.agent_id())
            .field("events", &self.events.len())
            .field("tips", &self.tips.len())
            .field("checkpoints", &self.checkpoints.len())
            .finish()
    }
}

fn checkpoint_chain_is_valid(checkpoints: &[Checkpoint]) -> bool {
    checkpoints
        .iter()
        .enumerate()
        .all(|(i, c)| c.height as usize == i && c.verify_signatures())
}

/// Sort a batch parents-first (Kahn's algorithm), breaking ties by HLC then
/// ID. Parents outside the batch are treated as already satisfied.
fn causal_sort(events: Vec<&LedgerEvent>) -> Vec<&LedgerEvent> {
    let by_id: HashMap<EventId, &LedgerEvent> = events.iter().map(|e| (e.id, *e)).collect();
    let mut in_degree: HashMap<EventId, usize> = HashMap::new();
    let mut children: HashMap<EventId, Vec<EventId>> = HashMap::new();
    let mut ready: BTreeSet<(Hlc, EventId)> = BTreeSet::new();

    for event in by_id.values() {
        let in_batch: BTreeSet<EventId> = event
            .parents()
            .iter()
            .filter(|p| by_id.contains_key(p))
            .copied()
            .collect();
        for parent in &in_batch {
            children.entry(*parent).or_default().push(event.id);
        }
        in_degree.insert(event.id, in_batch.len());
        if in_batch.is_empty() {
            ready.insert((event.hlc(), event.id));
        }
    }

    let mut result = Vec::with_capacity(by_id.len());
    while let Some((hlc, id)) = ready.iter().next().copied() {
        ready.remove(&(hlc, id));
        result.push(by_id[&id]);
        for child in children.get(&id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(child) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    ready.insert((by_id[child].hlc(), *child));
                }
            }
        }
    }

    result
}

/// Owned version of [`causal_sort`], used for import and restore.
pub fn causal_order(events: Vec<LedgerEvent>) -> Vec<LedgerEvent> {
    let order: Vec<EventId> = causal_sort(events.iter().collect())
        .into_iter()
        .map(|e| e.id)
        .collect();
    let mut by_id: HashMap<EventId, LedgerEvent> = events.into_iter().map(|e| (e.id, e)).collect();
    order.into_iter().filter_map(|id| by_id.remove(&id)).collect()
}

/// A ledger shared between tasks.
///
/// Mutations take the write lock, so there is a single writer at a time;
/// reads take the read lock and always observe a consistent snapshot.
#[derive(Clone)]
pub struct SharedLedger {
    inner: Arc<parking_lot::RwLock<Ledger>>,
}

impl SharedLedger {
    pub fn new(ledger: Ledger) -> Self {
        SharedLedger {
            inner: Arc::new(parking_lot::RwLock::new(ledger)),
        }
    }

    /// Direct read access for multi-step inspections.
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, Ledger> {
        self.inner.read()
    }

    /// Direct write access for multi-step mutations.
    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, Ledger> {
        self.inner.write()
    }

    pub fn append_event(&self, payload: EventPayload) -> Result<LedgerEvent> {
        self.inner.write().append(payload)
    }

    pub fn append_with_parents(
        &self,
        payload: EventPayload,
        parents: Vec<EventId>,
    ) -> Result<LedgerEvent> {
        self.inner.write().append_with_parents(payload, parents)
    }

    pub fn validate_and_insert(&self, event: LedgerEvent) -> Result<EventValidation> {
        self.inner.write().validate_and_insert(event)
    }

    pub fn create_checkpoint(&self) -> Result<Checkpoint> {
        self.inner.write().create_checkpoint()
    }

    pub fn import(&self, data: LedgerExport) -> Result<ImportResult> {
        self.inner.write().import(data)
    }

    pub fn query_events(&self, options: &EventQueryOptions) -> EventQueryResult {
        self.inner.read().query_events(options)
    }

    pub fn generate_merkle_proof(&self, id: &EventId) -> Option<MerkleProof> {
        self.inner.read().generate_merkle_proof(id)
    }

    pub fn verify_merkle_proof(&self, proof: &MerkleProof) -> bool {
        self.inner.read().verify_merkle_proof(proof)
    }

    pub fn get_latest_checkpoint(&self) -> Option<Checkpoint> {
        self.inner.read().latest_checkpoint().cloned()
    }

    pub fn get_stats(&self) -> ChainStats {
        self.inner.read().get_stats()
    }

    pub fn get_config(&self) -> LedgerConfig {
        self.inner.read().config().clone()
    }

    pub fn export(&self) -> LedgerExport {
        self.inner.read().export()
    }

    pub fn agent_id(&self) -> AgentId {
        self.inner.read().agent_id()
    }

    pub fn tips(&self) -> Vec<EventId> {
        self.inner.read().tips()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl std::fmt::Debug for SharedLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.read().fmt(f)
    }
}
