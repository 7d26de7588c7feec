//! Integration tests for the event ledger.
//!
//! Tests cover:
//! - Admission checks and their atomicity
//! - Idempotent re-insertion
//! - Export/import between agents
//! - Reload from the file store
//! - Tip and causality invariants under random histories

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use weave_ledger::{
    sign, AgentKeypair, EventEnvelope, EventId, EventKind, EventPayload, EventQueryOptions,
    FileStore, HybridClock, Ledger, LedgerConfig, LedgerConfigBuilder, LedgerEvent, LedgerStore,
    ManualTimeSource, MemoryStore, SharedLedger, ValidationError,
};

fn manual_ledger(secret: u8, start_ms: u64) -> (Ledger, ManualTimeSource) {
    let source = ManualTimeSource::new(start_ms);
    let ledger = Ledger::open(
        LedgerConfig::default(),
        AgentKeypair::from_secret([secret; 32]),
        HybridClock::with_source(Arc::new(source.clone())),
        Box::new(MemoryStore),
    )
    .unwrap();
    (ledger, source)
}

fn node(name: &str) -> EventPayload {
    EventPayload::node_created(name, "concept")
}

/// Stored IDs that no stored event names as a parent.
fn recomputed_tips(ledger: &Ledger) -> Vec<EventId> {
    let export = ledger.export();
    let referenced: HashSet<EventId> = export
        .events
        .iter()
        .flat_map(|e| e.parents().iter().copied())
        .collect();
    let mut tips: Vec<EventId> = export
        .events
        .iter()
        .map(|e| e.id)
        .filter(|id| !referenced.contains(id))
        .collect();
    tips.sort();
    tips
}

#[test]
fn test_id_mismatch_is_rejected_without_side_effects() {
    let (mut source, _) = manual_ledger(1, 1_000);
    let mut forged = source.append(node("original")).unwrap();
    forged.envelope.payload = node("tampered");

    let (mut target, _) = manual_ledger(2, 1_000);
    target.append(node("local")).unwrap();
    let before = target.export();
    let clock_before = target.clock_time();

    let validation = target.validate_and_insert(forged).unwrap();
    assert!(!validation.valid);
    assert!(validation.signature_valid);
    assert!(validation
        .errors
        .iter()
        .any(|e| e.to_string().contains("Event ID mismatch")));

    assert_eq!(target.export(), before);
    assert_eq!(target.clock_time(), clock_before);
}

#[test]
fn test_foreign_signature_is_rejected() {
    let (mut source, _) = manual_ledger(1, 1_000);
    let mut event = source.append(node("a")).unwrap();
    event.signature = sign(&event.id, &AgentKeypair::from_secret([7u8; 32]));

    let (mut target, _) = manual_ledger(2, 1_000);
    let validation = target.validate_and_insert(event.clone()).unwrap();
    assert!(!validation.valid);
    assert!(!validation.signature_valid);
    assert_eq!(validation.errors, vec![ValidationError::InvalidSignature(event.id)]);
    assert!(target.is_empty());
}

#[test]
fn test_missing_parent_is_rejected() {
    let (mut source, _) = manual_ledger(1, 1_000);
    let parent = source.append(node("parent")).unwrap();
    let child = source.append(node("child")).unwrap();

    let (mut target, _) = manual_ledger(2, 1_000);
    let validation = target.validate_and_insert(child).unwrap();
    assert!(!validation.parents_exist);
    assert_eq!(validation.errors, vec![ValidationError::ParentNotFound(parent.id)]);
    assert!(target.tips().is_empty());
}

#[test]
fn test_child_not_after_parent_is_a_causality_violation() {
    let key = AgentKeypair::from_secret([3u8; 32]);
    let (mut target, _) = manual_ledger(2, 1_000);

    let parent = LedgerEvent::seal(
        EventEnvelope {
            parents: Vec::new(),
            hlc: weave_ledger::Hlc::new(500, 3),
            author: key.agent_id(),
            payload: node("parent"),
        },
        &key,
    )
    .unwrap();
    assert!(target.validate_and_insert(parent.clone()).unwrap().is_new());

    let child = LedgerEvent::seal(
        EventEnvelope {
            parents: vec![parent.id],
            hlc: weave_ledger::Hlc::new(500, 3),
            author: key.agent_id(),
            payload: node("child"),
        },
        &key,
    )
    .unwrap();
    let validation = target.validate_and_insert(child).unwrap();
    assert!(!validation.causality_valid);
    assert!(validation.parents_exist);
    assert_eq!(validation.errors, vec![ValidationError::CausalityViolation(parent.id)]);
    assert_eq!(target.tips(), vec![parent.id]);
}

#[test]
fn test_duplicate_insert_is_a_noop() {
    let (mut source, _) = manual_ledger(1, 5_000);
    let event = source.append(node("a")).unwrap();

    let (mut target, _) = manual_ledger(2, 1_000);
    let first = target.validate_and_insert(event.clone()).unwrap();
    assert!(first.is_new());
    let clock_after_first = target.clock_time();

    let second = target.validate_and_insert(event.clone()).unwrap();
    assert!(second.valid);
    assert!(second.already_present);
    assert_eq!(target.len(), 1);
    assert_eq!(target.tips(), vec![event.id]);
    assert_eq!(target.clock_time(), clock_after_first);
}

#[test]
fn test_accepting_remote_event_advances_clock() {
    let (mut source, _) = manual_ledger(1, 9_000);
    let remote = source.append(node("future")).unwrap();

    let (mut target, _) = manual_ledger(2, 1_000);
    target.validate_and_insert(remote.clone()).unwrap();
    let local = target.append(node("after")).unwrap();

    assert!(local.hlc() > remote.hlc());
    assert_eq!(local.parents(), &[remote.id]);
}

#[test]
fn test_auto_checkpoint_scenario() {
    let config = LedgerConfigBuilder::new().checkpoint_interval(2).build();
    let mut ledger = Ledger::in_memory(config, AgentKeypair::from_secret([1u8; 32]));

    ledger.append(node("a")).unwrap();
    ledger.append(node("b")).unwrap();

    assert_eq!(ledger.len(), 3);
    assert_eq!(ledger.events_since_checkpoint(), 1);
    let checkpoint = ledger.latest_checkpoint().unwrap();
    assert_eq!(checkpoint.height, 0);
    assert!(ledger.verify_checkpoint(checkpoint));

    let announcements =
        ledger.query_events(&EventQueryOptions::new().kind(EventKind::CheckpointCreated));
    assert_eq!(announcements.total_count, 1);
}

#[test]
fn test_export_import_between_agents() {
    let (mut alice, _) = manual_ledger(1, 1_000);
    for name in ["a", "b", "c"] {
        alice.append(node(name)).unwrap();
    }
    alice.create_checkpoint().unwrap();

    let (mut bob, _) = manual_ledger(2, 1_000);
    let json = alice.export_json().unwrap();
    let result = bob.import_json(&json).unwrap();

    assert_eq!(result.imported, 4);
    assert_eq!(result.rejected, 0);
    assert!(result.checkpoints_replaced);
    assert_eq!(bob.tips(), alice.tips());
    assert_eq!(bob.checkpoints(), alice.checkpoints());
    assert_eq!(bob.events_since_checkpoint(), 1);

    let again = bob.import(alice.export()).unwrap();
    assert_eq!(again.imported, 0);
    assert_eq!(again.already_present, 4);

    // Bob can prove Alice's checkpointed events against the adopted checkpoint.
    let first = alice.export().events[0].id;
    let proof = bob.generate_merkle_proof(&first).unwrap();
    assert!(bob.verify_merkle_proof(&proof));
    assert_eq!(proof, alice.generate_merkle_proof(&first).unwrap());
}

#[test]
fn test_import_rejects_tampered_checkpoints() {
    let (mut alice, _) = manual_ledger(1, 1_000);
    alice.append(node("a")).unwrap();
    alice.create_checkpoint().unwrap();

    let mut export = alice.export();
    export.checkpoints[0].height = 4;

    let (mut bob, _) = manual_ledger(2, 1_000);
    let result = bob.import(export).unwrap();
    assert_eq!(result.imported, 2);
    assert!(!result.checkpoints_replaced);
    assert!(bob.checkpoints().is_empty());
}

#[test]
fn test_import_orders_batch_causally() {
    let (mut alice, _) = manual_ledger(1, 1_000);
    for name in ["a", "b", "c", "d"] {
        alice.append(node(name)).unwrap();
    }
    let mut export = alice.export();
    export.events.reverse();

    let (mut bob, _) = manual_ledger(2, 1_000);
    let result = bob.import(export).unwrap();
    assert_eq!(result.imported, 4);
    assert_eq!(bob.tips(), alice.tips());
}

#[test]
fn test_file_backed_ledger_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = LedgerConfigBuilder::new()
        .checkpoint_interval(3)
        .data_dir(dir.path())
        .build();

    let (first, agent, tips, checkpoints, last_time) = {
        let mut ledger = Ledger::new(config.clone()).unwrap();
        let first = ledger.append(node("a")).unwrap();
        for name in ["b", "c", "d"] {
            ledger.append(node(name)).unwrap();
        }
        (
            first.id,
            ledger.agent_id(),
            ledger.tips(),
            ledger.checkpoints().to_vec(),
            ledger.clock_time(),
        )
    };

    let mut reopened = Ledger::new(config).unwrap();
    assert_eq!(reopened.agent_id(), agent);
    assert_eq!(reopened.len(), 5);
    assert_eq!(reopened.tips(), tips);
    assert_eq!(reopened.checkpoints(), checkpoints.as_slice());
    assert_eq!(reopened.events_since_checkpoint(), 2);
    assert!(reopened.clock_time() >= last_time);

    let proof = reopened.generate_merkle_proof(&first).unwrap();
    assert!(reopened.verify_merkle_proof(&proof));

    let next = reopened.append(node("e")).unwrap();
    assert!(next.hlc() > last_time);
}

#[test]
fn test_reload_drops_events_that_violate_causality() {
    let dir = tempfile::tempdir().unwrap();
    let key = AgentKeypair::from_secret([4u8; 32]);
    let sealed = |parents: Vec<EventId>, hlc: weave_ledger::Hlc, name: &str| {
        LedgerEvent::seal(
            EventEnvelope {
                parents,
                hlc,
                author: key.agent_id(),
                payload: node(name),
            },
            &key,
        )
        .unwrap()
    };
    let parent = sealed(Vec::new(), weave_ledger::Hlc::new(800, 0), "parent");
    // Correctly signed, but not after its parent.
    let child = sealed(vec![parent.id], weave_ledger::Hlc::new(800, 0), "child");

    {
        let mut store = FileStore::open(dir.path()).unwrap();
        store.append_event(&parent).unwrap();
        store.append_event(&child).unwrap();
    }

    let ledger = Ledger::open(
        LedgerConfig::default(),
        AgentKeypair::from_secret([4u8; 32]),
        HybridClock::new(),
        Box::new(FileStore::open(dir.path()).unwrap()),
    )
    .unwrap();
    assert_eq!(ledger.len(), 1);
    assert!(ledger.contains(&parent.id));
    assert!(!ledger.contains(&child.id));
    assert_eq!(ledger.tips(), vec![parent.id]);
}

#[test]
fn test_shared_ledger_concurrent_appends() {
    let shared = SharedLedger::new(Ledger::in_memory(
        LedgerConfig::default(),
        AgentKeypair::from_secret([1u8; 32]),
    ));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let shared = shared.clone();
            std::thread::spawn(move || {
                for i in 0..10 {
                    shared.append_event(node(&format!("t{t}-{i}"))).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(shared.len(), 40);
    // Every local append builds on all tips, so the history stays linear.
    assert_eq!(shared.tips().len(), 1);
    assert_eq!(shared.get_stats().total_events, 40);
}

#[derive(Clone, Debug)]
enum Op {
    Append,
    Root,
    Fork(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Append),
        1 => Just(Op::Root),
        2 => (0usize..64).prop_map(Op::Fork),
    ]
}

proptest! {
    #[test]
    fn prop_tips_and_causality_hold(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let (mut ledger, source) = manual_ledger(1, 1_000);
        let mut ids: Vec<EventId> = Vec::new();

        for (i, op) in ops.iter().enumerate() {
            if i % 3 == 0 {
                source.advance(1);
            }
            let payload = node(&format!("n{i}"));
            let event = match op {
                Op::Append => ledger.append(payload).unwrap(),
                Op::Root => ledger.append_with_parents(payload, Vec::new()).unwrap(),
                Op::Fork(pick) if !ids.is_empty() => {
                    let parent = ids[pick % ids.len()];
                    ledger.append_with_parents(payload, vec![parent]).unwrap()
                }
                Op::Fork(_) => ledger.append(payload).unwrap(),
            };
            ids.push(event.id);
        }

        prop_assert_eq!(ledger.tips(), recomputed_tips(&ledger));
        for event in ledger.export().events {
            prop_assert!(event.verify_id());
            for parent in event.parents() {
                let parent = ledger.get_event(parent).unwrap();
                prop_assert!(event.hlc() > parent.hlc());
            }
        }
    }
}
