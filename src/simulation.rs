use crate::config::{SimulationConfig, WeaveConfig};
use async_stream::stream;
use futures::stream::Stream;
use futures::stream::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use weave_ledger::{
    AgentKeypair, EventId, EventKind, EventPayload, Ledger, LedgerConfig, LedgerError, SharedLedger,
};
use weave_sync::{
    Fault, MemoryNetwork, MemoryTransport, PeerId, SyndicationConfig, SyndicationService,
};

/// Statistics collected during a simulation run
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub agents: usize,
    pub events_per_agent: usize,
    pub total_syncs: usize,
    pub failed_syncs: usize,
    pub events_exchanged: usize,
    pub total_time: Duration,
    pub avg_sync_time: Duration,
    pub checkpoints: usize,
    pub converged: bool,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Syndication Simulation Statistics             ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Agents:                    {:>30} ║", self.agents);
        println!("║  Events per Agent:          {:>30} ║", self.events_per_agent);
        println!("║  Sync Operations:           {:>30} ║", self.total_syncs);
        println!("║  Failed Syncs:              {:>30} ║", self.failed_syncs);
        println!("║  Events Exchanged:          {:>30} ║", self.events_exchanged);
        println!("║  Checkpoints (all agents):  {:>30} ║", self.checkpoints);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Average Sync Time:         {:>28}µs ║", self.avg_sync_time.as_micros());
        println!("║  Converged:                 {:>30} ║", if self.converged { "yes" } else { "NO" });
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// One simulated node: a ledger plus the service syncing it.
pub struct Agent {
    pub endpoint: String,
    pub ledger: SharedLedger,
    pub service: SyndicationService<MemoryTransport>,
}

fn endpoint(idx: usize) -> String {
    format!("mem://agent-{}", idx)
}

/// Build `count` agents on `network`, each peered with every other.
pub fn build_agents(
    count: usize,
    config: &WeaveConfig,
    network: &MemoryNetwork,
) -> Result<Vec<Agent>, LedgerError> {
    let mut agents = Vec::with_capacity(count);
    for idx in 0..count {
        let ledger_config = LedgerConfig {
            data_dir: config
                .ledger
                .data_dir
                .as_ref()
                .map(|dir| dir.join(format!("agent-{}", idx))),
            ..config.ledger.clone()
        };
        let ledger = match ledger_config.data_dir {
            Some(_) => Ledger::new(ledger_config)?,
            None => Ledger::in_memory(ledger_config, AgentKeypair::generate()),
        };
        let ledger = SharedLedger::new(ledger);
        network.register(endpoint(idx), ledger.clone());

        let syndication = SyndicationConfig {
            peers: (0..count).filter(|&j| j != idx).map(endpoint).collect(),
            auto_sync: false,
            ..config.syndication.clone()
        };
        let service = SyndicationService::new(syndication, ledger.clone(), Arc::new(network.transport()));
        agents.push(Agent {
            endpoint: endpoint(idx),
            ledger,
            service,
        });
    }
    Ok(agents)
}

/// Generator that yields agent index pairs for random pairwise syncs
fn agent_pair_generator(num_agents: usize, num_syncs: usize) -> impl Stream<Item = (usize, usize)> {
    stream! {
        let mut rng = StdRng::from_entropy();
        for _ in 0..num_syncs {
            let a = rng.gen_range(0..num_agents);
            let b = rng.gen_range(0..num_agents);
            yield (a, b);
        }
    }
}

/// IDs of application events, ignoring sync and checkpoint bookkeeping.
fn application_events(ledger: &SharedLedger) -> BTreeSet<EventId> {
    ledger
        .export()
        .events
        .into_iter()
        .filter(|e| {
            !matches!(
                e.kind(),
                EventKind::SyncStarted | EventKind::SyncCompleted | EventKind::CheckpointCreated
            )
        })
        .map(|e| e.id)
        .collect()
}

/// Run the multi-agent simulation described by `config.simulation`.
pub async fn run_simulation(config: &WeaveConfig) -> Result<SimulationStats, LedgerError> {
    let SimulationConfig {
        agents: num_agents,
        events_per_agent,
        random_syncs,
        flaky_agents,
    } = config.simulation.clone();

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Weave Syndication Simulation                        ║");
    println!("║  Agents: {} | Events/Agent: {} | Random syncs: {} ║",
             num_agents, events_per_agent, random_syncs);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let network = MemoryNetwork::new();
    let agents = build_agents(num_agents, config, &network)?;
    for agent in &agents {
        agent.service.start().await;
    }

    println!("\n[Phase 1/3] Appending events...");

    let mut handles = vec![];
    for (idx, agent) in agents.iter().enumerate() {
        let ledger = agent.ledger.clone();
        let handle = tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            for i in 0..events_per_agent {
                let node_id = format!("agent{}-node{}", idx, i);
                let payload = if i > 0 && rng.gen_bool(0.3) {
                    EventPayload::edge_created(
                        format!("agent{}-edge{}", idx, i),
                        format!("agent{}-node{}", idx, rng.gen_range(0..i)),
                        node_id,
                        "relates_to",
                    )
                } else {
                    EventPayload::node_created(node_id, "concept")
                };
                ledger.append_event(payload)?;

                if i % 100 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            Ok::<(), LedgerError>(())
        });
        handles.push(handle);
    }

    for handle in handles {
        match handle.await {
            Ok(result) => result?,
            Err(err) => tracing::error!(error = %err, "append task panicked"),
        }
    }

    println!("[Phase 1/3] ✓ Completed");
    println!("[Phase 2/3] Random pairwise syncs ({} flaky)...", flaky_agents.min(num_agents));

    for agent in agents.iter().take(flaky_agents) {
        network.set_fault(&agent.endpoint, Fault::FailFetch);
    }

    let mut sync_times = vec![];
    let mut total_syncs = 0;
    let mut failed_syncs = 0;
    let mut events_exchanged = 0;
    let mut pairs = Box::pin(agent_pair_generator(num_agents, random_syncs));

    while let Some((a, b)) = pairs.next().await {
        if a == b {
            continue; // Skip self-sync
        }
        let peer_id = PeerId::from_endpoint(&agents[b].endpoint);
        let sync_start = Instant::now();
        match agents[a].service.sync_with_peer(&peer_id).await {
            Ok(result) if result.success => {
                events_exchanged += result.events_received + result.events_sent;
            }
            Ok(_) => failed_syncs += 1,
            Err(err) => {
                tracing::warn!(error = %err, "sync skipped");
                failed_syncs += 1;
            }
        }
        sync_times.push(sync_start.elapsed());
        total_syncs += 1;

        if total_syncs % 10 == 0 {
            println!("  Syncs completed: {}/{}", total_syncs, random_syncs);
        }
    }

    for agent in agents.iter().take(flaky_agents) {
        network.clear_fault(&agent.endpoint);
    }

    println!("[Phase 2/3] ✓ Completed");
    println!("[Phase 3/3] Converging...");

    // Two full passes: the first spreads everything to some agent, the second
    // carries it everywhere.
    for _ in 0..2 {
        for agent in &agents {
            for peer in agent.service.get_all_peers() {
                let sync_start = Instant::now();
                match agent.service.sync_with_peer(&peer.id).await {
                    Ok(result) if result.success => {
                        events_exchanged += result.events_received + result.events_sent;
                    }
                    _ => failed_syncs += 1,
                }
                sync_times.push(sync_start.elapsed());
                total_syncs += 1;
            }
        }
    }

    let reference = agents.first().map(|a| application_events(&a.ledger));
    let converged = agents
        .iter()
        .all(|a| Some(application_events(&a.ledger)) == reference);
    let checkpoints = agents.iter().map(|a| a.ledger.read().checkpoints().len()).sum();

    for agent in &agents {
        agent.service.stop().await;
    }

    let avg_sync_time = if !sync_times.is_empty() {
        sync_times.iter().sum::<Duration>() / sync_times.len() as u32
    } else {
        Duration::ZERO
    };

    println!("[Phase 3/3] ✓ Completed");

    Ok(SimulationStats {
        agents: num_agents,
        events_per_agent,
        total_syncs,
        failed_syncs,
        events_exchanged,
        total_time: start.elapsed(),
        avg_sync_time,
        checkpoints,
        converged,
    })
}
