use mirra_store::{
    Broker, DelayConfigBuilder, DelayedTransport, ImmediateTransport, RelayServer,
    SocketConfigBuilder, SocketTransport, Store, StoreError, Transport,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Replicated state used by every scenario.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ledger {
    pub total: i64,
    pub entries: u64,
}

fn add(ledger: &mut Ledger, amount: &Value) -> bool {
    match amount.as_i64() {
        Some(amount) => {
            ledger.total += amount;
            ledger.entries += 1;
            true
        }
        None => false,
    }
}

/// Statistics collected while running a scenario
#[derive(Clone, Debug)]
pub struct ScenarioStats {
    pub name: &'static str,
    pub num_replicas: usize,
    pub total_commits: usize,
    pub total_time: Duration,
    pub commits_per_second: f64,
    pub final_total: i64,
    pub converged: bool,
}

impl ScenarioStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║  {:<58}║", self.name);
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Number of Replicas:        {:>30} ║", self.num_replicas);
        println!("║  Total Commits:             {:>30} ║", self.total_commits);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Commits/Second:            {:>30.0} ║", self.commits_per_second);
        println!("║  Final Total:               {:>30} ║", self.final_total);
        println!("║  Converged:                 {:>30} ║", self.converged);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

fn replica(transport: Arc<dyn Transport>) -> Result<Store<Ledger>, StoreError> {
    Store::builder()
        .state(Ledger::default())
        .mutation("add", add)
        .plugin(move |store| store.add_transport(transport))
        .build()
}

fn converged(replicas: &[Store<Ledger>], expected_entries: u64) -> bool {
    let Some(first) = replicas.first() else {
        return true;
    };
    let reference = first.state();
    reference.entries == expected_entries && replicas.iter().all(|r| *r.state() == *reference)
}

/// Commit `num_commits` random amounts, each on a randomly chosen replica.
fn commit_randomly(replicas: &[Store<Ledger>], num_commits: usize) -> Result<(), StoreError> {
    let mut rng = StdRng::from_entropy();
    for i in 0..num_commits {
        let origin = rng.gen_range(0..replicas.len());
        let amount: i64 = rng.gen_range(-100..=100);
        replicas[origin].commit("add", json!(amount))?;

        if (i + 1) % 100 == 0 {
            println!("  Commits completed: {}/{}", i + 1, num_commits);
        }
    }
    Ok(())
}

async fn wait_for_convergence(replicas: &[Store<Ledger>], expected: u64, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while !converged(replicas, expected) {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

fn finish(
    name: &'static str,
    replicas: &[Store<Ledger>],
    num_commits: usize,
    start: Instant,
    in_sync: bool,
) -> ScenarioStats {
    let total_time = start.elapsed();
    let final_total = replicas.first().map(|r| r.state().total).unwrap_or_default();
    for store in replicas {
        store.close_transports();
    }
    if in_sync {
        info!(scenario = name, final_total, "replicas converged");
    } else {
        warn!(scenario = name, "replicas did not converge");
    }
    ScenarioStats {
        name,
        num_replicas: replicas.len(),
        total_commits: num_commits,
        total_time,
        commits_per_second: num_commits as f64 / total_time.as_secs_f64().max(f64::EPSILON),
        final_total,
        converged: in_sync,
    }
}

/// Replicas sharing one in-process room; every commit reaches all peers
/// before `commit` returns.
pub fn immediate_fan_out(
    num_replicas: usize,
    num_commits: usize,
) -> Result<ScenarioStats, StoreError> {
    println!("\n[Immediate] {} replicas, {} commits", num_replicas, num_commits);
    let start = Instant::now();

    let broker = Broker::new();
    let replicas = (0..num_replicas)
        .map(|_| replica(ImmediateTransport::join(&broker, "immediate")))
        .collect::<Result<Vec<_>, _>>()?;

    commit_randomly(&replicas, num_commits)?;
    let in_sync = converged(&replicas, num_commits as u64);
    Ok(finish("Immediate Transport", &replicas, num_commits, start, in_sync))
}

/// Replicas on a delayed in-process room.
pub async fn delayed_fan_out(
    num_replicas: usize,
    num_commits: usize,
    delay: Duration,
) -> Result<ScenarioStats, StoreError> {
    println!(
        "\n[Delayed] {} replicas, {} commits, {}ms delay",
        num_replicas,
        num_commits,
        delay.as_millis()
    );
    let start = Instant::now();

    let broker = Broker::new();
    let config = DelayConfigBuilder::new().delay(delay).build();
    let replicas = (0..num_replicas)
        .map(|_| -> Result<Store<Ledger>, StoreError> {
            replica(DelayedTransport::join(&broker, "delayed", config.clone())?)
        })
        .collect::<Result<Vec<_>, _>>()?;

    commit_randomly(&replicas, num_commits)?;
    let in_sync = wait_for_convergence(&replicas, num_commits as u64, delay * 40).await;
    Ok(finish("Delayed Transport", &replicas, num_commits, start, in_sync))
}

/// Replicas each holding their own TCP connection to a local relay.
pub async fn relay_fan_out(
    num_replicas: usize,
    num_commits: usize,
) -> Result<ScenarioStats, StoreError> {
    println!("\n[Relay] {} replicas, {} commits", num_replicas, num_commits);
    let start = Instant::now();

    let relay = RelayServer::bind("127.0.0.1:0").await?;
    let config = SocketConfigBuilder::new()
        .address(relay.local_addr().to_string())
        .room("relay")
        .build();

    let mut replicas = Vec::with_capacity(num_replicas);
    for _ in 0..num_replicas {
        let transport = SocketTransport::connect(config.clone()).await?;
        replicas.push(replica(transport)?);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while relay.room_size("relay") < num_replicas && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    commit_randomly(&replicas, num_commits)?;
    let in_sync =
        wait_for_convergence(&replicas, num_commits as u64, Duration::from_secs(10)).await;
    let stats = finish("Relay Transport", &replicas, num_commits, start, in_sync);
    relay.shutdown();
    Ok(stats)
}
