use cohort_core::object::SHARED_VALUE;
use cohort_core::{CohortError, Id, SharedObjectDescriptor};
use cohort_group::{GroupContext, MemoryHub, SharedObjectContainer, GENERIC_CONTAINER};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Statistics collected during a group simulation
#[derive(Clone, Debug, Default)]
pub struct SimulationStats {
    pub num_clients: usize,
    pub objects_per_client: usize,
    pub committed: usize,
    pub aborted: usize,
    pub removed: usize,
    pub total_time: Duration,
    pub avg_commit_time: Duration,
    pub commits_per_second: f64,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Group Simulation Statistics                    ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Clients:                   {:>30} ║", self.num_clients);
        println!("║  Objects per Client:        {:>30} ║", self.objects_per_client);
        println!("║  Committed:                 {:>30} ║", self.committed);
        println!("║  Aborted:                   {:>30} ║", self.aborted);
        println!("║  Removed:                   {:>30} ║", self.removed);
        println!(
            "║  Total Time:                {:>29}s ║",
            format!("{:.3}", self.total_time.as_secs_f64())
        );
        println!("║  Average Commit Time:       {:>28}µs ║", self.avg_commit_time.as_micros());
        println!("║  Commits/Second:            {:>30.0} ║", self.commits_per_second);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

#[derive(Default)]
struct ClientReport {
    commit_times: Vec<Duration>,
    aborted: usize,
    removed: usize,
}

/// A server plus `num_clients` clients on one in-memory hub. Every client
/// creates `objects_per_client` shared values under random ids, waits for
/// each to commit, removes them again and disconnects.
pub async fn run_group_simulation(
    num_clients: usize,
    objects_per_client: usize,
    timeout_ms: u64,
) -> Result<SimulationStats, CohortError> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Shared-Object Group Simulation                      ║");
    println!(
        "║  Clients: {} | Objects/Client: {} | Timeout: {}ms",
        num_clients, objects_per_client, timeout_ms
    );
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let context = GroupContext::with_memory_hub(MemoryHub::new());

    let server =
        context.create_container(GENERIC_CONTAINER, &[json!("server"), json!(timeout_ms)])?;
    server.connect(server.id()).await?;

    println!("\n[Phase 1/3] Joining clients...");
    let mut clients = Vec::with_capacity(num_clients);
    for i in 0..num_clients {
        let client = context.create_container(
            GENERIC_CONTAINER,
            &[json!(format!("client-{}", i)), json!(timeout_ms)],
        )?;
        client.connect(server.id()).await?;
        clients.push(Arc::new(client));
    }
    wait_for_members(&server, num_clients + 1).await;
    println!("[Phase 1/3] ✓ {} members", server.get_members().len());

    println!("[Phase 2/3] Creating and removing shared objects...");
    let handles = clients.iter().map(|client| {
        let client = Arc::clone(client);
        tokio::spawn(async move { run_client(&client, objects_per_client).await })
    });
    let mut reports = Vec::with_capacity(num_clients);
    for joined in join_all(handles).await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => warn!(error = %e, "client task failed"),
        }
    }
    println!("[Phase 2/3] ✓ Completed");

    println!("[Phase 3/3] Disconnecting...");
    for client in &clients {
        client.disconnect().await?;
    }
    server.disconnect().await?;
    println!("[Phase 3/3] ✓ Completed");

    let total_time = start.elapsed();
    let commit_times: Vec<Duration> = reports
        .iter()
        .flat_map(|r| r.commit_times.iter().copied())
        .collect();
    let committed = commit_times.len();
    let avg_commit_time = if committed > 0 {
        commit_times.iter().sum::<Duration>() / committed as u32
    } else {
        Duration::ZERO
    };

    Ok(SimulationStats {
        num_clients,
        objects_per_client,
        committed,
        aborted: reports.iter().map(|r| r.aborted).sum(),
        removed: reports.iter().map(|r| r.removed).sum(),
        total_time,
        avg_commit_time,
        commits_per_second: committed as f64 / total_time.as_secs_f64(),
    })
}

async fn run_client(client: &SharedObjectContainer, objects: usize) -> ClientReport {
    let mut rng = StdRng::from_entropy();
    let mut report = ClientReport::default();
    let mut created = Vec::with_capacity(objects);

    for i in 0..objects {
        let object_id = Id::from_string(format!("{}-{:016x}", client.id(), rng.gen::<u64>()));
        let descriptor = SharedObjectDescriptor::new(object_id.clone(), SHARED_VALUE)
            .with_init_args(json!({ "owner": client.id().as_str(), "seq": i }));

        let begun = Instant::now();
        let outcome = match client.create_shared_object(descriptor).await {
            Ok(txn) => txn.wait_to_commit().await.map_err(CohortError::from),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                report.commit_times.push(begun.elapsed());
                created.push(object_id);
            }
            Err(e) => {
                warn!(client = %client.id(), error = %e, "create failed");
                report.aborted += 1;
            }
        }
    }

    for object_id in created {
        match client.remove_shared_object(&object_id).await {
            Ok(()) => report.removed += 1,
            Err(e) => warn!(client = %client.id(), error = %e, "remove failed"),
        }
    }
    report
}

async fn wait_for_members(container: &SharedObjectContainer, expected: usize) {
    while container.get_members().len() < expected {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// One member stops answering while the server replicates an object.
pub async fn run_hung_member_demo(timeout_ms: u64) -> Result<(), CohortError> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Hung Member Demo                                    ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let hub = MemoryHub::new();
    let context = GroupContext::with_memory_hub(hub.clone());
    let server =
        context.create_container(GENERIC_CONTAINER, &[json!("server"), json!(timeout_ms)])?;
    let healthy = context.create_container(GENERIC_CONTAINER, &[json!("healthy")])?;
    let hung = context.create_container(GENERIC_CONTAINER, &[json!("hung")])?;

    server.connect(server.id()).await?;
    healthy.connect(server.id()).await?;
    hung.connect(server.id()).await?;
    wait_for_members(&server, 3).await;

    hub.mute(hung.id());
    let descriptor = SharedObjectDescriptor::new(Id::from("doomed"), SHARED_VALUE);
    let txn = server.create_shared_object(descriptor).await?;
    match txn.wait_to_commit().await {
        Ok(()) => println!("  unexpected commit"),
        Err(signal) => {
            info!(%signal, "transaction ended");
            println!("  {:?}: {}", txn.state(), signal);
            tokio::time::sleep(Duration::from_millis(10)).await;
            println!(
                "  healthy member still holds the object: {}",
                healthy.directory().contains(&Id::from("doomed"))
            );
        }
    }
    hub.unmute(hung.id());

    for container in [&hung, &healthy, &server] {
        container.disconnect().await?;
    }
    Ok(())
}
