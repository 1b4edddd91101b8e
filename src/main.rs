use simulation::{run_group_simulation, run_hung_member_demo};
use tracing_subscriber::EnvFilter;
pub mod simulation;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(async_main()) {
        eprintln!("simulation failed: {}", e);
        std::process::exit(1);
    }
}

async fn async_main() -> Result<(), cohort_core::CohortError> {
    // Small group
    let stats = run_group_simulation(3, 10, 5_000).await?;
    stats.print();

    // Larger group
    let stats = run_group_simulation(10, 50, 5_000).await?;
    stats.print();

    run_hung_member_demo(500).await?;

    println!("\n✓ All simulations completed successfully!");
    Ok(())
}
