use stress_test::{stress_test_outline, stress_test_scaling};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var("LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start runtime");
            std::process::exit(1);
        }
    };
    rt.block_on(async_main());
}

async fn async_main() {
    // Run async stress tests
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            REPLICATION STRESS TESTS                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: small scale, reliable relay
    let stats = stress_test_outline(3, 20, 0.0).await;
    stats.print();

    // Test 2: small scale, flaky relay
    let stats = stress_test_outline(3, 20, 0.1).await;
    stats.print();

    // Test 3: medium scale, flaky relay
    let stats = stress_test_outline(8, 50, 0.05).await;
    stats.print();

    // Test 4: Scaling analysis
    stress_test_scaling(12, 4).await;

    println!("\n✓ All stress tests completed!");
}
