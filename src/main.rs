use stress_test::{stress_test_scaling, stress_test_text};

fn main() {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            std::process::exit(1);
        }
    };
    if !rt.block_on(async_main()) {
        std::process::exit(1);
    }
}

async fn async_main() -> bool {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            ASYNC STRESS TESTS                               ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut converged = true;

    // Small scale
    let stats = stress_test_text(4, 200, 100).await;
    stats.print();
    converged &= stats.converged;

    // Medium scale
    let stats = stress_test_text(10, 500, 400).await;
    stats.print();
    converged &= stats.converged;

    converged &= stress_test_scaling(20, 5).await;

    if converged {
        println!("\n✓ All stress tests completed successfully!");
    } else {
        println!("\n✗ Replicas diverged!");
    }
    converged
}
