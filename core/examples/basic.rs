//! Basic circuit breaker usage example

use sliding_breaker::{CircuitBreaker, CircuitError, ManualClock};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Run `f` under the breaker's protection
fn guarded<T, F>(breaker: &CircuitBreaker, f: F) -> Result<Result<T, String>, CircuitError>
where
    T: 'static,
    F: FnOnce() -> Result<T, String>,
{
    breaker.acquire_permission()?;
    let start = Instant::now();
    let result = f();
    match &result {
        Ok(value) => breaker.on_result(start.elapsed(), value),
        Err(err) => breaker.on_error(start.elapsed(), err),
    }
    Ok(result)
}

fn main() {
    println!("=== Circuit Breaker Basic Example ===\n");

    let clock = Arc::new(ManualClock::new());

    // Create a circuit with builder API
    let circuit = CircuitBreaker::builder("payment_api")
        .failure_rate_threshold(50.0)
        .count_based_window(4)
        .minimum_number_of_calls(4)
        .permitted_calls_in_half_open(2)
        .wait_duration_in_open(Duration::from_secs(5))
        .clock(clock.clone())
        .on_open(|name| println!("🔴 Circuit '{}' opened!", name))
        .on_close(|name| println!("🟢 Circuit '{}' closed!", name))
        .on_half_open(|name| println!("🟡 Circuit '{}' half-open, testing...", name))
        .build()
        .expect("valid configuration");

    println!("Initial state: {}\n", circuit.state());

    // Simulate successful calls
    println!("--- Successful calls ---");
    for i in 1..=2 {
        match guarded(&circuit, move || Ok(format!("Payment {}", i))) {
            Ok(Ok(result)) => println!("✓ {}", result),
            Ok(Err(e)) => println!("✗ Error: {}", e),
            Err(e) => println!("✗ {}", e),
        }
    }
    println!("State: {}\n", circuit.state());

    // Simulate failures
    println!("--- Triggering failures ---");
    for i in 1..=2 {
        match guarded(&circuit, move || Err::<String, _>(format!("Payment failed {}", i))) {
            Ok(Ok(_)) => println!("✓ Success"),
            Ok(Err(e)) => println!("✗ {}", e),
            Err(e) => println!("✗ {}", e),
        }
    }
    let metrics = circuit.metrics();
    println!(
        "State: {} (failure rate {}% over {} calls)\n",
        circuit.state(),
        metrics.failure_rate,
        metrics.buffered_calls
    );

    // Try calling while open
    println!("--- Attempting call while open ---");
    match guarded(&circuit, || Ok("Should be rejected".to_string())) {
        Ok(_) => println!("✓ Success"),
        Err(e) => println!("✗ {}", e),
    }
    println!();

    // Let the wait elapse and probe
    println!("--- Waiting out the open state ---");
    clock.advance(Duration::from_secs(5));
    for i in 1..=2 {
        match guarded(&circuit, move || Ok(format!("Trial payment {}", i))) {
            Ok(Ok(result)) => println!("✓ {}", result),
            Ok(Err(e)) => println!("✗ Error: {}", e),
            Err(e) => println!("✗ {}", e),
        }
    }
    println!("State: {}\n", circuit.state());

    // Reset and demonstrate a clean slate
    println!("--- Resetting circuit ---");
    circuit.transition_to_forced_open_state();
    println!("State after forcing open: {}", circuit.state());
    circuit.reset();
    println!("State after reset: {}", circuit.state());
    println!("Buffered calls: {}", circuit.metrics().buffered_calls);
}
