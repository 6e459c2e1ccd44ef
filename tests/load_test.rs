//! Load testing for discovery-driven calls through the fault tolerance layers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use service_resilience::config::loader::parse_config;
use service_resilience::discovery::{InstanceStatus, ServiceInstance};
use service_resilience::lifecycle::ResilienceContext;
use service_resilience::resilience::{ExecuteOptions, ResilienceError};

mod common;

#[tokio::test]
async fn test_load_performance() {
    // 1. Setup mock backends
    let backend1 = common::start_mock_backend("Hello from backend 1").await;
    let backend2 = common::start_mock_backend("Hello from backend 2").await;

    // 2. Setup context
    let config = parse_config(
        r#"
        [health_check]
        enabled = false

        [health_monitor]
        enabled = false

        [[bulkheads]]
        name = "web"
        max_concurrent = 64

        [[services]]
        name = "web"
        timeout_secs = 5
        bulkhead_pool = "web"

        [services.retry]
        max_attempts = 2
        base_delay_ms = 10
        "#,
    )
    .unwrap();
    let ctx = Arc::new(ResilienceContext::from_config(config).unwrap());
    for (id, addr) in [("web-1", backend1), ("web-2", backend2)] {
        ctx.discovery()
            .registry()
            .register(
                ServiceInstance::new(id, "web", addr.ip().to_string(), addr.port())
                    .with_status(InstanceStatus::Healthy),
                None,
            )
            .await
            .unwrap();
    }

    // 3. Run load test
    let concurrency = 20;
    let requests_per_task = 50;
    let total_requests = concurrency * requests_per_task;

    let client = reqwest::Client::new();
    let start = Instant::now();

    let mut tasks = Vec::new();
    for _ in 0..concurrency {
        let client = client.clone();
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            let mut latencies = Vec::new();
            for _ in 0..requests_per_task {
                let req_start = Instant::now();
                let result: Result<String, ResilienceError<reqwest::Error>> = ctx
                    .call("web", ExecuteOptions::new(), |instance| {
                        let client = client.clone();
                        async move {
                            client
                                .get(format!("http://{}/", instance.address()))
                                .send()
                                .await?
                                .error_for_status()?
                                .text()
                                .await
                        }
                    })
                    .await;
                if result.is_ok() {
                    latencies.push(req_start.elapsed());
                }
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for task in tasks {
        let latencies = task.await.unwrap();
        all_latencies.extend(latencies);
    }

    let duration = start.elapsed();
    let rps = total_requests as f64 / duration.as_secs_f64();

    if all_latencies.is_empty() {
        panic!("No successful requests recorded");
    }

    all_latencies.sort();
    let p50 = all_latencies[all_latencies.len() / 2];
    let p95 = all_latencies[(all_latencies.len() as f64 * 0.95) as usize];
    let p99 = all_latencies[(all_latencies.len() as f64 * 0.99) as usize];

    println!("\n--- Load Test Results ---");
    println!("Total Requests: {}", total_requests);
    println!("Concurrency:    {}", concurrency);
    println!("Total Duration: {:?}", duration);
    println!("Requests/sec:   {:.2}", rps);
    println!("P50 Latency:    {:?}", p50);
    println!("P95 Latency:    {:?}", p95);
    println!("P99 Latency:    {:?}", p99);
    println!("Success Rate:   {}/{}", all_latencies.len(), total_requests);
    println!("-------------------------\n");

    // 4. Counters settle once every call returned
    let stats = ctx.fault_tolerance().request_stats();
    assert_eq!(stats["web"].total, total_requests as u64);
    assert_eq!(stats["web"].success + stats["web"].failure, total_requests as u64);

    let connections = ctx.discovery().balancer().connections();
    assert_eq!(connections.in_flight("web-1"), 0);
    assert_eq!(connections.in_flight("web-2"), 0);
    assert_eq!(ctx.fault_tolerance().bulkheads().pool("web").unwrap().in_flight(), 0);

    tokio::time::timeout(Duration::from_secs(15), ctx.shutdown())
        .await
        .unwrap();
}
