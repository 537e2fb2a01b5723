//! Fetch a handful of URLs at different priorities and print the scheduler
//! statistics.
//!
//! ```text
//! cargo run --example fetch -- https://httpbin.org/json https://httpbin.org/get
//! ```

use std::time::Duration;

use netkit::{
    CallBehavior, HttpBridgeConfig, NetkitResult, NetworkServices, Priority, QuotaPolicy,
    RetryDelayPolicy, SchedulerConfig,
};

#[tokio::main]
async fn main() -> NetkitResult<()> {
    tracing_subscriber::fmt::init();

    let mut urls: Vec<String> = std::env::args().skip(1).collect();
    if urls.is_empty() {
        urls.push("https://httpbin.org/json".to_string());
    }

    let config = SchedulerConfig::new()
        .quotas(QuotaPolicy::default().with_quota(Priority::Low, 1))
        .maintenance_interval(Duration::from_millis(250));
    let services = NetworkServices::start_http(
        config,
        HttpBridgeConfig::new().user_agent("netkit-fetch-example"),
    )?;

    let mut pending = Vec::new();
    for (n, url) in urls.iter().enumerate() {
        let priority = if n == 0 { Priority::High } else { Priority::Low };
        let behavior = CallBehavior::builder()
            .priority(priority)
            .timeout(Duration::from_secs(10))
            .max_retries(2)
            .retry_delay_policy(RetryDelayPolicy::LogarithmicBackoff)
            .retry_jitter(0.2)
            .build()?;

        let transactions = services.transactions().clone();
        let url = url.clone();
        pending.push(tokio::spawn(async move {
            let outcome = transactions.get_json(&url, &(), behavior).await;
            (url, outcome)
        }));
    }

    for task in pending {
        let Ok((url, outcome)) = task.await else {
            continue;
        };
        match outcome {
            Ok(response) => println!(
                "{url}: {} in {:?}\n{}",
                response.status, response.latency, response.payload
            ),
            Err(e) => println!("{url}: {e}"),
        }
    }

    let stats = services.scheduler().snapshot_statistics();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
