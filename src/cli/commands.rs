use anyhow::{Context, Result};
use bytes::Bytes;
use std::io::Read;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

use genpool::{Config, HttpUpstream, Manager};

fn build_manager(config: &Config) -> Result<Manager<HttpUpstream>> {
    let upstream = HttpUpstream::new(&config.upstream).context("Invalid upstream configuration")?;
    let manager = Manager::new(config.manager.clone(), upstream).context("Failed to start connection manager")?;
    Ok(manager)
}

/// Submit one payload and print the response body
pub async fn cmd_submit(config: &Config, payload: Option<String>) -> Result<()> {
    let payload = match payload {
        Some(p) => p,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read payload from stdin")?;
            buf
        }
    };

    let manager = build_manager(config)?;
    let start = Instant::now();
    let result = manager.submit(Bytes::from(payload)).await;
    debug!(elapsed_ms = start.elapsed().as_millis() as u64, "Submit finished");
    manager.shutdown().await;

    let body = result.context("Request failed")?;
    println!("{}", String::from_utf8_lossy(&body));
    Ok(())
}

/// Submit every non-empty line of `path` as its own payload
pub async fn cmd_batch(config: &Config, path: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .context(format!("Failed to read batch file: {:?}", path))?;

    let payloads: Vec<Bytes> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| Bytes::from(line.to_string()))
        .collect();

    if payloads.is_empty() {
        println!("No payloads in {:?}", path);
        return Ok(());
    }

    let manager = build_manager(config)?;
    let total = payloads.len();
    info!(total, "Submitting batch");

    let start = Instant::now();
    let results = manager.submit_batch(payloads).await;
    let elapsed = start.elapsed();

    let mut failed = 0;
    for (i, result) in results.iter().enumerate() {
        match result {
            Ok(body) => println!("[{}] ok {}", i, String::from_utf8_lossy(body)),
            Err(e) => {
                failed += 1;
                println!("[{}] error {}", i, e);
            }
        }
    }

    println!(
        "{} requests, {} failed in {:.2}s ({})",
        total,
        failed,
        elapsed.as_secs_f64(),
        manager.stats()
    );
    manager.shutdown().await;

    if failed == total {
        anyhow::bail!("All {} requests failed", total);
    }
    Ok(())
}

/// Run one warmup pass against the upstream and print pool state
pub async fn cmd_ping(config: &Config) -> Result<()> {
    let manager = build_manager(config)?;

    let start = Instant::now();
    let report = manager.warm_up().await;
    let elapsed = start.elapsed();

    println!("Endpoint:  {}", config.upstream.endpoint);
    println!("Warmed:    {}", report.warmed);
    println!("Failed:    {}", report.failed);
    println!("Evicted:   {}", report.evicted);
    println!("Took:      {:.0}ms", elapsed.as_secs_f64() * 1000.0);
    println!("Pool:      {}", manager.stats());
    manager.shutdown().await;

    if report.warmed == 0 && report.failed > 0 {
        anyhow::bail!("Upstream did not answer the ping");
    }
    Ok(())
}

/// Print the effective configuration as YAML, with the API key masked
pub fn cmd_config(config: &Config) -> Result<()> {
    let mut shown = config.clone();
    if shown.upstream.api_key.is_some() {
        shown.upstream.api_key = Some("********".to_string());
    }
    let yaml = serde_yaml::to_string(&shown).context("Failed to render configuration")?;
    print!("{}", yaml);
    Ok(())
}
