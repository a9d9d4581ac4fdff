use std::time::Instant;

use tcp_throttle::logger::init_logger;
use tcp_throttle::prelude::*;
use tcp_throttle::Config;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();

    let config = Config::load()?;
    let probe = config.probe;
    info!(
        "Probing {} with {} byte payloads, limit {:?} B/s",
        probe.target, probe.payload_size, probe.bandwidth_limit
    );

    let start = Instant::now();
    let mut total_bytes = 0u64;
    let mut failures = 0u32;

    for iteration in 1..=probe.iterations {
        match run_probe(&probe).await {
            Ok(report) => {
                total_bytes += report.total_bytes;
                info!(
                    "Run {}/{}: {} payload bytes at {:.2} MB/s",
                    iteration,
                    probe.iterations,
                    report.payload_bytes,
                    report.throughput_mbps()
                );
            }
            Err(e) => {
                failures += 1;
                warn!("Run {}/{} failed: {}", iteration, probe.iterations, e);
            }
        }
    }

    let summary = ProbeSummary::new(total_bytes, start.elapsed());
    info!("=== CLIENT METRICS ===");
    info!("Total bytes received: {}", summary.total_bytes_received);
    info!("Test duration: {:.2}s", summary.test_duration);
    info!("Average throughput: {:.2} MB/s", summary.avg_throughput);

    if let Some(path) = &probe.summary_path {
        let data = serde_json::to_string_pretty(&summary)?;
        if let Err(e) = tokio::fs::write(path, data).await {
            error!("Failed to write summary to {}: {}", path.display(), e);
            return Err(e.into());
        }
        info!("Summary written to {}", path.display());
    }

    if failures > 0 && failures == probe.iterations {
        return Err(format!("all {} probe runs failed", failures).into());
    }

    Ok(())
}
