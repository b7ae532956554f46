//! Sample command - show one filtered snapshot of listening ports.

use anyhow::Result;
use portwatch_core::{FailoverSampler, PidLookup, PidResolver, SocketSampler, WatchConfig};
use serde::Serialize;

#[derive(Serialize)]
struct SampledPort {
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pids: Option<Vec<u32>>,
}

pub async fn run(config: &WatchConfig, with_pids: bool, json: bool) -> Result<()> {
    let filter = config.filter()?;
    let sampler = FailoverSampler::for_choice(config.backend);

    let mut ports: Vec<u16> = sampler
        .sample()
        .await?
        .into_iter()
        .filter(|port| *port != 0 && filter.matches(*port))
        .collect();
    ports.sort_unstable();

    let resolver = PidResolver::system(config.resolve_timeout());
    let mut rows = Vec::with_capacity(ports.len());
    for port in ports {
        let pids = if with_pids {
            Some(resolver.resolve(port).await.into_iter().collect())
        } else {
            None
        };
        rows.push(SampledPort { port, pids });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No listening ports found.");
        return Ok(());
    }

    // Table header
    if with_pids {
        println!("{:<6} PIDS", "PORT");
    } else {
        println!("PORT");
    }
    println!("{}", "-".repeat(24));

    for row in &rows {
        match &row.pids {
            Some(pids) if pids.is_empty() => println!("{:<6} unknown", row.port),
            Some(pids) => {
                let list: Vec<String> = pids.iter().map(|p| p.to_string()).collect();
                println!("{:<6} {}", row.port, list.join(","));
            }
            None => println!("{}", row.port),
        }
    }

    println!("\nTotal: {} ports ({})", rows.len(), sampler.primary().name());
    Ok(())
}
