//! Resolve command - show the processes holding a port open.

use anyhow::Result;
use portwatch_core::{PidLookup, PidResolver, WatchConfig};

pub async fn run(config: &WatchConfig, port: u16, json: bool) -> Result<()> {
    let resolver = PidResolver::system(config.resolve_timeout());
    let pids: Vec<u32> = resolver.resolve(port).await.into_iter().collect();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "port": port, "pids": pids }))?
        );
        return Ok(());
    }

    if pids.is_empty() {
        println!("Port {}: owner unknown", port);
    } else {
        let list: Vec<String> = pids.iter().map(|p| p.to_string()).collect();
        println!("Port {}: {}", port, list.join(", "));
    }
    Ok(())
}
