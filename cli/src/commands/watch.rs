//! Watch command - run the port watcher until terminated.

use std::future::Future;

use anyhow::{bail, Context, Result};
use portwatch_core::adapters::TracerStream;
use portwatch_core::application::NoLookup;
use portwatch_core::{
    EventEmitter, EventRunReport, EventSource, FailoverSampler, HttpSink, Mode, PidResolver,
    PortFilter, PortWatcher, ReconciliationEngine, SamplingSchedule, SnapshotPersister,
    TracerProcess, WatchConfig,
};
use tracing::{info, warn};

use crate::signals::shutdown_signal;

pub async fn run(config: WatchConfig) -> Result<()> {
    config.validate().context("invalid configuration")?;

    let filter = config.filter()?;
    let shutdown = shutdown_signal().context("failed to install signal handlers")?;

    if filter.is_active() {
        info!(ports = %filter, "port filter active");
    }

    watch(&config, filter, shutdown).await?;
    Ok(())
}

/// Run the configured modality until shutdown. Returns the source tag of the
/// modality that ran last.
///
/// In ebpf mode, a tracer that cannot be spawned, or whose stream ends before
/// any event was decoded, is replaced by sampling tagged `fallback`. A tracer
/// that dies after delivering events is an error: coverage cannot be resumed
/// without losing the fd bindings.
async fn watch(
    config: &WatchConfig,
    filter: PortFilter,
    shutdown: impl Future<Output = ()>,
) -> Result<EventSource> {
    if config.mode == Mode::Polling {
        run_sampling(config, filter, EventSource::Polling, shutdown).await?;
        return Ok(EventSource::Polling);
    }

    tokio::pin!(shutdown);
    match TracerProcess::spawn(&config.tracer_command) {
        Ok((tracer, stream)) => {
            let report = run_events(config, filter.clone(), tracer, stream, shutdown.as_mut())
                .await?;
            if report.interrupted {
                return Ok(EventSource::Ebpf);
            }
            if report.events > 0 {
                bail!(
                    "kernel tracer exited after {} events, port coverage lost",
                    report.events
                );
            }
            warn!("kernel tracer exited before reporting any event, falling back to sampling");
        }
        Err(e) => {
            warn!(error = %e, "kernel tracer unavailable, falling back to sampling");
        }
    }

    run_sampling(config, filter, EventSource::Fallback, shutdown).await?;
    Ok(EventSource::Fallback)
}

fn emitter(config: &WatchConfig) -> Result<EventEmitter<HttpSink>> {
    let sink = match &config.sink_url {
        Some(url) => {
            info!(url = %url, "forwarding events to sink");
            Some(HttpSink::new(url.clone(), config.sink_timeout())?)
        }
        None => None,
    };
    Ok(EventEmitter::new(config.identity(), sink))
}

fn snapshot(config: &WatchConfig) -> Option<SnapshotPersister> {
    let persister = SnapshotPersister::new(config.snapshot_path.clone()?);
    info!(path = %persister.path().display(), "writing port snapshot");
    Some(persister)
}

async fn run_sampling(
    config: &WatchConfig,
    filter: PortFilter,
    source: EventSource,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let sampler = FailoverSampler::for_choice(config.backend);
    let engine = ReconciliationEngine::for_sampling(
        PidResolver::system(config.resolve_timeout()),
        filter,
        config.grace(),
        source,
    );
    let mut watcher = PortWatcher::new(engine, emitter(config)?, snapshot(config));

    watcher
        .run_sampling(&sampler, &SamplingSchedule::from_config(config), shutdown)
        .await;
    Ok(())
}

async fn run_events(
    config: &WatchConfig,
    filter: PortFilter,
    tracer: TracerProcess,
    mut stream: TracerStream,
    shutdown: impl Future<Output = ()>,
) -> Result<EventRunReport> {
    info!(pid = tracer.id(), "kernel tracer started");

    let engine = ReconciliationEngine::for_events(filter);
    let mut watcher: PortWatcher<NoLookup, HttpSink> =
        PortWatcher::new(engine, emitter(config)?, snapshot(config));

    let report = watcher.run_events(&mut stream, shutdown).await;
    let status = tracer.terminate().await;
    if !report.interrupted {
        if let Some(status) = status {
            warn!(%status, events = report.events, "kernel tracer exited");
        }
    }
    Ok(report)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    fn ebpf_config(script: &str) -> WatchConfig {
        WatchConfig {
            mode: Mode::Ebpf,
            interval_ms: 20,
            // Keep sampled ports (and their PID lookups) out of the test
            ports: Some("1".to_string()),
            snapshot_path: None,
            tracer_command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            ..WatchConfig::default()
        }
    }

    async fn watch_for(config: &WatchConfig, millis: u64) -> Result<EventSource> {
        watch(
            config,
            config.filter()?,
            sleep(Duration::from_millis(millis)),
        )
        .await
    }

    #[tokio::test]
    async fn test_tracer_exiting_at_startup_falls_back_to_sampling() {
        let config = ebpf_config("echo 'ERROR: missing CAP_BPF' >&2; exit 1");
        assert_eq!(watch_for(&config, 200).await.unwrap(), EventSource::Fallback);
    }

    #[tokio::test]
    async fn test_unspawnable_tracer_falls_back_to_sampling() {
        let config = WatchConfig {
            tracer_command: vec!["/nonexistent/portwatch-tracer".to_string()],
            ..ebpf_config("")
        };
        assert_eq!(watch_for(&config, 100).await.unwrap(), EventSource::Fallback);
    }

    #[tokio::test]
    async fn test_tracer_dying_after_events_is_an_error() {
        let config =
            ebpf_config(r#"echo '{"type":"bind","pid":1,"fd":3,"port":1,"family":"AF_INET"}'"#);
        assert!(watch_for(&config, 5_000).await.is_err());
    }

    #[tokio::test]
    async fn test_running_tracer_stops_on_shutdown() {
        let config = ebpf_config("exec sleep 30");
        assert_eq!(watch_for(&config, 100).await.unwrap(), EventSource::Ebpf);
    }
}
