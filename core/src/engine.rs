//! Portwatch engine - the watcher loop.
//!
//! [`PortWatcher`] owns the reconciliation engine (and therefore the port
//! store), the emitter, the shutdown flusher and the snapshot writer. It is
//! driven from a single task: either a sampling loop or a kernel event
//! stream, each raced against a shutdown future that ends in the flush.
//!
//! Shutdown only interrupts waits (cycle and burst sleeps, stream reads).
//! Once a transition has been applied to the store its events are emitted
//! before shutdown is observed, so the flush never misses a port.

use std::collections::HashSet;
use std::future::{pending, Future};
use std::pin::{pin, Pin};
use std::time::{Duration, Instant};

use tokio::io::AsyncBufRead;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::adapters::{HttpSink, KernelEventSource, PidResolver, SnapshotPersister, StreamItem};
use crate::application::{EventEmitter, ReconciliationEngine, ShutdownFlusher};
use crate::config::WatchConfig;
use crate::domain::{KernelEvent, LifecycleEvent};
use crate::ports::{EventSink, PidLookup, SocketSampler};

/// Timing of the sampling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingSchedule {
    /// Sleep between cycles.
    pub interval: Duration,
    /// Samples per cycle, at least 1.
    pub burst_count: u32,
    /// Sleep between samples of one cycle.
    pub burst_delay: Duration,
}

impl SamplingSchedule {
    pub fn from_config(config: &WatchConfig) -> Self {
        Self {
            interval: config.interval(),
            burst_count: config.burst_count.max(1),
            burst_delay: config.burst_delay(),
        }
    }
}

impl Default for SamplingSchedule {
    fn default() -> Self {
        Self::from_config(&WatchConfig::default())
    }
}

/// What one sampling cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub samples_ok: u32,
    pub opened: usize,
    pub closed: usize,
}

/// How a kernel event run ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventRunReport {
    /// Records decoded into kernel events.
    pub events: u64,
    /// Synthetic closes emitted by the flush.
    pub flushed: usize,
    /// True when shutdown was requested, false when the stream ended.
    pub interrupted: bool,
}

/// The running watcher.
pub struct PortWatcher<L: PidLookup = PidResolver, K: EventSink = HttpSink> {
    engine: ReconciliationEngine<L>,
    emitter: EventEmitter<K>,
    flusher: ShutdownFlusher,
    snapshot: Option<SnapshotPersister>,
}

impl<L: PidLookup, K: EventSink> PortWatcher<L, K> {
    pub fn new(
        engine: ReconciliationEngine<L>,
        emitter: EventEmitter<K>,
        snapshot: Option<SnapshotPersister>,
    ) -> Self {
        Self {
            engine,
            emitter,
            flusher: ShutdownFlusher::new(),
            snapshot,
        }
    }

    pub fn engine(&self) -> &ReconciliationEngine<L> {
        &self.engine
    }

    pub fn is_flushed(&self) -> bool {
        self.flusher.is_flushed()
    }

    async fn persist(&self) {
        if let Some(snapshot) = &self.snapshot {
            snapshot.persist(&self.engine.store().ports()).await;
        }
    }

    // ========================================================================
    // Sampling modality
    // ========================================================================

    /// Run one burst of samples and reconcile it.
    ///
    /// New ports are emitted at the sample where they first appear; closures
    /// are evaluated once against the union of the burst. If every sample in
    /// the burst failed, closures are skipped.
    pub async fn run_cycle<S: SocketSampler>(
        &mut self,
        sampler: &S,
        schedule: &SamplingSchedule,
    ) -> CycleReport {
        self.cycle(sampler, schedule, pin!(pending::<()>())).await.unwrap_or_default()
    }

    /// One burst; `None` if `shutdown` resolved during a burst delay.
    ///
    /// An interrupted burst skips closure evaluation and leaves every tracked
    /// port in the store for the flush.
    async fn cycle<S, F>(
        &mut self,
        sampler: &S,
        schedule: &SamplingSchedule,
        mut shutdown: Pin<&mut F>,
    ) -> Option<CycleReport>
    where
        S: SocketSampler,
        F: Future<Output = ()>,
    {
        let mut report = CycleReport::default();
        let mut union = HashSet::new();

        for i in 0..schedule.burst_count.max(1) {
            if i > 0 && !schedule.burst_delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = shutdown.as_mut() => return None,
                    _ = sleep(schedule.burst_delay) => {}
                }
            }

            let raw = match sampler.sample().await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(backend = sampler.name(), error = %e, "sample failed");
                    continue;
                }
            };
            report.samples_ok += 1;

            let sample = self.engine.admit(raw);
            let now = Instant::now();
            for port in self.engine.refresh(&sample, now) {
                if let Some(event) = self.engine.open(port, now).await {
                    self.emitter.emit(&event).await;
                    report.opened += 1;
                }
            }
            union.extend(sample);
        }

        if report.samples_ok == 0 {
            warn!(
                backend = sampler.name(),
                "no sample succeeded this cycle, skipping closure evaluation"
            );
            return Some(report);
        }

        let closed = self.engine.settle(&union, Instant::now());
        report.closed = closed.len();
        self.emitter.emit_all(&closed).await;
        self.persist().await;

        debug!(
            samples = report.samples_ok,
            opened = report.opened,
            closed = report.closed,
            tracked = self.engine.store().len(),
            "cycle complete"
        );
        Some(report)
    }

    /// Sample until `shutdown` resolves, then flush.
    ///
    /// Returns the number of synthetic close events emitted by the flush.
    pub async fn run_sampling<S, F>(
        &mut self,
        sampler: &S,
        schedule: &SamplingSchedule,
        shutdown: F,
    ) -> usize
    where
        S: SocketSampler,
        F: Future<Output = ()>,
    {
        info!(
            backend = sampler.name(),
            source = %self.engine.source(),
            interval_ms = schedule.interval.as_millis() as u64,
            burst_count = schedule.burst_count,
            "sampling started"
        );

        tokio::pin!(shutdown);
        loop {
            if self.cycle(sampler, schedule, shutdown.as_mut()).await.is_none() {
                break;
            }
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = sleep(schedule.interval) => {}
            }
        }

        self.shutdown().await
    }

    // ========================================================================
    // Kernel event modality
    // ========================================================================

    /// Apply one kernel event and emit the resulting transitions.
    pub async fn apply_kernel_event(&mut self, event: &KernelEvent) -> Vec<LifecycleEvent> {
        let events = self.engine.on_kernel_event(event, Instant::now());
        if !events.is_empty() {
            self.emitter.emit_all(&events).await;
            self.persist().await;
        }
        events
    }

    /// Consume kernel events until the stream ends or `shutdown` resolves,
    /// then flush. Malformed records are logged and skipped.
    pub async fn run_events<R, F>(
        &mut self,
        source: &mut KernelEventSource<R>,
        shutdown: F,
    ) -> EventRunReport
    where
        R: AsyncBufRead + Unpin,
        F: Future<Output = ()>,
    {
        info!(source = %self.engine.source(), "consuming kernel events");

        let mut report = EventRunReport::default();
        tokio::pin!(shutdown);
        loop {
            let item = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    report.interrupted = true;
                    break;
                }
                item = source.next_item() => item,
            };

            match item {
                Ok(Some(StreamItem::Event(event))) => {
                    report.events += 1;
                    self.apply_kernel_event(&event).await;
                }
                Ok(Some(StreamItem::Malformed { line, error })) => {
                    warn!(line, error = %error, "skipping malformed kernel event");
                }
                Ok(None) => {
                    info!(lines = source.lines_read(), "kernel event stream ended");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "kernel event stream failed");
                    break;
                }
            }
        }

        report.flushed = self.shutdown().await;
        report
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Emit a synthetic close for every tracked port. Only the first call
    /// emits anything; each sink attempt is individually time-bounded.
    pub async fn shutdown(&mut self) -> usize {
        if self.flusher.is_flushed() {
            return 0;
        }

        let events = self.flusher.flush(self.engine.store(), self.engine.source());
        self.emitter.emit_all(&events).await;
        self.engine.clear_bindings();

        info!(closed = events.len(), "shutdown flush complete");
        events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::NoLookup;
    use crate::domain::{ContainerIdentity, EventSource, PortFilter, SinkPayload};
    use crate::error::{Error, Result};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;
    use tokio::io::BufReader;

    /// Mock sampler replaying scripted samples; repeats the last one when exhausted.
    struct MockSampler {
        script: Mutex<VecDeque<Option<Vec<u16>>>>,
        last: Mutex<Option<Vec<u16>>>,
    }

    impl MockSampler {
        fn new(script: Vec<Option<Vec<u16>>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(Some(Vec::new())),
            }
        }
    }

    impl SocketSampler for MockSampler {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn sample(&self) -> Result<HashSet<u16>> {
            let next = self.script.lock().unwrap().pop_front();
            let step = match next {
                Some(step) => {
                    *self.last.lock().unwrap() = step.clone();
                    step
                }
                None => self.last.lock().unwrap().clone(),
            };
            step.map(|ports| ports.into_iter().collect())
                .ok_or_else(|| Error::BackendUnavailable("scripted failure".into()))
        }
    }

    /// Mock sink sharing what it receives with the test.
    #[derive(Clone, Default)]
    struct RecordingSink {
        received: Arc<Mutex<Vec<(String, u16, String)>>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<(String, u16, String)> {
            self.received.lock().unwrap().clone()
        }
    }

    impl EventSink for RecordingSink {
        async fn forward(&self, payload: &SinkPayload<'_>) -> Result<()> {
            let value = serde_json::to_value(payload)?;
            self.received.lock().unwrap().push((
                value["event"].as_str().unwrap_or_default().to_string(),
                payload.port,
                payload.source.to_string(),
            ));
            Ok(())
        }
    }

    /// Records like [`RecordingSink`], then stalls on every close it forwards.
    struct SlowCloseSink {
        inner: RecordingSink,
        stall: Duration,
    }

    impl EventSink for SlowCloseSink {
        async fn forward(&self, payload: &SinkPayload<'_>) -> Result<()> {
            self.inner.forward(payload).await?;
            if serde_json::to_value(payload)?["event"] == "close" {
                sleep(self.stall).await;
            }
            Ok(())
        }
    }

    fn watcher(
        sink: &RecordingSink,
        source: EventSource,
        snapshot: Option<SnapshotPersister>,
    ) -> PortWatcher<NoLookup, RecordingSink> {
        let engine = ReconciliationEngine::for_sampling(
            NoLookup,
            PortFilter::allow_all(),
            Duration::ZERO,
            source,
        );
        let emitter = EventEmitter::new(ContainerIdentity::default(), Some(sink.clone()));
        PortWatcher::new(engine, emitter, snapshot)
    }

    fn burst(count: u32) -> SamplingSchedule {
        SamplingSchedule {
            interval: Duration::from_millis(5),
            burst_count: count,
            burst_delay: Duration::ZERO,
        }
    }

    fn ev(kind: &str, port: u16, source: &str) -> (String, u16, String) {
        (kind.to_string(), port, source.to_string())
    }

    #[tokio::test]
    async fn test_cycle_opens_per_sample_and_closes_on_union() {
        let sink = RecordingSink::default();
        let mut watcher = watcher(&sink, EventSource::Polling, None);
        let sampler = MockSampler::new(vec![
            Some(vec![80]),
            Some(vec![22]),
            Some(vec![22]),
            Some(vec![22]),
        ]);

        let first = watcher.run_cycle(&sampler, &burst(2)).await;
        assert_eq!(first, CycleReport { samples_ok: 2, opened: 2, closed: 0 });

        let second = watcher.run_cycle(&sampler, &burst(2)).await;
        assert_eq!(second.closed, 1);

        assert_eq!(
            sink.events(),
            vec![
                ev("open", 80, "polling"),
                ev("open", 22, "polling"),
                ev("close", 80, "polling"),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_burst_skips_closures() {
        let sink = RecordingSink::default();
        let mut watcher = watcher(&sink, EventSource::Polling, None);
        let sampler = MockSampler::new(vec![Some(vec![8080]), None, None]);

        watcher.run_cycle(&sampler, &burst(1)).await;
        let failed = watcher.run_cycle(&sampler, &burst(2)).await;

        assert_eq!(failed.samples_ok, 0);
        assert!(watcher.engine().store().contains(8080));
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_burst_failure_still_reconciles() {
        let sink = RecordingSink::default();
        let mut watcher = watcher(&sink, EventSource::Polling, None);
        let sampler = MockSampler::new(vec![Some(vec![8080]), None, Some(vec![])]);

        watcher.run_cycle(&sampler, &burst(1)).await;
        let report = watcher.run_cycle(&sampler, &burst(2)).await;

        assert_eq!(report.samples_ok, 1);
        assert_eq!(report.closed, 1);
    }

    #[tokio::test]
    async fn test_cycle_writes_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ports");
        let sink = RecordingSink::default();
        let snapshot = SnapshotPersister::new(&path);
        let mut watcher = watcher(&sink, EventSource::Polling, Some(snapshot));
        let sampler = MockSampler::new(vec![Some(vec![8080, 22])]);

        watcher.run_cycle(&sampler, &burst(1)).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "22\n8080\n");
    }

    #[tokio::test]
    async fn test_run_sampling_flushes_on_shutdown() {
        let sink = RecordingSink::default();
        let mut watcher = watcher(&sink, EventSource::Fallback, None);
        let sampler = MockSampler::new(vec![Some(vec![3000])]);

        let flushed = watcher
            .run_sampling(&sampler, &burst(1), sleep(Duration::from_millis(50)))
            .await;

        assert_eq!(flushed, 1);
        assert!(watcher.is_flushed());
        assert_eq!(
            sink.events(),
            vec![ev("open", 3000, "fallback"), ev("close", 3000, "shutdown-fallback")]
        );

        // Repeated termination requests emit nothing more
        assert_eq!(watcher.shutdown().await, 0);
        assert_eq!(sink.events().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_during_close_emission_keeps_every_close() {
        let sink = RecordingSink::default();
        let engine = ReconciliationEngine::for_sampling(
            NoLookup,
            PortFilter::allow_all(),
            Duration::ZERO,
            EventSource::Polling,
        );
        let emitter = EventEmitter::new(
            ContainerIdentity::default(),
            Some(SlowCloseSink {
                inner: sink.clone(),
                stall: Duration::from_millis(200),
            }),
        );
        let mut watcher = PortWatcher::new(engine, emitter, None);
        let sampler = MockSampler::new(vec![Some(vec![80, 81]), Some(vec![])]);

        // Shutdown arrives while the first close is still being forwarded
        let flushed = watcher
            .run_sampling(&sampler, &burst(1), sleep(Duration::from_millis(100)))
            .await;

        assert_eq!(flushed, 0);
        assert!(watcher.engine().store().is_empty());
        assert_eq!(
            sink.events(),
            vec![
                ev("open", 80, "polling"),
                ev("open", 81, "polling"),
                ev("close", 80, "polling"),
                ev("close", 81, "polling"),
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_during_burst_delay_leaves_ports_to_flush() {
        let sink = RecordingSink::default();
        let mut watcher = watcher(&sink, EventSource::Polling, None);
        let sampler = MockSampler::new(vec![Some(vec![443]), Some(vec![])]);
        let schedule = SamplingSchedule {
            interval: Duration::from_millis(5),
            burst_count: 2,
            burst_delay: Duration::from_secs(5),
        };

        let flushed = watcher
            .run_sampling(&sampler, &schedule, sleep(Duration::from_millis(50)))
            .await;

        assert_eq!(flushed, 1);
        assert_eq!(
            sink.events(),
            vec![ev("open", 443, "polling"), ev("close", 443, "shutdown")]
        );
    }

    #[tokio::test]
    async fn test_run_events_until_stream_end() {
        let sink = RecordingSink::default();
        let engine = ReconciliationEngine::for_events(PortFilter::allow_all());
        let emitter = EventEmitter::new(ContainerIdentity::default(), Some(sink.clone()));
        let mut watcher = PortWatcher::new(engine, emitter, None);

        let input = concat!(
            "{\"type\":\"bind\",\"pid\":10,\"fd\":3,\"port\":8080,\"family\":\"AF_INET\"}\n",
            "not json\n",
            "{\"type\":\"bind\",\"pid\":11,\"fd\":4,\"port\":9090,\"family\":\"AF_INET6\"}\n",
            "{\"type\":\"close\",\"pid\":10,\"fd\":3}\n",
            "{\"type\":\"close\",\"pid\":99,\"fd\":1}\n",
        );
        let mut source = KernelEventSource::new(BufReader::new(input.as_bytes()));

        let report = watcher.run_events(&mut source, pending::<()>()).await;

        assert_eq!(
            report,
            EventRunReport {
                events: 4,
                flushed: 1,
                interrupted: false
            }
        );
        assert_eq!(
            sink.events(),
            vec![
                ev("open", 8080, "ebpf"),
                ev("open", 9090, "ebpf"),
                ev("close", 8080, "ebpf"),
                ev("close", 9090, "shutdown-ebpf"),
            ]
        );
        assert_eq!(watcher.engine().binding_count(), 0);
    }

    #[tokio::test]
    async fn test_run_events_survives_non_utf8_line() {
        let sink = RecordingSink::default();
        let engine = ReconciliationEngine::for_events(PortFilter::allow_all());
        let emitter = EventEmitter::new(ContainerIdentity::default(), Some(sink.clone()));
        let mut watcher = PortWatcher::new(engine, emitter, None);

        let mut input = Vec::new();
        input.extend_from_slice(
            b"{\"type\":\"bind\",\"pid\":10,\"fd\":3,\"port\":8080,\"family\":\"AF_INET\"}\n",
        );
        input.extend_from_slice(b"\xff\xfe\n");
        input.extend_from_slice(
            b"{\"type\":\"bind\",\"pid\":11,\"fd\":4,\"port\":9090,\"family\":\"AF_INET\"}\n",
        );
        input.extend_from_slice(b"{\"type\":\"close\",\"pid\":10,\"fd\":3}\n");
        let mut source = KernelEventSource::new(BufReader::new(&input[..]));

        let report = watcher.run_events(&mut source, pending::<()>()).await;

        assert_eq!(report.events, 3);
        assert_eq!(
            sink.events(),
            vec![
                ev("open", 8080, "ebpf"),
                ev("open", 9090, "ebpf"),
                ev("close", 8080, "ebpf"),
                ev("close", 9090, "shutdown-ebpf"),
            ]
        );
    }

    #[tokio::test]
    async fn test_run_events_stops_on_shutdown() {
        let sink = RecordingSink::default();
        let engine = ReconciliationEngine::for_events(PortFilter::allow_all());
        let emitter = EventEmitter::new(ContainerIdentity::default(), Some(sink.clone()));
        let mut watcher = PortWatcher::new(engine, emitter, None);

        // A reader that never yields a line
        let (_writer, reader) = tokio::io::duplex(64);
        let mut source = KernelEventSource::new(BufReader::new(reader));

        let report = watcher
            .run_events(&mut source, sleep(Duration::from_millis(20)))
            .await;
        assert!(report.interrupted);
        assert_eq!(report.flushed, 0);
        assert!(watcher.is_flushed());
    }
}
