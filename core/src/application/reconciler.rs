//! Port lifecycle reconciliation.
//!
//! The engine is the only writer of the [`PortStateStore`] and of the fd
//! bindings used by the kernel event modality. Sampled observations go
//! through a graced discipline (closures wait out a debounce window); kernel
//! events are authoritative and ordered, so their transitions are immediate.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::domain::{
    is_valid_port, EventSource, KernelEvent, LifecycleEvent, PortFilter, PortRecord,
    PortStateStore,
};
use crate::ports::PidLookup;

/// How closures are confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Sampling: a missing port closes once it has stayed missing for `grace`.
    Graced(Duration),
    /// Kernel events: a matching close removes the port immediately.
    Ungraced,
}

impl Discipline {
    fn grace(&self) -> Duration {
        match self {
            Discipline::Graced(grace) => *grace,
            Discipline::Ungraced => Duration::ZERO,
        }
    }
}

/// PID lookup for modalities that carry their own attribution.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLookup;

impl PidLookup for NoLookup {
    async fn resolve(&self, _port: u16) -> BTreeSet<u32> {
        BTreeSet::new()
    }
}

/// Events produced by one full reconciliation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub opened: Vec<LifecycleEvent>,
    pub closed: Vec<LifecycleEvent>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty()
    }
}

/// Turns observations into de-duplicated, debounced lifecycle transitions.
pub struct ReconciliationEngine<L: PidLookup = NoLookup> {
    store: PortStateStore,
    bindings: HashMap<(u32, i64), u16>,
    filter: PortFilter,
    discipline: Discipline,
    lookup: L,
    source: EventSource,
}

impl ReconciliationEngine<NoLookup> {
    /// Engine for the kernel event modality.
    pub fn for_events(filter: PortFilter) -> Self {
        Self {
            store: PortStateStore::new(),
            bindings: HashMap::new(),
            filter,
            discipline: Discipline::Ungraced,
            lookup: NoLookup,
            source: EventSource::Ebpf,
        }
    }
}

impl<L: PidLookup> ReconciliationEngine<L> {
    /// Engine for the sampling modality.
    ///
    /// `source` is [`EventSource::Polling`], or [`EventSource::Fallback`] when
    /// sampling stands in for an unavailable kernel event stream.
    pub fn for_sampling(
        lookup: L,
        filter: PortFilter,
        grace: Duration,
        source: EventSource,
    ) -> Self {
        Self {
            store: PortStateStore::new(),
            bindings: HashMap::new(),
            filter,
            discipline: Discipline::Graced(grace),
            lookup,
            source,
        }
    }

    pub fn store(&self) -> &PortStateStore {
        &self.store
    }

    pub fn source(&self) -> EventSource {
        self.source
    }

    /// Number of live fd bindings (kernel event modality).
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Drop all fd bindings. They carry no externally visible state.
    pub fn clear_bindings(&mut self) {
        self.bindings.clear();
    }

    fn admits(&self, port: u16) -> bool {
        port != 0 && self.filter.matches(port)
    }

    /// Drop invalid ports and ports outside the allow-list from a raw sample.
    pub fn admit(&self, raw: HashSet<u16>) -> HashSet<u16> {
        raw.into_iter().filter(|port| self.admits(*port)).collect()
    }

    // ========================================================================
    // Sampling modality
    // ========================================================================

    /// Refresh every tracked port present in `observed` and return the
    /// observed ports that are not tracked yet, sorted.
    ///
    /// A tracked port that reappears inside its grace window keeps its
    /// record (and its attribution); only its pending-close mark is cleared.
    pub fn refresh(&mut self, observed: &HashSet<u16>, now: Instant) -> Vec<u16> {
        let mut unseen = Vec::new();

        for &port in observed {
            if !self.admits(port) {
                continue;
            }
            match self.store.get_mut(port) {
                Some(record) => {
                    if record.is_pending_close() {
                        debug!(port, "port reappeared within grace window");
                    }
                    record.refresh(now);
                }
                None => unseen.push(port),
            }
        }

        unseen.sort_unstable();
        unseen
    }

    /// Start tracking a newly observed port. Resolves its owners first.
    ///
    /// Returns `None` if the port is already tracked or not admitted.
    pub async fn open(&mut self, port: u16, now: Instant) -> Option<LifecycleEvent> {
        if !self.admits(port) || self.store.contains(port) {
            return None;
        }

        let pids = self.lookup.resolve(port).await;
        let record = PortRecord::opened(port, pids, now);
        let event = LifecycleEvent::open(port, record.pids(), self.source);
        self.store.put(record);
        Some(event)
    }

    /// Evaluate closures for every tracked port absent from `observed`.
    ///
    /// In a burst, `observed` is the union of every sample in the burst.
    pub fn settle(&mut self, observed: &HashSet<u16>, now: Instant) -> Vec<LifecycleEvent> {
        let grace = self.discipline.grace();
        let mut candidates: Vec<u16> = self
            .store
            .iter()
            .map(|(port, _)| *port)
            .filter(|port| !observed.contains(port))
            .collect();
        candidates.sort_unstable();

        let mut closed = Vec::new();
        for port in candidates {
            let Some(record) = self.store.get_mut(port) else {
                continue;
            };

            let confirmed = if grace.is_zero() {
                true
            } else {
                match record.pending_close_since {
                    Some(since) => now.saturating_duration_since(since) >= grace,
                    None if record.unseen_for(now) < grace => {
                        trace!(port, grace_ms = grace.as_millis() as u64, "port pending close");
                        record.pending_close_since = Some(now);
                        false
                    }
                    None => true,
                }
            };

            if confirmed {
                if let Some(record) = self.store.delete(port) {
                    closed.push(LifecycleEvent::close(port, record.pids(), self.source));
                }
            }
        }

        closed
    }

    /// Reconcile one observation: opens, refreshes, then closures.
    pub async fn reconcile(&mut self, observed: &HashSet<u16>, now: Instant) -> Reconciliation {
        let observed: HashSet<u16> = observed
            .iter()
            .copied()
            .filter(|port| self.admits(*port))
            .collect();

        let mut opened = Vec::new();
        for port in self.refresh(&observed, now) {
            if let Some(event) = self.open(port, now).await {
                opened.push(event);
            }
        }

        let closed = self.settle(&observed, now);
        Reconciliation { opened, closed }
    }

    // ========================================================================
    // Kernel event modality
    // ========================================================================

    /// Apply one kernel event in arrival order.
    pub fn on_kernel_event(&mut self, event: &KernelEvent, now: Instant) -> Vec<LifecycleEvent> {
        match event {
            KernelEvent::Bind {
                pid,
                fd,
                port,
                family,
            } => {
                if !family.is_ip() {
                    trace!(pid, fd, %family, "ignoring non-IP bind");
                    return Vec::new();
                }
                if !is_valid_port(*port) {
                    trace!(pid, fd, port, "ignoring bind without a port");
                    return Vec::new();
                }
                let port = *port as u16;
                if !self.filter.matches(port) {
                    return Vec::new();
                }
                self.bind(*pid, *fd, port, now)
            }
            KernelEvent::Close { pid, fd } => self.unbind(*pid, *fd).into_iter().collect(),
        }
    }

    /// Record a binding of `port` by `(pid, fd)`.
    ///
    /// Only the first binding of a port emits `open`. Further bindings of an
    /// already open port (SO_REUSEPORT, forked listeners) add their PID to the
    /// record silently; the port closes when its last binding goes away.
    fn bind(&mut self, pid: u32, fd: i64, port: u16, now: Instant) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();

        // A rebind of a live fd without an observed close releases the old port.
        if let Some(previous) = self.bindings.get(&(pid, fd)).copied() {
            if previous == port {
                if let Some(record) = self.store.get_mut(port) {
                    record.refresh(now);
                }
                return events;
            }
            events.extend(self.unbind(pid, fd));
        }

        self.bindings.insert((pid, fd), port);

        match self.store.get_mut(port) {
            Some(record) => {
                debug!(port, pid, "additional binding on open port");
                record.owning_pids.insert(pid);
                record.refresh(now);
            }
            None => {
                let record = PortRecord::opened(port, BTreeSet::from([pid]), now);
                self.store.put(record);
                events.push(LifecycleEvent::open(port, vec![pid], self.source));
            }
        }

        events
    }

    fn unbind(&mut self, pid: u32, fd: i64) -> Option<LifecycleEvent> {
        let Some(port) = self.bindings.remove(&(pid, fd)) else {
            trace!(pid, fd, "close of untracked fd");
            return None;
        };

        let remaining: BTreeSet<u32> = self
            .bindings
            .iter()
            .filter(|(_, bound)| **bound == port)
            .map(|((owner, _), _)| *owner)
            .collect();

        if remaining.is_empty() {
            let record = self.store.delete(port)?;
            return Some(LifecycleEvent::close(port, record.pids(), self.source));
        }

        if let Some(record) = self.store.get_mut(port) {
            record.owning_pids = remaining;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AddressFamily, EventKind};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock lookup with fixed answers that counts its calls.
    #[derive(Default)]
    struct MockLookup {
        answers: BTreeMap<u16, Vec<u32>>,
        calls: AtomicUsize,
    }

    impl MockLookup {
        fn with(port: u16, pids: Vec<u32>) -> Self {
            let mut lookup = Self::default();
            lookup.answers.insert(port, pids);
            lookup
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PidLookup for MockLookup {
        async fn resolve(&self, port: u16) -> BTreeSet<u32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .get(&port)
                .map(|pids| pids.iter().copied().collect())
                .unwrap_or_default()
        }
    }

    fn set(ports: &[u16]) -> HashSet<u16> {
        ports.iter().copied().collect()
    }

    fn sampling(grace_ms: u64) -> ReconciliationEngine<MockLookup> {
        ReconciliationEngine::for_sampling(
            MockLookup::default(),
            PortFilter::allow_all(),
            Duration::from_millis(grace_ms),
            EventSource::Polling,
        )
    }

    fn bind(pid: u32, fd: i64, port: i64) -> KernelEvent {
        KernelEvent::Bind {
            pid,
            fd,
            port,
            family: AddressFamily::Inet,
        }
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let mut engine = sampling(0);
        let t0 = Instant::now();

        let first = engine.reconcile(&set(&[22, 80]), t0).await;
        assert_eq!(first.opened.len(), 2);

        let second = engine.reconcile(&set(&[22, 80]), t0 + Duration::from_secs(1)).await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_continuity_advances_last_seen() {
        let mut engine = sampling(0);
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);

        engine.reconcile(&set(&[443]), t0).await;
        let result = engine.reconcile(&set(&[443]), t1).await;

        assert!(result.is_empty());
        let record = engine.store().get(443).unwrap();
        assert_eq!(record.first_seen, t0);
        assert_eq!(record.last_seen, t1);
    }

    #[tokio::test]
    async fn test_scenario_a_sampling_without_grace() {
        let mut engine = sampling(0);
        let t0 = Instant::now();
        let tick = Duration::from_secs(1);

        let r1 = engine.reconcile(&set(&[]), t0).await;
        assert!(r1.is_empty());

        let r2 = engine.reconcile(&set(&[5000]), t0 + tick).await;
        assert_eq!(r2.opened.len(), 1);
        assert_eq!(r2.opened[0].kind, EventKind::Open);
        assert_eq!(r2.opened[0].port, 5000);

        let r3 = engine.reconcile(&set(&[5000]), t0 + tick * 2).await;
        assert!(r3.is_empty());

        let r4 = engine.reconcile(&set(&[]), t0 + tick * 3).await;
        assert!(r4.opened.is_empty());
        assert_eq!(r4.closed, vec![LifecycleEvent::close(5000, vec![], EventSource::Polling)]);
        assert!(engine.store().is_empty());
    }

    #[tokio::test]
    async fn test_reappearance_within_grace_is_silent() {
        let mut engine = sampling(3000);
        engine.lookup.answers.insert(8080, vec![7]);
        let t0 = Instant::now();
        let tick = Duration::from_secs(1);

        engine.reconcile(&set(&[8080]), t0).await;
        assert_eq!(engine.lookup.calls(), 1);

        let gone = engine.reconcile(&set(&[]), t0 + tick).await;
        assert!(gone.is_empty());
        assert!(engine.store().get(8080).unwrap().is_pending_close());

        let back = engine.reconcile(&set(&[8080]), t0 + tick * 2).await;
        assert!(back.is_empty());
        assert!(!engine.store().get(8080).unwrap().is_pending_close());
        // Continuity of the existing record, no second resolution
        assert_eq!(engine.lookup.calls(), 1);
        assert_eq!(engine.store().get(8080).unwrap().pids(), vec![7]);
    }

    #[tokio::test]
    async fn test_close_fires_once_at_grace_expiry() {
        let mut engine = ReconciliationEngine::for_sampling(
            MockLookup::with(8080, vec![7]),
            PortFilter::allow_all(),
            Duration::from_millis(2000),
            EventSource::Polling,
        );
        let t0 = Instant::now();
        let tick = Duration::from_secs(1);

        engine.reconcile(&set(&[8080]), t0).await;

        // Pending at t1, still inside grace at t2
        assert!(engine.reconcile(&set(&[]), t0 + tick).await.is_empty());
        assert!(engine.reconcile(&set(&[]), t0 + tick * 2).await.is_empty());

        let expired = engine.reconcile(&set(&[]), t0 + tick * 3).await;
        assert_eq!(
            expired.closed,
            vec![LifecycleEvent::close(8080, vec![7], EventSource::Polling)]
        );

        assert!(engine.reconcile(&set(&[]), t0 + tick * 4).await.is_empty());
    }

    #[tokio::test]
    async fn test_grace_already_elapsed_closes_immediately() {
        let mut engine = sampling(500);
        let t0 = Instant::now();

        engine.reconcile(&set(&[8080]), t0).await;
        let late = engine.reconcile(&set(&[]), t0 + Duration::from_secs(1)).await;
        assert_eq!(late.closed.len(), 1);
    }

    #[tokio::test]
    async fn test_burst_opens_immediately_and_closes_on_union() {
        let mut engine = sampling(0);
        let t0 = Instant::now();
        engine.reconcile(&set(&[22, 80]), t0).await;

        // Burst: S1 = {22}, S2 = {80, 3000}
        let now = t0 + Duration::from_secs(1);
        let s1 = set(&[22]);
        let s2 = set(&[80, 3000]);

        assert!(engine.refresh(&s1, now).is_empty());

        let new_at_s2 = engine.refresh(&s2, now);
        assert_eq!(new_at_s2, vec![3000]);
        let opened = engine.open(3000, now).await.unwrap();
        assert_eq!(opened.port, 3000);
        assert!(engine.store().contains(3000));

        // 22 missing from S2 and 80 missing from S1, but both are in the union
        let union: HashSet<u16> = s1.union(&s2).copied().collect();
        assert!(engine.settle(&union, now).is_empty());
        assert_eq!(engine.store().ports(), vec![22, 80, 3000]);
    }

    #[tokio::test]
    async fn test_intra_burst_flap_reports_once() {
        let mut engine = sampling(0);
        let now = Instant::now();

        let mut opens = 0;
        let mut union = HashSet::new();
        for sample in [set(&[9000]), set(&[]), set(&[9000])] {
            for port in engine.refresh(&sample, now) {
                if engine.open(port, now).await.is_some() {
                    opens += 1;
                }
            }
            union.extend(sample);
        }

        assert_eq!(opens, 1);
        assert!(engine.settle(&union, now).is_empty());
    }

    #[tokio::test]
    async fn test_scenario_c_filter() {
        let mut engine = ReconciliationEngine::for_sampling(
            MockLookup::default(),
            "8000-8005".parse().unwrap(),
            Duration::ZERO,
            EventSource::Polling,
        );

        let result = engine.reconcile(&set(&[7999, 8000, 9000]), Instant::now()).await;
        assert_eq!(result.opened.len(), 1);
        assert_eq!(result.opened[0].port, 8000);
        assert_eq!(engine.store().ports(), vec![8000]);
        assert_eq!(engine.lookup.calls(), 1);
    }

    #[tokio::test]
    async fn test_port_zero_rejected() {
        let mut engine = sampling(0);
        let result = engine.reconcile(&set(&[0]), Instant::now()).await;
        assert!(result.is_empty());
        assert!(engine.admit(set(&[0, 22])).contains(&22));
        assert!(!engine.admit(set(&[0, 22])).contains(&0));
    }

    #[test]
    fn test_scenario_b_kernel_events() {
        let mut engine = ReconciliationEngine::for_events(PortFilter::allow_all());
        let now = Instant::now();

        let opened = engine.on_kernel_event(&bind(10, 3, 8080), now);
        assert_eq!(opened, vec![LifecycleEvent::open(8080, vec![10], EventSource::Ebpf)]);

        let closed = engine.on_kernel_event(&KernelEvent::Close { pid: 10, fd: 3 }, now);
        assert_eq!(closed, vec![LifecycleEvent::close(8080, vec![10], EventSource::Ebpf)]);
        assert!(engine.store().is_empty());
        assert_eq!(engine.binding_count(), 0);
    }

    #[test]
    fn test_unmatched_close_is_silent() {
        let mut engine = ReconciliationEngine::for_events(PortFilter::allow_all());
        let now = Instant::now();

        engine.on_kernel_event(&bind(10, 3, 8080), now);
        assert!(engine
            .on_kernel_event(&KernelEvent::Close { pid: 10, fd: 4 }, now)
            .is_empty());
        assert!(engine
            .on_kernel_event(&KernelEvent::Close { pid: 11, fd: 3 }, now)
            .is_empty());
        assert!(engine.store().contains(8080));
    }

    #[test]
    fn test_non_ip_and_portless_binds_ignored() {
        let mut engine = ReconciliationEngine::for_events(PortFilter::allow_all());
        let now = Instant::now();

        let unix = KernelEvent::Bind {
            pid: 1,
            fd: 5,
            port: 8080,
            family: AddressFamily::Other("AF_UNIX".to_string()),
        };
        assert!(engine.on_kernel_event(&unix, now).is_empty());
        assert!(engine.on_kernel_event(&bind(1, 6, 0), now).is_empty());
        assert!(engine.on_kernel_event(&bind(1, 7, 70000), now).is_empty());
        assert!(engine.store().is_empty());
        assert_eq!(engine.binding_count(), 0);
    }

    #[test]
    fn test_filter_applies_to_kernel_events() {
        let mut engine = ReconciliationEngine::for_events("8000-8005".parse().unwrap());
        let now = Instant::now();

        assert!(engine.on_kernel_event(&bind(1, 3, 9000), now).is_empty());
        assert_eq!(engine.binding_count(), 0);
        assert!(engine
            .on_kernel_event(&KernelEvent::Close { pid: 1, fd: 3 }, now)
            .is_empty());
    }

    #[test]
    fn test_shared_port_closes_with_last_binding() {
        let mut engine = ReconciliationEngine::for_events(PortFilter::allow_all());
        let now = Instant::now();

        assert_eq!(engine.on_kernel_event(&bind(10, 3, 8080), now).len(), 1);
        assert!(engine.on_kernel_event(&bind(11, 4, 8080), now).is_empty());
        assert_eq!(engine.store().get(8080).unwrap().pids(), vec![10, 11]);

        assert!(engine
            .on_kernel_event(&KernelEvent::Close { pid: 10, fd: 3 }, now)
            .is_empty());
        assert_eq!(engine.store().get(8080).unwrap().pids(), vec![11]);

        let closed = engine.on_kernel_event(&KernelEvent::Close { pid: 11, fd: 4 }, now);
        assert_eq!(closed, vec![LifecycleEvent::close(8080, vec![11], EventSource::Ebpf)]);
    }

    #[test]
    fn test_rebind_of_live_fd_releases_old_port() {
        let mut engine = ReconciliationEngine::for_events(PortFilter::allow_all());
        let now = Instant::now();

        engine.on_kernel_event(&bind(10, 3, 8080), now);
        let events = engine.on_kernel_event(&bind(10, 3, 9090), now);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Close);
        assert_eq!(events[0].port, 8080);
        assert_eq!(events[1].kind, EventKind::Open);
        assert_eq!(events[1].port, 9090);
        assert_eq!(engine.store().ports(), vec![9090]);
    }
}
