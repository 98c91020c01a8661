use super::histogram::{Histogram, PsthObserver, WINDOW_CLOSE_DELAY_MS};
use super::triggers::SourceId;
use super::{ChannelId, ChannelInfo, StreamId};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Identity of one alignment engine: a (channel, trigger source) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineKey {
    pub channel: ChannelId,
    pub source: SourceId,
}

// WINDOW TIMER ----------------------------------------------------------------

/// Cancellable one-shot deadlines keyed by engine identity.
///
/// The producer context schedules deadlines when a window opens; the
/// control context drains expired ones and drives the window-close
/// transition. There is at most one deadline per engine, since an engine
/// accepts no further triggers while its window is open.
pub struct WindowTimer {
    deadlines: Vec<(EngineKey, Instant)>,
}

impl WindowTimer {
    pub fn new() -> Self {
        Self {
            deadlines: Vec::new(),
        }
    }

    pub fn schedule(&mut self, key: EngineKey, deadline: Instant) {
        self.deadlines.retain(|(k, _)| *k != key);
        self.deadlines.push((key, deadline));
    }

    pub fn cancel_where<F: Fn(&EngineKey) -> bool>(&mut self, predicate: F) {
        self.deadlines.retain(|(k, _)| !predicate(k));
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    /// Removes and returns every deadline at or before `now`.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<EngineKey> {
        let mut expired = Vec::new();
        self.deadlines.retain(|(key, deadline)| {
            if *deadline <= now {
                expired.push(*key);
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().map(|(_, d)| *d).min()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

impl Default for WindowTimer {
    fn default() -> Self {
        Self::new()
    }
}

// DISPATCH --------------------------------------------------------------------

struct Routes {
    // Insertion order, for deterministic iteration and snapshots.
    ordered: Vec<Arc<Histogram>>,
    engines: HashMap<EngineKey, Arc<Histogram>>,
    by_channel: HashMap<ChannelId, Vec<Arc<Histogram>>>,
    by_source: HashMap<SourceId, Vec<Arc<Histogram>>>,
}

impl Routes {
    fn new() -> Self {
        Self {
            ordered: Vec::new(),
            engines: HashMap::new(),
            by_channel: HashMap::new(),
            by_source: HashMap::new(),
        }
    }

    fn rebuild_indexes(&mut self) {
        self.engines.clear();
        self.by_channel.clear();
        self.by_source.clear();

        for engine in &self.ordered {
            let key = EngineKey {
                channel: engine.channel().id,
                source: engine.source(),
            };
            self.engines.insert(key, engine.clone());
            self.by_channel
                .entry(key.channel)
                .or_default()
                .push(engine.clone());
            self.by_source
                .entry(key.source)
                .or_default()
                .push(engine.clone());
        }
    }
}

/// Routes spikes and trigger events to the alignment engines and owns the
/// engine lifecycle. One engine exists per registered (channel, source)
/// pair; the signal-chain owner supplies the cross-product on rebuild.
pub struct PsthDispatch {
    routes: RwLock<Routes>,
    timer: Mutex<WindowTimer>,
    observer: Arc<dyn PsthObserver>,
    window_close_delay: Duration,
}

impl PsthDispatch {
    pub fn new(observer: Arc<dyn PsthObserver>) -> Self {
        Self {
            routes: RwLock::new(Routes::new()),
            timer: Mutex::new(WindowTimer::new()),
            observer,
            window_close_delay: Duration::from_millis(WINDOW_CLOSE_DELAY_MS),
        }
    }

    /// Drops every engine and every pending deadline ahead of a wholesale
    /// re-registration. Rebuilds are rare (signal-chain edits), so there is
    /// no incremental diffing.
    pub fn prepare_to_update(&self) {
        let mut routes = self.routes.write().unwrap();
        routes.ordered.clear();
        routes.rebuild_indexes();
        self.timer.lock().unwrap().clear();
    }

    /// Registers an engine for a (channel, source) pair. An existing engine
    /// for the same pair is replaced.
    pub fn add_histogram(
        &self,
        channel: ChannelInfo,
        source: SourceId,
        pre_ms: u32,
        post_ms: u32,
        bin_size_ms: u32,
    ) {
        let engine = Arc::new(Histogram::new(
            channel,
            source,
            pre_ms,
            post_ms,
            bin_size_ms,
            self.observer.clone(),
        ));

        let mut routes = self.routes.write().unwrap();
        let key = EngineKey {
            channel: engine.channel().id,
            source: engine.source(),
        };
        routes
            .ordered
            .retain(|e| !(e.channel().id == key.channel && e.source() == key.source));
        routes.ordered.push(engine);
        routes.rebuild_indexes();
    }

    /// Tears down every engine keyed by a removed trigger source. Pending
    /// window deadlines for those engines are cancelled, so a countdown in
    /// flight can never reach a dropped engine.
    pub fn remove_source(&self, source: SourceId) {
        let mut routes = self.routes.write().unwrap();
        routes.ordered.retain(|e| e.source() != source);
        routes.rebuild_indexes();
        self.timer
            .lock()
            .unwrap()
            .cancel_where(|key| key.source == source);
    }

    /// Tears down every engine on a removed channel, cancelling pending
    /// deadlines as for `remove_source`.
    pub fn remove_channel(&self, channel: ChannelId) {
        let mut routes = self.routes.write().unwrap();
        routes.ordered.retain(|e| e.channel().id != channel);
        routes.rebuild_indexes();
        self.timer
            .lock()
            .unwrap()
            .cancel_where(|key| key.channel == channel);
    }

    // PRODUCER PATH ----------------------------------------------------------

    /// Forwards a spike to every engine subscribed to its channel.
    pub fn push_spike(&self, channel: ChannelId, sample_number: i64, unit_id: u32) {
        let routes = self.routes.read().unwrap();
        if let Some(engines) = routes.by_channel.get(&channel) {
            for engine in engines {
                engine.add_spike(sample_number, unit_id);
            }
        }
    }

    /// Forwards a trigger event to the engines keyed by its source whose
    /// channel lives on the same data stream. Engines that open a window
    /// get a close deadline scheduled at `now` plus the collection delay.
    pub fn push_event(&self, source: SourceId, stream: StreamId, sample_number: i64, now: Instant) {
        let opened: Vec<EngineKey> = {
            let routes = self.routes.read().unwrap();
            match routes.by_source.get(&source) {
                Some(engines) => engines
                    .iter()
                    .filter(|e| e.stream_id() == stream)
                    .filter(|e| e.add_event(sample_number))
                    .map(|e| EngineKey {
                        channel: e.channel().id,
                        source: e.source(),
                    })
                    .collect(),
                None => Vec::new(),
            }
        };

        if !opened.is_empty() {
            let deadline = now + self.window_close_delay;
            let mut timer = self.timer.lock().unwrap();
            for key in opened {
                timer.schedule(key, deadline);
            }
        }
    }

    // CONTROL PATH -----------------------------------------------------------

    /// Closes every window whose deadline has passed. Returns the number of
    /// windows closed. Engines evicted after their deadline was scheduled
    /// are skipped silently.
    pub fn process_window_timeouts(&self, now: Instant) -> usize {
        let expired = self.timer.lock().unwrap().poll_expired(now);

        let mut closed = 0;
        for key in expired {
            let engine = self.routes.read().unwrap().engines.get(&key).cloned();
            if let Some(engine) = engine {
                engine.close_window();
                closed += 1;
            }
        }
        closed
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.lock().unwrap().next_deadline()
    }

    /// Applies a new analysis window to every engine. Each engine recounts
    /// all of its retained spikes, so the engines are recounted in parallel.
    pub fn set_window_size_ms(&self, pre_ms: u32, post_ms: u32) {
        let engines = self.histograms();
        engines
            .par_iter()
            .for_each(|e| e.set_window_size_ms(pre_ms, post_ms));
    }

    pub fn set_bin_size_ms(&self, bin_size_ms: u32) {
        let engines = self.histograms();
        engines.par_iter().for_each(|e| e.set_bin_size_ms(bin_size_ms));
    }

    pub fn clear_all(&self) {
        let engines = self.histograms();
        engines.par_iter().for_each(|e| e.clear());
    }

    /// Propagates a unit's maximum to every histogram on a channel, keeping
    /// a common vertical scale across overlaid conditions.
    pub fn raise_unit_max_for_channel(&self, channel: ChannelId, unit_id: u32, max_count: u32) {
        let routes = self.routes.read().unwrap();
        if let Some(engines) = routes.by_channel.get(&channel) {
            for engine in engines {
                engine.raise_unit_max(unit_id, max_count);
            }
        }
    }

    /// Drops shared maxima on every engine (leaving overlay mode).
    pub fn rederive_running_max_all(&self) {
        for engine in self.histograms() {
            engine.rederive_running_max();
        }
    }

    pub fn histograms(&self) -> Vec<Arc<Histogram>> {
        self.routes.read().unwrap().ordered.clone()
    }

    pub fn get(&self, channel: ChannelId, source: SourceId) -> Option<Arc<Histogram>> {
        self.routes
            .read()
            .unwrap()
            .engines
            .get(&EngineKey { channel, source })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.read().unwrap().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::histogram::NullObserver;

    fn dispatch_with_pairs(pairs: &[(u32, u16, u32)]) -> PsthDispatch {
        // (channel id, stream id, source id) triples, all at 30 kHz.
        let dispatch = PsthDispatch::new(Arc::new(NullObserver));
        for &(channel, stream, source) in pairs {
            dispatch.add_histogram(
                ChannelInfo::new(channel, &format!("Electrode {}", channel + 1), stream, 30_000.0),
                SourceId(source),
                20,
                20,
                10,
            );
        }
        dispatch
    }

    fn close_all(dispatch: &PsthDispatch, now: Instant) -> usize {
        dispatch.process_window_timeouts(now + Duration::from_millis(WINDOW_CLOSE_DELAY_MS + 1))
    }

    #[test]
    fn spikes_reach_every_engine_on_the_channel() {
        let dispatch = dispatch_with_pairs(&[(0, 0, 0), (0, 0, 1), (1, 0, 0)]);
        let now = Instant::now();

        dispatch.push_event(SourceId(0), StreamId(0), 0, now);
        dispatch.push_event(SourceId(1), StreamId(0), 0, now);
        dispatch.push_spike(ChannelId(0), 150, 0);
        assert_eq!(close_all(&dispatch, now), 3);

        let a = dispatch.get(ChannelId(0), SourceId(0)).unwrap();
        let b = dispatch.get(ChannelId(0), SourceId(1)).unwrap();
        let c = dispatch.get(ChannelId(1), SourceId(0)).unwrap();

        assert_eq!(a.counts_for_unit(0).unwrap(), vec![0, 0, 1, 0]);
        assert_eq!(b.counts_for_unit(0).unwrap(), vec![0, 0, 1, 0]);
        assert_eq!(c.counts_for_unit(0).unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn events_are_gated_by_stream_id() {
        let dispatch = dispatch_with_pairs(&[(0, 0, 0), (1, 1, 0)]);
        let now = Instant::now();

        dispatch.push_event(SourceId(0), StreamId(1), 0, now);

        let same_stream = dispatch.get(ChannelId(1), SourceId(0)).unwrap();
        let other_stream = dispatch.get(ChannelId(0), SourceId(0)).unwrap();

        assert!(same_stream.is_window_open());
        assert!(!other_stream.is_window_open());
    }

    #[test]
    fn expired_windows_close_and_count_trials() {
        let dispatch = dispatch_with_pairs(&[(0, 0, 0)]);
        let now = Instant::now();

        dispatch.push_event(SourceId(0), StreamId(0), 0, now);

        // Not yet due.
        assert_eq!(dispatch.process_window_timeouts(now), 0);
        assert_eq!(close_all(&dispatch, now), 1);

        let engine = dispatch.get(ChannelId(0), SourceId(0)).unwrap();
        assert_eq!(engine.num_trials(), 1);
        assert!(dispatch.next_deadline().is_none());
    }

    #[test]
    fn removing_a_source_with_an_open_window_is_safe() {
        let dispatch = dispatch_with_pairs(&[(0, 0, 0), (0, 0, 1)]);
        let now = Instant::now();

        dispatch.push_event(SourceId(0), StreamId(0), 0, now);
        dispatch.push_event(SourceId(1), StreamId(0), 0, now);

        dispatch.remove_source(SourceId(0));
        assert_eq!(dispatch.len(), 1);

        // Only the surviving engine's deadline fires.
        assert_eq!(close_all(&dispatch, now), 1);
        let survivor = dispatch.get(ChannelId(0), SourceId(1)).unwrap();
        assert_eq!(survivor.num_trials(), 1);
    }

    #[test]
    fn prepare_to_update_drops_engines_and_deadlines() {
        let dispatch = dispatch_with_pairs(&[(0, 0, 0)]);
        let now = Instant::now();

        dispatch.push_event(SourceId(0), StreamId(0), 0, now);
        dispatch.prepare_to_update();

        assert!(dispatch.is_empty());
        assert!(dispatch.next_deadline().is_none());
        assert_eq!(close_all(&dispatch, now), 0);
    }

    #[test]
    fn settings_changes_apply_to_every_engine() {
        let dispatch = dispatch_with_pairs(&[(0, 0, 0), (1, 0, 0)]);

        dispatch.set_window_size_ms(10, 10);
        dispatch.set_bin_size_ms(5);

        for engine in dispatch.histograms() {
            assert_eq!(engine.bin_edges(), vec![-10.0, -5.0, 0.0, 5.0, 10.0]);
        }
    }

    #[test]
    fn unit_max_propagates_across_a_channel() {
        let dispatch = dispatch_with_pairs(&[(0, 0, 0), (0, 0, 1), (1, 0, 0)]);

        dispatch.raise_unit_max_for_channel(ChannelId(0), 0, 7);

        assert_eq!(
            dispatch
                .get(ChannelId(0), SourceId(0))
                .unwrap()
                .running_max(0),
            Some(7)
        );
        assert_eq!(
            dispatch
                .get(ChannelId(0), SourceId(1))
                .unwrap()
                .running_max(0),
            Some(7)
        );
        assert_eq!(
            dispatch
                .get(ChannelId(1), SourceId(0))
                .unwrap()
                .running_max(0),
            Some(0)
        );

        dispatch.rederive_running_max_all();
        assert_eq!(
            dispatch
                .get(ChannelId(0), SourceId(0))
                .unwrap()
                .running_max(0),
            Some(0)
        );
    }
}
