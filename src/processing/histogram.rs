use super::binning::{BinEdges, CountMatrix, RelativeSpike};
use super::snapshot::HistogramSnapshot;
use super::triggers::{Colour, SourceId};
use super::{ChannelId, ChannelInfo, StreamId};
use std::sync::{Arc, Mutex};

/// One-shot collection window, slightly longer than the analysis range so
/// that spikes delivered late by the acquisition pipeline are still seen
/// before the trial is finalised.
pub const WINDOW_CLOSE_DELAY_MS: u64 = 1010;

/// Offsets at or beyond this magnitude are discarded (strict comparison).
pub const OFFSET_LIMIT_MS: f64 = 1000.0;

// OBSERVER --------------------------------------------------------------------

/// Notifications emitted by a histogram towards a display adapter.
///
/// The default implementation of all methods is a no-op; implementors
/// override what they need.
#[allow(unused_variables)]
pub trait PsthObserver: Send + Sync {
    /// A trial window closed and the counts were updated.
    fn on_trial_complete(&self, channel: ChannelId, source: SourceId, trial_count: u32) {}

    /// A unit's running maximum increased. In overlay mode the adapter is
    /// expected to propagate the new maximum to sibling histograms on the
    /// same channel so they share a vertical scale.
    fn on_max_count(&self, channel: ChannelId, source: SourceId, unit_id: u32, max_count: u32) {}

    /// Counts changed outside of a trial close (re-bin, clear).
    fn on_counts_updated(&self, channel: ChannelId, source: SourceId) {}
}

/// Observer that discards every notification.
pub struct NullObserver;

impl PsthObserver for NullObserver {}

// ALIGNMENT ENGINE ------------------------------------------------------------

// Spikes and the open-window flag arrive from the real-time producer
// context; everything else runs on the timer/control context. The producer
// only ever takes the `pending` lock, and only for the duration of a push.
struct PendingWindow {
    new_spikes: Vec<(i64, u32)>,
    waiting_for_window_to_close: bool,
    latest_event_sample_number: i64,
}

struct HistogramData {
    pre_ms: u32,
    post_ms: u32,
    bin_size_ms: u32,
    bin_edges: BinEdges,
    relative_spikes: Vec<RelativeSpike>,
    counts: CountMatrix,
    num_trials: u32,
}

/// Aligns spikes from one channel against one trigger condition and keeps
/// the per-trial bin counts.
pub struct Histogram {
    channel: ChannelInfo,
    source: SourceId,
    pending: Mutex<PendingWindow>,
    data: Mutex<HistogramData>,
    observer: Arc<dyn PsthObserver>,
}

impl Histogram {
    pub fn new(
        channel: ChannelInfo,
        source: SourceId,
        pre_ms: u32,
        post_ms: u32,
        bin_size_ms: u32,
        observer: Arc<dyn PsthObserver>,
    ) -> Self {
        Self {
            channel,
            source,
            pending: Mutex::new(PendingWindow {
                new_spikes: Vec::new(),
                waiting_for_window_to_close: false,
                latest_event_sample_number: 0,
            }),
            data: Mutex::new(HistogramData {
                pre_ms,
                post_ms,
                bin_size_ms,
                bin_edges: BinEdges::generate(pre_ms, post_ms, bin_size_ms),
                relative_spikes: Vec::new(),
                counts: CountMatrix::new(),
                num_trials: 0,
            }),
            observer,
        }
    }

    pub fn channel(&self) -> &ChannelInfo {
        &self.channel
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn stream_id(&self) -> StreamId {
        self.channel.stream_id
    }

    // INGESTION (producer context) -------------------------------------------

    /// Buffers a spike time. Safe to call from the acquisition thread; the
    /// critical section covers only the buffer append.
    pub fn add_spike(&self, sample_number: i64, unit_id: u32) {
        let mut pending = self.pending.lock().unwrap();
        pending.new_spikes.push((sample_number, unit_id));
    }

    /// Registers a trigger event. Returns true if a collection window was
    /// opened; the caller is then responsible for scheduling the one-shot
    /// close countdown. Events arriving while a window is already open are
    /// ignored, so at most one trigger is processed per window.
    pub fn add_event(&self, sample_number: i64) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if pending.waiting_for_window_to_close {
            return false;
        }
        pending.latest_event_sample_number = sample_number;
        pending.waiting_for_window_to_close = true;
        true
    }

    // WINDOW CLOSE (timer context) -------------------------------------------

    /// Folds the buffered spikes into the trial series and recounts. Called
    /// when the collection countdown expires; a no-op if no window is open,
    /// so a stale timer after a teardown or clear cannot do damage.
    pub fn close_window(&self) {
        let (new_spikes, event_sample) = {
            let mut pending = self.pending.lock().unwrap();
            if !pending.waiting_for_window_to_close {
                return;
            }
            pending.waiting_for_window_to_close = false;
            (
                std::mem::take(&mut pending.new_spikes),
                pending.latest_event_sample_number,
            )
        };

        let mut guard = self.data.lock().unwrap();
        let data = &mut *guard;

        let trial_index = data.num_trials;
        let num_bins = data.bin_edges.num_bins();

        for (sample_number, unit_id) in new_spikes {
            let offset_ms =
                (sample_number - event_sample) as f64 / self.channel.sample_rate * 1000.0;

            if offset_ms > -OFFSET_LIMIT_MS && offset_ms < OFFSET_LIMIT_MS {
                data.counts.register_unit(unit_id, num_bins);
                data.relative_spikes.push(RelativeSpike {
                    offset_ms,
                    unit_id,
                    trial_index,
                });
            }
        }

        data.num_trials += 1;

        // The first trial initialises the rows; afterwards only the newest
        // trial's spikes are added on top.
        let full = data.num_trials == 1;
        let changes = data.counts.recount(
            &data.bin_edges,
            &data.relative_spikes,
            data.num_trials - 1,
            full,
        );
        let trial_count = data.num_trials;
        drop(guard);

        for change in changes {
            self.observer
                .on_max_count(self.channel.id, self.source, change.unit_id, change.max_count);
        }
        self.observer
            .on_trial_complete(self.channel.id, self.source, trial_count);
    }

    // CONFIGURATION (control context) ----------------------------------------

    /// Resets the trial counter and discards every retained spike.
    /// Registered unit ids survive a clear; their rows are zeroed.
    pub fn clear(&self) {
        {
            let mut guard = self.data.lock().unwrap();
            let data = &mut *guard;
            data.relative_spikes.clear();
            data.num_trials = 0;
            let num_bins = data.bin_edges.num_bins();
            data.counts.reset(num_bins);
        }
        self.observer.on_counts_updated(self.channel.id, self.source);
    }

    pub fn set_window_size_ms(&self, pre_ms: u32, post_ms: u32) {
        {
            let mut guard = self.data.lock().unwrap();
            let data = &mut *guard;
            data.pre_ms = pre_ms;
            data.post_ms = post_ms;
            Self::rebin(data);
        }
        self.observer.on_counts_updated(self.channel.id, self.source);
    }

    pub fn set_bin_size_ms(&self, bin_size_ms: u32) {
        {
            let mut guard = self.data.lock().unwrap();
            let data = &mut *guard;
            data.bin_size_ms = bin_size_ms;
            Self::rebin(data);
        }
        self.observer.on_counts_updated(self.channel.id, self.source);
    }

    // Regenerates the edges and recounts every retained spike, not just the
    // latest trial.
    fn rebin(data: &mut HistogramData) {
        data.bin_edges = BinEdges::generate(data.pre_ms, data.post_ms, data.bin_size_ms);
        let latest_trial = data.num_trials.saturating_sub(1);
        data.counts
            .recount(&data.bin_edges, &data.relative_spikes, latest_trial, true);
    }

    /// Merges a maximum propagated from a sibling histogram (overlay mode).
    pub fn raise_unit_max(&self, unit_id: u32, max_count: u32) -> bool {
        let mut data = self.data.lock().unwrap();
        data.counts.raise_unit_max(unit_id, max_count)
    }

    /// Re-derives each unit's maximum from its own counts, dropping any
    /// shared scale (leaving overlay mode).
    pub fn rederive_running_max(&self) {
        let mut data = self.data.lock().unwrap();
        data.counts.rederive_running_max();
    }

    // QUERY (control context) ------------------------------------------------

    pub fn num_trials(&self) -> u32 {
        self.data.lock().unwrap().num_trials
    }

    pub fn is_window_open(&self) -> bool {
        self.pending.lock().unwrap().waiting_for_window_to_close
    }

    pub fn bin_edges(&self) -> Vec<f64> {
        self.data.lock().unwrap().bin_edges.values().to_vec()
    }

    pub fn unit_ids(&self) -> Vec<u32> {
        self.data.lock().unwrap().counts.unit_ids().to_vec()
    }

    pub fn counts_for_unit(&self, unit_id: u32) -> Option<Vec<u32>> {
        self.data
            .lock()
            .unwrap()
            .counts
            .counts_for_unit(unit_id)
            .map(|row| row.to_vec())
    }

    pub fn running_max(&self, unit_id: u32) -> Option<u32> {
        self.data.lock().unwrap().counts.running_max(unit_id)
    }

    /// Builds a serialisable snapshot for one unit. The condition name and
    /// colour are supplied by the registry owner.
    pub fn snapshot(
        &self,
        condition_name: &str,
        condition_colour: Colour,
        unit_id: u32,
    ) -> HistogramSnapshot {
        let data = self.data.lock().unwrap();
        let num_bins = data.bin_edges.num_bins();

        let spike_counts = data
            .counts
            .counts_for_unit(unit_id)
            .map(|row| row.to_vec())
            .unwrap_or_else(|| vec![0; num_bins]);

        HistogramSnapshot {
            channel: self.channel.name.clone(),
            condition: condition_name.to_string(),
            colour: condition_colour.hex_string(),
            trial_count: data.num_trials,
            bin_edges: data.bin_edges.values()[..num_bins].to_vec(),
            spike_counts,
        }
    }
}
