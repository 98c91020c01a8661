use serde::Serialize;
use std::io::Write;

/// Serialisable view of one histogram for the display and reporting layers.
///
/// `bin_edges` holds the left edge of each bin, parallel to `spike_counts`.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub channel: String,
    pub condition: String,
    /// Condition colour as an RGB hex string.
    pub colour: String,
    pub trial_count: u32,
    pub bin_edges: Vec<f64>,
    pub spike_counts: Vec<u32>,
}

impl HistogramSnapshot {
    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|e| format!("Failed to serialize snapshot: {}", e))
    }
}

pub fn snapshots_to_json(snapshots: &[HistogramSnapshot]) -> Result<String, String> {
    serde_json::to_string(snapshots)
        .map_err(|e| format!("Failed to serialize snapshots: {}", e))
}

/// Writes one row per bin with the channel and condition repeated, so the
/// output loads directly into spreadsheet or dataframe tooling.
pub fn write_counts_csv<W: Write>(
    writer: W,
    snapshots: &[HistogramSnapshot],
) -> Result<(), String> {
    let mut csv_writer = csv::Writer::from_writer(writer);

    csv_writer
        .write_record(["channel", "condition", "trial_count", "bin_start_ms", "count"])
        .map_err(|e| format!("Failed to write CSV header: {}", e))?;

    for snapshot in snapshots {
        for (edge, count) in snapshot.bin_edges.iter().zip(&snapshot.spike_counts) {
            csv_writer
                .write_record([
                    snapshot.channel.as_str(),
                    snapshot.condition.as_str(),
                    &snapshot.trial_count.to_string(),
                    &edge.to_string(),
                    &count.to_string(),
                ])
                .map_err(|e| format!("Failed to write CSV row: {}", e))?;
        }
    }

    csv_writer
        .flush()
        .map_err(|e| format!("Failed to flush CSV output: {}", e))
}
