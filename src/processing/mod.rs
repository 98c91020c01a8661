pub mod binning;
pub mod dispatch;
pub mod histogram;
pub mod messages;
pub mod psth_processor;
pub mod snapshot;
pub mod triggers;

// SHARED IDENTIFIERS ----------------------------------------------------------

/// Identifies one spike channel (electrode) in the signal chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

/// Identifies the data stream (clock domain) a channel or event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u16);

/// Static description of a spike channel, supplied by the acquisition layer.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
    pub stream_id: StreamId,
    pub sample_rate: f64,
}

impl ChannelInfo {
    pub fn new(id: u32, name: &str, stream_id: u16, sample_rate: f64) -> Self {
        Self {
            id: ChannelId(id),
            name: name.to_string(),
            stream_id: StreamId(stream_id),
            sample_rate,
        }
    }
}
