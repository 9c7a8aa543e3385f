use serde::Serialize;

/// Admission predicate: a new connection of either transport kind may be
/// created iff the three pools together sit strictly below the maximum.
pub fn admitted(streamable: usize, pending: usize, event_stream: usize, max: usize) -> bool {
    streamable + pending + event_stream < max
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub streamable_sessions: usize,
    pub pending_sessions: usize,
    pub event_stream_sessions: usize,
    pub max_sessions: usize,
    pub at_capacity: bool,
}

impl HealthSnapshot {
    pub fn new(streamable: usize, pending: usize, event_stream: usize, max: usize) -> Self {
        Self {
            streamable_sessions: streamable,
            pending_sessions: pending,
            event_stream_sessions: event_stream,
            max_sessions: max,
            at_capacity: !admitted(streamable, pending, event_stream, max),
        }
    }
}
