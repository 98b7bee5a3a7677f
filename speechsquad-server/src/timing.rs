//! Latency ledger assembled from downstream call metadata.
//!
//! Downstream services report per-component latencies as metadata entries
//! whose key starts with `tracing.`, each value float milliseconds. The
//! ledger keeps every entry in arrival order (duplicate keys allowed) and
//! flattens into the wire map at the end of the stream, last entry winning.

use std::collections::HashMap;
use std::time::Instant;

use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tracing::trace;

use speechsquad_proto::TRACING_PREFIX;

#[derive(Debug, Default)]
pub struct TimingLedger {
    entries: Vec<(String, f32)>,
}

impl TimingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Harvest every `tracing.*` entry from a metadata map. Values that do
    /// not parse as floats are dropped.
    pub fn absorb(&mut self, metadata: &MetadataMap) {
        for entry in metadata.iter() {
            if let KeyAndValueRef::Ascii(key, value) = entry {
                let key = key.as_str();
                if !key.starts_with(TRACING_PREFIX) {
                    continue;
                }
                let Ok(text) = value.to_str() else { continue };
                let Ok(ms) = text.trim().parse::<f32>() else { continue };
                trace!("timing metadata {key} = {ms}ms");
                self.entries.push((key.to_string(), ms));
            }
        }
    }

    /// Record a latency the orchestrator measured itself.
    pub fn record(&mut self, label: &str, ms: f32) {
        self.entries.push((label.to_string(), ms));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flatten into the response map; for duplicate labels the most recent
    /// entry wins.
    pub fn to_component_timing(&self) -> HashMap<String, f32> {
        let mut map = HashMap::with_capacity(self.entries.len());
        for (key, ms) in &self.entries {
            map.insert(key.clone(), *ms);
        }
        map
    }
}

/// Interval between two timepoints in float milliseconds, zero when either
/// end is missing (a leg that never ran contributes no latency).
pub fn span_ms(start: Option<Instant>, end: Option<Instant>) -> f32 {
    match (start, end) {
        (Some(start), Some(end)) => end.saturating_duration_since(start).as_secs_f32() * 1000.0,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_absorb_filters_on_prefix() {
        let mut metadata = MetadataMap::new();
        metadata.insert("tracing.server_latency.natural_query", "12.5".parse().unwrap());
        metadata.insert("content-type", "application/grpc".parse().unwrap());
        metadata.insert("tracing.bogus", "not-a-number".parse().unwrap());

        let mut ledger = TimingLedger::new();
        ledger.absorb(&metadata);

        let map = ledger.to_component_timing();
        assert_eq!(map.len(), 1);
        assert_eq!(map["tracing.server_latency.natural_query"], 12.5);
    }

    #[test]
    fn test_duplicate_labels_keep_last() {
        let mut ledger = TimingLedger::new();
        ledger.record("tracing.speech_squad.asr_latency", 10.0);
        ledger.record("tracing.speech_squad.asr_latency", 20.0);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.to_component_timing()["tracing.speech_squad.asr_latency"], 20.0);
    }

    #[test]
    fn test_span_ms() {
        let start = Instant::now();
        let end = start + Duration::from_millis(250);
        let ms = span_ms(Some(start), Some(end));
        assert!((ms - 250.0).abs() < 1.0, "got {ms}");
        assert_eq!(span_ms(None, Some(end)), 0.0);
        // a reversed interval saturates to zero rather than going negative
        assert_eq!(span_ms(Some(end), Some(start)), 0.0);
    }
}
