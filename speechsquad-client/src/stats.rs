//! Latency statistics and the run report.

use std::collections::HashMap;

use crate::scheduler::LoadStats;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub median: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub avg: f64,
}

/// Percentiles over a sorted copy, floor indices; `None` for an empty set.
pub fn summarize(raw: &[f64]) -> Option<LatencySummary> {
    if raw.is_empty() {
        return None;
    }
    let mut latencies = raw.to_vec();
    latencies.sort_by(f64::total_cmp);
    let n = latencies.len() as f64;
    let at = |percent: f64| latencies[(percent * n / 100.0).floor() as usize];
    Some(LatencySummary {
        median: at(50.0),
        p90: at(90.0),
        p95: at(95.0),
        p99: at(99.0),
        avg: latencies.iter().sum::<f64>() / n,
    })
}

fn print_latency_block(name: &str, values: &[f64]) -> Option<f64> {
    println!("-----------------------------------------------------------");
    let summary = summarize(values)?;
    println!(" {name} (ms):");
    println!("\t\tMedian\t\t90th\t\t95th\t\t99th\t\tAvg");
    println!(
        "\t\t{:.3}\t\t{:.3}\t\t{:.3}\t\t{:.3}\t\t{:.3}",
        summary.median, summary.p90, summary.p95, summary.p99, summary.avg
    );
    Some(summary.avg)
}

/// Per-process statistics block; returns the average per label for the
/// cross-process reduce.
pub fn print_process_stats(stats: &LoadStats) -> HashMap<String, f64> {
    let mut averages = HashMap::new();
    let mut labels: Vec<&String> = stats.component_timings_ms.keys().collect();
    labels.sort();
    for label in labels {
        if let Some(avg) = print_latency_block(label, &stats.component_timings_ms[label]) {
            averages.insert(label.clone(), avg);
        }
    }
    if let Some(avg) = print_latency_block("Client Latency", &stats.response_latencies_ms) {
        averages.insert("Client Latency".to_string(), avg);
    }
    averages
}

/// Aggregated final report, printed by peer 0 only. Summed averages are
/// divided by the number of peers that actually measured latencies.
pub fn print_final_report(
    wall_ms: f64,
    total_audio_secs: f64,
    failed: u64,
    averages: &HashMap<String, f64>,
    success_proc_count: u64,
) {
    println!("\t\t================ Final Report ================");
    println!("Run time: {} sec.", wall_ms / 1000.0);
    println!("Total audio processed: {total_audio_secs} sec.");
    println!("Throughput: {} RTFX", total_audio_secs * 1000.0 / wall_ms);
    println!("Number of failed audio clips: {failed}");
    println!("Average Latencies ====> ");
    let mut labels: Vec<&String> = averages.keys().collect();
    labels.sort();
    for label in labels {
        println!(
            "\t{label}:{} ms",
            averages[label] / success_proc_count.max(1) as f64
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_empty_is_none() {
        assert!(summarize(&[]).is_none());
    }

    #[test]
    fn test_summarize_single_value() {
        let s = summarize(&[42.0]).unwrap();
        assert_eq!(s.median, 42.0);
        assert_eq!(s.p99, 42.0);
        assert_eq!(s.avg, 42.0);
    }

    #[test]
    fn test_summarize_percentiles_use_floor_indices() {
        // 0..100 sorted; floor(p * 100 / 100) indexes directly.
        let values: Vec<f64> = (0..100).map(f64::from).collect();
        let s = summarize(&values).unwrap();
        assert_eq!(s.median, 50.0);
        assert_eq!(s.p90, 90.0);
        assert_eq!(s.p95, 95.0);
        assert_eq!(s.p99, 99.0);
        assert!((s.avg - 49.5).abs() < 1e-9);
    }

    #[test]
    fn test_summarize_is_order_independent() {
        let sorted = summarize(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let shuffled = summarize(&[3.0, 1.0, 4.0, 2.0]).unwrap();
        assert_eq!(sorted, shuffled);
    }
}
