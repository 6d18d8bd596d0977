//! Console tables.
//!
//! The only place latencies are converted to microseconds.

use crate::stats::{GlobalSummary, LocalSummary};

const WIDTH: usize = 25;
const MICROS: f64 = 1e6;

/// Header of the global summary table.
pub fn global_header() -> String {
    row(&[
        "Size (Bytes)",
        "Avg Latency (μs)",
        "Min Latency (μs)",
        "Max Latency (μs)",
        "Iterations",
        "Bandwidth (MB/s)",
    ])
}

/// One line of the global summary table for a run moving `bytes` per trial.
pub fn format_global(bytes: u64, summary: &GlobalSummary) -> String {
    row(&[
        &bytes.to_string(),
        &micros(summary.mean),
        &micros(summary.min),
        &micros(summary.max),
        &summary.trials.to_string(),
        &format!("{:.3}", bandwidth(bytes, summary.mean)),
    ])
}

/// Global summary table for a size sweep: one header, one line per size.
pub fn format_sweep<'a, I>(rows: I) -> String
where
    I: IntoIterator<Item = (u64, &'a GlobalSummary)>,
{
    let mut out = global_header();
    for (bytes, summary) in rows {
        out.push('\n');
        out.push_str(&format_global(bytes, summary));
    }
    out
}

/// Per-rank table, one line per rank in rank order.
pub fn format_rank_table(summaries: &[LocalSummary]) -> String {
    let mut out = row(&[
        "Rank",
        "Avg Latency (μs)",
        "Min Latency (μs)",
        "Max Latency (μs)",
        "Stddev (μs)",
    ]);
    for (rank, s) in summaries.iter().enumerate() {
        out.push('\n');
        out.push_str(&row(&[
            &rank.to_string(),
            &micros(s.mean),
            &micros(s.min),
            &micros(s.max),
            &micros(s.stddev),
        ]));
    }
    out
}

/// Throughput in MB/s (2^20 bytes) for `bytes` moved in `seconds`.
///
/// Zero when the latency is not positive.
pub fn bandwidth(bytes: u64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        (bytes as f64 / 1024.0 / 1024.0) / seconds
    } else {
        0.0
    }
}

fn micros(seconds: f64) -> String {
    format!("{:.3}", seconds * MICROS)
}

fn row(cells: &[&str]) -> String {
    let line: String = cells.iter().map(|cell| format!("{cell:<WIDTH$}")).collect();
    line.trim_end().to_string()
}
