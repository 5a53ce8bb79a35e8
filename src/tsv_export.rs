//! TSV export for machine-readable replay results

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::metrics::{KindHists, BUCKET_LABELS};
use crate::scheduler::RunSummary;

const HEADER: &str = "operation\tsize_bucket\tbucket_idx\tmean_us\tp50_us\tp90_us\tp95_us\tp99_us\tmax_us\tops_per_sec\tcount";

/// TSV exporter for replay results
pub struct TsvExporter {
    basename: String,
}

impl TsvExporter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            basename: path.as_ref().to_string_lossy().to_string(),
        }
    }

    pub fn results_path(&self) -> PathBuf {
        PathBuf::from(format!("{}-results.tsv", self.basename))
    }

    /// Export per-kind, per-size-bucket latency rows plus one ALL row.
    /// Returns the path written.
    pub fn export_results(&self, summary: &RunSummary) -> Result<PathBuf> {
        let path = self.results_path();
        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut f = BufWriter::new(file);

        writeln!(f, "{}", HEADER)?;
        let wall_seconds = summary.wall_time.as_secs_f64().max(f64::EPSILON);
        for row in collect_rows(&summary.hists, wall_seconds) {
            writeln!(f, "{}", row)?;
        }
        f.flush()
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

fn collect_rows(hists: &KindHists, wall_seconds: f64) -> Vec<String> {
    // Sorted by bucket, then kind
    let mut rows = Vec::new();
    for (kind, op_hists) in hists.active() {
        for (i, s) in op_hists.bucket_summaries() {
            rows.push((i, format_row(kind.as_str(), BUCKET_LABELS[i], i, &s, wall_seconds)));
        }
    }
    rows.sort_by_key(|(bucket_idx, _)| *bucket_idx);

    let mut out: Vec<String> = rows.into_iter().map(|(_, row)| row).collect();
    let combined = hists.combined_histogram();
    if let Some(s) = crate::metrics::LatencySummary::from_histogram(&combined) {
        out.push(format_row("ALL", "all", BUCKET_LABELS.len(), &s, wall_seconds));
    }
    out
}

fn format_row(
    op: &str,
    bucket_label: &str,
    bucket_idx: usize,
    s: &crate::metrics::LatencySummary,
    wall_seconds: f64,
) -> String {
    format!(
        "{}\t{}\t{}\t{:.2}\t{:.2}\t{:.2}\t{:.2}\t{:.2}\t{:.2}\t{:.2}\t{}",
        op,
        bucket_label,
        bucket_idx,
        s.mean,
        s.p50 as f64,
        s.p90 as f64,
        s.p95 as f64,
        s.p99 as f64,
        s.max as f64,
        s.count as f64 / wall_seconds,
        s.count
    )
}
