//! Run artifacts: annotation JSONL, summary JSON and a Markdown summary.

use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use evalmatrix_state::{ResultSet, RunId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::aggregator::{model_summaries, AnnotationRecord, FailureKind, ModelSummary};

pub const SUMMARY_SCHEMA_VERSION: &str = "1";

/// Canonical summary artifact written at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryReport {
    pub schema_version: String,
    pub run_id: RunId,
    pub generated_at: DateTime<Utc>,
    /// Hex SHA-256 of the set's timestamp-free content.
    pub content_digest: String,
    pub cells: usize,
    pub terminal: usize,
    pub models: Vec<ModelSummary>,
}

impl SummaryReport {
    pub fn from_result_set(set: &ResultSet) -> Result<Self> {
        Ok(Self {
            schema_version: SUMMARY_SCHEMA_VERSION.to_string(),
            run_id: set.run_id().clone(),
            generated_at: Utc::now(),
            content_digest: content_digest(set)?,
            cells: set.len(),
            terminal: set.terminal_count(),
            models: model_summaries(set),
        })
    }
}

/// Digest of (cell, status, output, attempts) for every outcome.
///
/// Equal for two runs that produced the same content at different times.
pub fn content_digest(set: &ResultSet) -> Result<String> {
    let bytes = serde_json::to_vec(&set.fingerprint()).context("serialize fingerprint")?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Write records as JSON Lines, one record per line.
pub fn write_annotation_jsonl(path: &Path, records: &[AnnotationRecord]) -> Result<()> {
    let file = std::fs::File::create(path).with_context(|| format!("create {:?}", path))?;
    let mut out = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut out, record).context("serialize annotation record")?;
        out.write_all(b"\n").with_context(|| format!("write {:?}", path))?;
    }
    out.flush().with_context(|| format!("flush {:?}", path))?;
    Ok(())
}

/// Read a JSON Lines annotation file back.
pub fn read_annotation_jsonl(path: &Path) -> Result<Vec<AnnotationRecord>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("{:?} line {}", path, n + 1))
        })
        .collect()
}

/// Write summary.json in pretty JSON format.
pub fn write_summary_json(path: &Path, report: &SummaryReport) -> Result<()> {
    let content = serde_json::to_string_pretty(report).context("serialize summary")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Render the per-model table for terminals and PR comments.
pub fn render_summary_md(report: &SummaryReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Run `{}`\n\n", report.run_id));
    out.push_str(&format!(
        "- cells: {}\n- terminal: {}\n- digest: `{}`\n\n",
        report.cells,
        report.terminal,
        short_digest(&report.content_digest)
    ));

    out.push_str(
        "| model | cells | success | rate | invalid_input | exhausted_retries | auth | pending | mean latency (ms) |\n",
    );
    out.push_str("|---|---:|---:|---:|---:|---:|---:|---:|---:|\n");
    for m in &report.models {
        let kind = |k: FailureKind| m.failure_kinds.get(&k).copied().unwrap_or(0);
        let latency = m
            .mean_latency_ms
            .map(|l| format!("{l:.1}"))
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "| `{}` | {} | {} | {:.1}% | {} | {} | {} | {} | {} |\n",
            m.model_id,
            m.total,
            m.successes,
            m.success_rate * 100.0,
            kind(FailureKind::InvalidInput),
            kind(FailureKind::ExhaustedRetries),
            kind(FailureKind::Auth),
            m.pending,
            latency
        ));
    }
    out
}

/// Write summary.md.
pub fn write_summary_md(path: &Path, report: &SummaryReport) -> Result<()> {
    std::fs::write(path, render_summary_md(report)).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}
