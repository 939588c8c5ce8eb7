//! JSON output formatting
//!
//! Serializes the final [`MasterReport`] with:
//! - Final status and diagnostics
//! - Cohort counters
//! - Elapsed time (microseconds plus a human-readable form)
//! - Finish timestamp (RFC 3339)
//! - One entry per tracked container

use crate::cohort::record::ContainerState;
use crate::cohort::{CohortSnapshot, FinalStatus};
use crate::master::MasterReport;
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::time::Duration;

/// Duration with both microseconds and human-readable format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonDuration {
    pub micros: u64,
    pub human: String,
}

impl JsonDuration {
    pub fn from_duration(d: Duration) -> Self {
        let micros = d.as_micros() as u64;
        let human = format_duration_human(d);
        Self { micros, human }
    }
}

/// One container as it stood at termination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonContainer {
    pub id: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<usize>,
    pub state: ContainerState,
    pub memory_mb: u64,
    pub vcores: u32,
}

/// Complete outcome report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonOutcomeReport {
    pub app_id: String,
    pub status: FinalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    pub counters: CohortSnapshot,
    pub elapsed: JsonDuration,
    pub finished_at: String,
    pub containers: Vec<JsonContainer>,
}

/// Build the JSON view of a report
pub fn build_report(report: &MasterReport) -> JsonOutcomeReport {
    let containers = report
        .containers
        .iter()
        .map(|record| JsonContainer {
            id: record.id().to_string(),
            host: record.host().to_string(),
            rank: record.rank,
            state: record.state,
            memory_mb: record.container.resource.memory_mb,
            vcores: record.container.resource.vcores,
        })
        .collect();

    JsonOutcomeReport {
        app_id: report.app_id.clone(),
        status: report.outcome.status,
        diagnostics: report.outcome.diagnostics.clone(),
        counters: report.counters,
        elapsed: JsonDuration::from_duration(report.elapsed),
        finished_at: chrono::Utc::now().to_rfc3339(),
        containers,
    }
}

/// Write JSON output to file
pub fn write_json_output(output_path: &Path, report: &JsonOutcomeReport, pretty: bool) -> Result<()> {
    let file = File::create(output_path)
        .with_context(|| format!("Failed to create JSON output: {}", output_path.display()))?;

    if pretty {
        serde_json::to_writer_pretty(file, report)?;
    } else {
        serde_json::to_writer(file, report)?;
    }

    Ok(())
}

/// Format duration in human-readable format
pub fn format_duration_human(d: Duration) -> String {
    let micros = d.as_micros() as u64;

    if micros == 0 {
        return "0µs".to_string();
    }

    if micros < 1000 {
        format!("{}µs", micros)
    } else if micros < 1_000_000 {
        format!("{:.3}ms", micros as f64 / 1000.0)
    } else if micros < 60_000_000 {
        format!("{:.3}s", micros as f64 / 1_000_000.0)
    } else if micros < 3_600_000_000 {
        format!("{:.2}m", micros as f64 / 60_000_000.0)
    } else {
        format!("{:.2}h", micros as f64 / 3_600_000_000.0)
    }
}
