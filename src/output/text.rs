//! Human-readable text output

use super::json::format_duration_human;
use crate::master::MasterReport;

/// Print the job outcome to the console
///
/// Shows the final status, the cohort counters and one line per container.
pub fn print_summary(report: &MasterReport) {
    println!("═══════════════════════════════════════════════════════════");
    println!("                    JOB OUTCOME");
    println!("═══════════════════════════════════════════════════════════");
    println!();
    print!("{}", render_summary(report));
}

/// Summary body, without the banner
pub fn render_summary(report: &MasterReport) -> String {
    let mut out = String::new();
    let c = &report.counters;

    out.push_str(&format!("Application:  {}\n", report.app_id));
    out.push_str(&format!("Status:       {}\n", report.outcome.status));
    if let Some(ref diagnostics) = report.outcome.diagnostics {
        out.push_str(&format!("Diagnostics:  {}\n", diagnostics));
    }
    out.push_str(&format!("Elapsed:      {}\n", format_duration_human(report.elapsed)));
    out.push('\n');

    out.push_str("Containers:\n");
    out.push_str(&format!(
        "  Total: {}  Requested: {}  Allocated: {}  Completed: {}  Failed: {}\n",
        c.total, c.requested, c.allocated, c.completed, c.failed
    ));

    if !report.containers.is_empty() {
        out.push('\n');
        for record in &report.containers {
            let rank = record
                .rank
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "  [{:>3}] {:<40} {:<20} {}\n",
                rank,
                record.id().as_str(),
                record.host(),
                record.state
            ));
        }
    }
    out
}
