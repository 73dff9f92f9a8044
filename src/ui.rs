//! Terminal output: colored outcomes, the audit trail and a progress bar for
//! the merge storm.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use turnstile::demo::{MergeReport, RaceReport, TicketState};
use turnstile::{AuditOutcome, AuditRecord, TransitionTable, WorkflowState};

pub struct Output {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Output {
    pub fn new() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    pub fn race(&self, report: &RaceReport) {
        println!("{}", self.dim.apply_to("─── Workers ───"));
        for outcome in &report.outcomes {
            match &outcome.result {
                Ok(result) if result.applied => println!(
                    "  {} {:<10} -> {:<11} applied (v{})",
                    self.green.apply_to("✓"),
                    outcome.actor,
                    outcome.target.to_string(),
                    result.version
                ),
                Ok(result) => println!(
                    "  {} {:<10} -> {:<11} already there (v{})",
                    self.yellow.apply_to("="),
                    outcome.actor,
                    outcome.target.to_string(),
                    result.version
                ),
                Err(err) => println!(
                    "  {} {:<10} -> {:<11} {err}",
                    self.red.apply_to("✗"),
                    outcome.actor,
                    outcome.target.to_string()
                ),
            }
        }
        println!();
        println!(
            "  final state {} at version {} ({} of {} workers changed it)",
            self.green.apply_to(report.final_state.state),
            report.final_state.version,
            report.applied(),
            report.outcomes.len()
        );
    }

    pub fn audit_trail(&self, records: &[AuditRecord]) {
        println!();
        println!("{}", self.dim.apply_to("─── Audit Trail ───"));
        for record in records {
            let style = match record.outcome {
                AuditOutcome::Applied => &self.green,
                AuditOutcome::NoOp => &self.yellow,
                AuditOutcome::Rejected { .. } => &self.red,
            };
            println!(
                "{}",
                style.apply_to(serde_json::to_string(record).unwrap_or_default())
            );
        }
    }

    pub fn merge_progress(&self, workers: u64) -> ProgressBar {
        let pb = ProgressBar::new(workers);
        if let Ok(style) = ProgressStyle::default_bar().template("{bar:40.cyan/blue} {pos}/{len} merges {msg}") {
            pb.set_style(style);
        }
        pb
    }

    pub fn merge(&self, report: &MergeReport) {
        let style = if report.final_len == report.workers {
            &self.green
        } else {
            &self.red
        };
        println!(
            "  {} history holds {} of {} entries at version {}",
            style.apply_to("●"),
            report.final_len,
            report.workers,
            report.version
        );
        println!(
            "  {} attempts in total, {} conflicts retried, worst worker needed {}",
            report.total_attempts,
            report.conflicts(),
            report.max_attempts
        );
    }

    pub fn table(&self, table: &TransitionTable<TicketState>) {
        println!("{}", self.dim.apply_to(format!("─── {} ───", table.entity_type())));
        for state in TicketState::all() {
            let mut tags = Vec::new();
            if table.is_initial(*state) {
                tags.push("initial".to_string());
            }
            if table.is_terminal(*state) {
                tags.push("terminal".to_string());
            }
            if let Some(permission) = table.required_permission(*state) {
                tags.push(format!("needs {permission}"));
            }
            for guard in table.guard_names(*state) {
                tags.push(format!("guard {guard}"));
            }

            let targets: Vec<String> = table.allowed(*state).iter().map(ToString::to_string).collect();
            let targets = if targets.is_empty() {
                self.dim.apply_to("-".to_string())
            } else {
                self.green.apply_to(targets.join(", "))
            };
            println!(
                "  {:<12} -> {targets} {}",
                state.to_string(),
                self.yellow.apply_to(tags.join(", "))
            );
        }
    }
}
