use std::fmt;
use std::time::SystemTime;

/// Terminal state of one alignment run. All five are terminal; `Cancelled`
/// is only ever produced by the cooperative cancel flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Converged,
    Plateaued,
    MaxIterations,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Converged => "converged",
            RunStatus::Plateaued => "plateaued",
            RunStatus::MaxIterations => "max iterations",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Append-only audit entry for one iteration. Never mutated after being
/// pushed onto the run history.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub iteration: u32,
    pub strategy_name: &'static str,
    pub capture_summary: String,
    pub raw_response_excerpt: String,
    pub applied: usize,
    pub rejected_refs: Vec<String>,
    pub similarity: Option<f64>,
    pub timestamp: SystemTime,
    pub notes: Vec<String>,
}

/// The only externally consumed output of a run: the full iteration history
/// plus the terminal status and final similarity.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub final_similarity: Option<f64>,
    pub history: Vec<IterationRecord>,
}

impl RunReport {
    pub fn rejected_ref_count(&self) -> usize {
        self.history
            .iter()
            .map(|record| record.rejected_refs.len())
            .sum()
    }

    /// Plain-text table of the run, one row per iteration. Debug aid; display
    /// proper is the caller's concern.
    pub fn render_table(&self) -> String {
        let mut lines = Vec::with_capacity(self.history.len() + 2);
        lines.push(format!(
            "{:>4}  {:<13} {:>10}  {:>7}  {:>8}  notes",
            "iter", "strategy", "similarity", "applied", "rejected"
        ));
        for record in &self.history {
            let similarity = match record.similarity {
                Some(score) => format!("{score:.1}"),
                None => "-".to_string(),
            };
            let mut remarks = record.notes.clone();
            if !record.rejected_refs.is_empty() {
                remarks.push(format!("rejected: {}", record.rejected_refs.join(", ")));
            }
            lines.push(format!(
                "{:>4}  {:<13} {:>10}  {:>7}  {:>8}  {}",
                record.iteration,
                record.strategy_name,
                similarity,
                record.applied,
                record.rejected_refs.len(),
                remarks.join("; ")
            ));
        }
        let final_similarity = match self.final_similarity {
            Some(score) => format!("{score:.1}"),
            None => "unknown".to_string(),
        };
        lines.push(format!(
            "status: {}, final similarity {final_similarity} after {} iteration(s)",
            self.status,
            self.history.len()
        ));
        lines.join("\n")
    }
}

/// Aggregate over a batch of alignment runs, for pipeline regression checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuiteSummary {
    pub total: usize,
    pub converged: usize,
    pub plateaued: usize,
    pub max_iterations: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub mean_final_similarity: f64,
    pub mean_iterations: f64,
}

impl SuiteSummary {
    pub fn convergence_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.converged as f64 / self.total as f64
    }
}

pub fn summarize_runs(reports: &[RunReport]) -> SuiteSummary {
    let mut summary = SuiteSummary {
        total: reports.len(),
        ..SuiteSummary::default()
    };

    let mut similarity_sum = 0.0;
    let mut similarity_count = 0usize;
    let mut iteration_sum = 0usize;
    for report in reports {
        match report.status {
            RunStatus::Converged => summary.converged += 1,
            RunStatus::Plateaued => summary.plateaued += 1,
            RunStatus::MaxIterations => summary.max_iterations += 1,
            RunStatus::Failed => summary.failed += 1,
            RunStatus::Cancelled => summary.cancelled += 1,
        }
        if let Some(score) = report.final_similarity {
            similarity_sum += score;
            similarity_count += 1;
        }
        iteration_sum += report.history.len();
    }

    if similarity_count > 0 {
        summary.mean_final_similarity = similarity_sum / similarity_count as f64;
    }
    if !reports.is_empty() {
        summary.mean_iterations = iteration_sum as f64 / reports.len() as f64;
    }
    summary
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::{IterationRecord, RunReport, RunStatus, SuiteSummary, summarize_runs};

    fn record(iteration: u32, similarity: Option<f64>) -> IterationRecord {
        IterationRecord {
            iteration,
            strategy_name: "exploration",
            capture_summary: "4 rgb, 4 depth, ref depth".to_string(),
            raw_response_excerpt: String::new(),
            applied: 1,
            rejected_refs: Vec::new(),
            similarity,
            timestamp: SystemTime::UNIX_EPOCH,
            notes: Vec::new(),
        }
    }

    fn report(status: RunStatus, scores: &[Option<f64>]) -> RunReport {
        let history = scores
            .iter()
            .enumerate()
            .map(|(index, score)| record(index as u32 + 1, *score))
            .collect::<Vec<_>>();
        RunReport {
            status,
            final_similarity: scores.iter().rev().find_map(|score| *score),
            history,
        }
    }

    #[test]
    fn table_lists_every_iteration_and_the_status() {
        let mut run = report(RunStatus::Converged, &[Some(42.0), Some(70.5), Some(88.0)]);
        run.history[1].rejected_refs.push("Tree".to_string());

        let table = run.render_table();
        assert_eq!(table.lines().count(), 5);
        assert!(table.contains("88.0"));
        assert!(table.contains("rejected: Tree"));
        assert!(table.ends_with("status: converged, final similarity 88.0 after 3 iteration(s)"));
    }

    #[test]
    fn table_marks_missing_similarity() {
        let run = report(RunStatus::Failed, &[None]);
        let table = run.render_table();
        assert!(table.contains(" -"));
        assert!(table.contains("final similarity unknown"));
    }

    #[test]
    fn rejected_refs_are_counted_across_the_run() {
        let mut run = report(RunStatus::MaxIterations, &[Some(40.0), Some(45.0)]);
        run.history[0].rejected_refs.push("Dog".to_string());
        run.history[1].rejected_refs.push("Sky".to_string());
        run.history[1].rejected_refs.push("Tree".to_string());
        assert_eq!(run.rejected_ref_count(), 3);
    }

    #[test]
    fn summary_aggregates_statuses_and_means() {
        let runs = vec![
            report(RunStatus::Converged, &[Some(50.0), Some(90.0)]),
            report(RunStatus::Plateaued, &[Some(70.0), Some(71.0), Some(70.0)]),
            report(RunStatus::Failed, &[None]),
        ];

        let summary = summarize_runs(&runs);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.converged, 1);
        assert_eq!(summary.plateaued, 1);
        assert_eq!(summary.failed, 1);
        assert!((summary.mean_final_similarity - 80.0).abs() < 1e-9);
        assert!((summary.mean_iterations - 2.0).abs() < 1e-9);
        assert!((summary.convergence_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn empty_suite_summarizes_to_zeros() {
        assert_eq!(summarize_runs(&[]), SuiteSummary::default());
    }
}
