//! Outcome of a migration run, per category and overall.

use std::fmt;

use crate::store::Category;

#[derive(Debug, Clone, PartialEq)]
pub enum CategoryOutcome {
    /// Nothing in the snapshot for this category.
    Empty,
    Migrated { written: usize, skipped: usize },
    /// Nothing was committed for this category. `key` names the offending
    /// entry when a single one was to blame.
    Failed { key: Option<String>, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryReport {
    pub category: Category,
    pub outcome: CategoryOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Success,
    PartialSuccess,
    Failure,
}

impl MigrationStatus {
    /// Process exit code for the command-line tool.
    pub fn exit_code(self) -> i32 {
        match self {
            MigrationStatus::Success => 0,
            MigrationStatus::Failure => 1,
            MigrationStatus::PartialSuccess => 2,
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStatus::Success => f.write_str("success"),
            MigrationStatus::PartialSuccess => f.write_str("partial success"),
            MigrationStatus::Failure => f.write_str("failure"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MigrationReport {
    pub schema: String,
    pub categories: Vec<CategoryReport>,
    /// Unknown top-level snapshot entries that were not migrated.
    pub ignored: Vec<String>,
}

impl MigrationReport {
    pub fn status(&self) -> MigrationStatus {
        let failed = self
            .categories
            .iter()
            .filter(|c| matches!(c.outcome, CategoryOutcome::Failed { .. }))
            .count();
        let migrated = self
            .categories
            .iter()
            .filter(|c| matches!(c.outcome, CategoryOutcome::Migrated { .. }))
            .count();

        match (failed, migrated) {
            (0, _) => MigrationStatus::Success,
            (_, 0) => MigrationStatus::Failure,
            _ => MigrationStatus::PartialSuccess,
        }
    }

    pub fn outcome(&self, category: Category) -> Option<&CategoryOutcome> {
        self.categories
            .iter()
            .find(|c| c.category == category)
            .map(|c| &c.outcome)
    }

    pub fn rows_written(&self) -> usize {
        self.categories
            .iter()
            .map(|c| match c.outcome {
                CategoryOutcome::Migrated { written, .. } => written,
                _ => 0,
            })
            .sum()
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Migration into schema '{}'", self.schema)?;
        writeln!(f, "{:<15} {:<8} {:>8} {:>8}  detail", "category", "result", "written", "skipped")?;
        for report in &self.categories {
            let name = report.category.snapshot_name();
            match &report.outcome {
                CategoryOutcome::Empty => {
                    writeln!(f, "{name:<15} {:<8} {:>8} {:>8}", "empty", "-", "-")?
                }
                CategoryOutcome::Migrated { written, skipped } => {
                    writeln!(f, "{name:<15} {:<8} {written:>8} {skipped:>8}", "ok")?
                }
                CategoryOutcome::Failed { key, error } => {
                    let detail = match key {
                        Some(key) => format!("{key}: {error}"),
                        None => error.clone(),
                    };
                    writeln!(f, "{name:<15} {:<8} {:>8} {:>8}  {detail}", "FAILED", 0, "-")?
                }
            }
        }
        if !self.ignored.is_empty() {
            writeln!(f, "ignored: {}", self.ignored.join(", "))?;
        }
        write!(f, "status: {}", self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcomes: Vec<CategoryOutcome>) -> MigrationReport {
        MigrationReport {
            schema: "test".into(),
            categories: Category::ALL
                .iter()
                .zip(outcomes)
                .map(|(category, outcome)| CategoryReport {
                    category: *category,
                    outcome,
                })
                .collect(),
            ignored: Vec::new(),
        }
    }

    fn failed() -> CategoryOutcome {
        CategoryOutcome::Failed {
            key: Some("seven".into()),
            error: "not an integer".into(),
        }
    }

    fn migrated(written: usize) -> CategoryOutcome {
        CategoryOutcome::Migrated {
            written,
            skipped: 0,
        }
    }

    #[test]
    fn status_and_exit_codes() {
        let ok = report(vec![migrated(1), CategoryOutcome::Empty, migrated(2)]);
        assert_eq!(ok.status(), MigrationStatus::Success);
        assert_eq!(ok.status().exit_code(), 0);
        assert_eq!(ok.rows_written(), 3);

        let partial = report(vec![migrated(1), failed()]);
        assert_eq!(partial.status(), MigrationStatus::PartialSuccess);
        assert_eq!(partial.status().exit_code(), 2);

        let broken = report(vec![failed(), CategoryOutcome::Empty]);
        assert_eq!(broken.status(), MigrationStatus::Failure);
        assert_eq!(broken.status().exit_code(), 1);

        assert_eq!(report(vec![]).status(), MigrationStatus::Success);
    }

    #[test]
    fn table_names_failures() {
        let text = report(vec![migrated(4), failed()]).to_string();
        assert!(text.contains("bot_data"));
        assert!(text.contains("FAILED"));
        assert!(text.contains("seven: not an integer"));
        assert!(text.ends_with("status: partial success"));
    }
}
