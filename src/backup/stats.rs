//! Per-group and run-level counters.
//!
//! Workers never touch these: each task returns a `TaskOutcome` and the
//! orchestrating task is the only writer.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

use super::detector::Reason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Uploaded { bytes: u64 },
    Skipped(Reason),
    Failed(&'static str),
    Folder,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub files_seen: u64,
    pub uploaded: u64,
    pub skipped: u64,
    pub skip_reasons: BTreeMap<String, u64>,
    pub failed: u64,
    pub failure_kinds: BTreeMap<String, u64>,
    pub folders: u64,
    pub bytes_transferred: u64,
}

impl Tally {
    pub fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Uploaded { bytes } => {
                self.files_seen += 1;
                self.uploaded += 1;
                self.bytes_transferred += bytes;
            }
            TaskOutcome::Skipped(reason) => {
                self.files_seen += 1;
                self.skipped += 1;
                *self.skip_reasons.entry(reason.as_str().to_string()).or_default() += 1;
            }
            TaskOutcome::Failed(kind) => {
                self.files_seen += 1;
                self.failed += 1;
                *self.failure_kinds.entry(kind.to_string()).or_default() += 1;
            }
            TaskOutcome::Folder => self.folders += 1,
        }
    }

    pub fn merge(&mut self, other: &Tally) {
        self.files_seen += other.files_seen;
        self.uploaded += other.uploaded;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.folders += other.folders;
        self.bytes_transferred += other.bytes_transferred;
        for (reason, count) in &other.skip_reasons {
            *self.skip_reasons.entry(reason.clone()).or_default() += count;
        }
        for (kind, count) in &other.failure_kinds {
            *self.failure_kinds.entry(kind.clone()).or_default() += count;
        }
    }
}

/// Result of a run that got past setup. Individual failures are part of a
/// normal, partially successful run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub backup_date: String,
    #[serde(flatten)]
    pub totals: Tally,
    pub groups: BTreeMap<String, Tally>,
    pub listing_incomplete: bool,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn new(backup_date: String) -> Self {
        RunSummary {
            backup_date,
            ..Default::default()
        }
    }

    pub fn add_group(&mut self, group: String, tally: Tally) {
        info!(
            group = %group,
            files = tally.files_seen,
            uploaded = tally.uploaded,
            skipped = tally.skipped,
            failed = tally.failed,
            folders = tally.folders,
            bytes = tally.bytes_transferred,
            "Group complete"
        );
        self.totals.merge(&tally);
        self.groups.entry(group).or_default().merge(&tally);
    }
}
