use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::detector::{Action, Reason, decide};
use super::keys::{destination_key, disambiguate, object_attributes};
use super::pool::WorkerPool;
use super::stats::{RunSummary, Tally, TaskOutcome};
use crate::config::EngineConfig;
use crate::errors::{BackupError, Result};
use crate::source::fetch::{ContentFetcher, FetchOutcome, effective_name};
use crate::source::path::{PathResolver, sanitize_segment};
use crate::source::{ContentKind, RemoteEntry, Scope, SourceClient};
use crate::state::{BackupRecord, StateStore};
use crate::storage::ObjectStore;
use crate::storage::transport::ChunkedTransporter;
use crate::utils::retry::RetryPolicy;

/// Ownership group an entry is counted and batched under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupKey {
    Owner(String),
    Shared(String),
}

impl GroupKey {
    fn for_entry(scope: &Scope, entry: &RemoteEntry) -> Self {
        match scope {
            Scope::UserFiles => GroupKey::Owner(entry.owner_identity.clone()),
            Scope::SharedDrive(drive) => GroupKey::Shared(drive.name.clone()),
        }
    }

    pub fn label(&self) -> String {
        match self {
            GroupKey::Owner(owner) => owner.clone(),
            GroupKey::Shared(name) => format!("shared:{}", name),
        }
    }

    pub fn shared_collection(&self) -> Option<&str> {
        match self {
            GroupKey::Owner(_) => None,
            GroupKey::Shared(name) => Some(name),
        }
    }
}

/// Unit of work handed to a worker.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub entry: RemoteEntry,
    pub group: GroupKey,
    pub backup_date: NaiveDate,
    /// A sibling in the same folder has the same name; the entry id is added
    /// to the key.
    pub name_taken: bool,
}

struct Listing {
    groups: BTreeMap<GroupKey, Vec<RemoteEntry>>,
    incomplete: bool,
    name_taken: HashSet<String>,
}

/// Entries whose stored name repeats a sibling's within the same group. The
/// lowest entry id keeps the plain name so reruns pick the same owner.
fn colliding_siblings(groups: &BTreeMap<GroupKey, Vec<RemoteEntry>>) -> HashSet<String> {
    let mut taken = HashSet::new();
    for entries in groups.values() {
        let mut siblings: HashMap<(Option<&str>, String), Vec<&str>> = HashMap::new();
        for entry in entries.iter().filter(|e| e.content_kind != ContentKind::Container) {
            let name = sanitize_segment(&effective_name(entry));
            siblings
                .entry((entry.parent_id.as_deref(), name))
                .or_default()
                .push(entry.entry_id.as_str());
        }
        for mut ids in siblings.into_values().filter(|ids| ids.len() > 1) {
            ids.sort_unstable();
            taken.extend(ids.into_iter().skip(1).map(str::to_string));
        }
    }
    taken
}

pub struct BackupEngine {
    source: Arc<dyn SourceClient>,
    state: Arc<dyn StateStore>,
    fetcher: ContentFetcher,
    paths: PathResolver,
    transporter: ChunkedTransporter,
    pool: WorkerPool,
    batch_size: usize,
    folder_prefix: Option<String>,
    attribute_limit: usize,
    state_ttl: chrono::Duration,
    /// Destination key → entry id, for every key written this run.
    claimed_keys: DashMap<String, String>,
}

impl BackupEngine {
    pub fn new(
        source: Arc<dyn SourceClient>,
        store: Arc<dyn ObjectStore>,
        state: Arc<dyn StateStore>,
        engine: &EngineConfig,
        folder_prefix: Option<String>,
    ) -> Self {
        let retry = RetryPolicy::from_engine(engine);
        BackupEngine {
            fetcher: ContentFetcher::new(Arc::clone(&source), retry),
            paths: PathResolver::new(Arc::clone(&source)),
            transporter: ChunkedTransporter::new(store, engine.large_object_threshold, engine.part_size, retry),
            pool: WorkerPool::new(engine.max_workers, engine.rate_limit_delay),
            batch_size: engine.batch_size.max(1),
            folder_prefix,
            attribute_limit: engine.attribute_value_limit,
            state_ttl: engine.state_ttl,
            claimed_keys: DashMap::new(),
            source,
            state,
        }
    }

    /// Lists every scope, then processes each group batch by batch.
    ///
    /// Returns `Err` only when nothing could be enumerated at all. Once the
    /// token is cancelled no new batch is started; the batch in flight always
    /// runs to completion.
    pub async fn run(
        self: &Arc<Self>,
        scopes: &[Scope],
        backup_date: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let listing = self.collect(scopes).await?;
        let mut summary = RunSummary::new(backup_date.format("%Y-%m-%d").to_string());
        summary.listing_incomplete = listing.incomplete;

        'groups: for (group, entries) in listing.groups {
            let label = group.label();
            info!(group = %label, entries = entries.len(), "Processing group");
            let mut tally = Tally::default();

            for batch in entries.chunks(self.batch_size) {
                if cancel.is_cancelled() {
                    warn!(group = %label, "Cancelled, not starting further batches");
                    summary.cancelled = true;
                    summary.add_group(label, tally);
                    break 'groups;
                }
                let tasks: Vec<TransferTask> = batch
                    .iter()
                    .map(|entry| TransferTask {
                        entry: entry.clone(),
                        group: group.clone(),
                        backup_date,
                        name_taken: listing.name_taken.contains(&entry.entry_id),
                    })
                    .collect();

                let outcomes = self
                    .pool
                    .run_batch(tasks, |task| {
                        let engine = Arc::clone(self);
                        async move { engine.process(task).await }
                    })
                    .await;
                outcomes.iter().for_each(|outcome| tally.record(outcome));
            }

            summary.add_group(label, tally);
        }

        info!(
            files = summary.totals.files_seen,
            uploaded = summary.totals.uploaded,
            skipped = summary.totals.skipped,
            failed = summary.totals.failed,
            bytes = summary.totals.bytes_transferred,
            listing_incomplete = summary.listing_incomplete,
            cancelled = summary.cancelled,
            "Backup run finished"
        );
        Ok(summary)
    }

    async fn collect(&self, scopes: &[Scope]) -> Result<Listing> {
        if scopes.is_empty() {
            return Err(BackupError::Setup("No scopes configured for backup".into()));
        }

        let mut groups: BTreeMap<GroupKey, Vec<RemoteEntry>> = BTreeMap::new();
        let mut seen = HashSet::new();
        let mut incomplete = false;
        let mut failed_scopes = Vec::new();

        for scope in scopes {
            let mut stream = self.source.list(scope.clone());
            let mut listed = 0usize;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(entry) => {
                        listed += 1;
                        if !seen.insert(entry.entry_id.clone()) {
                            debug!(entry_id = %entry.entry_id, "Entry already listed under another scope");
                            continue;
                        }
                        self.paths.remember(&entry);
                        groups.entry(GroupKey::for_entry(scope, &entry)).or_default().push(entry);
                    }
                    Err(e) if listed == 0 => {
                        error!(scope = ?scope, error = %e, "Listing failed");
                        failed_scopes.push(e);
                        break;
                    }
                    Err(e) => {
                        warn!(scope = ?scope, listed, error = %e, "Listing interrupted, continuing with partial results");
                        incomplete = true;
                        break;
                    }
                }
            }
            info!(scope = ?scope, listed, "Scope listed");
        }

        if failed_scopes.len() == scopes.len() {
            let reasons: Vec<String> = failed_scopes.iter().map(ToString::to_string).collect();
            return Err(BackupError::Setup(format!(
                "No entries could be enumerated: {}",
                reasons.join("; ")
            )));
        }
        if !failed_scopes.is_empty() {
            incomplete = true;
        }

        let name_taken = colliding_siblings(&groups);
        if !name_taken.is_empty() {
            info!(entries = name_taken.len(), "Entries share a name with a sibling; their keys carry the entry id");
        }
        Ok(Listing {
            groups,
            incomplete,
            name_taken,
        })
    }

    /// Reserves `key` for `entry_id` for the rest of the run. A key already
    /// held by another entry (same-named folders on the path) is replaced by
    /// its disambiguated form.
    fn claim_key(&self, key: String, entry_id: &str) -> String {
        match self.claimed_keys.entry(key) {
            Entry::Vacant(slot) => {
                let key = slot.key().clone();
                slot.insert(entry_id.to_string());
                key
            }
            Entry::Occupied(slot) if slot.get() == entry_id => slot.key().clone(),
            Entry::Occupied(slot) => {
                let alternative = disambiguate(slot.key(), entry_id);
                warn!(entry_id, key = %slot.key(), held_by = %slot.get(), %alternative, "Key already written this run");
                drop(slot);
                self.claimed_keys.insert(alternative.clone(), entry_id.to_string());
                alternative
            }
        }
    }

    /// Task boundary: every error is folded into the outcome here.
    async fn process(&self, task: TransferTask) -> TaskOutcome {
        match self.try_process(&task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    entry_id = %task.entry.entry_id,
                    name = %task.entry.name,
                    kind = e.kind(),
                    error = %e,
                    "Entry failed"
                );
                TaskOutcome::Failed(e.kind())
            }
        }
    }

    async fn try_process(&self, task: &TransferTask) -> Result<TaskOutcome> {
        let entry = &task.entry;
        if entry.content_kind == ContentKind::Container {
            return Ok(TaskOutcome::Folder);
        }

        let record = match self.state.get(&entry.entry_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(entry_id = %entry.entry_id, error = %e, "State lookup failed, re-verifying entry");
                None
            }
        };

        let decision = decide(entry, record.as_ref(), None);
        if decision.action == Action::Skip {
            debug!(entry_id = %entry.entry_id, reason = %decision.reason, "Skipped before fetch");
            return Ok(TaskOutcome::Skipped(decision.reason));
        }

        let content = match self.fetcher.fetch(entry).await? {
            FetchOutcome::Fetched(content) => content,
            FetchOutcome::Unsupported(_) => return Ok(TaskOutcome::Skipped(Reason::UnsupportedKind)),
        };

        let decision = decide(entry, record.as_ref(), Some(&content.content_hash));
        if decision.action == Action::Skip {
            debug!(entry_id = %entry.entry_id, reason = %decision.reason, "Skipped after fetch");
            return Ok(TaskOutcome::Skipped(decision.reason));
        }

        let shared = task.group.shared_collection();
        let logical_path = self.paths.resolve_path(&entry.entry_id, &content.effective_name).await;
        let mut key = destination_key(
            self.folder_prefix.as_deref(),
            &entry.owner_identity,
            shared,
            task.backup_date,
            &logical_path,
        );
        if task.name_taken {
            key = disambiguate(&key, &entry.entry_id);
        }
        let key = self.claim_key(key, &entry.entry_id);
        let attributes = object_attributes(
            entry,
            task.backup_date,
            &content.content_hash,
            shared,
            self.attribute_limit,
        );

        let size = content.bytes.len() as u64;
        let mode = self.transporter.transport(content.bytes, &key, &attributes).await?;
        info!(entry_id = %entry.entry_id, %key, size, mode = ?mode, reason = %decision.reason, "Uploaded");

        let now = Utc::now();
        let record = BackupRecord {
            entry_id: entry.entry_id.clone(),
            content_hash: Some(content.content_hash),
            modified_time: entry.modified_time,
            destination_key: key,
            size,
            remote_checksum: entry.remote_checksum.clone(),
            last_backup_time: now,
            expiry: now + self.state_ttl,
        };
        if let Err(e) = self.state.put(&record).await {
            // The object is in place; the next run re-verifies by content hash.
            error!(entry_id = %entry.entry_id, error = %e, "Failed to persist backup record");
        }

        Ok(TaskOutcome::Uploaded { bytes: size })
    }
}
