//! Tiered staleness check.
//!
//! Cheap metadata (remote checksum, then modification time) decides whether
//! an entry needs to be fetched at all; after fetching, the locally computed
//! content hash is the final word on whether it needs to be uploaded.

use std::fmt;

use crate::source::{ContentKind, RemoteEntry};
use crate::state::BackupRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Skip,
    FetchToVerify,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reason {
    NewEntry,
    ChecksumChanged,
    ModifiedTimeNewer,
    InsufficientMetadata,
    ContentChanged,
    Container,
    ChecksumUnchanged,
    NotModified,
    ContentUnchanged,
    UnsupportedKind,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::NewEntry => "new entry",
            Reason::ChecksumChanged => "checksum changed",
            Reason::ModifiedTimeNewer => "modified time newer",
            Reason::InsufficientMetadata => "insufficient metadata",
            Reason::ContentChanged => "content changed",
            Reason::Container => "container",
            Reason::ChecksumUnchanged => "checksum unchanged",
            Reason::NotModified => "not modified",
            Reason::ContentUnchanged => "content unchanged",
            Reason::UnsupportedKind => "unsupported kind",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason is for logs and statistics only; control flow looks at `action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub reason: Reason,
}

impl Decision {
    fn skip(reason: Reason) -> Self {
        Decision { action: Action::Skip, reason }
    }

    fn fetch(reason: Reason) -> Self {
        Decision { action: Action::FetchToVerify, reason }
    }

    fn upload(reason: Reason) -> Self {
        Decision { action: Action::Upload, reason }
    }
}

fn checksums_differ(entry: &RemoteEntry, record: &BackupRecord) -> Option<bool> {
    match (&entry.remote_checksum, &record.remote_checksum) {
        (Some(current), Some(previous)) => Some(current != previous),
        _ => None,
    }
}

fn modified_newer(entry: &RemoteEntry, record: &BackupRecord) -> Option<bool> {
    match (entry.modified_time, record.modified_time) {
        (Some(current), Some(previous)) => Some(current > previous),
        _ => None,
    }
}

/// Pre-download decision. Never skips on inconclusive metadata, and a record
/// without a content hash is never trusted for a skip.
pub fn should_download(entry: &RemoteEntry, record: Option<&BackupRecord>) -> Decision {
    if entry.content_kind == ContentKind::Container {
        return Decision::skip(Reason::Container);
    }
    let Some(record) = record else {
        return Decision::fetch(Reason::NewEntry);
    };
    let trusted = record.content_hash.is_some();

    match checksums_differ(entry, record) {
        Some(true) => return Decision::fetch(Reason::ChecksumChanged),
        Some(false) if trusted => return Decision::skip(Reason::ChecksumUnchanged),
        Some(false) => return Decision::fetch(Reason::InsufficientMetadata),
        None => {}
    }

    match modified_newer(entry, record) {
        Some(true) => Decision::fetch(Reason::ModifiedTimeNewer),
        Some(false) if trusted => Decision::skip(Reason::NotModified),
        _ => Decision::fetch(Reason::InsufficientMetadata),
    }
}

/// Post-download decision over the hash of the bytes actually fetched.
pub fn should_upload(entry: &RemoteEntry, record: Option<&BackupRecord>, content_hash: &str) -> Decision {
    if entry.content_kind == ContentKind::Container {
        return Decision::skip(Reason::Container);
    }
    let Some(record) = record else {
        return Decision::upload(Reason::NewEntry);
    };
    if checksums_differ(entry, record) == Some(true) {
        return Decision::upload(Reason::ChecksumChanged);
    }
    if modified_newer(entry, record) == Some(true) {
        return Decision::upload(Reason::ModifiedTimeNewer);
    }
    if record.content_hash.as_deref() != Some(content_hash) {
        return Decision::upload(Reason::ContentChanged);
    }
    Decision::skip(Reason::ContentUnchanged)
}

/// Single entry point: without a content hash this is the pre-download
/// check, with one it is the post-download check.
pub fn decide(entry: &RemoteEntry, record: Option<&BackupRecord>, content_hash: Option<&str>) -> Decision {
    match content_hash {
        None => should_download(entry, record),
        Some(hash) => should_upload(entry, record, hash),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn entry(kind: ContentKind) -> RemoteEntry {
        RemoteEntry {
            entry_id: "f1".into(),
            name: "a.txt".into(),
            mime_type: "text/plain".into(),
            content_kind: kind,
            size: Some(10),
            modified_time: Some(t0()),
            owner_identity: "alice@example.com".into(),
            parent_id: None,
            remote_checksum: Some("X".into()),
        }
    }

    fn record() -> BackupRecord {
        BackupRecord {
            entry_id: "f1".into(),
            content_hash: Some("H".into()),
            modified_time: Some(t0()),
            destination_key: "alice/2024-05-01/a.txt".into(),
            size: 10,
            remote_checksum: Some("X".into()),
            last_backup_time: t0(),
            expiry: t0() + Duration::days(30),
        }
    }

    #[test]
    fn test_no_record_fetches_regular_and_skips_container() {
        for kind in [ContentKind::Regular, ContentKind::Virtual] {
            let d = decide(&entry(kind), None, None);
            assert_eq!(d, Decision { action: Action::FetchToVerify, reason: Reason::NewEntry });
        }
        let d = decide(&entry(ContentKind::Container), None, None);
        assert_eq!(d, Decision { action: Action::Skip, reason: Reason::Container });
        assert_eq!(d.reason.to_string(), "container");
    }

    #[test]
    fn test_matching_checksum_skips_regardless_of_modified_time() {
        let rec = record();
        for offset in [-3600, 0, 3600] {
            let mut e = entry(ContentKind::Regular);
            e.modified_time = Some(t0() + Duration::seconds(offset));
            assert_eq!(should_download(&e, Some(&rec)).action, Action::Skip);
        }
    }

    #[test]
    fn test_differing_checksum_fetches_and_uploads() {
        let mut e = entry(ContentKind::Regular);
        e.remote_checksum = Some("Y".into());
        let rec = record();

        assert_eq!(
            should_download(&e, Some(&rec)),
            Decision { action: Action::FetchToVerify, reason: Reason::ChecksumChanged }
        );
        assert_eq!(
            should_upload(&e, Some(&rec), "H"),
            Decision { action: Action::Upload, reason: Reason::ChecksumChanged }
        );
    }

    #[test]
    fn test_modified_time_tier() {
        let mut e = entry(ContentKind::Virtual);
        e.remote_checksum = None;
        let mut rec = record();
        rec.remote_checksum = None;

        assert_eq!(should_download(&e, Some(&rec)).reason, Reason::NotModified);

        e.modified_time = Some(t0() + Duration::minutes(5));
        assert_eq!(should_download(&e, Some(&rec)).reason, Reason::ModifiedTimeNewer);
        assert_eq!(should_upload(&e, Some(&rec), "H").action, Action::Upload);
    }

    #[test]
    fn test_inconclusive_metadata_fails_open() {
        let mut e = entry(ContentKind::Regular);
        e.remote_checksum = None;
        e.modified_time = None;
        let rec = record();
        assert_eq!(
            should_download(&e, Some(&rec)),
            Decision { action: Action::FetchToVerify, reason: Reason::InsufficientMetadata }
        );

        let mut e = entry(ContentKind::Regular);
        e.remote_checksum = None;
        let mut rec = record();
        rec.modified_time = None;
        assert_eq!(should_download(&e, Some(&rec)).reason, Reason::InsufficientMetadata);
    }

    #[test]
    fn test_record_without_content_hash_is_reverified() {
        let mut rec = record();
        rec.content_hash = None;
        let e = entry(ContentKind::Regular);

        assert_eq!(should_download(&e, Some(&rec)).reason, Reason::InsufficientMetadata);
        assert_eq!(should_upload(&e, Some(&rec), "H").reason, Reason::ContentChanged);
    }

    #[test]
    fn test_post_download_hash_decides() {
        let mut e = entry(ContentKind::Regular);
        e.remote_checksum = None;
        e.modified_time = None;
        let rec = record();

        assert_eq!(
            decide(&e, Some(&rec), Some("H")),
            Decision { action: Action::Skip, reason: Reason::ContentUnchanged }
        );
        assert_eq!(
            decide(&e, Some(&rec), Some("other")),
            Decision { action: Action::Upload, reason: Reason::ContentChanged }
        );
        assert_eq!(decide(&e, None, Some("H")).reason, Reason::NewEntry);
    }
}
