//! Destination key scheme and object attributes.

use chrono::NaiveDate;

use crate::source::RemoteEntry;
use crate::storage::ObjectAttributes;

const HASH_ATTRIBUTE_LEN: usize = 16;

/// Local part of an address, or the whole identity when it has no `@`.
pub fn owner_short_name(owner_identity: &str) -> &str {
    match owner_identity.split_once('@') {
        Some((local, _)) => local,
        None => owner_identity,
    }
}

pub fn shared_prefix(collection_name: &str) -> String {
    format!("shared_{}", collection_name.replace('/', "_"))
}

/// `[prefix/]{owner}/[shared_{name}/]{YYYY-MM-DD}/{logical_path}`
pub fn destination_key(
    folder_prefix: Option<&str>,
    owner_identity: &str,
    shared_collection: Option<&str>,
    backup_date: NaiveDate,
    logical_path: &str,
) -> String {
    let mut segments: Vec<String> = Vec::with_capacity(5);
    if let Some(prefix) = folder_prefix {
        segments.push(prefix.to_string());
    }
    segments.push(owner_short_name(owner_identity).to_string());
    if let Some(name) = shared_collection {
        segments.push(shared_prefix(name));
    }
    segments.push(backup_date.format("%Y-%m-%d").to_string());
    segments.push(logical_path.to_string());
    segments.join("/")
}

/// Inserts ` ({entry_id})` before the extension of the last key segment so
/// entries sharing a name get distinct objects.
pub fn disambiguate(key: &str, entry_id: &str) -> String {
    let (dir, leaf) = match key.rsplit_once('/') {
        Some((dir, leaf)) => (Some(dir), leaf),
        None => (None, key),
    };
    let (stem, extension) = match leaf.rfind('.') {
        Some(dot) if dot > 0 => leaf.split_at(dot),
        _ => (leaf, ""),
    };
    let leaf = format!("{} ({}){}", stem, entry_id, extension);
    match dir {
        Some(dir) => format!("{}/{}", dir, leaf),
        None => leaf,
    }
}

/// Truncates to at most `limit` bytes without splitting a character.
pub fn clamp(value: &str, limit: usize) -> String {
    if value.len() <= limit {
        return value.to_string();
    }
    let mut end = limit;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

pub fn object_attributes(
    entry: &RemoteEntry,
    backup_date: NaiveDate,
    content_hash: &str,
    shared_collection: Option<&str>,
    limit: usize,
) -> ObjectAttributes {
    let mut attributes = ObjectAttributes::new();
    attributes.insert("original-owner".into(), entry.owner_identity.clone());
    attributes.insert("backup-date".into(), backup_date.format("%Y-%m-%d").to_string());
    attributes.insert("source-file-id".into(), entry.entry_id.clone());
    attributes.insert("mime-type".into(), entry.mime_type.clone());
    attributes.insert(
        "content-hash".into(),
        content_hash.chars().take(HASH_ATTRIBUTE_LEN).collect(),
    );
    if let Some(modified) = entry.modified_time {
        attributes.insert("modified-time".into(), modified.to_rfc3339());
    }
    if let Some(name) = shared_collection {
        attributes.insert("shared-drive".into(), name.to_string());
    }

    for value in attributes.values_mut() {
        *value = clamp(value, limit);
    }
    attributes
}
