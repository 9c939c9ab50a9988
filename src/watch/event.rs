// # Change Events
//
// The structured record the event worker builds per overlapping region
// per fault (SPEC_FULL.md §3, §4.6) and the canonical JSONL record the
// worker persists into FastStorage's secondary namespace (SPEC_FULL.md
// §6). `ValueSlot` expresses the "inline xor spilled" invariant as a
// Rust enum rather than the paired-nullable-pointer shape the FFI
// boundary eventually needs -- that translation lives in `crate::api`.

use serde::{Deserialize, Serialize};

use crate::common::{AdapterId, LanguageTag, RegionId, ScopeTag, Seq, ThreadId};

/// Either a value small enough to carry inline, or the FastStorage key
/// it was spilled under.
#[derive(Debug, Clone)]
pub enum ValueSlot {
    Inline(Vec<u8>),
    Spilled(String),
}

impl ValueSlot {
    pub fn storage_key(&self) -> Option<&str> {
        match self {
            ValueSlot::Spilled(key) => Some(key),
            ValueSlot::Inline(_) => None,
        }
    }

    pub fn inline_value(&self) -> Option<&[u8]> {
        match self {
            ValueSlot::Inline(bytes) => Some(bytes),
            ValueSlot::Spilled(_) => None,
        }
    }
}

/// Source-location context attached to an event when the adapter
/// supplied it; entirely optional, since native regions rarely have a
/// variable name or line number.
#[derive(Debug, Clone, Default)]
pub struct SourceContext {
    pub variable_name: Option<String>,
    pub file: Option<String>,
    pub function: Option<String>,
    pub line: Option<u32>,
}

/// A single observed write to a watched region (SPEC_FULL.md §3).
/// Immutable once built; visible to the user callback for the duration
/// of its invocation, then released by the caller.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub seq: Seq,
    pub timestamp_ns: u64,
    pub adapter_id: AdapterId,
    pub region_id: RegionId,
    pub context: SourceContext,
    pub fault_ip: usize,
    pub thread_id: ThreadId,
    pub thread_name: Option<String>,
    pub language: LanguageTag,
    pub scope: ScopeTag,
    pub old_preview: Vec<u8>,
    pub new_preview: Vec<u8>,
    pub old: Option<ValueSlot>,
    pub new: Option<ValueSlot>,
    pub stack_trace: Vec<String>,
    pub user_data: usize,
}

impl ChangeEvent {
    /// Truncates `bytes` to at most `preview_len` bytes for the preview
    /// fields, which are always inline regardless of the spill decision.
    pub fn preview(bytes: &[u8], preview_len: usize) -> Vec<u8> {
        bytes[..bytes.len().min(preview_len)].to_vec()
    }
}

/// Canonical secondary-persistence record (SPEC_FULL.md §6): one JSON
/// object per line in FastStorage's `log/{seq}` namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChangeRecord {
    pub seq: Seq,
    pub ts_ns: u64,
    pub thread_id: ThreadId,
    pub thread_name: Option<String>,
    pub variable_name: Option<String>,
    pub language: LanguageTag,
    pub scope: ScopeTag,
    pub old_preview: Vec<u8>,
    pub new_preview: Vec<u8>,
    pub file: Option<String>,
    pub function: Option<String>,
    pub line: Option<u32>,
}

impl From<&ChangeEvent> for StoredChangeRecord {
    fn from(e: &ChangeEvent) -> Self {
        Self {
            seq: e.seq,
            ts_ns: e.timestamp_ns,
            thread_id: e.thread_id,
            thread_name: e.thread_name.clone(),
            variable_name: e.context.variable_name.clone(),
            language: e.language,
            scope: e.scope,
            old_preview: e.old_preview.clone(),
            new_preview: e.new_preview.clone(),
            file: e.context.file.clone(),
            function: e.context.function.clone(),
            line: e.context.line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_long_values() {
        let bytes = vec![7u8; 1000];
        let preview = ChangeEvent::preview(&bytes, 256);
        assert_eq!(preview.len(), 256);
    }

    #[test]
    fn preview_keeps_short_values_whole() {
        let bytes = vec![1u8, 2, 3];
        let preview = ChangeEvent::preview(&bytes, 256);
        assert_eq!(preview, vec![1, 2, 3]);
    }

    #[test]
    fn value_slot_reports_exactly_one_representation() {
        let inline = ValueSlot::Inline(vec![1, 2, 3]);
        assert!(inline.inline_value().is_some());
        assert!(inline.storage_key().is_none());

        let spilled = ValueSlot::Spilled("v/1/old".to_string());
        assert!(spilled.inline_value().is_none());
        assert!(spilled.storage_key().is_some());
    }

    #[test]
    fn stored_record_mirrors_event_fields() {
        let event = ChangeEvent {
            seq: 42,
            timestamp_ns: 123,
            adapter_id: 1,
            region_id: 7,
            context: SourceContext {
                variable_name: Some("x".into()),
                file: Some("a.rs".into()),
                function: Some("f".into()),
                line: Some(10),
            },
            fault_ip: 0,
            thread_id: 99,
            thread_name: Some("main".into()),
            language: LanguageTag::Native,
            scope: ScopeTag::Local,
            old_preview: vec![1],
            new_preview: vec![2],
            old: Some(ValueSlot::Inline(vec![1])),
            new: Some(ValueSlot::Inline(vec![2])),
            stack_trace: vec![],
            user_data: 0,
        };
        let record = StoredChangeRecord::from(&event);
        assert_eq!(record.seq, 42);
        assert_eq!(record.variable_name.as_deref(), Some("x"));
        assert_eq!(record.line, Some(10));
    }
}
