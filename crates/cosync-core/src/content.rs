//! Merged content of a value.
//!
//! Content is rebuilt by applying decoded transactions in the global order
//! (`made_at`, then session id, then index). Given the same set of
//! transactions every peer produces the same content:
//!
//! - maps: last writer wins per key
//! - lists and plain text: a replicated growable array. Every inserted item is
//!   keyed by its [`OpId`]; items inserted after the same anchor are ordered
//!   newest first by (`made_at`, [`OpId`]); deletes leave tombstones
//! - streams: one append-only list per session
//! - binary streams: a mime type plus chunks in order

use bytes::Bytes;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::header::ValueKind;
use crate::transaction::{Change, ListAnchor};
use crate::types::{OpId, SessionId, TransactionId};

/// A transaction whose changes are available in plaintext.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEntry {
    pub tx: TransactionId,
    pub made_at: u64,
    pub changes: Vec<Change>,
}

/// Last-writer-wins map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapContent {
    entries: BTreeMap<String, MapEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    /// `None` once deleted.
    pub value: Option<JsonValue>,
    pub made_at: u64,
    pub tx: TransactionId,
}

impl MapContent {
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.entries.get(key).and_then(|e| e.value.as_ref())
    }

    /// The last edit for `key`, including deletes.
    pub fn last_edit(&self, key: &str) -> Option<&MapEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, e)| e.value.is_some())
            .map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.value.as_ref().map(|v| (k.as_str(), v)))
    }

    pub fn len(&self) -> usize {
        self.keys().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set(&mut self, key: &str, value: Option<JsonValue>, entry: &DecodedEntry) {
        self.entries.insert(
            key.to_string(),
            MapEntry {
                value,
                made_at: entry.made_at,
                tx: entry.tx,
            },
        );
    }

    pub fn to_json(&self) -> JsonValue {
        let map: JsonMap<String, JsonValue> = self
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        JsonValue::Object(map)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ListItem {
    value: JsonValue,
    made_at: u64,
}

/// Replicated growable array.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListContent {
    items: HashMap<OpId, ListItem>,
    /// Children per anchor (`None` = list start), sorted newest first.
    children: HashMap<Option<OpId>, Vec<(Reverse<u64>, Reverse<OpId>)>>,
    deleted: HashSet<OpId>,
}

impl ListContent {
    fn insert(&mut self, op: OpId, after: ListAnchor, value: JsonValue, made_at: u64) {
        if self.items.contains_key(&op) {
            return;
        }
        self.items.insert(op, ListItem { value, made_at });
        let anchor = match after {
            ListAnchor::Start => None,
            ListAnchor::After(id) => Some(id),
        };
        let siblings = self.children.entry(anchor).or_default();
        let key = (Reverse(made_at), Reverse(op));
        let pos = siblings.binary_search(&key).unwrap_or_else(|p| p);
        siblings.insert(pos, key);
    }

    fn delete(&mut self, target: OpId) {
        self.deleted.insert(target);
    }

    /// Item ids in document order, including tombstones.
    fn ordered_ids(&self) -> Vec<OpId> {
        let mut out = Vec::with_capacity(self.items.len());
        let mut stack: Vec<OpId> = Vec::new();
        let push_children = |stack: &mut Vec<OpId>, anchor: Option<OpId>| {
            if let Some(kids) = self.children.get(&anchor) {
                stack.extend(kids.iter().rev().map(|(_, Reverse(id))| *id));
            }
        };
        push_children(&mut stack, None);
        while let Some(id) = stack.pop() {
            out.push(id);
            push_children(&mut stack, Some(id));
        }
        out
    }

    /// Visible items with their stable ids, in document order.
    pub fn entries(&self) -> Vec<(OpId, &JsonValue)> {
        self.ordered_ids()
            .into_iter()
            .filter(|id| !self.deleted.contains(id))
            .filter_map(|id| self.items.get(&id).map(|item| (id, &item.value)))
            .collect()
    }

    pub fn values(&self) -> Vec<&JsonValue> {
        self.entries().into_iter().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creation time of an item, if known.
    pub fn made_at(&self, id: &OpId) -> Option<u64> {
        self.items.get(id).map(|i| i.made_at)
    }

    /// Concatenation of string items, for plain text.
    pub fn text(&self) -> String {
        self.entries()
            .into_iter()
            .filter_map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Array(self.values().into_iter().cloned().collect())
    }
}

/// Per-session append-only lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamContent {
    per_session: BTreeMap<SessionId, Vec<StreamItem>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub value: JsonValue,
    pub made_at: u64,
    pub tx: TransactionId,
}

impl StreamContent {
    pub fn session_items(&self, session: &SessionId) -> &[StreamItem] {
        self.per_session
            .get(session)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Latest item of every session.
    pub fn latest_per_session(&self) -> BTreeMap<SessionId, &StreamItem> {
        self.per_session
            .iter()
            .filter_map(|(s, items)| items.last().map(|i| (*s, i)))
            .collect()
    }

    /// All items, merged in global order.
    pub fn all_items(&self) -> Vec<&StreamItem> {
        let mut items: Vec<&StreamItem> = self.per_session.values().flatten().collect();
        items.sort_by_key(|i| (i.made_at, i.tx));
        items
    }

    pub fn to_json(&self) -> JsonValue {
        let map: JsonMap<String, JsonValue> = self
            .per_session
            .iter()
            .map(|(s, items)| {
                (
                    s.to_string(),
                    JsonValue::Array(items.iter().map(|i| i.value.clone()).collect()),
                )
            })
            .collect();
        JsonValue::Object(map)
    }
}

/// A binary blob streamed in chunks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BinaryContent {
    pub mime_type: Option<String>,
    pub total_size: Option<u64>,
    pub chunks: Vec<Bytes>,
    pub finished: bool,
}

impl BinaryContent {
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }

    /// The full blob once the stream is finished.
    pub fn bytes(&self) -> Option<Vec<u8>> {
        if !self.finished {
            return None;
        }
        Some(self.chunks.iter().flat_map(|c| c.iter().copied()).collect())
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::json!({
            "mimeType": self.mime_type,
            "totalSize": self.total_size,
            "size": self.size(),
            "finished": self.finished,
        })
    }
}

/// Merged content, tagged by value kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueContent {
    Map(MapContent),
    List(ListContent),
    Text(ListContent),
    Stream(StreamContent),
    Binary(BinaryContent),
}

impl ValueContent {
    /// Empty content for a kind. Groups and accounts are maps.
    pub fn new(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Map | ValueKind::Group | ValueKind::Account => {
                ValueContent::Map(MapContent::default())
            }
            ValueKind::List => ValueContent::List(ListContent::default()),
            ValueKind::PlainText => ValueContent::Text(ListContent::default()),
            ValueKind::Stream => ValueContent::Stream(StreamContent::default()),
            ValueKind::BinaryStream => ValueContent::Binary(BinaryContent::default()),
        }
    }

    /// Build content from entries that are already in global order.
    pub fn from_entries<'a>(
        kind: ValueKind,
        entries: impl IntoIterator<Item = &'a DecodedEntry>,
    ) -> Self {
        let mut content = Self::new(kind);
        for entry in entries {
            content.apply(entry);
        }
        content
    }

    /// Apply one transaction. Changes that do not fit the kind are skipped.
    pub fn apply(&mut self, entry: &DecodedEntry) {
        for (i, change) in entry.changes.iter().enumerate() {
            let op = OpId {
                tx: entry.tx,
                change: i as u32,
            };
            match (&mut *self, change) {
                (ValueContent::Map(map), Change::MapSet { key, value }) => {
                    map.set(key, Some(value.clone()), entry)
                }
                (ValueContent::Map(map), Change::MapDelete { key }) => map.set(key, None, entry),
                (
                    ValueContent::List(list) | ValueContent::Text(list),
                    Change::ListInsert { after, value },
                ) => list.insert(op, *after, value.clone(), entry.made_at),
                (ValueContent::List(list) | ValueContent::Text(list), Change::ListDelete { target }) => {
                    list.delete(*target)
                }
                (ValueContent::Stream(stream), Change::StreamPush { value }) => stream
                    .per_session
                    .entry(entry.tx.session)
                    .or_default()
                    .push(StreamItem {
                        value: value.clone(),
                        made_at: entry.made_at,
                        tx: entry.tx,
                    }),
                (ValueContent::Binary(bin), Change::BinaryStart { mime_type, total_size }) => {
                    if bin.mime_type.is_none() {
                        bin.mime_type = Some(mime_type.clone());
                        bin.total_size = *total_size;
                    }
                }
                (ValueContent::Binary(bin), Change::BinaryChunk { data }) => {
                    if !bin.finished {
                        bin.chunks.push(data.clone());
                    }
                }
                (ValueContent::Binary(bin), Change::BinaryEnd) => bin.finished = true,
                (_, change) => {
                    tracing::debug!(tx = ?entry.tx, ?change, "change does not apply to value kind");
                }
            }
        }
    }

    pub fn as_map(&self) -> Option<&MapContent> {
        match self {
            ValueContent::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListContent> {
        match self {
            ValueContent::List(l) | ValueContent::Text(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&StreamContent> {
        match self {
            ValueContent::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&BinaryContent> {
        match self {
            ValueContent::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// A JSON rendering, identical on every converged peer.
    pub fn to_json(&self) -> JsonValue {
        match self {
            ValueContent::Map(m) => m.to_json(),
            ValueContent::List(l) => l.to_json(),
            ValueContent::Text(t) => JsonValue::String(t.text()),
            ValueContent::Stream(s) => s.to_json(),
            ValueContent::Binary(b) => b.to_json(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AgentSecret, CryptoProvider, DefaultCrypto};
    use proptest::prelude::*;
    use serde_json::json;

    fn session(seed: u8) -> SessionId {
        SessionId {
            agent: DefaultCrypto.agent_id(&AgentSecret::from_seed(&[seed; 32])),
            nonce: seed as u64,
        }
    }

    fn entry(seed: u8, index: u32, made_at: u64, changes: Vec<Change>) -> DecodedEntry {
        DecodedEntry {
            tx: TransactionId {
                session: session(seed),
                index,
            },
            made_at,
            changes,
        }
    }

    fn op(e: &DecodedEntry, change: u32) -> OpId {
        OpId { tx: e.tx, change }
    }

    #[test]
    fn test_map_last_writer_wins() {
        let a = entry(1, 0, 10, vec![Change::MapSet { key: "x".into(), value: json!(1) }]);
        let b = entry(2, 0, 20, vec![Change::MapSet { key: "x".into(), value: json!(2) }]);
        let c = entry(1, 1, 30, vec![Change::MapDelete { key: "x".into() }]);

        let content = ValueContent::from_entries(ValueKind::Map, [&a, &b]);
        assert_eq!(content.as_map().unwrap().get("x"), Some(&json!(2)));

        let content = ValueContent::from_entries(ValueKind::Map, [&a, &b, &c]);
        assert_eq!(content.as_map().unwrap().get("x"), None);
        assert!(content.as_map().unwrap().last_edit("x").is_some());
        assert_eq!(content.to_json(), json!({}));
    }

    #[test]
    fn test_list_sequential_inserts() {
        let first = entry(1, 0, 1, vec![Change::ListInsert { after: ListAnchor::Start, value: json!("a") }]);
        let second = entry(
            1,
            1,
            2,
            vec![
                Change::ListInsert { after: ListAnchor::After(op(&first, 0)), value: json!("b") },
                Change::ListInsert {
                    after: ListAnchor::After(OpId { tx: TransactionId { session: session(1), index: 1 }, change: 0 }),
                    value: json!("c"),
                },
            ],
        );
        let content = ValueContent::from_entries(ValueKind::List, [&first, &second]);
        assert_eq!(content.to_json(), json!(["a", "b", "c"]));
    }

    #[test]
    fn test_list_concurrent_inserts_newest_first() {
        let base = entry(1, 0, 1, vec![Change::ListInsert { after: ListAnchor::Start, value: json!("base") }]);
        let anchor = ListAnchor::After(op(&base, 0));
        let older = entry(2, 0, 5, vec![Change::ListInsert { after: anchor, value: json!("older") }]);
        let newer = entry(3, 0, 9, vec![Change::ListInsert { after: anchor, value: json!("newer") }]);

        let content = ValueContent::from_entries(ValueKind::List, [&base, &older, &newer]);
        assert_eq!(content.to_json(), json!(["base", "newer", "older"]));
    }

    #[test]
    fn test_list_delete_tombstones() {
        let a = entry(1, 0, 1, vec![
            Change::ListInsert { after: ListAnchor::Start, value: json!(1) },
        ]);
        let b = entry(1, 1, 2, vec![
            Change::ListInsert { after: ListAnchor::After(op(&a, 0)), value: json!(2) },
        ]);
        let del = entry(2, 0, 3, vec![Change::ListDelete { target: op(&a, 0) }]);

        let content = ValueContent::from_entries(ValueKind::List, [&a, &b, &del]);
        // Children of a deleted item stay in place
        assert_eq!(content.to_json(), json!([2]));
    }

    #[test]
    fn test_plain_text() {
        let a = entry(1, 0, 1, vec![Change::ListInsert { after: ListAnchor::Start, value: json!("hello") }]);
        let b = entry(1, 1, 2, vec![Change::ListInsert { after: ListAnchor::After(op(&a, 0)), value: json!(" world") }]);
        let content = ValueContent::from_entries(ValueKind::PlainText, [&a, &b]);
        assert_eq!(content.to_json(), json!("hello world"));
    }

    #[test]
    fn test_stream_per_session() {
        let a = entry(1, 0, 1, vec![Change::StreamPush { value: json!("a1") }]);
        let b = entry(2, 0, 2, vec![Change::StreamPush { value: json!("b1") }]);
        let c = entry(1, 1, 3, vec![Change::StreamPush { value: json!("a2") }]);
        let content = ValueContent::from_entries(ValueKind::Stream, [&a, &b, &c]);
        let stream = content.as_stream().unwrap();
        assert_eq!(stream.session_items(&session(1)).len(), 2);
        assert_eq!(stream.latest_per_session()[&session(1)].value, json!("a2"));
        let all: Vec<_> = stream.all_items().iter().map(|i| i.value.clone()).collect();
        assert_eq!(all, vec![json!("a1"), json!("b1"), json!("a2")]);
    }

    #[test]
    fn test_binary_stream() {
        let e = entry(1, 0, 1, vec![
            Change::BinaryStart { mime_type: "image/png".into(), total_size: Some(4) },
            Change::BinaryChunk { data: Bytes::from_static(b"ab") },
            Change::BinaryChunk { data: Bytes::from_static(b"cd") },
        ]);
        let content = ValueContent::from_entries(ValueKind::BinaryStream, [&e]);
        assert!(content.as_binary().unwrap().bytes().is_none());

        let end = entry(1, 1, 2, vec![Change::BinaryEnd]);
        let content = ValueContent::from_entries(ValueKind::BinaryStream, [&e, &end]);
        assert_eq!(content.as_binary().unwrap().bytes().unwrap(), b"abcd");
    }

    #[test]
    fn test_mismatched_change_ignored() {
        let e = entry(1, 0, 1, vec![Change::StreamPush { value: json!(1) }]);
        let content = ValueContent::from_entries(ValueKind::Map, [&e]);
        assert_eq!(content.to_json(), json!({}));
    }

    proptest! {
        // Inserts sorted into global order give the same list regardless of
        // the order in which they were generated.
        #[test]
        fn list_converges_for_any_arrival_order(
            seeds in proptest::collection::vec((1u8..4, 0u64..50), 1..12),
            shuffle in any::<u64>(),
        ) {
            let mut entries: Vec<DecodedEntry> = Vec::new();
            for (i, (seed, made_at)) in seeds.iter().enumerate() {
                let after = if i == 0 {
                    ListAnchor::Start
                } else {
                    ListAnchor::After(op(&entries[(i * 7) % i], 0))
                };
                entries.push(entry(*seed, i as u32, *made_at, vec![
                    Change::ListInsert { after, value: json!(i) },
                ]));
            }

            let mut a = entries.clone();
            a.sort_by_key(|e| (e.made_at, e.tx));
            let mut b = entries.clone();
            let len = b.len();
            b.rotate_left((shuffle as usize) % len);
            b.sort_by_key(|e| (e.made_at, e.tx));

            let ca = ValueContent::from_entries(ValueKind::List, &a);
            let cb = ValueContent::from_entries(ValueKind::List, &b);
            prop_assert_eq!(ca.to_json(), cb.to_json());
        }
    }
}
