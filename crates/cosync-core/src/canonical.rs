//! Canonical CBOR encoding for deterministic hashing.
//!
//! This module implements RFC 8949 Core Deterministic Encoding:
//! - Map keys sorted by encoded byte comparison
//! - Integers use smallest valid encoding
//! - Definite lengths only
//! - No floats (timestamps are u64 milliseconds)
//!
//! Only structures that are hashed or signed go through this encoder: value
//! headers (for ids) and transactions (for the session signature chain).
//! Everything else travels with plain `ciborium` serialization.

use ciborium::value::Value;

use crate::header::{HeaderMeta, Ruleset, ValueHeader};
use crate::transaction::Transaction;

/// Header field keys (integer keys for compact encoding).
mod keys {
    pub const KIND: u64 = 0;
    pub const RULESET: u64 = 1;
    pub const META: u64 = 2;
    pub const CREATED_AT: u64 = 3;
    pub const UNIQUENESS: u64 = 4;

    pub const META_SOURCE: u64 = 0;
    pub const META_ATTRS: u64 = 1;

    pub const TX_PRIVACY: u64 = 0;
    pub const TX_MADE_AT: u64 = 1;
    pub const TX_CHANGES: u64 = 2;
    pub const TX_META: u64 = 3;
    pub const TX_KEY_ID: u64 = 4;
}

/// Ruleset discriminators.
mod ruleset_tags {
    pub const GROUP: u64 = 0;
    pub const OWNED_BY_GROUP: u64 = 1;
    pub const OWNED_BY_AGENT: u64 = 2;
    pub const UNSAFE_ALLOW_ALL: u64 = 3;
}

fn int(n: u64) -> Value {
    Value::Integer(n.into())
}

fn opt_bytes(bytes: Option<&[u8]>) -> Value {
    match bytes {
        Some(b) => Value::Bytes(b.to_vec()),
        None => Value::Null,
    }
}

/// Encode a value header to canonical CBOR bytes.
pub fn canonical_header_bytes(header: &ValueHeader) -> Vec<u8> {
    let value = header_to_cbor_value(header);
    let mut buf = Vec::new();
    encode_value_to(&mut buf, &value);
    buf
}

/// Encode a transaction to canonical CBOR bytes.
///
/// These bytes feed the session hash chain, so they must be identical on every
/// peer that holds the transaction.
pub fn canonical_transaction_bytes(tx: &Transaction) -> Vec<u8> {
    let entries = match tx {
        Transaction::Trusting {
            made_at,
            changes,
            meta,
        } => vec![
            (int(keys::TX_PRIVACY), int(0)),
            (int(keys::TX_MADE_AT), int(*made_at)),
            (int(keys::TX_CHANGES), Value::Bytes(changes.to_vec())),
            (int(keys::TX_META), opt_bytes(meta.as_deref())),
        ],
        Transaction::Private {
            made_at,
            key_id,
            encrypted_changes,
            encrypted_meta,
        } => vec![
            (int(keys::TX_PRIVACY), int(1)),
            (int(keys::TX_MADE_AT), int(*made_at)),
            (int(keys::TX_CHANGES), Value::Bytes(encrypted_changes.to_vec())),
            (int(keys::TX_META), opt_bytes(encrypted_meta.as_deref())),
            (int(keys::TX_KEY_ID), Value::Bytes(key_id.0.to_vec())),
        ],
    };
    let mut buf = Vec::new();
    encode_map_canonical(&mut buf, &entries);
    buf
}

fn ruleset_to_cbor_value(ruleset: &Ruleset) -> Value {
    match ruleset {
        Ruleset::Group { initial_admin } => Value::Array(vec![
            int(ruleset_tags::GROUP),
            Value::Text(initial_admin.to_string()),
        ]),
        Ruleset::OwnedByGroup { group } => Value::Array(vec![
            int(ruleset_tags::OWNED_BY_GROUP),
            Value::Bytes(group.0.to_vec()),
        ]),
        Ruleset::OwnedByAgent { owner } => Value::Array(vec![
            int(ruleset_tags::OWNED_BY_AGENT),
            Value::Text(owner.to_string()),
        ]),
        Ruleset::UnsafeAllowAll => Value::Array(vec![int(ruleset_tags::UNSAFE_ALLOW_ALL)]),
    }
}

fn meta_to_cbor_value(meta: &HeaderMeta) -> Value {
    let attrs = meta
        .attrs
        .iter()
        .map(|(k, v)| (Value::Text(k.clone()), Value::Text(v.clone())))
        .collect();
    Value::Map(vec![
        (
            int(keys::META_SOURCE),
            opt_bytes(meta.source.as_ref().map(|s| &s.0[..])),
        ),
        (int(keys::META_ATTRS), Value::Map(attrs)),
    ])
}

/// Convert a header to a CBOR Value (map with integer keys).
fn header_to_cbor_value(header: &ValueHeader) -> Value {
    let meta = match &header.meta {
        Some(meta) => meta_to_cbor_value(meta),
        None => Value::Null,
    };
    Value::Map(vec![
        (int(keys::KIND), int(header.kind.to_u8().into())),
        (int(keys::RULESET), ruleset_to_cbor_value(&header.ruleset)),
        (int(keys::META), meta),
        (int(keys::CREATED_AT), int(header.created_at)),
        (
            int(keys::UNIQUENESS),
            opt_bytes(header.uniqueness.as_ref().map(|u| &u[..])),
        ),
    ])
}

/// Recursively encode a CBOR value.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => encode_bytes(buf, b),
        Value::Text(s) => encode_text(buf, s),
        Value::Array(arr) => encode_array(buf, arr),
        Value::Map(entries) => encode_map_canonical(buf, entries),
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Tag(tag, inner) => {
            encode_uint(buf, 6, *tag);
            encode_value_to(buf, inner);
        }
        Value::Float(f) => {
            buf.push(0xfb);
            buf.extend_from_slice(&f.to_be_bytes());
        }
        // Null and anything this encoder never produces
        _ => buf.push(0xf6),
    }
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, i: ciborium::value::Integer) {
    let n: i128 = i.into();

    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        let abs = (-1 - n) as u64;
        encode_uint(buf, 1, abs);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

/// Encode a byte string (major type 2).
fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    encode_uint(buf, 2, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Encode a text string (major type 3).
fn encode_text(buf: &mut Vec<u8>, s: &str) {
    encode_uint(buf, 3, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

/// Encode an array (major type 4).
fn encode_array(buf: &mut Vec<u8>, arr: &[Value]) {
    encode_uint(buf, 4, arr.len() as u64);
    for item in arr {
        encode_value_to(buf, item);
    }
}

/// Encode a map canonically (major type 5).
///
/// Keys are sorted by their encoded byte comparison.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) {
    let mut pairs: Vec<(Vec<u8>, &Value)> = entries
        .iter()
        .map(|(k, v)| {
            let mut key_buf = Vec::new();
            encode_value_to(&mut key_buf, k);
            (key_buf, v)
        })
        .collect();

    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, pairs.len() as u64);
    for (key_bytes, value) in pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value);
    }
}
