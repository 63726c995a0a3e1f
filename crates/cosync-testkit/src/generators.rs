//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::{json, Value as JsonValue};

use cosync_core::{
    AgentSecret, Change, ContentMessage, CryptoProvider, DefaultCrypto, Ruleset, SessionId,
    Transaction, ValueCore, ValueHeader, ValueId, ValueKind,
};

/// Generate a random agent.
pub fn agent_secret() -> impl Strategy<Value = AgentSecret> {
    any::<[u8; 32]>().prop_map(|seed| AgentSecret::from_seed(&seed))
}

/// Generate a random ValueId.
pub fn value_id() -> impl Strategy<Value = ValueId> {
    any::<[u8; 32]>().prop_map(ValueId::from_bytes)
}

/// Generate a small JSON scalar.
pub fn json_scalar() -> impl Strategy<Value = JsonValue> {
    prop_oneof![
        Just(JsonValue::Null),
        any::<bool>().prop_map(JsonValue::Bool),
        any::<i32>().prop_map(|n| json!(n)),
        "[a-z]{0,8}".prop_map(JsonValue::String),
    ]
}

/// One map edit over a handful of keys, so edits collide often.
pub fn map_change() -> impl Strategy<Value = Change> {
    let key = prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(String::from);
    prop_oneof![
        3 => (key.clone(), json_scalar()).prop_map(|(key, value)| Change::MapSet { key, value }),
        1 => key.prop_map(|key| Change::MapDelete { key }),
    ]
}

/// A writer's edits, one transaction per inner vector.
pub fn writer_script(max_transactions: usize) -> impl Strategy<Value = Vec<Vec<Change>>> {
    prop::collection::vec(prop::collection::vec(map_change(), 1..4), 1..=max_transactions)
}

/// Scripts for several writers of the same map.
pub fn map_scripts(
    writers: usize,
    max_transactions: usize,
) -> impl Strategy<Value = Vec<Vec<Vec<Change>>>> {
    prop::collection::vec(writer_script(max_transactions), writers)
}

/// Each writer's script applied to its own copy of one open map.
///
/// Writer `n` uses seed `n + 1` and timestamps interleaved across writers
/// so concurrent edits of one key have distinct winners.
pub fn replicas(scripts: &[Vec<Vec<Change>>]) -> Vec<ValueCore> {
    let header = ValueHeader::deterministic(ValueKind::Map, Ruleset::UnsafeAllowAll, 0);
    scripts
        .iter()
        .enumerate()
        .map(|(n, script)| {
            let secret = AgentSecret::from_seed(&[n as u8 + 1; 32]);
            let session = SessionId {
                agent: DefaultCrypto.agent_id(&secret),
                nonce: n as u64,
            };
            let mut core = ValueCore::new(header.clone());
            for (i, changes) in script.iter().enumerate() {
                let made_at = (i * scripts.len() + n) as u64;
                let tx = Transaction::trusting(made_at, changes)
                    .expect("generated transactions are small");
                core.append_local(&DefaultCrypto, &secret, session, tx);
            }
            core
        })
        .collect()
}

/// Every content message a replica would send to an empty peer.
pub fn full_content(cores: &[ValueCore]) -> Vec<ContentMessage> {
    cores
        .iter()
        .flat_map(|core| core.new_content_since(None))
        .collect()
}
