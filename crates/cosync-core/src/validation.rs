//! Structural checks on headers and content messages.
//!
//! These run before any signature work so obviously broken input is dropped
//! early. Signature and permission checks happen elsewhere.

use crate::error::ValidationError;
use crate::header::{Ruleset, ValueHeader, ValueKind};
use crate::value::ContentMessage;

/// Maximum number of free-form header attributes.
pub const MAX_HEADER_ATTRS: usize = 32;

/// Validate a header's structure.
///
/// Group rulesets belong to groups and accounts only, and groups and accounts
/// must use a group ruleset.
pub fn validate_header(header: &ValueHeader) -> Result<(), ValidationError> {
    let is_group_ruleset = matches!(header.ruleset, Ruleset::Group { .. });
    if is_group_ruleset != header.kind.is_identity() {
        return Err(ValidationError::RulesetKindMismatch {
            ruleset: header.ruleset.name(),
            kind: header.kind.name(),
        });
    }

    if let Some(meta) = &header.meta {
        if meta.attrs.len() > MAX_HEADER_ATTRS {
            return Err(ValidationError::TooManyAttributes {
                count: meta.attrs.len(),
                limit: MAX_HEADER_ATTRS,
            });
        }
    }

    if header.kind == ValueKind::Group && header.meta.as_ref().and_then(|m| m.source).is_some() {
        return Err(ValidationError::StructuralError(
            "groups cannot be derived from another value".into(),
        ));
    }

    Ok(())
}

/// Validate a content message's structure.
pub fn validate_content(msg: &ContentMessage) -> Result<(), ValidationError> {
    if let Some(header) = &msg.header {
        if header.id() != msg.id {
            return Err(ValidationError::HeaderIdMismatch(msg.id));
        }
        validate_header(header)?;
    }

    for (session, content) in &msg.new {
        if content.new_transactions.is_empty() {
            return Err(ValidationError::EmptySessionContent(*session));
        }
        content
            .after
            .checked_add(content.new_transactions.len() as u32)
            .ok_or_else(|| ValidationError::StructuralError("session length overflow".into()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AgentSecret, CryptoProvider, DefaultCrypto, Signature};
    use crate::header::HeaderMeta;
    use crate::types::{SessionId, ValueId};
    use crate::value::SessionNewContent;

    fn agent() -> crate::types::AgentId {
        DefaultCrypto.agent_id(&AgentSecret::from_seed(&[0x42; 32]))
    }

    #[test]
    fn test_valid_headers() {
        let group = ValueHeader::new(ValueKind::Group, Ruleset::Group { initial_admin: agent() }, 0);
        validate_header(&group).unwrap();

        let map = ValueHeader::new(
            ValueKind::Map,
            Ruleset::OwnedByGroup { group: group.id() },
            0,
        );
        validate_header(&map).unwrap();
    }

    #[test]
    fn test_group_ruleset_on_map_rejected() {
        let header = ValueHeader::new(ValueKind::Map, Ruleset::Group { initial_admin: agent() }, 0);
        assert!(matches!(
            validate_header(&header),
            Err(ValidationError::RulesetKindMismatch { .. })
        ));

        let header = ValueHeader::new(ValueKind::Group, Ruleset::UnsafeAllowAll, 0);
        assert!(validate_header(&header).is_err());
    }

    #[test]
    fn test_too_many_attrs() {
        let mut meta = HeaderMeta::default();
        for i in 0..=MAX_HEADER_ATTRS {
            meta.attrs.insert(format!("k{i}"), "v".into());
        }
        let header = ValueHeader::new(ValueKind::Map, Ruleset::UnsafeAllowAll, 0).with_meta(meta);
        assert!(matches!(
            validate_header(&header),
            Err(ValidationError::TooManyAttributes { .. })
        ));
    }

    #[test]
    fn test_content_checks() {
        let header = ValueHeader::new(ValueKind::Map, Ruleset::UnsafeAllowAll, 0);
        let mut msg = ContentMessage::new(ValueId::from_bytes([1; 32]));
        msg.header = Some(header.clone());
        assert!(matches!(
            validate_content(&msg),
            Err(ValidationError::HeaderIdMismatch(_))
        ));

        msg.id = header.id();
        validate_content(&msg).unwrap();

        let session = SessionId {
            agent: agent(),
            nonce: 1,
        };
        msg.new.insert(
            session,
            SessionNewContent {
                after: 0,
                new_transactions: Vec::new(),
                last_signature: Signature([0; 64]),
            },
        );
        assert!(matches!(
            validate_content(&msg),
            Err(ValidationError::EmptySessionContent(_))
        ));
    }
}
