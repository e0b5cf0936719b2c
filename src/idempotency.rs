//! Idempotency keys for remote ticket commands.
//!
//! A key is a pure function of who issued the command (tenant, store,
//! device), the business date it belongs to, the command kind, the entity it
//! targets and an optional sub-part, plus a scheme version. Re-deriving it
//! for the same logical operation yields the same string on every call and
//! after restarts, so the remote side can deduplicate retried deliveries.
//!
//! Layout: `tenant:store:device:YYYY-MM-DD:Kind:entity:part:vN`

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use crate::device::DeviceContext;
use crate::error::{OutboxError, Result};

/// Current key scheme version.
pub const KEY_SCHEME_VERSION: u32 = 1;

const DELIMITER: char = ':';
/// Placeholder for an absent optional field.
const ABSENT: &str = "-";

/// The four remote commands the outbox knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    CreateTicket,
    AddLine,
    PayCash,
    PayMock,
}

impl CommandKind {
    pub const ALL: [CommandKind; 4] = [
        CommandKind::CreateTicket,
        CommandKind::AddLine,
        CommandKind::PayCash,
        CommandKind::PayMock,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::CreateTicket => "CreateTicket",
            CommandKind::AddLine => "AddLine",
            CommandKind::PayCash => "PayCash",
            CommandKind::PayMock => "PayMock",
        }
    }

    /// Commands that need the server ticket id before they can be sent.
    pub fn requires_mapping(self) -> bool {
        !matches!(self, CommandKind::CreateTicket)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self> {
        CommandKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| OutboxError::InvalidStoredValue {
                field: "outbox.kind",
                value: s.to_string(),
            })
    }
}

/// Every input of a key. `device_id` is optional here only so that a
/// missing device can be reported instead of silently producing a key.
#[derive(Debug, Clone)]
pub struct KeyParams<'a> {
    pub tenant_id: Option<&'a str>,
    pub store_id: Option<&'a str>,
    pub device_id: Option<&'a str>,
    pub business_date: NaiveDate,
    pub kind: CommandKind,
    pub entity_id: &'a str,
    pub part: Option<&'a str>,
    pub version: u32,
}

/// Build the key string from explicit parameters.
pub fn make_key(params: &KeyParams<'_>) -> Result<String> {
    let device_id = params
        .device_id
        .filter(|id| !id.trim().is_empty())
        .ok_or(OutboxError::MissingDeviceContext("device_id"))?;
    check_device_id(device_id)?;

    let date = params.business_date.format("%Y-%m-%d").to_string();
    let fields = [
        optional_field(params.tenant_id),
        optional_field(params.store_id),
        encode_field(device_id),
        Cow::Owned(date),
        Cow::Borrowed(params.kind.as_str()),
        encode_field(params.entity_id),
        optional_field(params.part),
        Cow::Owned(format!("v{}", params.version)),
    ];

    let mut key = String::with_capacity(fields.iter().map(|f| f.len() + 1).sum());
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            key.push(DELIMITER);
        }
        key.push_str(field);
    }
    Ok(key)
}

/// Derive the key for a command issued under `ctx`.
///
/// The business date comes from the context, which fixed it when it was
/// resolved, so keys do not drift across midnight within a session.
pub fn derive_key(
    ctx: &DeviceContext,
    kind: CommandKind,
    entity_id: &str,
    part: Option<&str>,
    version: u32,
) -> Result<String> {
    make_key(&KeyParams {
        tenant_id: ctx.tenant_id(),
        store_id: ctx.store_id(),
        device_id: Some(ctx.device_id()),
        business_date: ctx.business_date(),
        kind,
        entity_id,
        part,
        version,
    })
}

/// Device ids are used verbatim, so surrounding whitespace is rejected.
pub(crate) fn check_device_id(device_id: &str) -> Result<()> {
    if device_id.trim() != device_id {
        return Err(OutboxError::InvalidInput(format!(
            "device id {device_id:?} has surrounding whitespace"
        )));
    }
    Ok(())
}

fn optional_field(value: Option<&str>) -> Cow<'_, str> {
    match value {
        Some(v) => encode_field(v),
        None => Cow::Borrowed(ABSENT),
    }
}

/// Escape a field so it can never contain the delimiter or equal the
/// absent placeholder.
fn encode_field(raw: &str) -> Cow<'_, str> {
    if raw == ABSENT {
        return Cow::Borrowed("%2D");
    }
    if !raw.contains(['%', DELIMITER]) {
        return Cow::Borrowed(raw);
    }
    let mut encoded = String::with_capacity(raw.len() + 4);
    for ch in raw.chars() {
        match ch {
            '%' => encoded.push_str("%25"),
            DELIMITER => encoded.push_str("%3A"),
            other => encoded.push(other),
        }
    }
    Cow::Owned(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn params<'a>(entity_id: &'a str, part: Option<&'a str>) -> KeyParams<'a> {
        KeyParams {
            tenant_id: Some("acme"),
            store_id: Some("store-9"),
            device_id: Some("till-1"),
            business_date: date("2026-10-17"),
            kind: CommandKind::AddLine,
            entity_id,
            part,
            version: KEY_SCHEME_VERSION,
        }
    }

    #[test]
    fn test_key_layout() {
        let key = make_key(&params("t-1", Some("l-1"))).unwrap();
        assert_eq!(key, "acme:store-9:till-1:2026-10-17:AddLine:t-1:l-1:v1");

        let mut p = params("t-1", None);
        p.tenant_id = None;
        p.store_id = None;
        p.kind = CommandKind::PayCash;
        assert_eq!(make_key(&p).unwrap(), "-:-:till-1:2026-10-17:PayCash:t-1:-:v1");
    }

    #[test]
    fn test_key_is_deterministic() {
        let p = params("ticket-42", Some("line-7"));
        let first = make_key(&p).unwrap();
        for _ in 0..10 {
            assert_eq!(make_key(&p).unwrap(), first);
        }

        let ctx = DeviceContext::new("till-1", date("2026-10-17"))
            .unwrap()
            .with_tenant("acme")
            .with_store("store-9");
        let via_ctx = derive_key(&ctx, CommandKind::AddLine, "ticket-42", Some("line-7"), 1).unwrap();
        assert_eq!(via_ctx, first);
    }

    #[test]
    fn test_distinct_operations_never_collide() {
        let mut keys = HashSet::new();
        let mut total = 0;
        for kind in CommandKind::ALL {
            for entity in ["t-1", "t-2"] {
                for part in [None, Some("l-1"), Some("l-2")] {
                    for day in ["2026-10-17", "2026-10-18"] {
                        for device in ["till-1", "till-2"] {
                            let mut p = params(entity, part);
                            p.kind = kind;
                            p.business_date = date(day);
                            p.device_id = Some(device);
                            keys.insert(make_key(&p).unwrap());
                            total += 1;
                        }
                    }
                }
            }
        }
        assert_eq!(keys.len(), total);
    }

    #[test]
    fn test_delimiters_in_ids_cannot_forge_another_key() {
        // Without escaping both would read "...:AddLine:a:b:-:v1".
        let joined = make_key(&params("a:b", None)).unwrap();
        let split = make_key(&params("a", Some("b"))).unwrap();
        assert_ne!(joined, split);
        assert!(joined.contains("a%3Ab"));

        // A literal "-" part is not the same as no part.
        let dash = make_key(&params("t-1", Some("-"))).unwrap();
        let none = make_key(&params("t-1", None)).unwrap();
        assert_ne!(dash, none);

        // Escaping is itself unambiguous.
        let pct = make_key(&params("a%3Ab", None)).unwrap();
        assert_ne!(pct, joined);
    }

    #[test]
    fn test_version_changes_key() {
        let mut p = params("t-1", None);
        let v1 = make_key(&p).unwrap();
        p.version = 2;
        let v2 = make_key(&p).unwrap();
        assert_ne!(v1, v2);
        assert!(v2.ends_with(":v2"));
    }

    #[test]
    fn test_missing_device_fails() {
        let mut p = params("t-1", None);
        p.device_id = None;
        assert!(matches!(
            make_key(&p),
            Err(OutboxError::MissingDeviceContext(_))
        ));

        p.device_id = Some("   ");
        assert!(matches!(
            make_key(&p),
            Err(OutboxError::MissingDeviceContext(_))
        ));
    }

    #[test]
    fn test_padded_device_id_is_rejected_not_trimmed() {
        let mut p = params("t-1", None);
        p.device_id = Some(" till-1");
        assert!(matches!(make_key(&p), Err(OutboxError::InvalidInput(_))));

        p.device_id = Some("till-1\t");
        assert!(matches!(make_key(&p), Err(OutboxError::InvalidInput(_))));

        p.device_id = Some("till-1");
        assert!(make_key(&p).is_ok());
    }

    #[test]
    fn test_command_kind_parse() {
        for kind in CommandKind::ALL {
            assert_eq!(kind.as_str().parse::<CommandKind>().unwrap(), kind);
        }
        assert!("Refund".parse::<CommandKind>().is_err());
        assert!(!CommandKind::CreateTicket.requires_mapping());
        assert!(CommandKind::PayMock.requires_mapping());
    }
}
