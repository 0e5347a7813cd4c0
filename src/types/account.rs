//! Account and group identity types.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex_lite::Regex;

/// Network family an account lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkFamily {
    /// Linked-server family (Mastodon and other ActivityPub servers).
    ActivityPub,
    /// Decentralized-identity family (AT Protocol, DIDs + PDS hosts).
    AtProto,
}

impl NetworkFamily {
    /// Stable tag used in storage keys.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ActivityPub => "activitypub",
            Self::AtProto => "atproto",
        }
    }

    /// Parse a storage tag.
    pub fn from_tag(s: &str) -> Option<Self> {
        match s {
            "activitypub" => Some(Self::ActivityPub),
            "atproto" => Some(Self::AtProto),
            _ => None,
        }
    }

    /// Infer the family from a user-entered handle.
    ///
    /// `@user@host` is ActivityPub; `did:` identifiers and bare domain
    /// handles (`alice.example.com`) are AT Protocol.
    pub fn infer_from_handle(handle: &str) -> Option<Self> {
        static ACTIVITYPUB: OnceLock<Regex> = OnceLock::new();
        static ATPROTO: OnceLock<Regex> = OnceLock::new();

        let handle = handle.trim();
        let activitypub = ACTIVITYPUB.get_or_init(|| {
            Regex::new(r"^@?[A-Za-z0-9_.\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$")
                .expect("static activitypub handle pattern")
        });
        let atproto = ATPROTO.get_or_init(|| {
            Regex::new(r"^(did:[a-z]+:[A-Za-z0-9._:%\-]+|@?([A-Za-z0-9\-]+\.)+[A-Za-z]{2,})$")
                .expect("static atproto handle pattern")
        });

        if activitypub.is_match(handle) {
            Some(Self::ActivityPub)
        } else if atproto.is_match(handle) {
            Some(Self::AtProto)
        } else {
            None
        }
    }
}

impl fmt::Display for NetworkFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Error parsing an [`AccountId`] from its storage form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountIdError {
    /// Missing `family:` prefix.
    #[error("account id has no family prefix: {0}")]
    MissingFamily(String),
    /// Unknown family tag.
    #[error("unknown network family: {0}")]
    UnknownFamily(String),
    /// Empty identifier after the prefix.
    #[error("account id has an empty value")]
    EmptyValue,
}

/// Network-family-tagged account identifier.
///
/// Equality, ordering and hashing are structural. Serializes as
/// `"<family>:<value>"` so it can key JSON maps and storage rows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountId {
    family: NetworkFamily,
    value: String,
}

impl AccountId {
    /// Create a new account id.
    pub fn new(family: NetworkFamily, value: impl Into<String>) -> Self {
        Self { family, value: value.into() }
    }

    /// ActivityPub actor id (usually the actor URI).
    pub fn activitypub(value: impl Into<String>) -> Self {
        Self::new(NetworkFamily::ActivityPub, value)
    }

    /// AT Protocol DID.
    pub fn atproto(value: impl Into<String>) -> Self {
        Self::new(NetworkFamily::AtProto, value)
    }

    /// Network family.
    pub fn family(&self) -> NetworkFamily {
        self.family
    }

    /// Opaque identifier within the family.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Stable storage-key form.
    pub fn storage_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family.tag(), self.value)
    }
}

impl FromStr for AccountId {
    type Err = AccountIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, value) = s
            .split_once(':')
            .ok_or_else(|| AccountIdError::MissingFamily(s.to_string()))?;
        let family = NetworkFamily::from_tag(tag)
            .ok_or_else(|| AccountIdError::UnknownFamily(tag.to_string()))?;
        if value.is_empty() {
            return Err(AccountIdError::EmptyValue);
        }
        Ok(Self::new(family, value))
    }
}

impl Serialize for AccountId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AccountId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Account profile as returned by a lookup client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account identifier.
    pub id: AccountId,
    /// Human-facing handle (`@user@host` or `alice.bsky.social`).
    pub handle: String,
    /// Display name, if set.
    pub display_name: Option<String>,
    /// Number of accounts this account follows, if reported.
    pub follows_count: Option<u64>,
    /// Number of followers, if reported.
    pub followers_count: Option<u64>,
}

impl Account {
    /// Minimal account with just an id and handle.
    pub fn new(id: AccountId, handle: impl Into<String>) -> Self {
        Self {
            id,
            handle: handle.into(),
            display_name: None,
            follows_count: None,
            followers_count: None,
        }
    }
}

/// Numeric group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user-defined group of followed accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group id.
    pub id: GroupId,
    /// Display name.
    pub name: String,
    /// Member accounts (order irrelevant).
    pub members: BTreeSet<AccountId>,
}

impl Group {
    /// Create a group.
    pub fn new(id: GroupId, name: impl Into<String>, members: impl IntoIterator<Item = AccountId>) -> Self {
        Self {
            id,
            name: name.into(),
            members: members.into_iter().collect(),
        }
    }
}

/// Membership delta reported by the group-editing layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "account", rename_all = "snake_case")]
pub enum MembershipChange {
    /// Nothing changed.
    Unchanged,
    /// An account was added.
    Added(AccountId),
    /// An account was removed.
    Removed(AccountId),
}

impl MembershipChange {
    /// Whether this change alters the member set.
    pub fn alters_membership(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_account_id_roundtrip_string() {
        let id = AccountId::atproto("did:plc:abc123");
        assert_eq!(id.to_string(), "atproto:did:plc:abc123");

        let parsed: AccountId = "atproto:did:plc:abc123".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_account_id_parse_errors() {
        assert!(matches!("nofamily".parse::<AccountId>(), Err(AccountIdError::MissingFamily(_))));
        assert!(matches!("gopher:x".parse::<AccountId>(), Err(AccountIdError::UnknownFamily(_))));
        assert_eq!("atproto:".parse::<AccountId>(), Err(AccountIdError::EmptyValue));
    }

    #[test]
    fn test_account_id_as_json_map_key() {
        let mut map = HashMap::new();
        map.insert(AccountId::activitypub("https://mastodon.social/users/alice"), 3u32);

        let json = serde_json::to_string(&map).unwrap();
        assert!(json.contains("activitypub:https://mastodon.social/users/alice"));

        let back: HashMap<AccountId, u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_family_distinguishes_same_value() {
        let a = AccountId::activitypub("same");
        let b = AccountId::atproto("same");
        assert_ne!(a, b);
    }

    #[test]
    fn test_infer_family_from_handle() {
        assert_eq!(NetworkFamily::infer_from_handle("@alice@mastodon.social"), Some(NetworkFamily::ActivityPub));
        assert_eq!(NetworkFamily::infer_from_handle("bob@example.org"), Some(NetworkFamily::ActivityPub));
        assert_eq!(NetworkFamily::infer_from_handle("carol.bsky.social"), Some(NetworkFamily::AtProto));
        assert_eq!(NetworkFamily::infer_from_handle("did:plc:z72i7hdynmk6r22z27h6tvur"), Some(NetworkFamily::AtProto));
        assert_eq!(NetworkFamily::infer_from_handle("not a handle"), None);
    }

    #[test]
    fn test_membership_change() {
        assert!(!MembershipChange::Unchanged.alters_membership());
        assert!(MembershipChange::Added(AccountId::atproto("did:plc:a")).alters_membership());
    }
}
