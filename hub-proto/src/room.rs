//! Room name canonicalization.
//!
//! Room names are opaque strings on the wire, but the hub treats a handful
//! of namespaces specially: `host`, `tenant:<id>`, `network:<id>`,
//! `user:<id>` (directed delivery, never joined by more than its owner's
//! devices), and `dm:<a>:<b>` whose two ids are always stored in ascending
//! order so the same conversation always canonicalizes to one name
//! regardless of who names whom first.

/// Builds the singleton room every connection auto-joins.
#[must_use]
pub fn host() -> String {
    "host".to_string()
}

#[must_use]
pub fn tenant(id: &str) -> String {
    format!("tenant:{id}")
}

#[must_use]
pub fn network(id: &str) -> String {
    format!("network:{id}")
}

#[must_use]
pub fn user(id: &str) -> String {
    format!("user:{id}")
}

/// Canonicalizes a direct-message room name between two user ids. The pair
/// is sorted so `canonical_dm("b", "a") == canonical_dm("a", "b")`.
#[must_use]
pub fn canonical_dm(a: &str, b: &str) -> String {
    if a <= b {
        format!("dm:{a}:{b}")
    } else {
        format!("dm:{b}:{a}")
    }
}

/// A parsed room name, classified by namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomRef<'a> {
    Host,
    Tenant(&'a str),
    Network(&'a str),
    User(&'a str),
    /// Already-canonical two-id DM room, e.g. a chat scope echoed back by
    /// the server.
    Dm(&'a str, &'a str),
    /// The shorthand single-id form a client sends to `room.join`: "dm with
    /// this other user id". Must be combined with the requesting
    /// connection's own user id via [`canonical_dm`] before use.
    DmTarget(&'a str),
    /// Any other namespace, passed through unexamined (domain-owned rooms).
    Other(&'a str),
}

/// Parses a room name into its namespace.
///
/// `dm:<id>` (one id) parses to [`RoomRef::DmTarget`]; `dm:<a>:<b>` (two
/// ids) parses to [`RoomRef::Dm`]. Everything else that isn't `host`,
/// `tenant:`, `network:`, or `user:` falls through to [`RoomRef::Other`].
#[must_use]
pub fn parse(name: &str) -> RoomRef<'_> {
    if name == "host" {
        return RoomRef::Host;
    }
    if let Some(id) = name.strip_prefix("tenant:") {
        return RoomRef::Tenant(id);
    }
    if let Some(id) = name.strip_prefix("network:") {
        return RoomRef::Network(id);
    }
    if let Some(id) = name.strip_prefix("user:") {
        return RoomRef::User(id);
    }
    if let Some(rest) = name.strip_prefix("dm:") {
        let mut parts = rest.splitn(2, ':');
        match (parts.next(), parts.next()) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => return RoomRef::Dm(a, b),
            (Some(id), None) if !id.is_empty() => return RoomRef::DmTarget(id),
            _ => {}
        }
    }
    RoomRef::Other(name)
}
