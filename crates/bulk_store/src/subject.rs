//! Authenticated identity and access restriction attached to a request.

use serde::{Deserialize, Serialize};

/// uid of the superuser.
pub const ROOT_UID: u32 = 0;

/// The authenticated principals of a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub uid: u32,
    /// Group ids, primary group first
    pub gids: Vec<u32>,
    #[serde(default)]
    pub username: Option<String>,
    /// Holds the admin role
    #[serde(default)]
    pub admin: bool,
}

impl Subject {
    pub fn new(uid: u32, primary_gid: u32) -> Self {
        Self {
            uid,
            gids: vec![primary_gid],
            username: None,
            admin: false,
        }
    }

    pub fn root() -> Self {
        Self::new(ROOT_UID, 0)
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_admin_role(mut self) -> Self {
        self.admin = true;
        self
    }

    pub fn is_root(&self) -> bool {
        self.uid == ROOT_UID
    }

    pub fn primary_gid(&self) -> Option<u32> {
        self.gids.first().copied()
    }

    /// Ownership key stored with each request: `"<uid>:<primary gid>"`.
    pub fn uid_gid_key(&self) -> String {
        match self.primary_gid() {
            Some(gid) => format!("{}:{}", self.uid, gid),
            None => format!("{}:", self.uid),
        }
    }

    /// Root or admin callers may act on any request.
    pub fn is_privileged(&self) -> bool {
        self.is_root() || self.admin
    }

    /// True if this caller may act on a request owned by `owner_key`.
    pub fn may_access(&self, owner_key: &str) -> bool {
        self.is_privileged() || self.uid_gid_key() == owner_key
    }
}

/// Access restriction captured at submission time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Restriction {
    #[default]
    None,
    ReadOnly,
    /// Only paths under one of these prefixes
    Prefixes { paths: Vec<String> },
}
