use std::fmt;
use std::time::Duration;

/// The kind of data a cache entry holds. Used as the key namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKind {
    User,
    Chats,
    Documents,
    Custom(String),
}

impl CacheKind {
    pub fn as_str(&self) -> &str {
        match self {
            CacheKind::User => "user",
            CacheKind::Chats => "chats",
            CacheKind::Documents => "documents",
            CacheKind::Custom(name) => name,
        }
    }

    /// Default TTL for this kind, or `None` to fall back to the cache-wide default.
    pub fn default_ttl(&self) -> Option<Duration> {
        match self {
            CacheKind::User => Some(Duration::from_secs(5 * 60)),
            CacheKind::Chats | CacheKind::Documents => Some(Duration::from_secs(60)),
            CacheKind::Custom(_) => None,
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `"{kind}:{id}"` cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    kind: CacheKind,
    key: String,
}

impl CacheKey {
    pub fn new(kind: CacheKind, id: impl fmt::Display) -> Self {
        let key = format!("{kind}:{id}");
        Self { kind, key }
    }

    pub fn user(id: impl fmt::Display) -> Self {
        Self::new(CacheKind::User, id)
    }

    pub fn chats(user_id: impl fmt::Display) -> Self {
        Self::new(CacheKind::Chats, user_id)
    }

    pub fn documents(user_id: impl fmt::Display) -> Self {
        Self::new(CacheKind::Documents, user_id)
    }

    pub fn kind(&self) -> &CacheKind {
        &self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Prefix matching every key of `kind`, for use with `EphemeralCache::invalidate_prefix`
    pub fn prefix_for(kind: &CacheKind) -> String {
        format!("{kind}:")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.key
    }
}
