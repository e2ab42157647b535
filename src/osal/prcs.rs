//! Process Identity
//!
//! Opaque tokens naming a calling process. The managers store a token's
//! id as the owner of a channel, queue, allocator or transport and compare
//! it against the caller on every mutating call. Tokens carry no
//! scheduling meaning.

use core::sync::atomic::{AtomicU64, Ordering};

/// Owner id recorded in manager tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrcsId(pub u64);

/// Identity of one calling process
///
/// Every [`PrcsToken::create`] yields a distinct identity, so several
/// "processes" can be simulated inside a single test binary.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct PrcsToken {
    id: PrcsId,
    os_pid: u32,
}

impl PrcsToken {
    /// Create a token for a new logical process
    pub fn create() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            id: PrcsId(COUNTER.fetch_add(1, Ordering::Relaxed)),
            os_pid: std::process::id(),
        }
    }

    pub fn id(&self) -> PrcsId {
        self.id
    }

    /// OS process hosting this logical process
    pub fn os_pid(&self) -> u32 {
        self.os_pid
    }

    /// Compare two identities
    pub fn is_equal(&self, other: &PrcsToken) -> bool {
        self.id == other.id
    }

    /// Check whether this token is the recorded owner
    pub fn owns(&self, owner: Option<PrcsId>) -> bool {
        owner == Some(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_distinct() {
        let a = PrcsToken::create();
        let b = PrcsToken::create();
        assert!(!a.is_equal(&b));
        assert!(a.is_equal(&a));
        assert_eq!(a.os_pid(), b.os_pid());
    }

    #[test]
    fn test_owns() {
        let a = PrcsToken::create();
        let b = PrcsToken::create();
        assert!(a.owns(Some(a.id())));
        assert!(!a.owns(Some(b.id())));
        assert!(!a.owns(None));
    }
}
