//! Lock modes and per-call lock options.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lock requested for rows read by a load.
///
/// Modes are ordered by strength; several modes share a level (the pessimistic
/// write family), so comparisons go through [`LockMode::level`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// No lock; rows may come from any cache
    #[default]
    None,
    /// Rows read from the database in this transaction
    Read,
    /// Version checked at the end of the transaction
    Optimistic,
    /// Version checked and incremented at the end of the transaction
    OptimisticForceIncrement,
    /// Write lock obtained by an update in this session
    Write,
    /// `select ... for update`
    Upgrade,
    /// `select ... for update nowait`
    UpgradeNowait,
    /// `select ... for update skip locked`
    UpgradeSkipLocked,
    /// Shared row lock (`for share`)
    PessimisticRead,
    /// Exclusive row lock
    PessimisticWrite,
    /// Exclusive row lock plus version increment
    PessimisticForceIncrement,
}

impl LockMode {
    /// Relative strength of the mode.
    pub const fn level(self) -> u8 {
        match self {
            LockMode::None => 0,
            LockMode::Read => 5,
            LockMode::Optimistic => 6,
            LockMode::OptimisticForceIncrement => 7,
            LockMode::Write
            | LockMode::Upgrade
            | LockMode::UpgradeNowait
            | LockMode::UpgradeSkipLocked => 10,
            LockMode::PessimisticRead => 12,
            LockMode::PessimisticWrite => 13,
            LockMode::PessimisticForceIncrement => 17,
        }
    }

    pub const fn greater_than(self, other: LockMode) -> bool {
        self.level() > other.level()
    }

    pub const fn less_than(self, other: LockMode) -> bool {
        self.level() < other.level()
    }

    /// True for modes that need a locking read (`for update` / `for share`).
    pub const fn is_pessimistic(self) -> bool {
        matches!(
            self,
            LockMode::Upgrade
                | LockMode::UpgradeNowait
                | LockMode::UpgradeSkipLocked
                | LockMode::PessimisticRead
                | LockMode::PessimisticWrite
                | LockMode::PessimisticForceIncrement
        )
    }

    /// True when the mode is weaker than a write-intent lock, which is the
    /// condition for serving a load from the shared cache.
    pub const fn permits_cache_read(self) -> bool {
        self.less_than(LockMode::Write)
    }
}

/// How long a locking read waits for a conflicting lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockTimeout {
    #[default]
    WaitForever,
    NoWait,
    SkipLocked,
    Millis(u64),
}

/// Lock settings for one load call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    pub mode: LockMode,
    pub timeout: LockTimeout,
    /// Extend the lock to joined association tables
    pub scope: bool,
    /// Per table-alias overrides
    pub alias_modes: BTreeMap<String, LockMode>,
}

impl LockOptions {
    pub fn new(mode: LockMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub const NONE: LockOptions = LockOptions {
        mode: LockMode::None,
        timeout: LockTimeout::WaitForever,
        scope: false,
        alias_modes: BTreeMap::new(),
    };

    /// Builder-style timeout setter.
    pub fn timeout(mut self, timeout: LockTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn scope(mut self, scope: bool) -> Self {
        self.scope = scope;
        self
    }

    pub fn alias_mode(mut self, alias: impl Into<String>, mode: LockMode) -> Self {
        self.alias_modes.insert(alias.into(), mode);
        self
    }

    pub fn is_wait_forever(&self) -> bool {
        self.timeout == LockTimeout::WaitForever
    }

    /// Effective timeout: the upgrade variants carry their own wait policy.
    pub fn effective_timeout(&self) -> LockTimeout {
        match self.mode {
            LockMode::UpgradeNowait => LockTimeout::NoWait,
            LockMode::UpgradeSkipLocked => LockTimeout::SkipLocked,
            _ => self.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_by_level() {
        assert!(LockMode::PessimisticWrite.greater_than(LockMode::Read));
        assert!(LockMode::None.less_than(LockMode::Read));
        assert!(!LockMode::Upgrade.greater_than(LockMode::Write));
    }

    #[test]
    fn cache_reads_need_weak_locks() {
        assert!(LockMode::None.permits_cache_read());
        assert!(LockMode::Optimistic.permits_cache_read());
        assert!(!LockMode::Write.permits_cache_read());
        assert!(!LockMode::PessimisticRead.permits_cache_read());
    }

    #[test]
    fn upgrade_variants_imply_timeouts() {
        let opts = LockOptions::new(LockMode::UpgradeNowait);
        assert!(opts.is_wait_forever());
        assert_eq!(opts.effective_timeout(), LockTimeout::NoWait);
    }
}
