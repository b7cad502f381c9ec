//! Hook table: which blocking-primitive categories run cooperatively.
//!
//! Rather than swapping process-global function tables, the table is a
//! value owned by the runtime. Each category maps to an [`IoMode`];
//! sockets capture their mode at construction and `sleep` consults the
//! table on every call. `enable` saves the previous flag set once, and
//! `disable` restores exactly that save, once.

use crate::base::neterror::NetError;
use std::ops::{BitOr, BitOrAssign};

/// Bit set of hookable primitive categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HookFlags(u32);

impl HookFlags {
    pub const NONE: HookFlags = HookFlags(0);
    pub const FILE: HookFlags = HookFlags(1 << 1);
    pub const SLEEP: HookFlags = HookFlags(1 << 2);
    pub const TCP: HookFlags = HookFlags(1 << 3);
    pub const UDP: HookFlags = HookFlags(1 << 4);
    pub const UNIX: HookFlags = HookFlags(1 << 5);
    pub const UDG: HookFlags = HookFlags(1 << 6);
    pub const TLS: HookFlags = HookFlags(1 << 7);
    pub const BLOCKING_FUNCTION: HookFlags = HookFlags(1 << 8);
    pub const ALL: HookFlags = HookFlags(
        Self::FILE.0
            | Self::SLEEP.0
            | Self::TCP.0
            | Self::UDP.0
            | Self::UNIX.0
            | Self::UDG.0
            | Self::TLS.0
            | Self::BLOCKING_FUNCTION.0,
    );

    pub fn contains(self, other: HookFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn add(self, other: HookFlags) -> HookFlags {
        HookFlags(self.0 | other.0)
    }

    pub fn remove(self, other: HookFlags) -> HookFlags {
        HookFlags(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for HookFlags {
    type Output = HookFlags;
    fn bitor(self, rhs: HookFlags) -> HookFlags {
        self.add(rhs)
    }
}

impl BitOrAssign for HookFlags {
    fn bitor_assign(&mut self, rhs: HookFlags) {
        *self = self.add(rhs);
    }
}

/// How a primitive in some category behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Real blocking call; blocks the whole process.
    Direct,
    /// Routed through the scheduler; blocks only the calling task.
    Cooperative,
}

/// Reversible per-category substitution of blocking primitives.
#[derive(Debug, Default)]
pub struct HookTable {
    active: HookFlags,
    saved: Option<HookFlags>,
    strict: bool,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches the given categories to cooperative mode.
    ///
    /// No-op if every requested category is already enabled. The flag set
    /// in effect before the first `enable` is saved for [`disable`].
    /// Fails with [`NetError::HookConflict`] once strict mode is on.
    ///
    /// [`disable`]: HookTable::disable
    pub fn enable(&mut self, flags: HookFlags) -> Result<(), NetError> {
        if self.strict {
            return Err(NetError::HookConflict);
        }
        if self.active.contains(flags) {
            return Ok(());
        }
        if self.saved.is_none() {
            self.saved = Some(self.active);
        }
        self.active |= flags;
        tracing::debug!(flags = ?flags, "coroutine hooks enabled");
        Ok(())
    }

    /// Restores the flag set saved by the first `enable`. Returns false
    /// (and does nothing) if there is nothing to restore.
    pub fn disable(&mut self) -> bool {
        match self.saved.take() {
            Some(previous) => {
                self.active = previous;
                tracing::debug!("coroutine hooks disabled");
                true
            }
            None => false,
        }
    }

    /// Forbids cooperative hooks for the rest of the table's life.
    /// Mutually exclusive with enabled hooks in either order.
    pub fn enable_strict_mode(&mut self) -> Result<(), NetError> {
        if !self.active.is_empty() {
            return Err(NetError::HookConflict);
        }
        self.strict = true;
        Ok(())
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn active(&self) -> HookFlags {
        self.active
    }

    pub fn mode(&self, category: HookFlags) -> IoMode {
        if self.active.contains(category) {
            IoMode::Cooperative
        } else {
            IoMode::Direct
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_is_idempotent() {
        let mut table = HookTable::new();
        table.enable(HookFlags::TCP | HookFlags::SLEEP).unwrap();
        table.enable(HookFlags::TCP).unwrap();
        assert_eq!(table.active(), HookFlags::TCP | HookFlags::SLEEP);
    }

    #[test]
    fn disable_restores_first_save_once() {
        let mut table = HookTable::new();
        table.enable(HookFlags::TCP).unwrap();
        table.enable(HookFlags::UDP).unwrap();
        assert!(table.disable());
        assert_eq!(table.active(), HookFlags::NONE);
        assert!(!table.disable());
    }

    #[test]
    fn strict_mode_excludes_hooks() {
        let mut table = HookTable::new();
        table.enable_strict_mode().unwrap();
        assert_eq!(table.enable(HookFlags::ALL), Err(NetError::HookConflict));

        let mut table = HookTable::new();
        table.enable(HookFlags::TCP).unwrap();
        assert_eq!(table.enable_strict_mode(), Err(NetError::HookConflict));
    }

    #[test]
    fn mode_tracks_flags() {
        let mut table = HookTable::new();
        assert_eq!(table.mode(HookFlags::TCP), IoMode::Direct);
        table.enable(HookFlags::TCP).unwrap();
        assert_eq!(table.mode(HookFlags::TCP), IoMode::Cooperative);
        assert_eq!(table.mode(HookFlags::UDP), IoMode::Direct);
    }
}
