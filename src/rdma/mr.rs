//! Memory region permissions and scatter-gather entries.

use std::ops::{Add, AddAssign, BitAnd, BitOr, Sub};

use super::type_alias::LKey;

/// Memory region permissions.
///
/// Values are those of `enum ibv_access_flags`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Permission(u32);

impl Permission {
    /// No access beyond local read, which is always granted.
    pub const EMPTY: Self = Self(0);
    pub const LOCAL_WRITE: Self = Self(1 << 0);
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    pub const REMOTE_READ: Self = Self(1 << 2);
    pub const REMOTE_ATOMIC: Self = Self(1 << 3);

    /// Get the raw access flags.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether all permissions in `other` are granted.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for Permission {
    /// Only local read, which is what a send buffer needs.
    fn default() -> Self {
        Self::EMPTY
    }
}

impl From<Permission> for i32 {
    fn from(p: Permission) -> Self {
        p.0 as _
    }
}

impl Add for Permission {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl AddAssign for Permission {
    fn add_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Sub for Permission {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 & !rhs.0)
    }
}

impl BitAnd for Permission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self + rhs
    }
}

/// A scatter-gather entry, i.e., a slice of a registered memory region that
/// a work request refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: LKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ops() {
        let p = Permission::LOCAL_WRITE | Permission::REMOTE_READ;
        assert!(p.contains(Permission::LOCAL_WRITE));
        assert!(!p.contains(Permission::REMOTE_WRITE));
        assert_eq!(p - Permission::REMOTE_READ, Permission::LOCAL_WRITE);
        assert_eq!(p & Permission::REMOTE_READ, Permission::REMOTE_READ);
        assert_eq!(i32::from(Permission::default()), 0);
    }

    #[cfg(rdma_core)]
    #[test]
    fn test_bits_match_verbs() {
        use crate::bindings::ibv_access_flags;

        assert_eq!(
            Permission::LOCAL_WRITE.bits(),
            ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0 as u32
        );
        assert_eq!(
            Permission::REMOTE_WRITE.bits(),
            ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0 as u32
        );
        assert_eq!(
            Permission::REMOTE_READ.bits(),
            ibv_access_flags::IBV_ACCESS_REMOTE_READ.0 as u32
        );
        assert_eq!(
            Permission::REMOTE_ATOMIC.bits(),
            ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC.0 as u32
        );
    }
}
