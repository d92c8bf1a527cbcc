//! Readiness bitmask shared by transceivers, acceptors and selectors.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// The socket operation a non-blocking call is waiting for.
///
/// A transceiver returns one of these bits when it cannot make further
/// progress without blocking; the caller registers the bit with the
/// selector and calls back once the selector reports it ready.
/// [`SocketOperation::NONE`] means the call completed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SocketOperation(u8);

impl SocketOperation {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const CONNECT: Self = Self(4);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Returns true if any bit of `other` is set in `self`.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn wants_read(self) -> bool {
        self.intersects(Self::READ)
    }

    /// A pending connect completes when the socket becomes writable, so
    /// backends watch both bits through the same OS filter.
    pub(crate) fn wants_write(self) -> bool {
        self.intersects(Self::WRITE | Self::CONNECT)
    }
}

impl BitOr for SocketOperation {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SocketOperation {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for SocketOperation {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for SocketOperation {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for SocketOperation {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & 0b111)
    }
}

impl fmt::Debug for SocketOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("NONE");
        }
        let mut names = Vec::new();
        if self.intersects(Self::READ) {
            names.push("READ");
        }
        if self.intersects(Self::WRITE) {
            names.push("WRITE");
        }
        if self.intersects(Self::CONNECT) {
            names.push("CONNECT");
        }
        f.write_str(&names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::SocketOperation;

    #[test]
    fn bit_operations() {
        let both = SocketOperation::READ | SocketOperation::WRITE;
        assert!(both.contains(SocketOperation::READ));
        assert!(!both.contains(SocketOperation::CONNECT));
        assert_eq!(both & !SocketOperation::READ, SocketOperation::WRITE);
        assert!(SocketOperation::CONNECT.wants_write());
        assert_eq!(format!("{:?}", both), "READ|WRITE");
    }
}
