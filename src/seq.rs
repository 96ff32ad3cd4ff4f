use std::fmt::{Display, Formatter};

/// An RUDP sequence number: 8 bits with modulo-256 wrap-around.
///
/// Ordering uses the half-window convention: `a` precedes `b` iff
/// `(b - a) mod 256` lies in `(0, 128]`. Naive integer comparison is wrong
/// across the wrap, so this type does not implement `Ord`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SequenceNumber(u8);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: u8) -> Self {
        Self(value)
    }

    pub fn to_raw(self) -> u8 {
        self.0
    }

    pub fn next(self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    pub fn prev(self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_sub(1))
    }

    /// `true` iff `self` precedes `other` in wrap-around order.
    pub fn is_before(self, other: SequenceNumber) -> bool {
        let diff = other.0.wrapping_sub(self.0);
        diff > 0 && diff <= 128
    }

    /// `true` iff `self` is `other` or precedes it.
    pub fn is_at_or_before(self, other: SequenceNumber) -> bool {
        self == other || self.is_before(other)
    }

    /// Wrap-around distance from `from` to `self`, i.e. how many increments
    /// of `from` reach `self`.
    pub fn distance_from(self, from: SequenceNumber) -> u8 {
        self.0.wrapping_sub(from.0)
    }
}
