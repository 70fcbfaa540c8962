use std::{fmt, ops};

/// Readiness interest used when attaching a transport.
///
/// An interest set tells the poller which operations to monitor on a
/// transport. Only readable and writable readiness are portable; an empty
/// set is valid and means the transport is attached but dormant until
/// [`Poller::add_events`] or a blocked read/write re-arms it.
///
/// [`Poller::add_events`]: crate::Poller::add_events
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interest(u8);

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

impl Interest {
    /// The empty interest set.
    pub const NONE: Interest = Interest(0);

    /// Interest in readable readiness.
    pub const READABLE: Interest = Interest(READABLE);

    /// Interest in writable readiness.
    pub const WRITABLE: Interest = Interest(WRITABLE);

    /// Add together two `Interest` values.
    ///
    /// This does the same thing as the `BitOr` implementation, but is a
    /// constant function.
    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// Removes `other` from the set.
    pub const fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// Returns true if the set is empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the set includes readable readiness.
    pub const fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    /// Returns true if the set includes writable readiness.
    pub const fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub(crate) const fn bits(self) -> u8 {
        self.0
    }

    pub(crate) const fn from_bits(bits: u8) -> Interest {
        Interest(bits & (READABLE | WRITABLE))
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_readable() {
            fmt.write_str("READABLE")?;
            one = true;
        }
        if self.is_writable() {
            if one {
                fmt.write_str(" | ")?;
            }
            fmt.write_str("WRITABLE")?;
            one = true;
        }
        if !one {
            fmt.write_str("NONE")?;
        }
        Ok(())
    }
}

/// How readiness for an attachment is reported.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventMode {
    /// Readiness is reported whenever the condition holds.
    Level,
    /// Readiness is reported when the state transitions. On backends whose
    /// primitive is level-triggered this is emulated by stripping the
    /// interest bit after delivery; a blocked read or write re-arms it.
    Edge,
    /// Use edge-triggered delivery if the backend supports it, level
    /// otherwise.
    EdgeOrLevel,
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn add_remove_round_trip() {
        let set = Interest::READABLE | Interest::WRITABLE;
        assert!(set.is_readable() && set.is_writable());
        let set = set.remove(Interest::WRITABLE);
        assert_eq!(set, Interest::READABLE);
        assert_eq!(set.remove(Interest::READABLE), Interest::NONE);
    }

    #[test]
    fn debug_names_bits() {
        assert_eq!(format!("{:?}", Interest::NONE), "NONE");
        assert_eq!(
            format!("{:?}", Interest::READABLE | Interest::WRITABLE),
            "READABLE | WRITABLE"
        );
    }
}
