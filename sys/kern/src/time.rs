// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.

/// In-kernel timestamp representation.
///
/// This is measured in ticks of the system timer since kernel start. At 64
/// bits it does not wrap in any deployment we care about, so arithmetic here
/// is deliberately non-wrapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Returns the timestamp `ticks` ticks after `self`. This is how wait
    /// budgets become deadlines.
    pub fn plus_ticks(self, ticks: u32) -> Self {
        Timestamp(self.0 + u64::from(ticks))
    }

    /// Advances this timestamp by one tick, returning the new value.
    pub fn succ(self) -> Self {
        Timestamp(self.0 + 1)
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budgets_become_deadlines() {
        let now = Timestamp::from(100);
        assert_eq!(now.plus_ticks(0), now);
        assert_eq!(now.plus_ticks(5), Timestamp::from(105));
        assert!(now.plus_ticks(1) > now);
    }
}
