// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.

/// In-kernel timestamp representation.
///
/// This is measured in ticks of the kernel timer; see
/// [`config::TIMER_FREQ`](crate::config::TIMER_FREQ) for the tick rate.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Tick(u64);

impl From<u64> for Tick {
    fn from(v: u64) -> Self {
        Tick(v)
    }
}

impl From<Tick> for u64 {
    fn from(v: Tick) -> Self {
        v.0
    }
}

impl core::ops::Add<u64> for Tick {
    type Output = Tick;

    fn add(self, rhs: u64) -> Tick {
        Tick(self.0 + rhs)
    }
}

impl Tick {
    /// The far-future tick used as a heap sentinel.
    pub const MAX: Tick = Tick(u64::MAX);
}
