//! USB enumeration watchdog.
//!
//! If the host has not configured the device within the enumeration
//! timeout, the firmware resets itself and tries again.  The attempt count
//! lives in a register that survives a soft reset (GPREGRET2 on nRF52), so
//! a host that never enumerates us stops the cycle after a bounded number
//! of resets instead of reboot-looping.

use crate::config::USB_ENUM_MAX_RETRIES;

/// Reset-surviving storage for the attempt counter.
pub trait RetryCounter {
    fn load(&self) -> u8;
    fn store(&mut self, value: u8);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WatchdogVerdict {
    /// Enumerated; counter cleared.
    Satisfied,
    /// Reset the device and try again.  `attempt` starts at 1.
    Reset { attempt: u8 },
    /// Out of attempts; stay up with USB inert.
    GiveUp,
}

pub struct EnumerationWatchdog<C> {
    counter: C,
    max_retries: u8,
}

impl<C: RetryCounter> EnumerationWatchdog<C> {
    pub fn new(counter: C) -> Self {
        Self::with_max_retries(counter, USB_ENUM_MAX_RETRIES)
    }

    pub fn with_max_retries(counter: C, max_retries: u8) -> Self {
        Self {
            counter,
            max_retries,
        }
    }

    /// Resets already spent before this boot.
    pub fn attempts(&self) -> u8 {
        self.counter.load()
    }

    /// Judge the state of USB at the end of the enumeration timeout, or
    /// when the controller reports an error.
    pub fn check(&mut self, enumerated: bool) -> WatchdogVerdict {
        let spent = self.counter.load();
        if enumerated {
            if spent != 0 {
                info!("USB enumerated after {} reset(s)", spent);
                self.counter.store(0);
            }
            return WatchdogVerdict::Satisfied;
        }
        if spent < self.max_retries {
            let attempt = spent + 1;
            warn!("USB not enumerated, reset {}/{}", attempt, self.max_retries);
            self.counter.store(attempt);
            WatchdogVerdict::Reset { attempt }
        } else {
            error!("USB enumeration failed {} times, giving up", spent);
            self.counter.store(0);
            WatchdogVerdict::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stands in for the retention register across simulated resets.
    struct Retained<'a>(&'a core::cell::Cell<u8>);

    impl RetryCounter for Retained<'_> {
        fn load(&self) -> u8 {
            self.0.get()
        }
        fn store(&mut self, value: u8) {
            self.0.set(value);
        }
    }

    #[test]
    fn enumerated_first_time() {
        let reg = core::cell::Cell::new(0);
        let mut wd = EnumerationWatchdog::new(Retained(&reg));
        assert_eq!(wd.check(true), WatchdogVerdict::Satisfied);
        assert_eq!(reg.get(), 0);
    }

    #[test]
    fn bounded_resets_then_give_up() {
        let reg = core::cell::Cell::new(0);
        let mut verdicts = Vec::new();
        // each iteration is one boot
        for _ in 0..4 {
            let mut wd = EnumerationWatchdog::with_max_retries(Retained(&reg), 3);
            verdicts.push(wd.check(false));
        }
        assert_eq!(
            verdicts,
            vec![
                WatchdogVerdict::Reset { attempt: 1 },
                WatchdogVerdict::Reset { attempt: 2 },
                WatchdogVerdict::Reset { attempt: 3 },
                WatchdogVerdict::GiveUp,
            ]
        );
        assert_eq!(reg.get(), 0);
    }

    #[test]
    fn success_after_reset_clears_counter() {
        let reg = core::cell::Cell::new(2);
        let mut wd = EnumerationWatchdog::new(Retained(&reg));
        assert_eq!(wd.attempts(), 2);
        assert_eq!(wd.check(true), WatchdogVerdict::Satisfied);
        assert_eq!(reg.get(), 0);
    }
}
