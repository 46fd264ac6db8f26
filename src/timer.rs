//! Typed connection timers multiplexed onto a single timer-wheel entry.
//!
//! Each connection registers one expiration with its worker's wheel: the
//! earliest of the six typed timers. Mutations report whether that earliest
//! expiration moved so the caller knows to re-register.

use slog;

/// Declaration order is cancellation order on close: everything before
/// `Shutdown` is cancelled when the connection starts closing.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum TimerType {
    Idle,
    KeepAlive,
    LossDetection,
    AckDelay,
    Pacing,
    Shutdown,
}

impl TimerType {
    pub const COUNT: usize = 6;

    pub fn all() -> impl Iterator<Item = TimerType> {
        [
            TimerType::Idle,
            TimerType::KeepAlive,
            TimerType::LossDetection,
            TimerType::AckDelay,
            TimerType::Pacing,
            TimerType::Shutdown,
        ]
        .iter()
        .cloned()
    }
}

impl slog::Value for TimerType {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

#[derive(Debug, Default)]
pub struct TimerTable {
    /// Absolute expiration μs per type
    expirations: [Option<u64>; TimerType::COUNT],
    earliest: Option<u64>,
}

impl TimerTable {
    pub fn new() -> Self {
        TimerTable::default()
    }

    /// Arm a timer `delay` μs from `now`. Returns true when the cached
    /// earliest expiration changed and the wheel must be re-registered.
    pub fn set(&mut self, ty: TimerType, now: u64, delay: u64) -> bool {
        self.set_absolute(ty, now + delay)
    }

    pub fn set_absolute(&mut self, ty: TimerType, time: u64) -> bool {
        self.expirations[ty as usize] = Some(time);
        self.refresh_earliest()
    }

    pub fn cancel(&mut self, ty: TimerType) -> bool {
        if self.expirations[ty as usize].take().is_none() {
            return false;
        }
        self.refresh_earliest()
    }

    pub fn is_set(&self, ty: TimerType) -> bool {
        self.expirations[ty as usize].is_some()
    }

    pub fn expiration(&self, ty: TimerType) -> Option<u64> {
        self.expirations[ty as usize]
    }

    /// Cached earliest expiration across all armed timers.
    pub fn next_expiration(&self) -> Option<u64> {
        self.earliest
    }

    /// Pop every timer due at `now`, earliest first.
    pub fn take_expired(&mut self, now: u64) -> Vec<TimerType> {
        let mut due: Vec<TimerType> = TimerType::all()
            .filter(|&ty| self.expirations[ty as usize].map_or(false, |t| t <= now))
            .collect();
        due.sort_by_key(|&ty| self.expirations[ty as usize]);
        for &ty in &due {
            self.expirations[ty as usize] = None;
        }
        if !due.is_empty() {
            self.refresh_earliest();
        }
        due
    }

    fn refresh_earliest(&mut self) -> bool {
        let new = self.expirations.iter().filter_map(|&x| x).min();
        if new == self.earliest {
            return false;
        }
        self.earliest = new;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_tracks_mutations() {
        let mut timers = TimerTable::new();
        assert!(timers.set(TimerType::Idle, 0, 100));
        assert!(!timers.set(TimerType::KeepAlive, 0, 200));
        assert_eq!(timers.next_expiration(), Some(100));
        assert!(timers.set(TimerType::LossDetection, 0, 50));
        assert_eq!(timers.next_expiration(), Some(50));
        assert!(timers.cancel(TimerType::LossDetection));
        assert_eq!(timers.next_expiration(), Some(100));
    }

    #[test]
    fn cancel_unset_is_noop() {
        let mut timers = TimerTable::new();
        assert!(!timers.cancel(TimerType::Shutdown));
    }

    #[test]
    fn expiry_pops_in_time_order() {
        let mut timers = TimerTable::new();
        timers.set(TimerType::KeepAlive, 0, 30);
        timers.set(TimerType::Idle, 0, 10);
        timers.set(TimerType::Shutdown, 0, 99);
        assert_eq!(
            timers.take_expired(30),
            vec![TimerType::Idle, TimerType::KeepAlive]
        );
        assert_eq!(timers.next_expiration(), Some(99));
        assert!(timers.take_expired(30).is_empty());
    }
}
