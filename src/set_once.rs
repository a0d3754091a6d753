//! Set-once atomics — write a location at most once, read it forever.
//!
//! Every space-map header field follows the same discipline: the first
//! participant establishes the value with a compare-exchange from zero, and
//! everyone else verifies against what is already there.  The value must be
//! non-zero, which is what makes the "is it set yet?" test a plain
//! `load() != 0`.
//!
//! Success uses acquire ordering so a reader that observes the value also
//! observes everything its writer published before it; the conflict-path
//! load stays relaxed.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Outcome of a set-once attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOnce<T> {
    /// The location was zero; this call established the value.
    Set,
    /// The location already held exactly this value.
    AlreadyEqual,
    /// The location holds a different non-zero value.
    Conflict(T),
}

impl<T> SetOnce<T> {
    /// True unless the established value disagrees with ours.
    #[inline]
    pub fn is_ok(&self) -> bool {
        !matches!(self, SetOnce::Conflict(_))
    }
}

macro_rules! def_set_once {
    ($fn_name:ident, $atomic:ty, $int:ty) => {
        /// Set `ptr` to `value` iff it is currently unset (zero).
        /// `value` must be non-zero.
        #[inline]
        pub fn $fn_name(ptr: &$atomic, value: $int) -> SetOnce<$int> {
            debug_assert!(value != 0);
            match ptr.compare_exchange(0, value, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => SetOnce::Set,
                Err(prev) if prev == value => SetOnce::AlreadyEqual,
                Err(prev) => SetOnce::Conflict(prev),
            }
        }
    };
}

def_set_once!(set_once_u8,  AtomicU8,  u8);
def_set_once!(set_once_u16, AtomicU16, u16);
def_set_once!(set_once_u32, AtomicU32, u32);
def_set_once!(set_once_u64, AtomicU64, u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_verify_then_conflict() {
        let cell = AtomicU32::new(0);
        assert_eq!(set_once_u32(&cell, 7), SetOnce::Set);
        assert_eq!(set_once_u32(&cell, 7), SetOnce::AlreadyEqual);
        assert_eq!(set_once_u32(&cell, 8), SetOnce::Conflict(7));
        assert_eq!(cell.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn all_widths() {
        let a = AtomicU8::new(0);
        let b = AtomicU16::new(0);
        let c = AtomicU64::new(0);
        assert_eq!(set_once_u8(&a, 0xFF), SetOnce::Set);
        assert_eq!(set_once_u16(&b, 1), SetOnce::Set);
        assert_eq!(set_once_u64(&c, u64::MAX), SetOnce::Set);
        assert!(set_once_u8(&a, 0xFE).is_ok() == false);
    }

    #[test]
    fn racing_writers_agree_on_one_value() {
        use std::sync::Arc;

        let cell = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (1..=8u64)
            .map(|v| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || set_once_u64(&cell, v))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| **r == SetOnce::Set).count();
        assert_eq!(winners, 1);
        let settled = cell.load(Ordering::Relaxed);
        assert!((1..=8).contains(&settled));
    }
}
