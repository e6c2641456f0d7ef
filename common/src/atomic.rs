//! Ergonomic wrapper over `std::sync::atomic` so producer engines can publish
//! a running flag across the capture thread and the calling thread without
//! reaching for a `Mutex` or naming an `Ordering` at every call site.
//!
//! All operations use `Ordering::SeqCst`: the flags this is used for (a
//! context's "should the producer keep running" signal) are checked at most
//! once per captured frame, so the extra cost against `Relaxed` is not worth
//! the risk of a torn stop signal.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};

pub trait EasyAtomic {
    type Item;

    /// Reads the current value.
    fn get(&self) -> Self::Item;

    /// Writes a new value, discarding the previous one.
    fn set(&self, value: Self::Item);

    /// Writes a new value and returns the previous one.
    fn update(&self, value: Self::Item) -> Self::Item;
}

macro_rules! easy_atomic {
    ($ty:ty, $item:ty) => {
        impl EasyAtomic for $ty {
            type Item = $item;

            fn get(&self) -> Self::Item {
                self.load(Ordering::SeqCst)
            }

            fn set(&self, value: Self::Item) {
                self.store(value, Ordering::SeqCst);
            }

            fn update(&self, value: Self::Item) -> Self::Item {
                self.swap(value, Ordering::SeqCst)
            }
        }
    };
}

easy_atomic!(AtomicBool, bool);
easy_atomic!(AtomicUsize, usize);
easy_atomic!(AtomicU64, u64);
easy_atomic!(AtomicI64, i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_get_set_update() {
        let flag = AtomicBool::new(false);
        assert_eq!(flag.get(), false);

        flag.set(true);
        assert_eq!(flag.get(), true);

        let previous = flag.update(false);
        assert_eq!(previous, true);
        assert_eq!(flag.get(), false);
    }
}
