//! Atomic counter cells and the integer kinds they can hold.
//!
//! A [`CounterCell`] is the unit of accumulation in the cache: one atomic
//! integer, shared through an `Arc` between the fast map, the staging map and
//! any caller that is in the middle of an update.
//!
//! The supported widths are expressed by the sealed [`Number`] trait, which
//! binds each integer kind to its native atomic type:
//!
//! | Kind  | Atomic       |
//! |-------|--------------|
//! | `i32` | `AtomicI32`  |
//! | `u32` | `AtomicU32`  |
//! | `i64` | `AtomicI64`  |
//! | `u64` | `AtomicU64`  |
//!
//! 8 and 16 bit widths are deliberately absent: they have no native
//! read-modify-write support on every target.
//!
//! # Memory Ordering
//!
//! All cell operations use `Ordering::Relaxed`. A cell carries no data besides
//! its own value, and read-modify-write operations on a single atomic are
//! totally ordered regardless of the ordering argument, so `fetch_add` and the
//! draining `swap` can never lose each other's contribution.

use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

use atomic_traits::{fetch, Atomic};
use crossbeam_utils::CachePadded;
use num_traits::{PrimInt, WrappingAdd, Zero};

mod sealed {
    pub trait Sealed {}
}

/// An integer kind that can back a [`CounterCell`].
///
/// Implemented for `i32`, `u32`, `i64` and `u64` only. Arithmetic wraps on
/// overflow, exactly like the underlying atomic `fetch_add`.
pub trait Number:
    PrimInt + WrappingAdd + Zero + Debug + Display + Default + Send + Sync + 'static + sealed::Sealed
{
    /// The native atomic type for this width.
    type Atomic: Atomic<Type = Self> + fetch::Add<Type = Self> + Debug + Send + Sync;
}

macro_rules! impl_number {
    ($($ty:ty => $atomic:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Number for $ty {
                type Atomic = $atomic;
            }
        )*
    };
}

impl_number! {
    i32 => AtomicI32,
    u32 => AtomicU32,
    i64 => AtomicI64,
    u64 => AtomicU64,
}

/// A single atomic accumulator.
///
/// The value is wrapped in [`CachePadded`] so that two hot keys never share a
/// cache line, which would otherwise turn independent increments on different
/// keys into contended writes.
///
/// # Examples
///
/// ```rust
/// use coalesce::cell::CounterCell;
///
/// let cell = CounterCell::<u64>::new(3);
/// assert_eq!(cell.fetch_add(2), 3);
/// assert_eq!(cell.take(), 5);
/// assert_eq!(cell.load(), 0);
/// ```
pub struct CounterCell<V: Number> {
    value: CachePadded<V::Atomic>,
}

impl<V: Number> CounterCell<V> {
    /// Creates a cell holding `initial`.
    pub fn new(initial: V) -> Self {
        Self {
            value: CachePadded::new(<V::Atomic as Atomic>::new(initial)),
        }
    }

    /// Adds `delta` (wrapping) and returns the previous value.
    #[inline]
    pub fn fetch_add(&self, delta: V) -> V {
        fetch::Add::fetch_add(&*self.value, delta, Ordering::Relaxed)
    }

    /// Replaces the value and returns the previous one.
    #[inline]
    pub fn swap(&self, new: V) -> V {
        Atomic::swap(&*self.value, new, Ordering::Relaxed)
    }

    /// Resets the cell to zero, returning what it held.
    ///
    /// This is the drain primitive used by commits.
    #[inline]
    pub fn take(&self) -> V {
        self.swap(V::zero())
    }

    /// Returns the current value without modifying it.
    #[inline]
    pub fn load(&self) -> V {
        Atomic::load(&*self.value, Ordering::Relaxed)
    }
}

impl<V: Number> Default for CounterCell<V> {
    fn default() -> Self {
        Self::new(V::zero())
    }
}

impl<V: Number> Debug for CounterCell<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CounterCell({})", self.load())
    }
}
