extern crate time;

use std::cell::Cell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, Ordering};

static GLOBAL_THREAD_ID: AtomicI64 = AtomicI64::new(0);

/// Dense id of the calling thread, assigned on first use and starting from 0.
pub fn get_thread_id() -> i64 {
    thread_local!(static THREAD_ID: Cell<i64> = Cell::new(-1););
    THREAD_ID.with(|tid| {
        if -1 == tid.get() {
            tid.set(GLOBAL_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        tid.get()
    })
}

#[repr(align(64))]
pub struct WrappedAlign64Type<T>(pub T);

impl<T> Default for WrappedAlign64Type<T>
where
    T: Default,
{
    fn default() -> Self {
        WrappedAlign64Type(T::default())
    }
}

impl<T> Deref for WrappedAlign64Type<T> {
    type Target = T;

    fn deref(&self) -> &<Self as Deref>::Target {
        &self.0
    }
}

impl<T> DerefMut for WrappedAlign64Type<T> {
    fn deref_mut(&mut self) -> &mut <Self as Deref>::Target {
        &mut self.0
    }
}

pub fn get_cur_microseconds_time() -> i64 {
    let timespec = time::get_time();
    timespec.sec * 1_000_000 + timespec.nsec as i64 / 1_000
}

#[inline]
pub fn pause() {
    hint::spin_loop();
}

mod test {

    #[test]
    fn test_align() {
        use std::mem;
        use util::WrappedAlign64Type;

        let v = WrappedAlign64Type(7_u64);
        assert_eq!(mem::align_of_val(&v), 64);
        assert_eq!(&v as *const _ as usize % 64, 0);
        assert_eq!(*v, 7);
    }

    #[test]
    fn test_thread_id() {
        use std::thread;
        use util::get_thread_id;

        let main_id = get_thread_id();
        assert_eq!(main_id, get_thread_id());
        let other_id = thread::spawn(get_thread_id).join().unwrap();
        assert_ne!(main_id, other_id);
    }

    #[test]
    fn test_clock_moves_forward() {
        use util::get_cur_microseconds_time;

        let a = get_cur_microseconds_time();
        assert!(a > 0);
        let b = get_cur_microseconds_time();
        assert!(b >= a);
    }
}
