//! Debug-hard, release-soft invariant checks.
//!
//! The reference C source (`BUS_ASSERT` in `bus_internal_types.h`) aborts the
//! process whenever an internal invariant is violated, in every build. That
//! is too blunt for a library embedded in someone else's process: a
//! corrupted `RxInfo` slot should be loud in development and logged (not
//! fatal) in production. Ported from the `safe_panic!`/`safe_assert!` pair
//! this workspace already uses elsewhere.

#[macro_export]
macro_rules! safe_panic {
    ($($arg:tt)*) => (if cfg!(debug_assertions) { panic!($($arg)*); } else { tracing::error!($($arg)*) })
}

#[macro_export]
macro_rules! safe_assert {
    ($cond:expr $(,)?) => {
        if cfg!(debug_assertions) {
            debug_assert!($cond);
        } else if !$cond {
            tracing::error!("ASSERT FAILED: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if cfg!(debug_assertions) {
            debug_assert!($cond, $($arg)+);
        } else if !$cond {
            tracing::error!("ASSERT FAILED: {}", format!($($arg)+));
        }
    };
}
