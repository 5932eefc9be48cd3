//! Ambient logging shim.
//!
//! Mirrors `debug_lib.h`'s compile-time on/off debug macros: when the
//! `defmt` feature is off (the default, e.g. for host unit tests) every
//! macro here compiles away to nothing, exactly like `debug_log(...)`
//! expanding to an empty macro when `DEBUG_ENABLE` isn't defined.

#[cfg(feature = "defmt")]
macro_rules! trace {
    ($($tt:tt)*) => { defmt::trace!($($tt)*) };
}
#[cfg(not(feature = "defmt"))]
macro_rules! trace {
    ($($tt:tt)*) => {};
}

#[cfg(feature = "defmt")]
macro_rules! debug {
    ($($tt:tt)*) => { defmt::debug!($($tt)*) };
}
#[cfg(not(feature = "defmt"))]
macro_rules! debug {
    ($($tt:tt)*) => {};
}

#[cfg(feature = "defmt")]
macro_rules! warn {
    ($($tt:tt)*) => { defmt::warn!($($tt)*) };
}
#[cfg(not(feature = "defmt"))]
macro_rules! warn {
    ($($tt:tt)*) => {};
}

pub(crate) use debug;
pub(crate) use trace;
pub(crate) use warn;

/// Dumps a byte buffer to the debug trace, the `defmt`-backed counterpart
/// of `debug_lib.h`'s `debug_log_dump`. Used by the request engine when a
/// decode fails, so a misbehaving hub's bytes are recoverable from logs.
#[allow(unused_variables)]
pub fn log_buffer(label: &str, buf: &[u8]) {
    #[cfg(feature = "defmt")]
    defmt::debug!("{}: {=[u8]:x}", label, buf);
}
