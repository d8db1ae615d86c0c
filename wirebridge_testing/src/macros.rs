//! Assertion macros for awaiting bridge operations.

/// Await a read from an inbound stream and panic with the call site on
/// failure.
#[macro_export]
macro_rules! read_expect {
    ($fut:expr) => {{
        $fut.await
            .expect(concat!("read failed at ", file!(), ":", line!()))
    }};
    ($fut:expr, $msg:expr) => {{
        let m = ::std::format!("{msg} at {}:{}", file!(), line!(), msg = $msg);
        $fut.await.expect(&m)
    }};
}

/// Await a write and panic with the call site on failure.
#[macro_export]
macro_rules! write_expect {
    ($fut:expr) => {{
        $fut.await
            .expect(concat!("write failed at ", file!(), ":", line!()))
    }};
    ($fut:expr, $msg:expr) => {{
        let m = ::std::format!("{msg} at {}:{}", file!(), line!(), msg = $msg);
        $fut.await.expect(&m)
    }};
}

pub use crate::{read_expect, write_expect};
