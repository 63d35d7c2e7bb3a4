// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 or the MIT license, at your
// option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Allocator-safe assertion and formatting macros.
//!
//! The standard library's `println`, `panic`, and `assert` macros may allocate
//! while formatting. Inside an allocator that is a problem: a failed assertion
//! in an allocation path re-enters the allocator and recurses until the stack
//! is gone. The macros in this crate (`alloc_assert!`, `alloc_debug_assert!`,
//! `alloc_assert_eq!`, `alloc_panic!`, `alloc_eprintln!`, ...) format into a
//! fixed stack buffer and write it with raw `libc::write`, so they never touch
//! the heap. Panics do not unwind: a message is flushed to stderr and the
//! process aborts.
//!
//! If a panic is triggered while another panic is already being reported (for
//! example because reporting itself trips an assertion), the process aborts
//! immediately rather than recursing.

#![no_std]

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

// Re-exported for use by the macro expansions; not part of the public API.
#[doc(hidden)]
pub use core::fmt::Write as FmtWrite;

#[doc(hidden)]
pub static STDOUT_MTX: spin::Mutex<()> = spin::Mutex::new(());
#[doc(hidden)]
pub static STDERR_MTX: spin::Mutex<()> = spin::Mutex::new(());

#[doc(hidden)]
pub static IS_PANICKING: AtomicBool = AtomicBool::new(false);

/// A buffered writer over a raw file descriptor.
///
/// Buffering keeps the common case down to one `write` syscall per message;
/// oversized messages are flushed in chunks. Write failures abort, as there is
/// nothing sensible left to do while reporting an allocator error.
#[doc(hidden)]
pub struct FdWriter {
    fd: libc::c_int,
    buf: [u8; 512],
    len: usize,
}

impl FdWriter {
    pub fn new(fd: libc::c_int) -> FdWriter {
        FdWriter { fd, buf: [0; 512], len: 0 }
    }

    pub fn flush(&mut self) {
        let mut rest = &self.buf[..self.len];
        while !rest.is_empty() {
            let written =
                unsafe { libc::write(self.fd, rest.as_ptr() as *const _, rest.len()) };
            if written < 1 {
                unsafe { libc::abort() };
            }
            rest = &rest[written as usize..];
        }
        self.len = 0;
    }
}

impl Write for FdWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for chunk in s.as_bytes().chunks(self.buf.len()) {
            if self.len + chunk.len() > self.buf.len() {
                self.flush();
            }
            self.buf[self.len..self.len + chunk.len()].copy_from_slice(chunk);
            self.len += chunk.len();
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn write_fmt(fd: libc::c_int, mtx: &spin::Mutex<()>, args: fmt::Arguments) {
    let guard = mtx.lock();
    let mut w = FdWriter::new(fd);
    if w.write_fmt(args).is_err() {
        unsafe { libc::abort() };
    }
    w.flush();
    drop(guard);
}

/// Aborts the process, reporting `args` on stderr first.
///
/// Detects recursive entry (a panic raised while reporting a panic) and aborts
/// without reporting in that case.
#[doc(hidden)]
pub fn panic_fmt(args: fmt::Arguments, file: &str, line: u32) -> ! {
    if IS_PANICKING.swap(true, Ordering::SeqCst) {
        unsafe { libc::abort() };
    }
    write_fmt(
        libc::STDERR_FILENO,
        &STDERR_MTX,
        format_args!("thread panicked at '{}', {}:{}\n", args, file, line),
    );
    unsafe { libc::abort() };
}

#[macro_export]
macro_rules! alloc_print {
    ($($arg:tt)*) => {
        $crate::write_fmt(1, &$crate::STDOUT_MTX, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! alloc_println {
    () => { $crate::alloc_print!("\n") };
    ($fmt:expr) => { $crate::alloc_print!(concat!($fmt, "\n")) };
    ($fmt:expr, $($arg:tt)*) => { $crate::alloc_print!(concat!($fmt, "\n"), $($arg)*) };
}

#[macro_export]
macro_rules! alloc_eprint {
    ($($arg:tt)*) => {
        $crate::write_fmt(2, &$crate::STDERR_MTX, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! alloc_eprintln {
    () => { $crate::alloc_eprint!("\n") };
    ($fmt:expr) => { $crate::alloc_eprint!(concat!($fmt, "\n")) };
    ($fmt:expr, $($arg:tt)*) => { $crate::alloc_eprint!(concat!($fmt, "\n"), $($arg)*) };
}

#[macro_export]
macro_rules! alloc_panic {
    () => { $crate::alloc_panic!("explicit panic") };
    ($($arg:tt)*) => {
        $crate::panic_fmt(format_args!($($arg)*), file!(), line!())
    };
}

#[macro_export]
macro_rules! alloc_assert {
    ($pred:expr) => {
        // Route through the message form so that formatting directives inside
        // the stringified predicate are not interpreted.
        $crate::alloc_assert!($pred, "{}", stringify!($pred))
    };
    ($pred:expr, $($arg:tt)*) => {
        if !($pred) {
            $crate::alloc_panic!("assertion failed: {}", format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! alloc_debug_assert {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            $crate::alloc_assert!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! alloc_assert_eq {
    ($a:expr, $b:expr) => {{
        let a = $a;
        let b = $b;
        $crate::alloc_assert!(
            a == b,
            "{} (evaluated to {:?} == {:?})",
            stringify!($a == $b),
            a,
            b
        );
    }};
    ($a:expr, $b:expr, $fmt:expr) => {{
        let a = $a;
        let b = $b;
        $crate::alloc_assert!(
            a == b,
            concat!("{} (evaluated to {:?} == {:?}): ", $fmt),
            stringify!($a == $b),
            a,
            b
        );
    }};
    ($a:expr, $b:expr, $fmt:expr, $($arg:tt)*) => {{
        let a = $a;
        let b = $b;
        $crate::alloc_assert!(
            a == b,
            concat!("{} (evaluated to {:?} == {:?}): ", $fmt),
            stringify!($a == $b),
            a,
            b,
            $($arg)*
        );
    }};
}

#[macro_export]
macro_rules! alloc_debug_assert_eq {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            $crate::alloc_assert_eq!($($arg)*);
        }
    };
}

/// `unwrap`/`expect` without the standard library's allocating panic path.
pub trait AllocUnwrap {
    type Item;
    fn alloc_unwrap(self) -> Self::Item;
    fn alloc_expect(self, msg: &str) -> Self::Item;
}

impl<T> AllocUnwrap for Option<T> {
    type Item = T;

    #[inline]
    fn alloc_unwrap(self) -> T {
        match self {
            Some(t) => t,
            None => alloc_panic!("called alloc_unwrap on a None value"),
        }
    }

    #[inline]
    fn alloc_expect(self, msg: &str) -> T {
        match self {
            Some(t) => t,
            None => alloc_panic!("{}", msg),
        }
    }
}

impl<T, E: fmt::Debug> AllocUnwrap for Result<T, E> {
    type Item = T;

    #[inline]
    fn alloc_unwrap(self) -> T {
        match self {
            Ok(t) => t,
            Err(e) => alloc_panic!("called alloc_unwrap on an Err value: {:?}", e),
        }
    }

    #[inline]
    fn alloc_expect(self, msg: &str) -> T {
        match self {
            Ok(t) => t,
            Err(e) => alloc_panic!("{}: {:?}", msg, e),
        }
    }
}

// Expand every macro once so that breakage is caught by `cargo check` even
// though the bodies must never run.
#[allow(unused)]
fn never_called() {
    alloc_print!("foo");
    alloc_println!("foo {}", 1);
    alloc_eprint!("foo");
    alloc_eprintln!("foo {}", 1);
    alloc_assert!(true);
    alloc_assert!(true, "foo");
    alloc_assert!(true, "foo: {}", "bar");
    alloc_debug_assert!(true);
    alloc_debug_assert!(true, "foo: {}", "bar");
    alloc_assert_eq!(1 + 2, 3);
    alloc_assert_eq!(1 + 2, 3, "foo");
    alloc_debug_assert_eq!(1 + 2, 3);
}
