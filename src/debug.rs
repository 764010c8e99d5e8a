// The MIT License (MIT)
//
// Copyright (c) 2020, National Cybersecurity Agency of France (ANSSI)
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Tools to help debugging the engine.
//!
//! Debug output goes through a process-wide `slog` logger. It is compiled in
//! only for debug and test builds, and can additionally be silenced at runtime
//! through [`DISABLE_DEBUG`].
//!
//! [`DISABLE_DEBUG`]: static.DISABLE_DEBUG.html

#[cfg(any(debug_assertions, test))]
use core::sync::atomic::{AtomicBool, Ordering};
#[cfg(any(debug_assertions, test))]
use slog::Drain;

/// Set to `true` to disable debug output at runtime in a debug or test build.
#[cfg(any(debug_assertions, test))]
pub static DISABLE_DEBUG: AtomicBool = AtomicBool::new(false);

#[cfg(any(debug_assertions, test))]
lazy_static::lazy_static! {
    /// Logger every `debug!` invocation funnels into.
    static ref LOGGER: slog::Logger = slog::Logger::root(
        slog_term::FullFormat::new(slog_term::PlainSyncDecorator::new(std::io::stdout()))
            .build()
            .fuse(),
        slog::o!(),
    );
}

/// Writes a `&str` to the debug logger.
#[cfg(any(debug_assertions, test))]
pub fn output_str(x: &str) {
    if !DISABLE_DEBUG.load(Ordering::SeqCst) {
        slog::debug!(&*LOGGER, "{}", x);
    }
}

/// Formats a message to the debug logger, `println!`-like, but only in debug
/// or test builds.
#[cfg(any(debug_assertions, test))]
#[macro_export]
macro_rules! debug {
    ($msg:expr) => {{
        $crate::debug::output_str($msg);
    }};
    ($fmt:expr, $($arg:tt)+) => {{
        $crate::debug::output_str(&format!($fmt, $($arg)+));
    }};
}

/// Printing debug message.
#[cfg(not(any(debug_assertions, test)))]
#[macro_export]
macro_rules! debug {
    ($msg:expr) => {};
    ($fmt:expr, $($arg:tt)+) => {};
}

/// Makes an error and add an error message to the debug logger at evaluation
/// time.
#[macro_export]
macro_rules! err {
    ($x:expr) => {{
        let e = $x;
        debug!("Error at {}:{}: {:?}", file!(), line!(), e);
        Err(e)
    }};
}

/// Forwards an error up (`try!`-like) while adding an error message to the
/// debug logger.
#[macro_export]
macro_rules! get {
    ($x:expr) => {{
        match $x {
            Ok(x) => x,
            Err(e) => {
                debug!("  Error at {}:{}: {:?}", file!(), line!(), e);
                Err(e)?
            }
        }
    }};
}
