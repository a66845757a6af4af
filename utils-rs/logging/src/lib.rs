// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Application-wide logging built on the slog stack.
//!
//! Log records go to stderr (the application's user-facing console output
//! goes to stdout and must not be interleaved with diagnostics), are
//! filtered via the `RUST_LOG` environment variable and drained
//! asynchronously.

use lazy_static::lazy_static;
use slog::Drain;

use std::env;

// The macros in `macros` expand to paths inside this reexport
pub use slog;

/// How many records the asynchronous drain buffers before blocking producers
const ASYNC_CHANNEL_SIZE: usize = 2048;

lazy_static! {
    /// Process-wide root logger
    pub static ref LOGGER: slog::Logger = build_logger();
}

fn build_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::LogBuilder::new(drain)
        .filter(None, slog::FilterLevel::Info)
        .parse(&env::var("RUST_LOG").unwrap_or_default())
        .build()
        .fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(ASYNC_CHANNEL_SIZE)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!())
}

/// Keeps the logging subsystem pinned for the application lifetime.
/// Hold the instance returned by `setup_for_app` in `main` until exit.
pub struct LoggerGuard {
    _private: (),
}

/// Initialize logging for an application binary and return the guard that
/// must live for the rest of `main`.
pub fn setup_for_app() -> LoggerGuard {
    lazy_static::initialize(&LOGGER);
    LoggerGuard { _private: () }
}

#[macro_export]
macro_rules! trace (
    ($($arg:tt)*) => { $crate::slog::trace!(&*$crate::LOGGER, $($arg)*) }
);

#[macro_export]
macro_rules! debug (
    ($($arg:tt)*) => { $crate::slog::debug!(&*$crate::LOGGER, $($arg)*) }
);

#[macro_export]
macro_rules! info (
    ($($arg:tt)*) => { $crate::slog::info!(&*$crate::LOGGER, $($arg)*) }
);

#[macro_export]
macro_rules! warn (
    ($($arg:tt)*) => { $crate::slog::warn!(&*$crate::LOGGER, $($arg)*) }
);

#[macro_export]
macro_rules! error (
    ($($arg:tt)*) => { $crate::slog::error!(&*$crate::LOGGER, $($arg)*) }
);

/// Import target for the logging macros: `use ii_logging::macros::*;`
pub mod macros {
    pub use crate::{debug, error, info, trace, warn};
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_logger_available() {
        let _guard = setup_for_app();
        info!("logger initialized from test");
    }
}
