//! Logging setup and module-gated logging macros.
//!
//! Chatty modules (sampling loops, the connection driver) gate their output
//! behind a module-level flag:
//! ```rust,ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_debug, log_info};
//!
//! log_info!("only logged while ENABLE_LOGS is true");
//! ```

use log::LevelFilter;

/// Installs `env_logger`. `RUST_LOG` overrides the default level; `verbose`
/// raises the crate's own modules to `Debug`. Safe to call more than once.
pub fn init_logging(verbose: bool) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Info);
    if verbose {
        builder.filter_module("pulsetrack_lib", LevelFilter::Debug);
    }
    builder.parse_default_env();

    if builder.try_init().is_err() {
        log::debug!("logger already initialised");
    }
}

/// Info logging gated on the calling module's `ENABLE_LOGS` const.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// Warn logging gated on the calling module's `ENABLE_LOGS` const.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// Error logging gated on the calling module's `ENABLE_LOGS` const.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}

/// Debug logging gated on the calling module's `ENABLE_LOGS` const.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*);
        }
    };
}
