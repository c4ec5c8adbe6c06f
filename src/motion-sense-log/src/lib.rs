//! Logging macros for the motion sense crates.
//!
//! `trace!`, `debug!`, `info!`, `warn!` and `error!` forward to `defmt` when the `defmt`
//! feature is enabled and to the `log` facade when the `log` feature is enabled. Without either
//! feature they only evaluate their arguments, so callers pass `Copy` values or references.
//!
//! Format strings must stick to `{}` and `{:?}` so they are valid for both backends.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]
#![deny(clippy::pedantic)]

#[cfg(all(feature = "defmt", feature = "log"))]
compile_error!(r#"feature "defmt" and feature "log" cannot be enabled at the same time"#);

#[cfg(feature = "defmt")]
pub mod defmt {
    //! Re-exports of `defmt` for types implementing `Format`.

    #[doc(hidden)]
    pub mod hidden {
        // The defmt macros expect `defmt` to be in scope at the call site.
        #[doc(hidden)]
        pub use defmt;
    }

    pub use defmt::{Debug2Format, Display2Format, Format};
}

#[cfg(feature = "log")]
#[doc(hidden)]
pub mod hidden {
    pub use log;
}

// `$d` carries a `$` into the generated macros.
macro_rules! define_log_macros {
    ($d:tt $($level:ident),*) => {$(
        #[doc = concat!("Logs a message at the ", stringify!($level), " level.")]
        #[cfg(feature = "defmt")]
        #[macro_export]
        macro_rules! $level {
            ($d($d arg:tt)*) => {{
                use $d crate::defmt::hidden::defmt;
                defmt::$level!($d($d arg)*);
            }};
        }

        #[doc = concat!("Logs a message at the ", stringify!($level), " level.")]
        #[cfg(feature = "log")]
        #[macro_export]
        macro_rules! $level {
            ($d($d arg:tt)*) => {{
                $d crate::hidden::log::$level!($d($d arg)*);
            }};
        }

        #[doc = concat!("Discards a ", stringify!($level), " level message.")]
        #[cfg(not(any(feature = "defmt", feature = "log")))]
        #[macro_export]
        macro_rules! $level {
            ($d($d arg:tt)*) => {{
                let _ = ($d($d arg)*);
            }};
        }
    )*};
}

define_log_macros!($ trace, debug, info, warn, error);
