//! Build-time configuration helpers.
//!
//! Tunables are read from `CONFIG_*` environment variables when the crate using them is
//! compiled, so they end up as plain constants in the firmware image. A value that does not
//! parse fails the build, naming the variable and what it configures.

#![no_std]
#![deny(missing_docs)]
#![deny(clippy::pedantic)]

#[doc(hidden)]
pub mod env;

macro_rules! define_env_with_default_macro {
    ($macro_name:ident, $parse_fn_name:ident, $output_type_name:literal) => {
        #[doc = concat!(
            "Reads an environment variable at build time as ",
            $output_type_name,
            ", falling back to a default.\n\n",
            "Usable in const context. Takes the variable name, the default, and a short ",
            "description used in the build error when the value does not parse.",
        )]
        #[macro_export]
        macro_rules! $macro_name {
            ($env_var:literal, $default:expr, $doc:literal) => {
                match option_env!($env_var) {
                    None => $default,
                    Some(str_value) => match $crate::env::konst::primitive::$parse_fn_name(str_value) {
                        Ok(value) => value,
                        Err(_) => $crate::env::const_panic::concat_panic!(
                            "invalid value `",
                            str_value,
                            "` for ",
                            $env_var,
                            " (",
                            $doc,
                            "): expected ",
                            $output_type_name,
                        ),
                    },
                }
            };
        }
    };
}

define_env_with_default_macro!(usize_from_env_or, parse_usize, "a usize");
define_env_with_default_macro!(u32_from_env_or, parse_u32, "a u32");
define_env_with_default_macro!(bool_from_env_or, parse_bool, "a bool");
