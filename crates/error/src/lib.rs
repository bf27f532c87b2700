//! Error handling infrastructure for the kmem workspace.
//!
//! Provides the `define_error!` macro for consistent subsystem error enums.
//! Each generated type carries a subsystem tag, per-variant numeric codes,
//! a `Display` impl, and a `core::error::Error` impl whose `source()` walks
//! into nested variants.
//!
//! ## Usage
//!
//! ### Simple errors (no inner data)
//! ```ignore
//! define_error! {
//!     pub enum CacheError("cache") {
//!         Exhausted = 1 => "backing store exhausted",
//!         BadHandle = 2 => "stale cache handle",
//!     }
//! }
//! ```
//!
//! ### Nested errors (with inner error type)
//! ```ignore
//! define_error! {
//!     pub enum BringupError("bringup") {
//!         Cache(CacheError) = 1 => "cache layer failed",
//!     }
//! }
//! ```

#![no_std]

/// Define a subsystem error enum with numeric codes and uniform formatting.
///
/// Simple variants render as `tag-NN: description`; nested variants append
/// the inner error and expose it through `Error::source()`.
#[macro_export]
macro_rules! define_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($tag:literal) {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $(($inner:ty))? = $code:literal => $desc:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant $(($inner))?,
            )*
        }

        impl $name {
            /// Subsystem tag for this error type.
            pub const SUBSYSTEM: &'static str = $tag;

            /// Numeric code of this variant, unique within the subsystem.
            pub const fn code(&self) -> u16 {
                match self {
                    $(
                        $crate::define_error!(@pattern $variant $(($inner))? _unused) => $code,
                    )*
                }
            }

            /// Static description of this variant.
            pub const fn description(&self) -> &'static str {
                match self {
                    $(
                        $crate::define_error!(@pattern $variant $(($inner))? _unused) => $desc,
                    )*
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $(
                        $crate::define_error!(@pattern $variant $(($inner))? inner) => {
                            $crate::define_error!(@display self f $(($inner))? inner)
                        }
                    )*
                }
            }
        }

        impl core::error::Error for $name {
            fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
                match self {
                    $(
                        $crate::define_error!(@pattern $variant $(($inner))? inner) => {
                            $crate::define_error!(@source $(($inner))? inner)
                        }
                    )*
                }
            }
        }
    };

    // Match-arm patterns for simple and nested variants.
    (@pattern $variant:ident ($inner:ty) $bind:ident) => { Self::$variant($bind) };
    (@pattern $variant:ident $bind:ident) => { Self::$variant };

    // Display bodies.
    (@display $self:ident $f:ident ($inner:ty) $bind:ident) => {
        write!($f, "{}-{:02}: {} ({})", Self::SUBSYSTEM, $self.code(), $self.description(), $bind)
    };
    (@display $self:ident $f:ident $bind:ident) => {
        write!($f, "{}-{:02}: {}", Self::SUBSYSTEM, $self.code(), $self.description())
    };

    // Error::source bodies.
    (@source ($inner:ty) $bind:ident) => { Some($bind) };
    (@source $bind:ident) => { None };
}

#[cfg(test)]
mod tests {
    use core::error::Error;

    define_error! {
        /// Test error type
        pub enum TestError("test") {
            /// First error
            First = 1 => "first failure",
            /// Second error
            Second = 2 => "second failure",
        }
    }

    define_error! {
        pub enum OuterError("outer") {
            Inner(TestError) = 1 => "wrapped failure",
        }
    }

    #[test]
    fn codes_and_descriptions() {
        assert_eq!(TestError::First.code(), 1);
        assert_eq!(TestError::Second.code(), 2);
        assert_eq!(TestError::First.description(), "first failure");
        assert_eq!(OuterError::Inner(TestError::Second).code(), 1);
        assert_eq!(TestError::SUBSYSTEM, "test");
    }

    #[test]
    fn display_format() {
        extern crate std;
        use std::format;
        assert_eq!(format!("{}", TestError::First), "test-01: first failure");
        assert_eq!(
            format!("{}", OuterError::Inner(TestError::First)),
            "outer-01: wrapped failure (test-01: first failure)"
        );
    }

    #[test]
    fn source_chain() {
        extern crate std;
        use std::string::ToString;
        let outer = OuterError::Inner(TestError::Second);
        let inner = outer.source().expect("nested variant has a source");
        assert_eq!(inner.to_string(), TestError::Second.to_string());
        assert!(TestError::First.source().is_none());
    }

    #[test]
    fn derives() {
        let e = TestError::First;
        let copied = e;
        assert_eq!(e, copied);
        extern crate std;
        use std::format;
        assert!(format!("{:?}", TestError::First).contains("First"));
    }
}
