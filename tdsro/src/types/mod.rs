//! Type integration with external types
//!
//! Implementation [`Decode`][d] and [`Into<Value>`][v] for external types.
//!
//! Available for:
//!
//! - [`time`][::time]'s [`PrimitiveDateTime`][tp] and [`Date`][td], requires `time` feature
//!
//! [d]: crate::Decode
//! [v]: crate::Value
//! [tp]: ::time::PrimitiveDateTime
//! [td]: ::time::Date

#[cfg(feature = "time")]
mod time;
