//! wideskies: encrypted PIR response computation
//!
//! Umbrella crate re-exporting the aggregation core. The command-line
//! responder lives in `crates/wideskies-responder`.

pub use wideskies_core::*;
