//! Request handlers.

pub mod detect;
pub mod health;

pub use detect::*;
pub use health::*;
