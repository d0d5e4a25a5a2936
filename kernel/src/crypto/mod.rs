//! Cryptographic infrastructure.
//!
//! The numerical core shared by kernel crypto: arbitrary-precision signed
//! integers with modular arithmetic, Montgomery multiplication and
//! sliding-window modular exponentiation.

pub mod mpint;

pub use mpint::Mpint;
