//! Property-based soundness tests.
//!
//! Run with: `cargo test --test property`

mod scan_soundness;
