//! Crate-level test support and end-to-end scenarios.
