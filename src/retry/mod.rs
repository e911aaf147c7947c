// src/retry/mod.rs
mod backoff;

pub use backoff::{is_temporary, AcceptBackoff};
