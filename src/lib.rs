// src/lib.rs
pub mod conn;
pub mod context;
pub mod retry;
pub mod server;
