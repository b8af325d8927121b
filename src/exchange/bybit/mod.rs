//! Bybit v5 adapter

pub mod client;
pub mod models;
