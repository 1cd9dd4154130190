// ===============================
// src/lib.rs
// ===============================
pub mod cache;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod domain;
pub mod feed;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod notify;
pub mod pnl;
pub mod recorder;
pub mod retry;
pub mod stream;
pub mod supervisor;
