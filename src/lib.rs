//! Real-time ingestion and routing pipeline for Solana-family DEX program
//! activity: WebSocket subscription management, per-DEX log/account parsing,
//! event classification, and price aggregation behind a uniform API.

pub mod config;
pub mod connection;
pub mod dex;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod events;
pub mod monitor;
pub mod price;
pub mod subscription;
