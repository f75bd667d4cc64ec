//! Real-time alpha-signal pipeline for the Kalshi prediction-market exchange.
//!
//! The crate ingests every public trade, ticker update, orderbook
//! delta/snapshot, and lifecycle event over an authenticated WebSocket;
//! maintains the current orderbook and regime view in a shared state store;
//! derives informed-flow, open-interest, microstructure, cross-market, and
//! lifecycle signals; fuses them into regime-weighted composite scores; and
//! persists everything to a time-series database through batched, retrying
//! writers.
//!
//! Components are wired together by the process binaries under `src/bin/`:
//! one process each for ingestion + discovery, the database writers, the
//! signal processors, the aggregator, monitoring, and backfill.
//!
//! # Environment
//!
//! Credentials come from `KALSHI_API_KEY_ID` and `KALSHI_PRIVATE_KEY_PATH`;
//! everything else (endpoints, Redis/Postgres coordinates, tuning) has
//! defaults documented in [`config`].

pub mod auth;
pub mod bus;
pub mod config;
pub mod discovery;
pub mod error;
pub mod ingest;
pub mod models;
pub mod monitor;
pub mod persist;
pub mod rest;
pub mod signals;
pub mod state;

pub use auth::AuthSigner;
pub use config::AppConfig;
pub use error::{Error, Result};
