//! # access-csv
//!
//! Incrementally converts an append-only Apache access log ("combined"
//! format) into day-partitioned CSV files and serves them over HTTP.
//!
//! ## Architecture
//!
//! ```text
//!  monolithic:
//!  ┌────────────┐   ┌───────────┐   ┌─────────────┐   ┌──────────┐
//!  │ access_log │──▶│ LogTailer │──▶│ CsvPipeline │──▶│ {day}.csv│──▶ HTTP
//!  └────────────┘   └───────────┘   └──────┬──────┘   └──────────┘
//!                                          ▼
//!                                      Registry (SQLite)
//!
//!  split:
//!  watcher: access_log ─▶ LogTailer ─▶ RelayPublisher ══ws══▶
//!  collector:              ══ws══▶ RelaySubscriber ─▶ CsvPipeline ─▶ {day}.csv
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! access-csv init                 # create the registry database
//! access-csv run                  # tail + CSV + download API in one process
//! access-csv watch                # split topology: watcher side
//! access-csv collect              # split topology: collector side
//! access-csv files                # list registered day files
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Log records and registry entries |
//! | [`parser`] | Access-log line grammar |
//! | [`registry`] | Day-file registry (SQLite and in-memory) |
//! | [`sink`] | Append-only CSV writer |
//! | [`pipeline`] | Parse, rotate, persist |
//! | [`tailer`] | Polling tail-diff over the log |
//! | [`relay`] | WebSocket relay between watcher and collector |
//! | [`server`] | CSV download HTTP server |
//! | [`runner`] | Process topologies |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod clock;
pub mod config;
pub mod db;
pub mod inspect;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod registry;
pub mod relay;
pub mod runner;
pub mod server;
pub mod sink;
pub mod tailer;
