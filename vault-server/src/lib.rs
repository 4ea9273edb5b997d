//! # strata-vault-server
//!
//! Authenticated, permissioned file storage server.
//!
//! This crate implements a storage server that:
//! - Speaks a framed request/response protocol over TCP (optionally TLS)
//! - Authenticates users with rotating session tokens
//! - Enforces per-file roles, quotas and file-count limits
//! - Pins peer certificates on first use and accepts signed rotations
//! - Persists everything in SQLite through a tiered lease pool
//!
//! ## Architecture
//!
//! ```text
//!  client ──► Connection ──► dispatch ──► handlers ──┬──► AuthManager
//!               │  (frames)     (session)            ├──► StorageCache ─┐
//!               │                                    ├──► FileStore     │
//!               ▼                                    └──► storage/*  ◄──┤
//!           TrustManager                                    │           │
//!                                                      LeasePool ◄──────┘
//!                                                   (high/normal/low)
//!                                                           │
//!                                                        SQLite
//! ```
//!
//! ## Protocol
//!
//! Every frame is a fixed-size header followed by an auth component and a
//! JSON body. Responses carry a `class:reason` code such as `0:a`, `1:read`
//! or `2:perm`; see `vault_types::ResponseCode`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod activity;
pub mod auth;
pub mod cache;
pub mod cleanup;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod files;
mod handlers;
pub mod http;
pub mod limits;
pub mod pool;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod trust;

pub use config::Config;
pub use error::{Result, VaultError};
pub use server::{VaultMetrics, VaultServer};
