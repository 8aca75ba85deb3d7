//! Desired-state reconciliation for remote hosts.
//!
//! Each host is described by a TOML file listing packages to install or
//! purge, services to start or restart, and files to distribute. A run
//! connects to each host over SSH (or the local shell), checks the package
//! database, issues only the corrective commands that are needed, and pushes
//! files concurrently with ownership and permissions applied.
//!
//! The public API is organised in layers, leaf first:
//!
//! - **[`exec`]**: the command execution seam
//! - **[`transport`]**: sessions, connection backends and file channels
//! - **[`reconcile`]**: dpkg-backed check-then-act for one rule
//! - **[`distribute`]**: concurrent file push
//! - **[`batch`]**: ordered, continue-on-failure rule lists
//! - **[`host`]**: the [`Host`](host::Host) capability surface
//! - **[`config`]** and **[`commands`]**: host files and subcommands
#![deny(clippy::or_fun_call)]
#![deny(clippy::bool_to_int_with_if)]

pub mod batch;
pub mod cli;
pub mod commands;
pub mod config;
pub mod distribute;
pub mod error;
pub mod exec;
pub mod host;
pub mod logging;
pub mod reconcile;
pub mod transport;
