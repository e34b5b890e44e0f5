//! tto replicates a database between two hosts.
//!
//! The sender dumps the source database on a schedule and streams each dump
//! into a working directory on the receiver host over SSH. The receiver
//! watches that directory and restores every newly published dump into the
//! target database. The two processes coordinate only through marker and
//! lock files in the working directory (see [`registry`]).

pub mod app;
pub mod cli;
pub mod config;
pub mod database;
pub mod dump;
pub mod error;
pub mod receiver;
pub mod registry;
pub mod retention;
pub mod retry;
pub mod schedule;
pub mod sender;
pub mod signal;
pub mod streaming;
pub mod transport;
pub mod watch;

pub use dump::DumpIdentifier;
pub use error::{Error, ErrorKind, Result};
pub use registry::{ConsumeOutcome, LockedRegistry};
pub use retention::RetentionBuffer;
