//! # magik-session
//!
//! Drives Smallworld Magik sessions and the method finder class browser over
//! their line-oriented pipes.
//!
//! ## Architecture
//!
//! - **session**: Interactive session engine: command submission, prompt boundaries, confirmations, kill and cancel
//! - **browser**: Class browser engine: query dispatch, result parsing, source location lookup
//! - **lines**: Byte stream to line reassembly, including unterminated prompts
//! - **patterns**: Regular expressions and line classification for both protocols
//! - **style**: ANSI highlighting of session output
//! - **method**: Method records built from method finder output
//! - **query**: Search parameters and their wire encoding
//! - **transport**: Child process spawning and stderr draining
//! - **aliases**: `gis_aliases` and `LAYERED_PRODUCTS` parsing, runalias command lines
//! - **config**: Settings file and flag/environment resolution
//! - **error**: Engine fault taxonomy

pub mod aliases;
pub mod browser;
pub mod cli;
pub mod config;
pub mod error;
pub mod lines;
pub mod method;
pub mod patterns;
pub mod query;
pub mod session;
pub mod style;
pub mod transport;
