#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! obs-mcp library: an obs-websocket v5 RPC client and the MCP tool layer on top.
//!
//! - `protocol`: opcodes, payloads, and the JSON frame codec
//! - `auth`: challenge/response authentication string
//! - `handshake`: Hello → Identify → Identified state machine
//! - `correlator`: pending-request table with timeouts
//! - `events`: event handler registry and broadcast stream
//! - `client`: the session: socket task, lifecycle, requests
//! - `config`: CLI / file / env configuration
//! - `mcp`, `tools`: stdio JSON-RPC server exposing the client as tools

pub mod auth;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod handshake;
pub mod mcp;
pub mod protocol;
pub mod tools;

pub use client::{ClientOptions, LifecycleEvent, ObsClient, SessionState};
pub use error::ObsError;
pub use events::ObsEvent;
pub use protocol::EventSubscription;
