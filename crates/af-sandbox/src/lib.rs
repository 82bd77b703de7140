#![warn(missing_docs)]

//! # af-sandbox
//!
//! V8 sandbox for pre-request scripts.
//!
//! A script runs as an async routine in a deno_core isolate with no module
//! loading, filesystem, process or environment access. It sees one object,
//! `af`, whose request fields and stores are backed by Rust state. Every
//! accepted write produces a [`SandboxMessage`] for the host, so the host can
//! mirror the script's changes incrementally without trusting a final echo.
//!
//! ## Layout
//!
//! - [`store`]: typed key/value stores with admission rules and change messages
//! - [`request`], [`context`]: the request facade, body store and `af` root
//! - [`bridge`]: correlated HTTP calls from the script to the host
//! - [`executor`]: the single-use message loop that owns the isolate
//! - [`host`]: [`SandboxHandle`], in-process or child-process
//! - [`protocol`]: the message contract and length-prefixed framing
//!
//! ## Isolation
//!
//! - **Fresh isolate per evaluation**: a loop accepts exactly one `evaluate`
//! - **Minimal globals**: `Deno`, `eval` and `Function` are removed, and the
//!   constructors of every function kind (plain, async, generator, async generator)
//!   are cut off, before any script runs
//! - **Pre-flight validation**: oversized scripts and NUL bytes are rejected early
//! - **Optional process boundary**: [`ExecutionMode::ChildProcess`] runs V8 in `af-sandbox-worker`

pub mod audit;
pub mod bridge;
pub mod context;
pub mod error;
pub mod executor;
pub mod host;
pub mod model;
pub mod ops;
pub mod protocol;
pub mod request;
pub mod store;
pub mod validator;

pub use audit::{AuditLogger, ScriptAuditBuilder, ScriptAuditEntry, ScriptOutcome};
pub use context::AfContext;
pub use error::SandboxError;
pub use executor::{ExecutionMode, SandboxConfig, SandboxLoop, SandboxState};
pub use host::{Responder, SandboxHandle};
pub use model::{
    BinaryBody, BinaryMode, BodyData, BodyType, FormDataKind, FormDataValue, HeaderValue,
    InitialState, VariableKind, VariableValue,
};
pub use protocol::{
    BridgeRequest, HostMessage, HttpResult, LogLevel, SandboxMessage, ScalarField, WorkerConfig,
};
pub use store::{Change, StoreName};
