#![warn(missing_docs)]

//! # af-host
//!
//! Host side of pre-request scripting.
//!
//! [`Orchestrator::send`] is the only entry point. For each send it resolves
//! template markers, loads the node's persisted storage, runs the attached
//! script in a fresh [`af_sandbox::SandboxHandle`], applies every mutation
//! message to a [`WorkingCopy`] as it arrives, answers the script's bridge
//! calls through the same [`Transport`] as the primary request, and finally
//! transmits the working copy.
//!
//! A script failure aborts the send with [`SendError::Script`] and the
//! transport is never invoked. Primary transport failures are reported in
//! [`SendOutcome::response`].

pub mod error;
pub mod node;
pub mod orchestrator;
pub mod resolve;
pub mod storage;
pub mod transport;
pub mod working;

pub use error::SendError;
pub use node::{RequestModel, RequestNode};
pub use orchestrator::{Orchestrator, OrchestratorConfig, ScriptLog, SendOutcome};
pub use resolve::{PassthroughResolver, TemplateResolver, VariableResolver};
pub use storage::{MemoryStorageCache, NodeStorage, StorageCache, StorageCacheConfig};
pub use transport::{
    prepare_request, FormPart, PreparedBody, PreparedRequest, ReqwestTransport, Transport,
    TransportConfig,
};
pub use working::WorkingCopy;
