//! Execution request dispatch.
//!
//! Clients address a request to one host by writing an [`ExecutionRequest`]
//! under `executionRequests/{hostId}/{requestId}`. The addressed host's
//! [`RequestDispatcher`] claims it through the [`ProcessedRequestLedger`],
//! runs it in the sandbox and reports progress as a [`ClientStatusRecord`]
//! at `clients/{clientId}`.

pub mod dispatcher;
pub mod ledger;
pub mod request;

pub use dispatcher::{DiscardReason, DispatchOutcome, RequestDispatcher};
pub use ledger::{Claim, ProcessedRequestLedger};
pub use request::{ClientStatusRecord, ExecutionRequest, JobStatus, ResourceHints};
