//! What goes into a spider run and what comes out of it. Transport & encoding of these
//! types is up to whoever drives the engine; everything here is plain serde.

pub mod job;
pub mod request;
pub mod result;

pub use job::{AddressFamily, Job};
pub use request::{RequestError, RunRequest};
pub use result::{
    result_columns, ConnectivityState, EcnState, FlowDetail, HopObservation, RawResult,
    RunResult, TraceSummary,
};
