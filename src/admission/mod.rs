//! Request admission: the per-request pipeline and its inputs and outputs.

mod coordinator;
mod outcome;
mod request;
mod routes;

pub use coordinator::AdmissionCoordinator;
pub use outcome::{
    BoundaryResponse, Decision, ErrorBody, Rejection, RejectionCause, ACCESS_DENIED_MESSAGE,
    DDOS_BLOCKED_MESSAGE,
};
pub use request::{RequestMetadata, API_KEY_HEADER};
pub use routes::RouteTable;
