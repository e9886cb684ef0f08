//! # Tower Flowgate
//!
//! `tower-flowgate` puts a [`flowgate::FlowGate`] in front of any
//! [Tower](https://github.com/tower-rs/tower) service.
//!
//! Each request enters a flowgate resource, named either once for the whole
//! service or per request by a [`ResourceExtractor`], and exits it when the
//! inner service's response is ready:
//!
//! 1. **Blocking**: a request refused by a flow rule fails with
//!    [`GateError::Blocked`] and never reaches the inner service.
//! 2. **Pacing**: a request admitted by a throttling rule is held on a tokio
//!    timer for its turn, without occupying a worker thread.
//! 3. **Statistics**: the response time is recorded on exit, and an inner
//!    failure is recorded as an error of the resource.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`GateError`], allowing automatic conversion
//!   to HTTP status codes (429, 500).

mod error;
mod layer;
mod service;


pub use error::GateError;
pub use layer::FixedResource;
pub use layer::FlowGateLayer;
pub use layer::ResourceExtractor;
pub use service::FlowGateService;
pub use service::ResponseFuture;
