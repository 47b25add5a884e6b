//! Agent side of the tunnel: the reconnection driver.
//!
//! The driver opens the outbound WebSocket to the control plane, serves the
//! initiator session until it ends, classifies the failure, and retries
//! after a fixed delay. Authorization failures and a lost upstream identity
//! are terminal; transient socket errors retry under the configured policy.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classify;
pub mod driver;

pub use classify::{classify_io, classify_ws, FailureCause};
pub use driver::{connect_authorizer, AgentConfig, Driver, DriverOutcome, RetryPolicy, WorkPoller};
