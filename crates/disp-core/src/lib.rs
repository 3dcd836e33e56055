//! Queue dispatch and completion state machine: the router, joiner,
//! readiness predicate, and dispatcher described in the component design.
//! `disp-daemon` wires this crate to a real broker client; `disp-core`
//! itself never talks to a socket.

pub mod advisory;
pub mod broker;
pub mod dispatcher;
pub mod inbound;
pub mod readiness;
pub mod router;

pub use advisory::AdvisoryReadiness;
pub use broker::{Broker, NoopBroker};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use inbound::Handlers;
