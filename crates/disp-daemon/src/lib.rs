//! `disp-daemon` library surface: the pieces `main.rs` wires together, kept
//! in a lib target so integration tests can exercise them without spawning
//! the real binary.

pub mod mqtt_broker;
pub mod watchdog;
