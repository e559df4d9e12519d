//! Safety gate.
//!
//! The gate is a pure classifier: it reads capabilities, live status and the
//! operation's static requirements, and sorts every finding into a warning or
//! a critical issue. It never repairs state and never talks to the device.

mod gate;

pub use gate::{GateContext, PolicySafetyGate, SafetyGate};
