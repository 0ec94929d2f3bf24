pub mod query_gate;

pub use query_gate::{ApprovedQuery, GateVerdict, SecurityGate};
