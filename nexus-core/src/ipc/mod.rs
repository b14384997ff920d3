//! Event types published by the live engine to its host.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them over whatever bus it uses (the terminal app prints them).

pub mod events;
