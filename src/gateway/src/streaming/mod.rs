//! SSE streaming: the stream hub and its fan-out machinery. Event types
//! and wire framing live in `lattice_shared::types::events`.

pub mod hub;

pub use hub::StreamHub;
