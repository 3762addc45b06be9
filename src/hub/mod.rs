//! The connection hub: per-connection send queues, project rooms, and
//! fan-out.

pub mod connection;
pub mod hub;
pub mod room;

pub use connection::{ConnId, Connection, OutboundQueue};
pub use hub::Hub;
pub use room::Rooms;
