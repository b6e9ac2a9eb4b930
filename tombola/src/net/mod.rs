//! The networking modules handle all the communication between the agencies and the server.

pub mod message;
pub mod shared;
pub mod transport;
