//! Domain layer: sessions, messaging and shared contracts

pub mod messaging;
pub mod session;
pub mod shared;
