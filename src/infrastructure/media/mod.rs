//! Media plane transports

pub mod rtp;
