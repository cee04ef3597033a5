//! Wire protocol implementations

pub mod msrp;
pub mod sip;
