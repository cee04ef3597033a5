//! Infrastructure layer: protocol stacks and media transports

pub mod media;
pub mod protocols;
