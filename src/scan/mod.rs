//! Peer discovery: filter compilation and the scan session actor.

pub mod filter;
pub mod scanner;
