//! Built-in protocol transport engine speaking JSON-RPC 2.0.

pub mod engine;
pub mod rpc;
