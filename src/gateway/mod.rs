// Conduit — Gateway Module
//
// Unix Domain Socket (UDS) server for local agents and tools.
// Newline-delimited JSON-RPC 2.0 in front of the execution engine.

mod protocol;
mod uds;

pub use uds::UdsServer;
