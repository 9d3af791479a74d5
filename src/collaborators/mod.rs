//! Clients for the HTTP control plane that runs next to every node: it answers degree queries
//!  and starts consensus runs.

pub mod degree;
pub mod kickoff;

mod http;
#[cfg(test)] mod test_server;
