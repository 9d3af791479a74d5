//! Distributed averaging: every node repeatedly moves its estimate towards its neighbors'
//!  estimates, weighted so that all nodes converge to the network-wide average.

pub mod config;
pub mod iterative;
pub mod matrix;
pub mod tag;
pub mod weights;
