//! Distributed averaging over a custom message transport.
//!
//! Every node holds a matrix of numbers, and all nodes together converge towards the element-wise
//!  average of their matrices by repeatedly exchanging their current estimate with their direct
//!  neighbors in the network graph. There is no coordinator and no global view: each node only
//!  knows its neighbors and their degrees.
//!
//! ## Consensus
//!
//! A run consists of a fixed number of iterations. In each iteration a node
//! * sends its current estimate to all neighbors, tagged with run id and iteration number
//! * waits until it has the same iteration's estimate from every neighbor
//! * moves its estimate towards the neighbors' estimates: `x += sum(w_j * (x_j - x))`
//!
//! The weights are Metropolis-Hastings weights `w_j = 1 / (max(deg(self), deg(j)) + 1)`. They
//!  are symmetric, so the sum of all estimates is preserved in every iteration, and the estimates
//!  converge to the average for any connected graph.
//!
//! A neighbor that does not deliver its data within a timeout aborts the run without a result.
//!
//! ## Transport
//!
//! Messages are split into packets that fit into a single datagram of the configured MTU
//!  (576 by default, since that is guaranteed to work without path MTU discovery). Packets are
//!  sent over UDP, or over TCP with one length-prefixed frame per packet. There is no
//!  acknowledgement or re-sending: UDP packets that get lost leave the message incomplete, and
//!  it is up to the consensus protocol to deal with that.
//!
//! Packet layout - numbers are little endian:
//! ```ascii
//! 0: seq_total (u16) - index of the last packet in the message, i.e. number of packets - 1
//! 2: seq_num (u16) - index of this packet in the message
//! 4: tag (4 bytes) - identifies the message together with the sender's IP address
//! 8: payload fragment
//! ```
//!
//! The receiver collects packets per sender IP and tag, and stores the complete message once it
//!  has all of them. A completed message can be taken exactly once.
//!
//! The control plane (starting runs, answering degree queries) is HTTP based and not part of
//!  this crate, apart from the clients in [collaborators].

pub mod collaborators;
pub mod consensus;
pub mod test_util;
pub mod transport;
pub mod util;
