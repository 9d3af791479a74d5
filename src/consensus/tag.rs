//! Tags for consensus messages: the first byte distinguishes runs, the other three count
//!  iterations (little endian). Both wrap around, so a run must finish before its tags are
//!  reused 256 runs later.

use crate::transport::tag::Tag;

const ITERATION_MODULUS: u64 = 1 << 24;

pub fn build_tag(run_id: u64, iteration: u64) -> Tag {
    let iteration = (iteration % ITERATION_MODULUS) as u32;
    let [it0, it1, it2, _] = iteration.to_le_bytes();
    Tag([(run_id % 256) as u8, it0, it1, it2])
}

/// Returns run discriminator and iteration number of a consensus tag.
pub fn parse_tag(tag: Tag) -> (u8, u32) {
    let [run_id, it0, it1, it2] = tag.0;
    (run_id, u32::from_le_bytes([it0, it1, it2, 0]))
}
