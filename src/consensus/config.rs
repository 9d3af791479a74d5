use std::time::Duration;

use anyhow::bail;

#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    /// number of rounds of exchanging estimates with all neighbors (`tc`)
    pub iterations: u32,
    /// distinguishes concurrent or consecutive runs on the wire - only the lowest byte is used
    pub run_id: u64,

    /// how long to wait for a single neighbor's outstanding data in one iteration before the
    ///  entire run is abandoned
    pub missing_data_timeout: Duration,
    /// pause between polls for outstanding data
    pub retry_backoff: Duration,

    /// If `true`, neighbors whose degree could not be determined (and who therefore have weight
    ///  0) are neither sent to nor waited for. Otherwise they take part in the exchange although
    ///  their data has no effect on the result.
    pub skip_zero_weight_neighbors: bool,
}

impl ConsensusConfig {
    pub fn new(iterations: u32, run_id: u64) -> ConsensusConfig {
        ConsensusConfig {
            iterations,
            run_id,
            missing_data_timeout: Duration::from_secs(15),
            retry_backoff: Duration::from_millis(10),
            skip_zero_weight_neighbors: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry_backoff.is_zero() {
            bail!("retry backoff must be positive");
        }
        if self.retry_backoff > self.missing_data_timeout {
            bail!("retry backoff {:?} is longer than the missing data timeout {:?}", self.retry_backoff, self.missing_data_timeout);
        }
        Ok(())
    }
}
