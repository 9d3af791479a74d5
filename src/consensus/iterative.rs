use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::consensus::config::ConsensusConfig;
use crate::consensus::matrix::Matrix;
use crate::consensus::tag::{build_tag, parse_tag};
use crate::consensus::weights::Weights;
use crate::transport::error::TransportError;
use crate::transport::tag::Tag;
use crate::transport::Transport;

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("iteration {iteration}: no data from {neighbor} after waiting {waited:?}")]
    TimedOut { iteration: u32, neighbor: IpAddr, waited: Duration },

    /// The transport refused to send, e.g. because it was closed. This is not a network
    ///  problem, so there is no point in waiting for neighbors.
    #[error("iteration {iteration}: could not send to {neighbor}: {source}")]
    Transport { iteration: u32, neighbor: IpAddr, #[source] source: TransportError },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunState {
    Idle,
    /// zero-based
    Running { iteration: u32 },
    Converged,
    TimedOut,
    Failed,
}

/// A single consensus run: `iterations` rounds of sending the current estimate to all
///  neighbors and moving it towards theirs by the neighbors' mixing weights.
///
/// Every round waits for data from all neighbors before it completes. Data that does not
///  arrive within `missing_data_timeout` aborts the run, and there is no result in that case -
///  a partially updated estimate is not an approximation of the average.
pub struct ConsensusRun {
    config: ConsensusConfig,
    transport: Arc<dyn Transport>,
    weights: Weights,
    state: RunState,
}

impl ConsensusRun {
    pub fn new(config: ConsensusConfig, transport: Arc<dyn Transport>, weights: Weights) -> anyhow::Result<ConsensusRun> {
        config.validate()?;
        Ok(ConsensusRun {
            config,
            transport,
            weights,
            state: RunState::Idle,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    #[instrument(name = "consensus", skip_all, fields(run_id = self.config.run_id))]
    pub async fn run(&mut self, initial: Matrix) -> Result<Matrix, ConsensusError> {
        let neighbors = self.participating_neighbors();
        debug!(iterations = self.config.iterations, num_neighbors = neighbors.len(), "starting consensus run");

        let mut missing_data: BTreeMap<IpAddr, VecDeque<Tag>> = neighbors.iter()
            .map(|&(neighbor, _)| (neighbor, VecDeque::new()))
            .collect();

        let mut estimate = initial;
        for iteration in 0..self.config.iterations {
            self.state = RunState::Running { iteration };
            info!("{} | Data: {}", iteration + 1, estimate);

            let previous = estimate;
            let tag = build_tag(self.config.run_id, iteration.into());
            if let Err(e) = self.transmit(iteration, &previous, tag, &neighbors).await {
                self.state = RunState::Failed;
                error!("consensus run failed: {}", e);
                return Err(e);
            }

            let mut weighted_sum = Matrix::zeros(previous.rows(), previous.cols());
            for &(neighbor, weight) in &neighbors {
                let queue = missing_data.entry(neighbor).or_default();

                match self.transport.get(neighbor, tag) {
                    Some(data) => accumulate(&mut weighted_sum, &previous, neighbor, weight, tag, data),
                    None => {
                        trace!(?neighbor, ?tag, "data not there yet");
                        if !queue.contains(&tag) {
                            queue.push_back(tag);
                        }
                    }
                }

                if let Err(e) = self.drain_missing_data(iteration, neighbor, weight, queue, &previous, &mut weighted_sum).await {
                    self.state = RunState::TimedOut;
                    error!("consensus run failed: {}", e);
                    return Err(e);
                }
            }

            debug!(iteration, "weighted sum of differences: {}", weighted_sum);
            estimate = previous;
            // shapes were checked when the differences were accumulated
            if let Err(e) = estimate.add_scaled(1.0, &weighted_sum) {
                warn!("discarding weighted sum: {}", e);
            }
        }

        self.state = RunState::Converged;
        info!("consensus run finished: {}", estimate);
        Ok(estimate)
    }

    fn participating_neighbors(&self) -> Vec<(IpAddr, f64)> {
        self.weights.iter()
            .filter(|(neighbor, weight)| {
                let skip = self.config.skip_zero_weight_neighbors && **weight == 0.0;
                if skip {
                    debug!(?neighbor, "skipping neighbor with weight 0");
                }
                !skip
            })
            .map(|(&neighbor, &weight)| (neighbor, weight))
            .collect()
    }

    /// Sends the estimate to all neighbors. Incomplete sends are logged and otherwise ignored
    ///  since the neighbor may still get the data, but a transport error aborts the run.
    async fn transmit(&self, iteration: u32, estimate: &Matrix, tag: Tag, neighbors: &[(IpAddr, f64)]) -> Result<(), ConsensusError> {
        let payload = estimate.to_bytes();
        for &(neighbor, _) in neighbors {
            trace!(?neighbor, ?tag, "transmitting estimate");
            match self.transport.send(neighbor, &payload, tag).await {
                Ok(true) => {}
                Ok(false) => warn!(?neighbor, ?tag, "estimate was not sent completely"),
                Err(source) => return Err(ConsensusError::Transport { iteration, neighbor, source }),
            }
        }
        Ok(())
    }

    /// Polls for all outstanding data of a neighbor until it has arrived or the timeout expires.
    async fn drain_missing_data(
        &self,
        iteration: u32,
        neighbor: IpAddr,
        weight: f64,
        queue: &mut VecDeque<Tag>,
        previous: &Matrix,
        weighted_sum: &mut Matrix,
    ) -> Result<(), ConsensusError> {
        let started = Instant::now();

        while let Some(missing_tag) = queue.pop_front() {
            if let Some(data) = self.transport.get(neighbor, missing_tag) {
                debug!(?neighbor, iteration = parse_tag(missing_tag).1, "picked up missing data");
                accumulate(weighted_sum, previous, neighbor, weight, missing_tag, data);
                continue;
            }
            queue.push_back(missing_tag);

            let waited = started.elapsed();
            if waited >= self.config.missing_data_timeout {
                return Err(ConsensusError::TimedOut { iteration, neighbor, waited });
            }
            sleep(self.config.retry_backoff).await;
        }
        Ok(())
    }
}

/// `weighted_sum += weight * (neighbor's estimate - previous)`. Data that can not be used is
///  logged and ignored, it still counts as received.
fn accumulate(weighted_sum: &mut Matrix, previous: &Matrix, neighbor: IpAddr, weight: f64, tag: Tag, data: Bytes) {
    let diff = Matrix::deser(&mut data.as_ref())
        .and_then(|neighbor_estimate| neighbor_estimate.try_sub(previous));

    match diff {
        Ok(diff) => {
            trace!(?neighbor, ?tag, "diff: {}", diff);
            if let Err(e) = weighted_sum.add_scaled(weight, &diff) {
                warn!(?neighbor, ?tag, "ignoring data: {}", e);
            }
        }
        Err(e) => warn!(?neighbor, ?tag, "ignoring data: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::in_memory_transport::InMemoryNetwork;
    use crate::transport::communicator::Communicator;
    use crate::transport::config::{Protocol, TransportConfig};
    use crate::transport::MockTransport;
    use rstest::rstest;
    use std::net::Ipv4Addr;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    const C: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3));

    fn weights(w: &[(IpAddr, f64)]) -> Weights {
        w.iter().cloned().collect()
    }

    /// runs consensus on all nodes concurrently, returning results in node order
    async fn run_all(network: &Arc<InMemoryNetwork>, nodes: Vec<(IpAddr, Weights, Matrix)>, iterations: u32) -> Vec<Result<Matrix, ConsensusError>> {
        let handles = nodes.into_iter()
            .map(|(addr, weights, initial)| {
                let transport = Arc::new(network.transport(addr));
                tokio::spawn(async move {
                    let mut run = ConsensusRun::new(ConsensusConfig::new(iterations, 7), transport, weights).unwrap();
                    run.run(initial).await
                })
            })
            .collect::<Vec<_>>();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_values_remain_unchanged() {
        let network = InMemoryNetwork::new();
        let w = 1.0 / 3.0;
        let results = run_all(&network, vec![
            (A, weights(&[(B, w), (C, w)]), Matrix::scalar(4.0)),
            (B, weights(&[(A, w), (C, w)]), Matrix::scalar(4.0)),
            (C, weights(&[(A, w), (B, w)]), Matrix::scalar(4.0)),
        ], 1).await;

        for result in results {
            assert_eq!(result.unwrap(), Matrix::scalar(4.0));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fully_connected_reaches_average_in_one_iteration() {
        let network = InMemoryNetwork::new();
        let w = 1.0 / 3.0;
        let results = run_all(&network, vec![
            (A, weights(&[(B, w), (C, w)]), Matrix::new(1, 2, vec![1.0, 10.0]).unwrap()),
            (B, weights(&[(A, w), (C, w)]), Matrix::new(1, 2, vec![2.0, 20.0]).unwrap()),
            (C, weights(&[(A, w), (B, w)]), Matrix::new(1, 2, vec![3.0, 30.0]).unwrap()),
        ], 1).await;

        for result in results {
            let result = result.unwrap();
            assert!((result.data()[0] - 2.0).abs() < 1e-12);
            assert!((result.data()[1] - 20.0).abs() < 1e-12);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_graph_converges() {
        // A - B - C: degrees 1, 2, 1
        let network = InMemoryNetwork::new();
        let w = 1.0 / 3.0;
        let results = run_all(&network, vec![
            (A, weights(&[(B, w)]), Matrix::scalar(0.0)),
            (B, weights(&[(A, w), (C, w)]), Matrix::scalar(3.0)),
            (C, weights(&[(B, w)]), Matrix::scalar(9.0)),
        ], 60).await;

        let results = results.into_iter()
            .map(|r| r.unwrap().data()[0])
            .collect::<Vec<_>>();
        for r in &results {
            assert!((r - 4.0).abs() < 1e-6, "{:?}", results);
        }
        // the weights are symmetric, so the sum is preserved in every iteration
        assert!((results.iter().sum::<f64>() - 12.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_neighbor_times_out() {
        let mut transport = MockTransport::new();
        transport.expect_send()
            .returning(|_, _, _| Ok(true));
        transport.expect_get()
            .returning(|_, _| None);

        let mut run = ConsensusRun::new(ConsensusConfig::new(3, 1), Arc::new(transport), weights(&[(B, 0.5)])).unwrap();
        assert_eq!(run.state(), RunState::Idle);

        let started = Instant::now();
        match run.run(Matrix::scalar(1.0)).await {
            Err(ConsensusError::TimedOut { iteration, neighbor, waited }) => {
                assert_eq!(iteration, 0);
                assert_eq!(neighbor, B);
                assert!(waited >= Duration::from_secs(15));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(run.state(), RunState::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_fails_run_immediately() {
        let mut transport = MockTransport::new();
        transport.expect_send()
            .times(1)
            .returning(|_, _, _| Err(TransportError::TransportClosed));
        transport.expect_get()
            .never();

        let mut run = ConsensusRun::new(ConsensusConfig::new(3, 1), Arc::new(transport), weights(&[(B, 0.5), (C, 0.5)])).unwrap();

        let started = Instant::now();
        match run.run(Matrix::scalar(1.0)).await {
            Err(ConsensusError::Transport { iteration, neighbor, source: TransportError::TransportClosed }) => {
                assert_eq!(iteration, 0);
                assert_eq!(neighbor, B);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(run.state(), RunState::Failed);
        assert!(started.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_send_is_not_fatal() {
        let mut transport = MockTransport::new();
        transport.expect_send()
            .returning(|_, _, _| Ok(false));
        transport.expect_get()
            .returning(|_, _| Some(Matrix::scalar(3.0).to_bytes()));

        let mut run = ConsensusRun::new(ConsensusConfig::new(1, 1), Arc::new(transport), weights(&[(B, 0.5)])).unwrap();
        assert_eq!(run.run(Matrix::scalar(1.0)).await.unwrap(), Matrix::scalar(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_communicator_fails_run_immediately() {
        let mut config = TransportConfig::new(Protocol::Udp, 0, None).unwrap();
        config.bind_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let communicator = Communicator::open(config).await.unwrap();
        communicator.close().await.unwrap();

        let mut run = ConsensusRun::new(ConsensusConfig::new(1, 1), Arc::new(communicator), weights(&[(B, 0.5)])).unwrap();
        let started = Instant::now();
        let result = run.run(Matrix::scalar(1.0)).await;
        assert!(matches!(result, Err(ConsensusError::Transport { source: TransportError::TransportClosed, .. })), "{:?}", result);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_muted_neighbor_fails_all_runs_that_depend_on_it() {
        let network = InMemoryNetwork::new();
        network.mute(C);
        let w = 1.0 / 3.0;
        let results = run_all(&network, vec![
            (A, weights(&[(B, w), (C, w)]), Matrix::scalar(1.0)),
            (B, weights(&[(A, w), (C, w)]), Matrix::scalar(2.0)),
            (C, weights(&[(A, w), (B, w)]), Matrix::scalar(3.0)),
        ], 2).await;

        assert!(matches!(results[0], Err(ConsensusError::TimedOut { iteration: 0, neighbor, .. }) if neighbor == C));
        assert!(matches!(results[1], Err(ConsensusError::TimedOut { iteration: 0, neighbor, .. }) if neighbor == C));
        // C itself receives everything, but the others stop sending after their timeout
        assert!(matches!(results[2], Err(ConsensusError::TimedOut { iteration: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_arriving_late_is_picked_up() {
        let network = InMemoryNetwork::new();
        let transport_a = Arc::new(network.transport(A));
        let transport_b = network.transport(B);

        let mut run = ConsensusRun::new(ConsensusConfig::new(1, 2), transport_a, weights(&[(B, 0.5)])).unwrap();
        let handle = tokio::spawn(async move {
            let result = run.run(Matrix::scalar(0.0)).await;
            (result, run.state())
        });

        sleep(Duration::from_secs(3)).await;
        assert!(transport_b.send(A, &Matrix::scalar(8.0).to_bytes(), build_tag(2, 0)).await.unwrap());

        let (result, state) = handle.await.unwrap();
        assert_eq!(result.unwrap(), Matrix::scalar(4.0));
        assert_eq!(state, RunState::Converged);

        // A's estimate for iteration 0 was sent to B
        assert_eq!(transport_b.get(A, build_tag(2, 0)), Some(Matrix::scalar(0.0).to_bytes()));
    }

    #[rstest]
    #[case::retained(false, true)]
    #[case::skipped(true, false)]
    #[tokio::test(start_paused = true)]
    async fn test_zero_weight_neighbor(#[case] skip_zero_weight_neighbors: bool, #[case] expect_contact: bool) {
        let mut transport = MockTransport::new();
        let num_expected = if expect_contact { 1 } else { 0 };
        transport.expect_send()
            .withf(|to, _, _| *to == C)
            .times(num_expected)
            .returning(|_, _, _| Ok(true));
        transport.expect_get()
            .withf(|from, _| *from == C)
            .times(num_expected)
            .returning(|_, _| Some(Matrix::scalar(100.0).to_bytes()));
        transport.expect_send()
            .withf(|to, _, _| *to == B)
            .times(1)
            .returning(|_, _, _| Ok(true));
        transport.expect_get()
            .withf(|from, _| *from == B)
            .times(1)
            .returning(|_, _| Some(Matrix::scalar(3.0).to_bytes()));

        let mut config = ConsensusConfig::new(1, 1);
        config.skip_zero_weight_neighbors = skip_zero_weight_neighbors;
        let mut run = ConsensusRun::new(config, Arc::new(transport), weights(&[(B, 0.5), (C, 0.0)])).unwrap();

        assert_eq!(run.run(Matrix::scalar(1.0)).await.unwrap(), Matrix::scalar(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_data_is_ignored() {
        let mut transport = MockTransport::new();
        transport.expect_send()
            .returning(|_, _, _| Ok(true));
        transport.expect_get()
            .withf(|from, _| *from == B)
            .returning(|_, _| Some(Bytes::from_static(b"garbage")));
        transport.expect_get()
            .withf(|from, _| *from == C)
            .returning(|_, _| Some(Matrix::zeros(2, 2).to_bytes()));

        let mut run = ConsensusRun::new(ConsensusConfig::new(2, 1), Arc::new(transport), weights(&[(B, 0.5), (C, 0.5)])).unwrap();
        assert_eq!(run.run(Matrix::scalar(1.0)).await.unwrap(), Matrix::scalar(1.0));
    }

    #[tokio::test]
    async fn test_zero_iterations() {
        let transport = MockTransport::new();
        let mut run = ConsensusRun::new(ConsensusConfig::new(0, 1), Arc::new(transport), weights(&[(B, 0.5)])).unwrap();
        assert_eq!(run.run(Matrix::scalar(5.0)).await.unwrap(), Matrix::scalar(5.0));
        assert_eq!(run.state(), RunState::Converged);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = ConsensusConfig::new(1, 1);
        config.retry_backoff = Duration::ZERO;
        assert!(ConsensusRun::new(config, Arc::new(MockTransport::new()), Weights::new()).is_err());
    }
}
