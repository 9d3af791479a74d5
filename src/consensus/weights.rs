use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{debug, warn};

use crate::util::safe_converter::SafeCast;

/// Mixing weight per neighbor
pub type Weights = BTreeMap<IpAddr, f64>;

/// Finds out how many neighbors a node has. This is asked of the neighbors themselves, so it
///  can fail for all the usual network reasons.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DegreeLookup: Send + Sync {
    async fn degree(&self, neighbor: IpAddr) -> anyhow::Result<u32>;
}

/// Metropolis-Hastings weights: `1 / (max(deg(self), deg(neighbor)) + 1)`. These are symmetric
///  between every pair of nodes, which makes the iteration converge to the true average rather
///  than some weighted mean.
///
/// A neighbor whose degree can not be determined gets weight 0, the others are unaffected.
pub async fn get_weights(neighbors: &BTreeSet<IpAddr>, degree_lookup: &dyn DegreeLookup) -> Weights {
    let local_degree = neighbors.len();

    let mut weights = Weights::new();
    for &neighbor in neighbors {
        let weight = match degree_lookup.degree(neighbor).await {
            Ok(remote_degree) => {
                let remote_degree: usize = remote_degree.safe_cast();
                1.0 / (remote_degree.max(local_degree) + 1) as f64
            }
            Err(e) => {
                warn!(?neighbor, "could not determine degree, using weight 0: {:#}", e);
                0.0
            }
        };
        debug!(?neighbor, weight, "mixing weight");
        weights.insert(neighbor, weight);
    }
    weights
}
