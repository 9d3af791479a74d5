use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::collaborators::http::http_get;

pub const NOTIFY_START_TIMEOUT: Duration = Duration::from_secs(5);

/// Asks a neighbor to start a consensus run: `GET /start/consensus?tc=<iterations>&id=<run_id>`.
///
/// Returns `false` if the neighbor could not be notified. The run starts anyway, and a neighbor
///  that does not take part causes it to time out.
pub async fn notify_start(neighbor: IpAddr, control_port: u16, iterations: u32, run_id: u64) -> bool {
    let path_and_query = format!("/start/consensus?tc={}&id={}", iterations, run_id);
    info!(?neighbor, "kickoff request {}", path_and_query);

    match http_get(SocketAddr::new(neighbor, control_port), &path_and_query, NOTIFY_START_TIMEOUT).await {
        Ok((status, _)) if status.is_success() => {
            debug!(?neighbor, "made kickoff request");
            true
        }
        Ok((status, _)) => {
            warn!(?neighbor, "kickoff request returned status {}", status);
            false
        }
        Err(e) => {
            warn!(?neighbor, "error requesting {}: {:#}", path_and_query, e);
            false
        }
    }
}
