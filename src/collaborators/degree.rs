use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use hyper::StatusCode;
use tracing::debug;

use crate::collaborators::http::http_get;
use crate::consensus::weights::DegreeLookup;

/// Asks a neighbor's control plane for its degree: `GET /degree?host=<neighbor>` must return
///  status 200 with the number as its body.
pub struct HttpDegreeLookup {
    pub control_port: u16,
    pub timeout: Duration,
}

impl HttpDegreeLookup {
    pub fn new(control_port: u16) -> HttpDegreeLookup {
        HttpDegreeLookup {
            control_port,
            timeout: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl DegreeLookup for HttpDegreeLookup {
    async fn degree(&self, neighbor: IpAddr) -> anyhow::Result<u32> {
        let path_and_query = format!("/degree?host={}", neighbor);
        debug!(?neighbor, "requesting degree");

        let (status, body) = http_get(SocketAddr::new(neighbor, self.control_port), &path_and_query, self.timeout).await?;
        if status != StatusCode::OK {
            bail!("degree request to {} returned status {}", neighbor, status);
        }

        let degree = std::str::from_utf8(&body)?
            .trim()
            .parse()?;
        Ok(degree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_server::{spawn_server, spawn_silent_server};
    use rstest::rstest;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[rstest]
    #[case::plain(StatusCode::OK, "3", Some(3))]
    #[case::whitespace(StatusCode::OK, " 12\n", Some(12))]
    #[case::zero(StatusCode::OK, "0", Some(0))]
    #[case::not_a_number(StatusCode::OK, "three", None)]
    #[case::negative(StatusCode::OK, "-1", None)]
    #[case::empty(StatusCode::OK, "", None)]
    #[case::not_found(StatusCode::NOT_FOUND, "3", None)]
    #[case::server_error(StatusCode::INTERNAL_SERVER_ERROR, "3", None)]
    #[tokio::test]
    async fn test_degree(#[case] status: StatusCode, #[case] body: &'static str, #[case] expected: Option<u32>) {
        let (addr, mut requests) = spawn_server(status, body).await;

        let degree = HttpDegreeLookup::new(addr.port()).degree(LOCALHOST).await;
        assert_eq!(degree.ok(), expected);
        assert_eq!(requests.recv().await.unwrap(), "/degree?host=127.0.0.1");
    }

    #[tokio::test]
    async fn test_degree_timeout() {
        let addr = spawn_silent_server().await;
        let mut lookup = HttpDegreeLookup::new(addr.port());
        lookup.timeout = Duration::from_millis(100);
        assert!(lookup.degree(LOCALHOST).await.is_err());
    }

    #[tokio::test]
    async fn test_degree_connection_refused() {
        let port = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap().local_addr().unwrap().port();
        assert!(HttpDegreeLookup::new(port).degree(LOCALHOST).await.is_err());
    }
}
