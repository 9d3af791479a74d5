use std::net::SocketAddr;
use std::time::Duration;

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::{header, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// A single GET request on a fresh connection, including connection setup in the timeout.
pub(crate) async fn http_get(addr: SocketAddr, path_and_query: &str, timeout: Duration) -> anyhow::Result<(StatusCode, Bytes)> {
    tokio::time::timeout(timeout, do_get(addr, path_and_query)).await?
}

async fn do_get(addr: SocketAddr, path_and_query: &str) -> anyhow::Result<(StatusCode, Bytes)> {
    let stream = TcpStream::connect(addr).await?;
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(?addr, "HTTP connection failed: {}", e);
        }
    });

    let request = Request::get(path_and_query)
        .header(header::HOST, addr.to_string())
        .body(Empty::<Bytes>::new())?;
    trace!(?addr, "GET {}", path_and_query);

    let response = sender.send_request(request).await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    Ok((status, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_server::{spawn_server, spawn_silent_server};

    #[tokio::test]
    async fn test_get() {
        let (addr, mut requests) = spawn_server(StatusCode::OK, "hello").await;

        let (status, body) = http_get(addr, "/some/path?a=1", Duration::from_secs(5)).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"hello"));
        assert_eq!(requests.recv().await.unwrap(), "/some/path?a=1");
    }

    #[tokio::test]
    async fn test_timeout() {
        let addr = spawn_silent_server().await;
        assert!(http_get(addr, "/", Duration::from_millis(200)).await.is_err());
    }
}
