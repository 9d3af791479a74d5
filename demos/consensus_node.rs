use std::collections::BTreeSet;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use avgconsensus::collaborators::degree::HttpDegreeLookup;
use avgconsensus::collaborators::kickoff::notify_start;
use avgconsensus::consensus::config::ConsensusConfig;
use avgconsensus::consensus::iterative::ConsensusRun;
use avgconsensus::consensus::matrix::Matrix;
use avgconsensus::consensus::weights::get_weights;
use avgconsensus::transport::communicator::Communicator;
use avgconsensus::transport::config::{Protocol, TransportConfig};
use clap::Parser;
use clap_derive::Parser;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::select;
use tracing::{error, info, warn, Level};

/// A consensus node with its HTTP control plane. Start one per host, then start a run on any
///  of them with `--kickoff` or `GET /start/consensus?tc=<iterations>&id=<run id>`.
#[derive(Parser)]
struct Args {
    /// this node's own address, used as the source address for all transport traffic
    bind_ip: IpAddr,

    /// whitespace separated integer rows
    data_file: String,

    #[clap(long)]
    neighbor: Vec<IpAddr>,

    #[clap(long, default_value = "udp")]
    protocol: String,

    #[clap(long, default_value_t = 9071)]
    port: i64,

    #[clap(long, default_value_t = 9090)]
    control_port: u16,

    /// start a run with this many iterations right away, notifying all neighbors
    #[clap(long)]
    kickoff: Option<u32>,

    #[clap(long, default_value_t = 1)]
    run_id: u64,

    #[clap(long, default_value_t = false)]
    skip_zero_weight_neighbors: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct Node {
    neighbors: BTreeSet<IpAddr>,
    control_port: u16,
    skip_zero_weight_neighbors: bool,
    initial_data: Matrix,
    communicator: Arc<Communicator>,
    is_running: AtomicBool,
}

impl Node {
    /// Notifies all neighbors and starts a run in the background, unless a run is in progress
    ///  already. Neighbors do the same when notified, so a single kickoff starts the entire
    ///  connected graph.
    fn kickoff(self: &Arc<Self>, iterations: u32, run_id: u64) -> bool {
        if self.is_running.swap(true, Ordering::AcqRel) {
            info!("consensus is running already");
            return false;
        }

        let node = self.clone();
        tokio::spawn(async move {
            for &neighbor in &node.neighbors {
                notify_start(neighbor, node.control_port, iterations, run_id).await;
            }

            match node.run(iterations, run_id).await {
                Ok(result) => info!("consensus result: {}", result),
                Err(e) => error!("consensus run failed: {:#}", e),
            }
            node.is_running.store(false, Ordering::Release);
        });
        true
    }

    async fn run(&self, iterations: u32, run_id: u64) -> anyhow::Result<Matrix> {
        let weights = get_weights(&self.neighbors, &HttpDegreeLookup::new(self.control_port)).await;
        info!("weights: {:?}", weights);

        let mut config = ConsensusConfig::new(iterations, run_id);
        config.skip_zero_weight_neighbors = self.skip_zero_weight_neighbors;

        let mut run = ConsensusRun::new(config, self.communicator.clone(), weights)?;
        Ok(run.run(self.initial_data.clone()).await?)
    }

    fn handle(self: &Arc<Self>, req: &Request<Incoming>) -> Response<Full<Bytes>> {
        match req.uri().path() {
            "/degree" => response(StatusCode::OK, self.neighbors.len().to_string()),
            "/start/consensus" => {
                let iterations = query_param(req, "tc").and_then(|s| s.parse().ok());
                let run_id = query_param(req, "id").and_then(|s| s.parse().ok());
                match (iterations, run_id) {
                    (Some(iterations), Some(run_id)) => {
                        if self.kickoff(iterations, run_id) {
                            response(StatusCode::OK, "started".to_string())
                        }
                        else {
                            response(StatusCode::OK, "running".to_string())
                        }
                    }
                    _ => response(StatusCode::BAD_REQUEST, "tc and id must be numbers".to_string()),
                }
            }
            _ => response(StatusCode::NOT_FOUND, "not found".to_string()),
        }
    }
}

fn query_param<'a>(req: &'a Request<Incoming>, name: &str) -> Option<&'a str> {
    req.uri().query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    if args.neighbor.is_empty() {
        return Err(anyhow!("missing neighbors"));
    }

    let initial_data = Matrix::load_from_file(&args.data_file)?;
    info!("initial data: {}", initial_data);

    let protocol: Protocol = args.protocol.parse()?;
    let mut transport_config = TransportConfig::new(protocol, args.port, None)?;
    transport_config.bind_ip = args.bind_ip;

    let communicator = Arc::new(Communicator::open(transport_config).await?);
    communicator.listen()?;

    let node = Arc::new(Node {
        neighbors: args.neighbor.into_iter().collect(),
        control_port: args.control_port,
        skip_zero_weight_neighbors: args.skip_zero_weight_neighbors,
        initial_data,
        communicator: communicator.clone(),
        is_running: AtomicBool::new(false),
    });

    if let Some(iterations) = args.kickoff {
        node.kickoff(iterations, args.run_id);
    }

    let http_addr = SocketAddr::new(args.bind_ip, args.control_port);
    let result = select! {
        result = run_http_server(http_addr, node) => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    communicator.close().await?;
    result
}

async fn run_http_server(addr: SocketAddr, node: Arc<Node>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        let node = node.clone();
        let service = service_fn(move |req| {
            let response = node.handle(&req);
            async move { Ok::<_, Infallible>(response) }
        });

        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                warn!("Error serving connection: {:?}", err);
            }
        });
    }
}
