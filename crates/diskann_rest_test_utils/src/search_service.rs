use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use diskann_rest_harness::{
    QueryRequest,
    VectorMatrix,
};
use http::{
    Method,
    StatusCode,
};
use http_body_util::{
    BodyExt as _,
    Full,
};
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{
    Request,
    Response,
};
use hyper_util::rt::TokioIo;
use serde::{
    Deserialize,
    Serialize,
};
use tokio::net::{
    TcpListener,
    TcpStream,
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    warn,
};

/// Body of a successful search response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query_id: u64,
    pub indices: Vec<u32>,
    pub distances: Vec<f32>,
}

/// A local HTTP server answering `ssd_server` search requests over an in-memory index.
///
/// # Examples
///
/// ```rust
/// # use diskann_rest_harness::{Dataset, QueryClient, QueryRequest};
/// # use diskann_rest_test_utils::SearchServer;
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let dataset = Dataset::generate(12345, 100, 8)?;
/// let handle = SearchServer::bind_local(dataset.vectors().clone()).await?.spawn_listener();
///
/// let client = QueryClient::new(handle.url(), None)?;
/// let response = client
///     .search(&QueryRequest {
///         ls: 32,
///         query_id: 1,
///         query: dataset.query().to_vec(),
///         k: 10,
///     })
///     .await?;
/// assert!(response.is_success());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SearchServer {
    listener: TcpListener,
    index: Arc<VectorMatrix>,
}

impl SearchServer {
    pub async fn bind(address: SocketAddr, index: VectorMatrix) -> std::io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(address).await?,
            index: Arc::new(index),
        })
    }

    /// Binds to an unused port on localhost.
    pub async fn bind_local(index: VectorMatrix) -> std::io::Result<Self> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], 0)), index).await
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawns a new task for accepting requests, returning a handle that stops it when dropped.
    pub fn spawn_listener(self) -> ServerHandle {
        let address = self
            .listener
            .local_addr()
            .expect("listener should be bound to an address");
        let cancellation_token = CancellationToken::new();
        tokio::task::spawn(self.serve(cancellation_token.clone()));
        ServerHandle {
            address,
            cancellation_token,
        }
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) {
        let service = SearchService { index: self.index };
        loop {
            select! {
                stream = self.listener.accept() => {
                    match stream {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Accepted connection");
                            tokio::spawn(handle_connection(stream, service.clone()));
                        },
                        Err(err) => warn!(%err, "Failed to accept connection"),
                    }
                },
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, service: SearchService) {
    let stream = TokioIo::new(stream);
    if let Err(err) = hyper::server::conn::http1::Builder::new()
        .serve_connection(stream, service)
        .await
    {
        debug!(%err, "Connection closed with an error");
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    address: SocketAddr,
    cancellation_token: CancellationToken,
}

impl ServerHandle {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The address in the form `ssd_server` is launched with.
    pub fn url(&self) -> url::Url {
        url::Url::parse(&format!("http://{}/", self.address)).expect("socket address is a valid url")
    }
}

impl std::fmt::Display for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

#[derive(Debug, Clone)]
struct SearchService {
    index: Arc<VectorMatrix>,
}

type ServiceError = Box<dyn std::error::Error + Send + Sync + 'static>;
type ServiceResponse = Response<Full<Bytes>>;
type ServiceFuture = Pin<Box<dyn Future<Output = Result<ServiceResponse, ServiceError>> + Send>>;

impl Service<Request<Incoming>> for SearchService {
    type Error = ServiceError;
    type Future = ServiceFuture;
    type Response = ServiceResponse;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let index = Arc::clone(&self.index);
        Box::pin(async move {
            if req.method() != Method::POST {
                return respond(StatusCode::METHOD_NOT_ALLOWED, "only POST is supported".into());
            }
            let body = req.into_body().collect().await?.to_bytes();
            let request = match serde_json::from_slice::<QueryRequest>(&body) {
                Ok(request) => request,
                Err(err) => return respond(StatusCode::BAD_REQUEST, format!("malformed request: {err}").into()),
            };
            match search(&index, &request) {
                Ok(response) => respond(StatusCode::OK, serde_json::to_vec(&response)?.into()),
                Err(reason) => respond(StatusCode::BAD_REQUEST, reason.into()),
            }
        })
    }
}

fn respond(status: StatusCode, body: Bytes) -> Result<ServiceResponse, ServiceError> {
    Ok(Response::builder().status(status).body(Full::new(body))?)
}

/// Exhaustive L2 search returning the `k` closest points, closest first.
pub fn search(index: &VectorMatrix, request: &QueryRequest) -> Result<SearchResponse, String> {
    if request.query.len() != index.dims() {
        return Err(format!(
            "query has {} dimensions but the index has {}",
            request.query.len(),
            index.dims()
        ));
    }
    if request.k == 0 {
        return Err("k must be positive".to_owned());
    }
    if request.ls < request.k {
        return Err(format!("Ls ({}) must be at least k ({})", request.ls, request.k));
    }

    let mut scored = index
        .iter_rows()
        .enumerate()
        .map(|(id, row)| {
            let distance = row
                .iter()
                .zip(&request.query)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>();
            (id, distance)
        })
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    scored.truncate(request.k as usize);

    Ok(SearchResponse {
        query_id: request.query_id,
        indices: scored.iter().map(|(id, _)| *id as u32).collect(),
        distances: scored.iter().map(|(_, distance)| *distance).collect(),
    })
}
