use std::time::Duration;

use reqwest::{
    Client,
    StatusCode,
};
use serde::{
    Deserialize,
    Serialize,
};
use tracing::debug;
use url::Url;

use crate::error::Error;

/// Body of a search request to `ssd_server`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Search list size; must be at least `k`.
    #[serde(rename = "Ls")]
    pub ls: u32,
    pub query_id: u64,
    pub query: Vec<f32>,
    pub k: u32,
}

/// The raw response. Only the status is interpreted by the harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    pub status: StatusCode,
    pub body: String,
}

impl QueryResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Posts [QueryRequest]s to a server address.
#[derive(Debug, Clone)]
pub struct QueryClient {
    client: Client,
    address: Url,
}

impl QueryClient {
    /// Without a `timeout` a request against a hung server never completes.
    pub fn new(address: Url, timeout: Option<Duration>) -> Result<Self, Error> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            address,
        })
    }

    pub fn address(&self) -> &Url {
        &self.address
    }

    /// Sends one request. Any status, including errors, is returned as a response; only transport
    /// failures are errors.
    pub async fn search(&self, request: &QueryRequest) -> Result<QueryResponse, reqwest::Error> {
        debug!(address =% self.address, query_id = request.query_id, k = request.k, ls = request.ls, "Sending query");
        let response = self.client.post(self.address.clone()).json(request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(%status, body_len = body.len(), "Received response");
        Ok(QueryResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;
    use serde_json::json;

    use super::*;

    fn request() -> QueryRequest {
        QueryRequest {
            ls: 32,
            query_id: 1234,
            query: vec![0.25, 0.5, 0.75],
            k: 10,
        }
    }

    #[test]
    fn test_wire_format() {
        let value = serde_json::to_value(request()).unwrap();
        assert_eq!(
            value,
            json!({
                "Ls": 32,
                "query_id": 1234,
                "query": [0.25, 0.5, 0.75],
                "k": 10
            })
        );
        let parsed: QueryRequest = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, request());
    }

    #[tokio::test]
    async fn test_search_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({
                "Ls": 32,
                "query_id": 1234,
                "query": [0.25, 0.5, 0.75],
                "k": 10
            })))
            .with_status(200)
            .with_body(r#"{"indices":[0]}"#)
            .create_async()
            .await;

        let client = QueryClient::new(server.url().parse().unwrap(), Some(Duration::from_secs(10))).unwrap();
        let response = client.search(&request()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.is_success());
        assert_eq!(response.body, r#"{"indices":[0]}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_is_returned() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/").with_status(500).create_async().await;

        let client = QueryClient::new(server.url().parse().unwrap(), None).unwrap();
        let response = client.search(&request()).await.unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.is_success());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let port = crate::server::ephemeral_port().unwrap();
        let client = QueryClient::new(crate::server::server_address(port).unwrap(), None).unwrap();
        let err = client.search(&request()).await.unwrap_err();
        assert!(err.is_connect(), "{err:?}");
    }
}
