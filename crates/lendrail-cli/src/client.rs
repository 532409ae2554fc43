//! Thin JSON client for the node's `/api/v1` surface.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:9101";

#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// A decoded reply: the typed body, or the node's rejection.
#[derive(Debug)]
pub enum Reply<T> {
    Ok(T),
    Rejected {
        status: StatusCode,
        body: ErrorResponse,
    },
}

impl<T> Reply<T> {
    pub fn into_result(self, what: &str) -> anyhow::Result<T> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Rejected { status, body } => anyhow::bail!(
                "{} failed (HTTP {}): {} [{}]",
                what,
                status,
                body.error,
                body.code
            ),
        }
    }
}

pub struct NodeClient {
    endpoint: String,
    http: reqwest::Client,
}

impl NodeClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.endpoint, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Reply<T>, reqwest::Error> {
        let url = self.url(path);
        tracing::debug!(%url, "GET");
        decode(self.http.get(&url).send().await?).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Reply<T>, reqwest::Error> {
        let url = self.url(path);
        tracing::debug!(%url, "POST");
        decode(self.http.post(&url).json(body).send().await?).await
    }

    /// Print the standard hint when the node cannot be reached.
    pub fn unreachable(&self, err: &reqwest::Error) {
        println!("Could not reach node at {}", self.endpoint);
        println!("  Error: {}", err);
        println!();
        println!("Is the node running? Start it with: lendrail-node");
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<Reply<T>, reqwest::Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(Reply::Ok(resp.json().await?));
    }
    let body = resp.json::<ErrorResponse>().await.unwrap_or(ErrorResponse {
        error: format!("node returned HTTP {}", status),
        code: "unknown".into(),
    });
    Ok(Reply::Rejected { status, body })
}
