use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use crate::config::ServerDetails;
use crate::error::ScanServiceError;
use crate::graph::GraphNode;
use crate::models::ScanResponse;

use super::{filter_responses, ScanGraphParams, ScanService};

const SCAN_GRAPH_PATH: &str = "api/v1/scan/graph";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_ATTEMPTS: u32 = 60;

#[derive(Debug, Deserialize)]
struct ScanStarted {
    scan_id: String,
}

/// Graph scanning over HTTP: submit, then poll until the results are ready.
#[derive(Debug, Clone)]
pub struct XrayClient {
    http: Client,
    poll_interval: Duration,
    max_attempts: u32,
}

impl XrayClient {
    pub fn new(request_timeout: Duration) -> Result<Self, ScanServiceError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("depaudit/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    pub fn with_polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = interval;
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn authorize(request: RequestBuilder, server: &ServerDetails) -> RequestBuilder {
        match (&server.access_token, &server.user) {
            (Some(token), _) => request.bearer_auth(token),
            (None, Some(user)) => request.basic_auth(user, server.password.as_ref()),
            (None, None) => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ScanServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ScanServiceError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// `<xray>api/v1/scan/graph` with the project or watch context.
pub(crate) fn submit_url(server: &ServerDetails, params: &ScanGraphParams) -> Result<Url, ScanServiceError> {
    let raw = format!("{}{}", server.xray_url(), SCAN_GRAPH_PATH);
    let mut url = Url::parse(&raw).map_err(|_| ScanServiceError::InvalidUrl(raw.clone()))?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(project) = params.project_key.as_deref().filter(|p| !p.is_empty()) {
            query.append_pair("project", project);
        }
        for watch in &params.watches {
            query.append_pair("watch", watch);
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url)
}

pub(crate) fn results_url(server: &ServerDetails, scan_id: &str, include_licenses: bool) -> Result<Url, ScanServiceError> {
    let mut raw = format!(
        "{}{}/{}?include_vulnerabilities=true",
        server.xray_url(),
        SCAN_GRAPH_PATH,
        scan_id
    );
    if include_licenses {
        raw.push_str("&include_licenses=true");
    }
    Url::parse(&raw).map_err(|_| ScanServiceError::InvalidUrl(raw))
}

#[async_trait]
impl ScanService for XrayClient {
    async fn scan_graph(
        &self,
        params: &ScanGraphParams,
        graph: &GraphNode,
    ) -> Result<Vec<ScanResponse>, ScanServiceError> {
        let server = params.server.as_ref().ok_or(ScanServiceError::MissingServer)?;

        let submit = Self::authorize(self.http.post(submit_url(server, params)?), server).json(graph);
        let started: ScanStarted = Self::check(submit.send().await?).await?.json().await?;
        debug!(scan_id = %started.scan_id, nodes = graph.nodes.len(), "Scan submitted");

        let url = results_url(server, &started.scan_id, params.include_licenses)?;
        for attempt in 1..=self.max_attempts {
            let response = Self::authorize(self.http.get(url.clone()), server).send().await?;
            if response.status() == StatusCode::ACCEPTED {
                debug!(scan_id = %started.scan_id, attempt, "Scan still in progress");
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }
            let mut result: ScanResponse = Self::check(response).await?.json().await?;
            if result.scan_id.is_empty() {
                result.scan_id = started.scan_id.clone();
            }
            return Ok(filter_responses(vec![result], params));
        }
        Err(ScanServiceError::PollingExhausted {
            scan_id: started.scan_id,
            attempts: self.max_attempts,
        })
    }
}
