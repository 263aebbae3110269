//! Remote scanning service boundary.
//!
//! The orchestrator only ever talks to a [`ScanService`]; [`XrayClient`] is
//! the HTTP implementation.

use async_trait::async_trait;

use crate::config::{AuditParams, ServerDetails};
use crate::error::ScanServiceError;
use crate::graph::GraphNode;
use crate::models::{Component, ScanResponse, Severity, Technology};

pub mod client;

pub use client::XrayClient;

/// Everything sent along with one flat graph.
#[derive(Debug, Clone, Default)]
pub struct ScanGraphParams {
    pub server: Option<ServerDetails>,
    pub technology: Option<Technology>,
    pub project_key: Option<String>,
    pub watches: Vec<String>,
    pub min_severity: Option<Severity>,
    pub fixable_only: bool,
    pub include_licenses: bool,
}

impl ScanGraphParams {
    pub fn from_audit(params: &AuditParams, technology: Technology) -> Self {
        Self {
            server: params.server.clone(),
            technology: Some(technology),
            project_key: params.project_key.clone(),
            watches: params.watches.clone(),
            min_severity: params.min_severity,
            fixable_only: params.fixable_only,
            include_licenses: params.include_licenses,
        }
    }
}

#[async_trait]
pub trait ScanService: Send + Sync {
    async fn scan_graph(
        &self,
        params: &ScanGraphParams,
        graph: &GraphNode,
    ) -> Result<Vec<ScanResponse>, ScanServiceError>;
}

/// Drops findings below the severity floor and, with `fixable_only`,
/// components without a fixed version. Issues left without components are
/// dropped too. Licenses are kept as they are.
pub fn filter_responses(responses: Vec<ScanResponse>, params: &ScanGraphParams) -> Vec<ScanResponse> {
    let floor = params.min_severity.unwrap_or_default();
    let keep_components = |components: &mut std::collections::BTreeMap<String, Component>| {
        if params.fixable_only {
            components.retain(|_, c| !c.fixed_versions.is_empty());
        }
        !components.is_empty()
    };

    responses
        .into_iter()
        .map(|mut response| {
            response.vulnerabilities.retain_mut(|v| v.severity >= floor && keep_components(&mut v.components));
            response.violations.retain_mut(|v| v.severity >= floor && keep_components(&mut v.components));
            response
        })
        .collect()
}
