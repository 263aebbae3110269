//! Scan orchestration.
//!
//! Every detected (technology, working directory) pair runs through
//! resolve → build → flatten → scan → impact paths on a bounded pool of
//! futures. A failing pair is recorded in [`ScanErrors`] and the others keep
//! going; only failing to capture the starting directory aborts the run.
//!
//! Adapters receive the pair's directory explicitly, so pairs never depend on
//! the process working directory. [`WorkingDirGuard`] still restores it at the
//! end of a run in case an adapter changed it.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::command::{CommandRunner, ProcessRunner};
use crate::config::AuditParams;
use crate::curation::CurationSettings;
use crate::detector::{detect_technologies, DetectorOptions};
use crate::error::{AuditError, PairFailure, PairStage, ScanErrors};
use crate::graph::flatten::flatten;
use crate::graph::impact::build_impact_paths;
use crate::models::{ApplicabilityPolicy, ScaScanResult, Technology};
use crate::resolver::RepositoryResolver;
use crate::scan::{ScanGraphParams, ScanService};
use crate::technologies::{AdapterRegistry, BuildContext, CurationPaths, DependencyTrees};

/// Restores the process working directory captured at construction when
/// dropped.
#[derive(Debug)]
pub struct WorkingDirGuard {
    original: PathBuf,
}

impl WorkingDirGuard {
    pub fn capture() -> Result<Self, AuditError> {
        let original = std::env::current_dir().map_err(AuditError::WorkingDirectory)?;
        Ok(Self { original })
    }

    pub fn original(&self) -> &Path {
        &self.original
    }
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        if let Err(e) = std::env::set_current_dir(&self.original) {
            warn!(dir = %self.original.display(), error = %e, "Failed to restore the working directory");
        }
    }
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPair {
    pub technology: Technology,
    pub working_dir: PathBuf,
    pub descriptors: Vec<PathBuf>,
}

/// Detect every root and turn the result into scan pairs.
///
/// Roots that cannot be walked are logged and skipped. A technology whose
/// subsuming sibling was detected in the same root is dropped. A requested
/// technology without working directories is scanned once at the root with
/// no descriptors.
pub fn plan_scans(roots: &[PathBuf], options: &DetectorOptions) -> Vec<ScanPair> {
    let mut pairs = Vec::new();
    for root in roots {
        let detected = match detect_technologies(root, options) {
            Ok(detected) => detected,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Skipping directory");
                continue;
            }
        };
        for (technology, dirs) in &detected {
            let subsumed = technology
                .subsumed_by()
                .and_then(|sibling| detected.get(&sibling))
                .is_some_and(|sibling_dirs| !sibling_dirs.is_empty());
            if subsumed {
                debug!(technology = %technology, "Skipping technology covered by its sibling");
                continue;
            }
            if dirs.is_empty() {
                pairs.push(ScanPair {
                    technology: *technology,
                    working_dir: root.clone(),
                    descriptors: Vec::new(),
                });
                continue;
            }
            pairs.extend(dirs.iter().map(|(dir, descriptors)| ScanPair {
                technology: *technology,
                working_dir: dir.clone(),
                descriptors: descriptors.clone(),
            }));
        }
    }
    pairs
}

/// Dependencies handed to third-party applicability analysis.
pub fn applicability_candidates(technology: Technology, deps: &DependencyTrees, all_requested: bool) -> Vec<String> {
    let all = match technology.applicability_policy() {
        ApplicabilityPolicy::AllDependencies => true,
        ApplicabilityPolicy::AllWhenRequested => all_requested,
        ApplicabilityPolicy::DirectOnly => false,
    };
    let ids: BTreeSet<String> = if all {
        deps.unique.ids().into_iter().map(str::to_string).collect()
    } else {
        deps.trees
            .iter()
            .flat_map(|tree| tree.nodes.iter().map(|n| n.id.clone()))
            .collect()
    };
    ids.into_iter().collect()
}

/// Everything a run produced. Failed pairs are in `errors`; the pairs that
/// succeeded are in `results` either way.
#[derive(Debug, Default)]
pub struct ScaRunReport {
    pub results: Vec<ScaScanResult>,
    pub applicability_candidates: BTreeMap<Technology, Vec<String>>,
    pub errors: ScanErrors,
}

impl ScaRunReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

struct PairOutput {
    result: ScaScanResult,
    candidates: Vec<String>,
}

pub struct ScaOrchestrator {
    registry: AdapterRegistry,
    scan_service: Arc<dyn ScanService>,
    resolver: RepositoryResolver,
    runner: Arc<dyn CommandRunner>,
    curation: CurationSettings,
    params: Arc<AuditParams>,
    cancel: CancellationToken,
}

impl ScaOrchestrator {
    pub fn new(params: Arc<AuditParams>, scan_service: Arc<dyn ScanService>) -> Self {
        let runner = ProcessRunner::new().with_timeout(params.timeout);
        Self {
            registry: AdapterRegistry::with_defaults(),
            scan_service,
            resolver: RepositoryResolver::default(),
            runner: Arc::new(runner),
            curation: CurationSettings::default(),
            params,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_resolver(mut self, resolver: RepositoryResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_curation(mut self, curation: CurationSettings) -> Self {
        self.curation = curation;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn curation_enabled(&self) -> bool {
        self.params.curation || self.curation.enabled
    }

    /// Detect and scan every working directory of `params.working_dirs`
    /// (the current directory when empty).
    pub async fn run(&self) -> Result<ScaRunReport, AuditError> {
        let guard = WorkingDirGuard::capture()?;
        let roots: Vec<PathBuf> = if self.params.working_dirs.is_empty() {
            vec![guard.original().to_path_buf()]
        } else {
            self.params
                .working_dirs
                .iter()
                .map(|dir| {
                    let absolute = guard.original().join(dir);
                    absolute.canonicalize().unwrap_or(absolute)
                })
                .collect()
        };

        let options = DetectorOptions::from_params(&self.params);
        let pairs = plan_scans(&roots, &options);
        info!(pairs = pairs.len(), "Starting dependency scans");
        let report = self.run_pairs(pairs).await;
        drop(guard);
        Ok(report)
    }

    /// Run already planned pairs, at most `params.threads` at a time.
    pub async fn run_pairs(&self, pairs: Vec<ScanPair>) -> ScaRunReport {
        let threads = self.params.threads.max(1);
        let outcomes: Vec<(ScanPair, Result<PairOutput, (PairStage, AuditError)>)> = stream::iter(pairs)
            .map(|pair| async move {
                let outcome = self.run_pair(&pair).await;
                (pair, outcome)
            })
            .buffer_unordered(threads)
            .collect()
            .await;

        let mut report = ScaRunReport::default();
        for (pair, outcome) in outcomes {
            match outcome {
                Ok(output) => {
                    let candidates = report.applicability_candidates.entry(pair.technology).or_default();
                    candidates.extend(output.candidates);
                    report.results.push(output.result);
                }
                Err((stage, error)) => {
                    warn!(technology = %pair.technology, dir = %pair.working_dir.display(), error = %error, "Scan failed");
                    report.errors.push(PairFailure {
                        technology: pair.technology,
                        working_dir: pair.working_dir,
                        stage,
                        error,
                    });
                }
            }
        }
        for candidates in report.applicability_candidates.values_mut() {
            candidates.sort();
            candidates.dedup();
        }
        report
            .results
            .sort_by(|a, b| (a.technology, &a.working_directory).cmp(&(b.technology, &b.working_directory)));
        report
    }

    #[instrument(skip_all, fields(technology = %pair.technology, dir = %pair.working_dir.display()))]
    async fn run_pair(&self, pair: &ScanPair) -> Result<PairOutput, (PairStage, AuditError)> {
        let mut stage = PairStage::Pending;
        self.execute(pair, &mut stage).await.map_err(|e| (stage, e))
    }

    async fn execute(&self, pair: &ScanPair, stage: &mut PairStage) -> Result<PairOutput, AuditError> {
        let technology = pair.technology;
        info!("Calculating {} dependencies...", technology.formal_name());

        let builder = self
            .registry
            .get(technology)
            .ok_or(AuditError::UnsupportedTechnology(technology))?;
        let resolution = self
            .resolver
            .resolve(technology, &pair.working_dir, &self.params)
            .map_err(|source| AuditError::Resolution { technology, source })?;
        if let Some(repo) = &resolution.repository {
            debug!(repository = %repo, "Resolving through repository");
        }

        let mut ctx = BuildContext::new(technology, &pair.working_dir, self.runner.clone());
        ctx.descriptors = pair.descriptors.clone();
        ctx.resolution = resolution;
        ctx.requirements_file = self.params.requirements_file.clone();
        ctx.npm_scope = self.params.npm_scope;
        ctx.use_wrapper = self.params.use_wrapper;
        if self.curation_enabled() {
            ctx.curation = Some(CurationPaths {
                cache_dir: self.curation.cache_dir_for(technology, &pair.working_dir)?,
                pip_cache_dir: self.curation.pip_cache_dir()?,
            });
        }

        let started = Instant::now();
        let deps = self
            .guarded("tree build", builder.build_trees(&ctx))
            .await?
            .map_err(|source| AuditError::TreeBuild { technology, source })?;
        if deps.trees.is_empty() || deps.node_count() == 0 {
            return Err(AuditError::NoDependencies);
        }
        *stage = PairStage::TreeBuilt;
        debug!(
            elapsed = ?started.elapsed(),
            trees = deps.trees.len(),
            unique = deps.unique.len(),
            "Dependency trees built"
        );

        let flat = flatten(&deps.unique);
        *stage = PairStage::Flattened;

        let scan_params = ScanGraphParams::from_audit(&self.params, technology);
        let started = Instant::now();
        let responses = self
            .guarded("scan", self.scan_service.scan_graph(&scan_params, &flat))
            .await?
            .map_err(|source| AuditError::Scan { technology, source })?;
        *stage = PairStage::Scanned;
        debug!(elapsed = ?started.elapsed(), responses = responses.len(), "Scan finished");

        let responses = build_impact_paths(responses, &deps.trees);
        *stage = PairStage::ImpactReconstructed;

        let candidates = applicability_candidates(technology, &deps, self.params.third_party_applicability);
        let mut result = ScaScanResult::new(pair.working_dir.clone(), technology, pair.descriptors.clone());
        result.is_multiple_root_project = Some(deps.trees.len() > 1);
        result.scan_responses = responses;
        result.download_urls = deps.download_urls;
        *stage = PairStage::Done;

        Ok(PairOutput { result, candidates })
    }

    /// Awaits `future` unless the run is cancelled or the step times out.
    async fn guarded<T>(&self, step: &'static str, future: impl Future<Output = T>) -> Result<T, AuditError> {
        if self.cancel.is_cancelled() {
            return Err(AuditError::Cancelled);
        }
        let bounded = async {
            match self.params.timeout {
                Some(timeout) => tokio::time::timeout(timeout, future)
                    .await
                    .map_err(|_| AuditError::Timeout { step, timeout }),
                None => Ok(future.await),
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AuditError::Cancelled),
            outcome = bounded => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;
    use crate::error::{ScanServiceError, TreeBuildError};
    use crate::graph::GraphNode;
    use crate::models::{Component, ScanResponse, Severity, Vulnerability};
    use crate::technologies::TreeBuilder;
    use async_trait::async_trait;
    use serial_test::serial;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Returns fixed trees and moves the process into the working directory
    /// the way a careless plugin would.
    struct StaticBuilder(Vec<GraphNode>);

    #[async_trait]
    impl TreeBuilder for StaticBuilder {
        async fn build_trees(&self, ctx: &BuildContext) -> Result<DependencyTrees, TreeBuildError> {
            std::env::set_current_dir(&ctx.working_dir).map_err(|e| TreeBuildError::io(&ctx.working_dir, e))?;
            Ok(DependencyTrees::from_trees(self.0.clone()))
        }
    }

    struct FailingBuilder;

    #[async_trait]
    impl TreeBuilder for FailingBuilder {
        async fn build_trees(&self, _ctx: &BuildContext) -> Result<DependencyTrees, TreeBuildError> {
            Err(TreeBuildError::malformed("go", "go.sum is corrupted"))
        }
    }

    struct SlowBuilder;

    #[async_trait]
    impl TreeBuilder for SlowBuilder {
        async fn build_trees(&self, _ctx: &BuildContext) -> Result<DependencyTrees, TreeBuildError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(DependencyTrees::from_trees(Vec::new()))
        }
    }

    /// Flags `vulnerable` whenever it is in the submitted graph.
    #[derive(Default)]
    struct FakeScanner {
        vulnerable: String,
        graphs: Mutex<Vec<GraphNode>>,
    }

    #[async_trait]
    impl ScanService for FakeScanner {
        async fn scan_graph(
            &self,
            _params: &ScanGraphParams,
            graph: &GraphNode,
        ) -> Result<Vec<ScanResponse>, ScanServiceError> {
            self.graphs.lock().unwrap().push(graph.clone());
            let mut response = ScanResponse {
                scan_id: "scan-1".into(),
                ..Default::default()
            };
            if graph.child(&self.vulnerable).is_some() {
                response.vulnerabilities.push(Vulnerability {
                    issue_id: "XRAY-100".into(),
                    severity: Severity::High,
                    components: BTreeMap::from([(self.vulnerable.clone(), Component::default())]),
                    ..Default::default()
                });
            }
            Ok(vec![response])
        }
    }

    fn diamond() -> Vec<GraphNode> {
        let pexpect = || {
            GraphNode::with_children(
                "pypi://pexpect:4.8.0",
                vec![GraphNode::new("pypi://ptyprocess:0.7.0")],
            )
        };
        vec![
            GraphNode::with_children("pypi://app-a:1.0", vec![pexpect()]),
            GraphNode::with_children("pypi://app-b:1.0", vec![pexpect()]),
        ]
    }

    fn params(threads: usize) -> AuditParams {
        AuditParams {
            threads,
            ignore_config_file: true,
            ..Default::default()
        }
    }

    fn orchestrator(params: AuditParams, registry: AdapterRegistry, scanner: Arc<FakeScanner>) -> ScaOrchestrator {
        ScaOrchestrator::new(Arc::new(params), scanner)
            .with_registry(registry)
            .with_runner(Arc::new(ScriptedRunner::new()))
    }

    fn pair(technology: Technology, dir: &str) -> ScanPair {
        ScanPair {
            technology,
            working_dir: PathBuf::from(dir),
            descriptors: Vec::new(),
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_one_failing_pair_does_not_stop_the_others() {
        let root = TempDir::new().unwrap();
        let root_path = root.path().canonicalize().unwrap();
        for (dir, file) in [("web", "package.json"), ("svc", "go.mod"), ("api", "requirements.txt")] {
            std::fs::create_dir_all(root_path.join(dir)).unwrap();
            std::fs::write(root_path.join(dir).join(file), "").unwrap();
        }
        let registry = AdapterRegistry::new()
            .register(Technology::Npm, Arc::new(StaticBuilder(diamond())))
            .register(Technology::Pip, Arc::new(StaticBuilder(diamond())))
            .register(Technology::Go, Arc::new(FailingBuilder));
        let mut params = params(2);
        params.working_dirs = vec![root_path.clone()];
        params.recursive = true;
        let scanner = Arc::new(FakeScanner::default());

        let before = std::env::current_dir().unwrap();
        let report = orchestrator(params, registry, scanner).run().await.unwrap();
        assert_eq!(std::env::current_dir().unwrap(), before);

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.errors.len(), 1);
        let failure = &report.errors.failures()[0];
        assert_eq!(failure.technology, Technology::Go);
        assert_eq!(failure.working_dir, root_path.join("svc"));
        assert!(matches!(failure.error, AuditError::TreeBuild { .. }));
        assert!(report.errors.to_string().contains("go.sum is corrupted"));
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_diamond_is_flattened_once_and_traced_through_both_roots() {
        let scanner = Arc::new(FakeScanner {
            vulnerable: "pypi://ptyprocess:0.7.0".into(),
            ..Default::default()
        });
        let registry = AdapterRegistry::new().register(Technology::Pip, Arc::new(DiamondBuilder));
        let report = orchestrator(params(1), registry, scanner.clone())
            .run_pairs(vec![pair(Technology::Pip, "/work/app")])
            .await;
        assert!(report.is_success());

        let flat = &scanner.graphs.lock().unwrap()[0];
        let ptyprocess = flat.nodes.iter().filter(|n| n.id == "pypi://ptyprocess:0.7.0").count();
        assert_eq!(ptyprocess, 1);

        let result = &report.results[0];
        assert_eq!(result.is_multiple_root_project, Some(true));
        let component = &result.scan_responses[0].vulnerabilities[0].components["pypi://ptyprocess:0.7.0"];
        assert_eq!(component.impact_paths.len(), 2);
        let starts: BTreeSet<&str> = component
            .impact_paths
            .iter()
            .map(|p| p[0].component_id.as_str())
            .collect();
        assert_eq!(starts, BTreeSet::from(["pypi://app-a:1.0", "pypi://app-b:1.0"]));
    }

    /// Same trees as [`StaticBuilder`] without touching the process directory.
    struct DiamondBuilder;

    #[async_trait]
    impl TreeBuilder for DiamondBuilder {
        async fn build_trees(&self, _ctx: &BuildContext) -> Result<DependencyTrees, TreeBuildError> {
            Ok(DependencyTrees::from_trees(diamond()))
        }
    }

    #[tokio::test]
    async fn test_empty_tree_is_reported_as_no_dependencies() {
        let registry = AdapterRegistry::new().register(
            Technology::Npm,
            Arc::new(StaticEmpty(vec![GraphNode::new("npm://app:1.0.0")])),
        );
        let report = orchestrator(params(1), registry, Arc::new(FakeScanner::default()))
            .run_pairs(vec![pair(Technology::Npm, "/work/web")])
            .await;
        let failure = &report.errors.failures()[0];
        assert!(matches!(failure.error, AuditError::NoDependencies));
        assert_eq!(failure.stage, PairStage::Pending);
        assert!(report.results.is_empty());
    }

    struct StaticEmpty(Vec<GraphNode>);

    #[async_trait]
    impl TreeBuilder for StaticEmpty {
        async fn build_trees(&self, _ctx: &BuildContext) -> Result<DependencyTrees, TreeBuildError> {
            Ok(DependencyTrees::from_trees(self.0.clone()))
        }
    }

    #[tokio::test]
    async fn test_unregistered_technology_is_pair_scoped() {
        let report = orchestrator(params(1), AdapterRegistry::new(), Arc::new(FakeScanner::default()))
            .run_pairs(vec![pair(Technology::Poetry, "/work/py")])
            .await;
        assert!(matches!(
            report.errors.failures()[0].error,
            AuditError::UnsupportedTechnology(Technology::Poetry)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_run_fails_every_pair() {
        let token = CancellationToken::new();
        token.cancel();
        let registry = AdapterRegistry::new().register(Technology::Pip, Arc::new(DiamondBuilder));
        let report = orchestrator(params(2), registry, Arc::new(FakeScanner::default()))
            .with_cancellation(token)
            .run_pairs(vec![pair(Technology::Pip, "/work/a"), pair(Technology::Pip, "/work/b")])
            .await;
        assert_eq!(report.errors.len(), 2);
        assert!(report
            .errors
            .failures()
            .iter()
            .all(|f| matches!(f.error, AuditError::Cancelled)));
    }

    #[tokio::test]
    async fn test_slow_tree_build_times_out() {
        let mut params = params(1);
        params.timeout = Some(Duration::from_millis(50));
        let registry = AdapterRegistry::new().register(Technology::Go, Arc::new(SlowBuilder));
        let report = orchestrator(params, registry, Arc::new(FakeScanner::default()))
            .run_pairs(vec![pair(Technology::Go, "/work/svc")])
            .await;
        assert!(matches!(
            report.errors.failures()[0].error,
            AuditError::Timeout { step: "tree build", .. }
        ));
    }

    #[test]
    fn test_applicability_candidates_follow_the_policy_table() {
        let deps = DependencyTrees::from_trees(diamond());
        let direct = vec!["pypi://pexpect:4.8.0".to_string()];
        let all = vec!["pypi://pexpect:4.8.0".to_string(), "pypi://ptyprocess:0.7.0".to_string()];

        assert_eq!(applicability_candidates(Technology::Pip, &deps, false), all);
        assert_eq!(applicability_candidates(Technology::Npm, &deps, false), direct);
        assert_eq!(applicability_candidates(Technology::Npm, &deps, true), all);
        assert_eq!(applicability_candidates(Technology::Maven, &deps, true), direct);
        assert_eq!(applicability_candidates(Technology::Go, &deps, false), direct);
    }

    #[test]
    fn test_plan_skips_dotnet_when_nuget_is_detected() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("Billing.csproj"), "<Project/>").unwrap();
        let options = DetectorOptions {
            recursive: true,
            technologies: Vec::new(),
            requested_descriptors: BTreeMap::new(),
            exclusions: Vec::new(),
        };
        let pairs = plan_scans(&[root.path().to_path_buf()], &options);
        let techs: Vec<Technology> = pairs.iter().map(|p| p.technology).collect();
        assert_eq!(techs, vec![Technology::Nuget]);
    }

    #[test]
    fn test_plan_scans_requested_technology_without_directories_at_root() {
        let root = TempDir::new().unwrap();
        let options = DetectorOptions {
            recursive: true,
            technologies: vec![Technology::Gradle],
            requested_descriptors: BTreeMap::new(),
            exclusions: Vec::new(),
        };
        let pairs = plan_scans(&[root.path().to_path_buf()], &options);
        assert_eq!(pairs, vec![ScanPair {
            technology: Technology::Gradle,
            working_dir: root.path().to_path_buf(),
            descriptors: Vec::new(),
        }]);
    }

    #[test]
    fn test_plan_skips_roots_that_cannot_be_walked() {
        let options = DetectorOptions {
            recursive: false,
            technologies: Vec::new(),
            requested_descriptors: BTreeMap::new(),
            exclusions: Vec::new(),
        };
        assert!(plan_scans(&[PathBuf::from("/definitely/not/here")], &options).is_empty());
    }

    #[test]
    #[serial]
    fn test_guard_restores_directory() {
        let before = std::env::current_dir().unwrap();
        let elsewhere = TempDir::new().unwrap();
        {
            let guard = WorkingDirGuard::capture().unwrap();
            std::env::set_current_dir(elsewhere.path()).unwrap();
            assert_eq!(guard.original(), before.as_path());
        }
        assert_eq!(std::env::current_dir().unwrap(), before);
    }
}
