use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::TreeBuildError;
use crate::graph::{expand_tree, Edges, GraphNode};
use crate::models::Technology;

use super::{dir_name, read_descriptor, BuildContext, DependencyTrees, TreeBuilder};

const MAVEN_REPO_PATH: &str = "{repo}";
const MAVEN_CENTRAL: &str = "https://repo.maven.apache.org/maven2";
const MIRROR_ID: &str = "depaudit-resolution";
const GRADLE_CONFIGURATION: &str = "runtimeClasspath";

/// Maven coordinates as they appear in tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Coordinates {
    pub group: String,
    pub artifact: String,
    pub packaging: String,
    pub version: String,
}

impl Coordinates {
    pub fn id(&self) -> String {
        Technology::Maven.node_id(&format!("{}:{}", self.group, self.artifact), &self.version)
    }

    /// Relative path of the artifact in a Maven layout repository.
    pub fn repository_path(&self) -> String {
        let extension = match self.packaging.as_str() {
            "bundle" | "maven-plugin" | "test-jar" => "jar",
            other => other,
        };
        format!(
            "{}/{}/{}/{}-{}.{}",
            self.group.replace('.', "/"),
            self.artifact,
            self.version,
            self.artifact,
            self.version,
            extension
        )
    }
}

/// `group:artifact:type[:classifier]:version[:scope]`, `has_scope` false for
/// the module line of a TGF block.
fn parse_tgf_coordinates(raw: &str, has_scope: bool) -> Option<Coordinates> {
    let parts: Vec<&str> = raw.split(':').collect();
    let version = match (parts.len(), has_scope) {
        (4, false) | (5, true) => parts[3],
        (5, false) | (6, true) => parts[4],
        _ => return None,
    };
    Some(Coordinates {
        group: parts[0].to_string(),
        artifact: parts[1].to_string(),
        packaging: parts[2].to_string(),
        version: version.to_string(),
    })
}

#[derive(Default)]
struct TgfBlock {
    root: Option<String>,
    nodes: BTreeMap<String, String>,
    edges: Edges,
    in_edges: bool,
}

/// Parse the (possibly appended) TGF output of `dependency:tree`. One tree per
/// module block.
pub(crate) fn parse_tgf(content: &str) -> Result<(Vec<GraphNode>, Vec<Coordinates>), TreeBuildError> {
    let mut trees = Vec::new();
    let mut artifacts: Vec<Coordinates> = Vec::new();
    let mut types: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut block = TgfBlock::default();

    let finish = |block: &mut TgfBlock, types: &BTreeMap<String, Vec<String>>, trees: &mut Vec<GraphNode>| {
        if let Some(root) = block.root.take() {
            trees.push(expand_tree(&root, &block.edges, types));
        }
        *block = TgfBlock::default();
    };

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line == "#" {
            block.in_edges = true;
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(first), Some(second)) = (parts.next(), parts.next()) else {
            return Err(TreeBuildError::malformed("maven", format!("unexpected TGF line '{line}'")));
        };
        let is_node = second.contains(':');
        if is_node && block.in_edges {
            finish(&mut block, &types, &mut trees);
        }
        if is_node {
            let is_root = block.root.is_none();
            let coordinates = parse_tgf_coordinates(second, !is_root)
                .ok_or_else(|| TreeBuildError::malformed("maven", format!("bad coordinates '{second}'")))?;
            let id = coordinates.id();
            let tags = types.entry(id.clone()).or_default();
            if !tags.contains(&coordinates.packaging) {
                tags.push(coordinates.packaging.clone());
            }
            if is_root {
                block.root = Some(id.clone());
            } else if !artifacts.contains(&coordinates) {
                artifacts.push(coordinates);
            }
            block.nodes.insert(first.to_string(), id);
        } else {
            let (Some(parent), Some(child)) = (block.nodes.get(first), block.nodes.get(second)) else {
                return Err(TreeBuildError::malformed("maven", format!("edge to unknown node '{line}'")));
            };
            let children = block.edges.entry(parent.clone()).or_default();
            if !children.contains(child) {
                children.push(child.clone());
            }
        }
    }
    finish(&mut block, &types, &mut trees);
    Ok((trees, artifacts))
}

#[derive(Serialize)]
struct MavenSettings {
    mirrors: Mirrors,
    #[serde(skip_serializing_if = "Option::is_none")]
    servers: Option<Servers>,
}

#[derive(Serialize)]
struct Mirrors {
    mirror: Vec<Mirror>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Mirror {
    id: String,
    mirror_of: String,
    url: String,
}

#[derive(Serialize)]
struct Servers {
    server: Vec<MavenServer>,
}

#[derive(Serialize)]
struct MavenServer {
    id: String,
    username: String,
    password: String,
}

/// `settings.xml` mirroring every repository through the resolution
/// repository.
pub(crate) fn mirror_settings(url: &str, credentials: Option<(String, String)>) -> Result<String, TreeBuildError> {
    let settings = MavenSettings {
        mirrors: Mirrors {
            mirror: vec![Mirror {
                id: MIRROR_ID.to_string(),
                mirror_of: "*".to_string(),
                url: url.to_string(),
            }],
        },
        servers: credentials.map(|(username, password)| Servers {
            server: vec![MavenServer {
                id: MIRROR_ID.to_string(),
                username,
                password,
            }],
        }),
    };
    quick_xml::se::to_string_with_root("settings", &settings)
        .map_err(|e| TreeBuildError::malformed("maven", format!("cannot write settings.xml: {e}")))
}

fn wrapper_or(ctx: &BuildContext, wrapper: &str, program: &str) -> String {
    let script = ctx.path(wrapper);
    if ctx.use_wrapper && script.is_file() {
        script.to_string_lossy().into_owned()
    } else {
        program.to_string()
    }
}

fn maven_base_url(ctx: &BuildContext) -> String {
    ctx.public_repository_url(MAVEN_REPO_PATH)
        .unwrap_or_else(|| MAVEN_CENTRAL.to_string())
}

fn artifact_urls(ctx: &BuildContext, artifacts: &[Coordinates]) -> BTreeMap<String, String> {
    let base = maven_base_url(ctx);
    artifacts
        .iter()
        .map(|a| (a.id(), format!("{}/{}", base.trim_end_matches('/'), a.repository_path())))
        .collect()
}

fn scratch_dir(prefix: &str) -> Result<tempfile::TempDir, TreeBuildError> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .map_err(|e| TreeBuildError::io(std::env::temp_dir(), e))
}

fn write_file(path: &Path, content: &str) -> Result<(), TreeBuildError> {
    std::fs::write(path, content).map_err(|e| TreeBuildError::io(path, e))
}

/// Runs `dependency:tree` in TGF form over every module of the reactor.
pub struct MavenBuilder;

#[async_trait]
impl TreeBuilder for MavenBuilder {
    async fn build_trees(&self, ctx: &BuildContext) -> Result<DependencyTrees, TreeBuildError> {
        if !ctx.path("pom.xml").is_file() {
            return Err(TreeBuildError::MissingDescriptor("pom.xml".to_string()));
        }
        let scratch = scratch_dir("depaudit-mvn-")?;
        let output_file = scratch.path().join("tree.tgf");

        let mut invocation = ctx.command(wrapper_or(ctx, "mvnw", "mvn")).args([
            "--batch-mode".to_string(),
            "dependency:tree".to_string(),
            "-DoutputType=tgf".to_string(),
            "-DappendOutput=true".to_string(),
            format!("-DoutputFile={}", output_file.display()),
        ]);
        if let Some(url) = ctx.public_repository_url(MAVEN_REPO_PATH) {
            let credentials = ctx.resolution.server.as_ref().and_then(|s| s.credentials());
            let settings = scratch.path().join("settings.xml");
            write_file(&settings, &mirror_settings(&url, credentials)?)?;
            invocation = invocation.arg("-s").arg(settings.to_string_lossy());
        }
        if let Some(curation) = &ctx.curation {
            invocation = invocation.arg(format!("-Dmaven.repo.local={}", curation.cache_dir.display()));
        }
        ctx.run(invocation).await?;

        let (trees, artifacts) = parse_tgf(&read_descriptor(&output_file)?)?;
        debug!(modules = trees.len(), artifacts = artifacts.len(), "Parsed Maven dependency tree");
        let mut deps = DependencyTrees::from_typed_trees(trees);
        if ctx.is_curation() {
            deps = deps.with_download_urls(artifact_urls(ctx, &artifacts));
        }
        Ok(deps)
    }
}

/// Parse the ASCII tree printed by `gradle dependencies` for one
/// configuration. Project dependencies are transparent: their children hang
/// off the enclosing node.
pub(crate) fn parse_gradle_tree(output: &str, root_id: &str) -> (GraphNode, Vec<Coordinates>) {
    let mut edges = Edges::new();
    let mut artifacts: Vec<Coordinates> = Vec::new();
    // (depth, id the children of this entry attach to); None for skipped entries
    let mut stack: Vec<(usize, Option<String>)> = Vec::new();

    for line in output.lines() {
        let Some(marker) = line.find("+--- ").or_else(|| line.find("\\--- ")) else {
            continue;
        };
        let depth = marker / 5;
        let entry = line[marker + 5..].trim();
        while stack.last().is_some_and(|(d, _)| *d >= depth) {
            stack.pop();
        }
        let parent = match stack.last() {
            Some((_, parent)) => parent.clone(),
            None => Some(root_id.to_string()),
        };

        let attach_to = match parse_gradle_entry(entry) {
            GradleEntry::Skipped => None,
            GradleEntry::Project => parent.clone(),
            GradleEntry::Artifact(coordinates) => parent.map(|parent| {
                let id = coordinates.id();
                let children = edges.entry(parent).or_default();
                if !children.contains(&id) {
                    children.push(id.clone());
                }
                if !artifacts.contains(&coordinates) {
                    artifacts.push(coordinates);
                }
                id
            }),
        };
        stack.push((depth, attach_to));
    }
    (expand_tree(root_id, &edges, &BTreeMap::new()), artifacts)
}

enum GradleEntry {
    Artifact(Coordinates),
    Project,
    Skipped,
}

fn parse_gradle_entry(entry: &str) -> GradleEntry {
    if entry.starts_with("project ") {
        return GradleEntry::Project;
    }
    if entry.ends_with("(c)") || entry.ends_with("(n)") || entry.contains("FAILED") {
        return GradleEntry::Skipped;
    }
    let entry = entry.trim_end_matches("(*)").trim();
    let (requested, resolved) = match entry.split_once(" -> ") {
        Some((requested, resolved)) => (requested, Some(resolved.trim())),
        None => (entry, None),
    };
    let parts: Vec<&str> = requested.split(':').collect();
    if parts.len() < 2 {
        return GradleEntry::Skipped;
    }
    let version = match resolved {
        // `-> project :x` substitutions are local modules
        Some(resolved) if resolved.starts_with("project ") => return GradleEntry::Project,
        Some(resolved) => resolved.split_whitespace().next().unwrap_or(resolved),
        None => parts.get(2).copied().unwrap_or_default(),
    };
    if version.is_empty() {
        return GradleEntry::Skipped;
    }
    GradleEntry::Artifact(Coordinates {
        group: parts[0].to_string(),
        artifact: parts[1].to_string(),
        packaging: "jar".to_string(),
        version: version.to_string(),
    })
}

fn groovy_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Init script routing every project's resolution through `url`.
pub(crate) fn gradle_init_script(url: &str, credentials: Option<(String, String)>) -> String {
    let credentials = credentials
        .map(|(user, secret)| {
            format!(
                "\n            credentials {{\n                username = {}\n                password = {}\n            }}",
                groovy_string(&user),
                groovy_string(&secret)
            )
        })
        .unwrap_or_default();
    format!(
        "allprojects {{\n    repositories {{\n        clear()\n        maven {{\n            url = {}{}\n        }}\n    }}\n}}\n",
        groovy_string(url),
        credentials
    )
}

fn gradle_root_name(ctx: &BuildContext) -> String {
    ["settings.gradle", "settings.gradle.kts"]
        .iter()
        .filter_map(|f| std::fs::read_to_string(ctx.path(f)).ok())
        .find_map(|content| {
            content.lines().find_map(|line| {
                let value = line.trim().strip_prefix("rootProject.name")?.trim().strip_prefix('=')?;
                let name = value.trim().trim_matches(|c| c == '"' || c == '\'');
                (!name.is_empty()).then(|| name.to_string())
            })
        })
        .unwrap_or_else(|| dir_name(&ctx.working_dir))
}

/// Runs `gradle dependencies` on the runtime classpath of the root project.
pub struct GradleBuilder;

#[async_trait]
impl TreeBuilder for GradleBuilder {
    async fn build_trees(&self, ctx: &BuildContext) -> Result<DependencyTrees, TreeBuildError> {
        let mut invocation = ctx.command(wrapper_or(ctx, "gradlew", "gradle")).args([
            "-q",
            "dependencies",
            "--configuration",
            GRADLE_CONFIGURATION,
        ]);
        let _scratch = match ctx.public_repository_url(MAVEN_REPO_PATH) {
            Some(url) => {
                let scratch = scratch_dir("depaudit-gradle-")?;
                let script = scratch.path().join("resolution.gradle");
                let credentials = ctx.resolution.server.as_ref().and_then(|s| s.credentials());
                write_file(&script, &gradle_init_script(&url, credentials))?;
                invocation = invocation.arg("--init-script").arg(script.to_string_lossy());
                Some(scratch)
            }
            None => None,
        };
        if let Some(curation) = &ctx.curation {
            invocation = invocation.env("GRADLE_USER_HOME", curation.cache_dir.to_string_lossy());
        }
        let output = ctx.run(invocation).await?;

        let root_id = Technology::Gradle.node_id(&gradle_root_name(ctx), "");
        let (tree, artifacts) = parse_gradle_tree(&output.stdout, &root_id);
        let mut deps = DependencyTrees::from_trees(vec![tree]);
        if ctx.is_curation() {
            deps = deps.with_download_urls(artifact_urls(ctx, &artifacts));
        }
        Ok(deps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::{ok, ScriptedRunner};
    use crate::config::ServerDetails;
    use crate::resolver::Resolution;
    use crate::technologies::CurationPaths;
    use std::sync::Arc;
    use tempfile::TempDir;

    const TGF: &str = "\
1001 com.acme:api:jar:1.0.0
1002 org.slf4j:slf4j-api:jar:2.0.9:compile
1003 com.google.guava:guava:jar:32.1.2-jre:compile
1004 com.google.guava:failureaccess:jar:1.0.1:compile
#
1001 1002 compile
1001 1003 compile
1003 1004 compile
2001 com.acme:web:war:1.0.0
2002 com.acme:api:jar:1.0.0:compile
2003 org.slf4j:slf4j-api:jar:2.0.9:compile
#
2001 2002 compile
2002 2003 compile
";

    const GRADLE_OUTPUT: &str = "
runtimeClasspath - Runtime classpath of source set 'main'.
+--- org.springframework:spring-core:5.3.30
|    \\--- org.springframework:spring-jcl:5.3.30
+--- com.google.guava:guava:31.0-jre -> 32.1.2-jre
|    +--- com.google.guava:failureaccess:1.0.1
|    \\--- org.checkerframework:checker-qual:3.33.0
+--- project :core
|    \\--- commons-io:commons-io:2.11.0
+--- org.springframework:spring-core:5.3.30 (*)
+--- org.example:missing:1.0 FAILED
\\--- org.slf4j:slf4j-api:2.0.9 (c)
";

    #[test]
    fn test_parse_tgf_one_tree_per_module() {
        let (trees, artifacts) = parse_tgf(TGF).unwrap();
        assert_eq!(trees.len(), 2);
        assert_eq!(trees[0].id, "gav://com.acme:api:1.0.0");
        let guava = trees[0].child("gav://com.google.guava:guava:32.1.2-jre").unwrap();
        assert!(guava.child("gav://com.google.guava:failureaccess:1.0.1").is_some());
        assert_eq!(trees[1].id, "gav://com.acme:web:1.0.0");
        assert_eq!(trees[1].types.as_deref(), Some(&["war".to_string()][..]));
        let api = trees[1].child("gav://com.acme:api:1.0.0").unwrap();
        assert!(api.child("gav://org.slf4j:slf4j-api:2.0.9").is_some());
        assert_eq!(artifacts.len(), 4);
    }

    #[test]
    fn test_parse_tgf_rejects_dangling_edge() {
        assert!(parse_tgf("1 a:b:jar:1\n#\n1 9 compile\n").is_err());
    }

    #[test]
    fn test_repository_path() {
        let c = parse_tgf_coordinates("org.apache.felix:org.apache.felix.scr:bundle:2.2.6:compile", true).unwrap();
        assert_eq!(
            c.repository_path(),
            "org/apache/felix/org.apache.felix.scr/2.2.6/org.apache.felix.scr-2.2.6.jar"
        );
        let classified = parse_tgf_coordinates("io.netty:netty-transport:jar:linux-x86_64:4.1.100:runtime", true).unwrap();
        assert_eq!(classified.version, "4.1.100");
    }

    #[test]
    fn test_mirror_settings() {
        let xml = mirror_settings("https://acme.example.com/artifactory/maven-remote", Some(("ci".into(), "s3cret".into()))).unwrap();
        assert!(xml.starts_with("<settings>"));
        assert!(xml.contains("<mirrorOf>*</mirrorOf>"));
        assert!(xml.contains("<url>https://acme.example.com/artifactory/maven-remote</url>"));
        assert!(xml.contains("<username>ci</username>"));
    }

    #[test]
    fn test_parse_gradle_tree() {
        let (tree, artifacts) = parse_gradle_tree(GRADLE_OUTPUT, "gav://shop:");
        let ids: Vec<&str> = tree.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "gav://org.springframework:spring-core:5.3.30",
                "gav://com.google.guava:guava:32.1.2-jre",
                "gav://commons-io:commons-io:2.11.0",
            ]
        );
        let spring = &tree.nodes[0];
        assert!(spring.child("gav://org.springframework:spring-jcl:5.3.30").is_some());
        assert_eq!(tree.nodes[1].nodes.len(), 2);
        assert!(!artifacts.iter().any(|a| a.artifact == "missing" || a.artifact == "slf4j-api"));
    }

    #[test]
    fn test_gradle_init_script_escapes_quotes() {
        let script = gradle_init_script("https://r/maven", Some(("ci".into(), "it's".into())));
        assert!(script.contains("url = 'https://r/maven'"));
        assert!(script.contains("password = 'it\\'s'"));
    }

    #[tokio::test]
    async fn test_maven_build_with_resolution_and_curation() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pom.xml"), "<project/>").unwrap();
        let runner = Arc::new(ScriptedRunner::new().on(
            |inv| inv.program == "mvn",
            |inv| {
                let out = inv
                    .args
                    .iter()
                    .find_map(|a| a.strip_prefix("-DoutputFile="))
                    .unwrap()
                    .to_string();
                std::fs::write(out, TGF).unwrap();
                ok("")
            },
        ));
        let mut ctx = BuildContext::new(Technology::Maven, dir.path(), runner.clone());
        ctx.resolution = Resolution {
            server: Some(ServerDetails {
                url: "https://acme.example.com".into(),
                access_token: Some("tkn".into()),
                ..Default::default()
            }),
            repository: Some("maven-remote".into()),
            source: None,
        };
        ctx.curation = Some(CurationPaths {
            cache_dir: dir.path().join("m2"),
            pip_cache_dir: dir.path().join("pip"),
        });
        let deps = MavenBuilder.build_trees(&ctx).await.unwrap();
        assert_eq!(deps.trees.len(), 2);
        assert!(matches!(deps.unique, crate::graph::UniqueDependencies::Typed(_)));
        assert_eq!(
            deps.download_urls["gav://org.slf4j:slf4j-api:2.0.9"],
            "https://acme.example.com/artifactory/maven-remote/org/slf4j/slf4j-api/2.0.9/slf4j-api-2.0.9.jar"
        );
        let args = &runner.recorded()[0].args;
        assert!(args.iter().any(|a| a == "-s"));
        assert!(args.iter().any(|a| a.starts_with("-Dmaven.repo.local=")));
    }

    #[tokio::test]
    async fn test_gradle_root_named_from_settings() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("build.gradle"), "").unwrap();
        std::fs::write(dir.path().join("settings.gradle"), "rootProject.name = 'shop'\n").unwrap();
        let runner = Arc::new(ScriptedRunner::new().on(|inv| inv.program == "gradle", |_| ok(GRADLE_OUTPUT)));
        let ctx = BuildContext::new(Technology::Gradle, dir.path(), runner);
        let deps = GradleBuilder.build_trees(&ctx).await.unwrap();
        assert_eq!(deps.trees[0].id, "gav://shop:");
        assert_eq!(deps.unique.len(), 6);
    }
}
