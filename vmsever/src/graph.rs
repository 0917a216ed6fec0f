//! Package dependency graphs built from a mounted guest.
//!
//! A [`DependencyGraph`] is a directed multigraph whose nodes are installed
//! packages and whose edges are dependency declarations. Operating system
//! package graphs contain cycles, so every traversal here is breadth-first
//! reachability, never a topological order.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

use anyhow::{bail, ensure, Context, Result};
use guest_cli_wrapper::{error::Error as GuestError, GuestHandle, PackageManager};
use log::debug;
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One installed package. `path` stays empty until the package file has been
/// exported into the package store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct PackageInfo {
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) architecture: String,
    pub(crate) essential: bool,
    pub(crate) size: u64,
    pub(crate) path: Option<PathBuf>,
}

/// The identity of a package as far as compatibility is concerned. Catalog
/// queries that do not carry sizes or file paths produce these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PackageCoord {
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) architecture: String,
}

impl From<&PackageInfo> for PackageCoord {
    fn from(info: &PackageInfo) -> Self {
        Self {
            name: info.name.clone(),
            version: info.version.clone(),
            architecture: info.architecture.clone(),
        }
    }
}

/// A dependency declaration. `constraint` is set when the declaration pins a
/// version, in which case `operator` and `version` carry the comparison.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct DependencyEdge {
    pub(crate) constraint: bool,
    pub(crate) operator: String,
    pub(crate) version: String,
}

impl DependencyEdge {
    pub(crate) fn unconstrained() -> Self {
        Self {
            constraint: false,
            operator: String::new(),
            version: String::new(),
        }
    }
}

/// Directed multigraph of installed packages with a name index on the side.
/// Package names are unique within one image, so names address nodes.
#[derive(Debug, Clone, Default)]
pub(crate) struct DependencyGraph {
    graph: Graph<PackageInfo, DependencyEdge>,
    index: HashMap<String, NodeIndex>,
}

/// Matches one dependency alternative: `name`, optional `:arch`, optional
/// `(op version)`.
static APT_DEP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ *([^(): ]*) *(?:: *([^(): ]*))? *(?:\( *([^()]*) *\))? *$")
        .expect("invalid apt dependency pattern")
});

/// Matches one `rpmdep -level` output line: `(level N) pkg -> dep`.
static DNF_DEP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\(level [0-9]*\) ([^ ]*) -> ([^ ]*) *$").expect("invalid rpmdep pattern")
});

/// Packages excluded from DNF graphs because the package manager cannot
/// remove or reinstall them.
const DNF_IGNORE_SET: &[&str] = &["filesystem"];

/// Guest-side scratch file for the rpmdep listing.
const RPMDEP_GUEST_PATH: &str = "/var/tempDependencies.txt";

impl DependencyGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Build the graph for whatever package manager the guest runs.
    pub(crate) async fn from_guest(handle: &dyn GuestHandle) -> Result<Self> {
        match handle.os().package_manager {
            PackageManager::Apt => Self::from_apt(handle).await,
            PackageManager::Dnf => Self::from_dnf(handle).await,
        }
    }

    /// Insert a package, updating the stored attributes if it already exists.
    pub(crate) fn add_package(&mut self, info: PackageInfo) -> NodeIndex {
        match self.index.get(&info.name) {
            Some(&idx) => {
                self.graph[idx] = info;
                idx
            }
            None => {
                let name = info.name.clone();
                let idx = self.graph.add_node(info);
                self.index.insert(name, idx);
                idx
            }
        }
    }

    /// Insert a dependency edge. Returns false when either endpoint is not
    /// part of the graph.
    pub(crate) fn add_dependency(&mut self, from: &str, to: &str, edge: DependencyEdge) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => {
                self.graph.add_edge(a, b, edge);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub(crate) fn package(&self, name: &str) -> Option<&PackageInfo> {
        self.index.get(name).map(|&idx| &self.graph[idx])
    }

    pub(crate) fn package_count(&self) -> usize {
        self.graph.node_count()
    }

    /// All packages keyed by name.
    pub(crate) fn node_data(&self) -> HashMap<&str, &PackageInfo> {
        self.graph
            .node_weights()
            .map(|info| (info.name.as_str(), info))
            .collect()
    }

    /// Names of packages whose name contains `needle`, for suggestions when a
    /// declared main service is not installed.
    pub(crate) fn names_containing(&self, needle: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .index
            .keys()
            .filter(|name| name.contains(needle))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub(crate) fn total_install_size(&self) -> u64 {
        self.graph.node_weights().map(|info| info.size).sum()
    }

    fn reachable(&self, roots: &[String]) -> HashSet<NodeIndex> {
        let mut seen = HashSet::new();
        for root in roots {
            let Some(&start) = self.index.get(root) else {
                debug!("closure root '{root}' is not in the graph");
                continue;
            };
            let mut bfs = Bfs::new(&self.graph, start);
            while let Some(idx) = bfs.next(&self.graph) {
                seen.insert(idx);
            }
        }
        seen
    }

    /// Packages reachable from the given roots, keyed by name. The roots are
    /// part of the result.
    pub(crate) fn closure(&self, roots: &[String]) -> HashMap<String, PackageInfo> {
        self.reachable(roots)
            .into_iter()
            .map(|idx| {
                let info = self.graph[idx].clone();
                (info.name.clone(), info)
            })
            .collect()
    }

    /// The subgraph induced by the packages reachable from `roots`.
    pub(crate) fn subgraph(&self, roots: &[String]) -> DependencyGraph {
        let keep = self.reachable(roots);
        let mut out = DependencyGraph::new();
        for &idx in &keep {
            out.add_package(self.graph[idx].clone());
        }
        for edge in self.graph.edge_references() {
            if keep.contains(&edge.source()) && keep.contains(&edge.target()) {
                out.add_dependency(
                    &self.graph[edge.source()].name,
                    &self.graph[edge.target()].name,
                    edge.weight().clone(),
                );
            }
        }
        out
    }

    /// Graph union. Packages already present keep their attributes; edges are
    /// only added when no identical edge connects the same endpoints, so
    /// folding the same subgraph in twice does not grow the graph.
    pub(crate) fn union_with(&mut self, other: &DependencyGraph) {
        for info in other.graph.node_weights() {
            if !self.contains(&info.name) {
                self.add_package(info.clone());
            }
        }
        for edge in other.graph.edge_references() {
            let from = &other.graph[edge.source()].name;
            let to = &other.graph[edge.target()].name;
            if !self.has_dependency(from, to, edge.weight()) {
                self.add_dependency(from, to, edge.weight().clone());
            }
        }
    }

    fn has_dependency(&self, from: &str, to: &str, edge: &DependencyEdge) -> bool {
        let (Some(&a), Some(&b)) = (self.index.get(from), self.index.get(to)) else {
            return false;
        };
        self.graph
            .edges_connecting(a, b)
            .any(|existing| existing.weight() == edge)
    }

    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec(&self.graph).context("unable to serialize package graph")?;
        std::fs::write(path, data)
            .context(format!("unable to write graph file '{}'", path.display()))
    }

    pub(crate) fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .context(format!("unable to read graph file '{}'", path.display()))?;
        let graph: Graph<PackageInfo, DependencyEdge> = serde_json::from_slice(&data)
            .context(format!("unable to parse graph file '{}'", path.display()))?;
        let index = graph
            .node_indices()
            .map(|idx| (graph[idx].name.clone(), idx))
            .collect();
        Ok(Self { graph, index })
    }

    /// Build the graph of an APT-managed guest from a single `dpkg-query`
    /// call.
    async fn from_apt(handle: &dyn GuestHandle) -> Result<Self> {
        let listing = handle
            .sh(
                "dpkg-query --show --showformat='${Package};${Version};${Architecture};\
                 ${Essential};${Installed-Size};${Depends};${Pre-Depends}\\n'",
            )
            .await
            .context("unable to enumerate installed packages")?;

        let mut graph = DependencyGraph::new();
        let mut packages = HashMap::new();
        for line in listing.lines().filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split(';').collect();
            ensure!(
                fields.len() == 7,
                "unparseable package line from dpkg-query: '{line}'"
            );
            let size_kib: u64 = fields[4].trim().parse().context(format!(
                "unparseable install size '{}' for package '{}'",
                fields[4], fields[0]
            ))?;
            let info = PackageInfo {
                name: fields[0].to_string(),
                version: fields[1].to_string(),
                architecture: fields[2].to_string(),
                essential: fields[3] == "yes",
                // dpkg reports KiB; stored sizes are decimal-scaled bytes for
                // compatibility with existing repositories.
                size: size_kib * 1000,
                path: None,
            };
            packages.insert(info.name.clone(), info);
        }
        for info in packages.values() {
            graph.add_package(info.clone());
        }

        for line in listing.lines().filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split(';').collect();
            let name = fields[0];
            for (dep, edge) in apt_dependency_edges(name, fields[5], fields[6], &packages)? {
                graph.add_dependency(name, &dep, edge);
            }
        }
        Ok(graph)
    }

    /// Build the graph of a DNF-managed guest from `rpm -qa` plus an
    /// `rpmdep` listing generated inside the guest.
    async fn from_dnf(handle: &dyn GuestHandle) -> Result<Self> {
        let listing = handle
            .sh("rpm --query --all --queryformat '%{NAME};%{VERSION};%{ARCH};%{SIZE}\\n'")
            .await
            .context("unable to enumerate installed packages")?;

        let mut graph = DependencyGraph::new();
        let mut ignored = Vec::new();
        for line in listing.lines().filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split(';').collect();
            ensure!(
                fields.len() == 4,
                "unparseable package line from rpm: '{line}'"
            );
            if DNF_IGNORE_SET.contains(&fields[0]) {
                ignored.push(fields[0].to_string());
                continue;
            }
            graph.add_package(PackageInfo {
                name: fields[0].to_string(),
                version: fields[1].to_string(),
                architecture: fields[2].to_string(),
                essential: false,
                // the rpm SIZE tag is already in bytes
                size: fields[3].trim().parse().context(format!(
                    "unparseable install size '{}' for package '{}'",
                    fields[3], fields[0]
                ))?,
                path: None,
            });
        }
        if !ignored.is_empty() {
            debug!(
                "packages ignored while creating the image graph: {}",
                ignored.join(",")
            );
        }

        let dependencies = fetch_rpmdep_listing(handle).await?;
        for line in dependencies.lines() {
            let Some(captures) = DNF_DEP.captures(line) else {
                continue;
            };
            let name = &captures[1];
            let dep = &captures[2];
            if name.contains("rpmlib")
                || dep.contains("rpmlib")
                || DNF_IGNORE_SET.contains(&name)
                || DNF_IGNORE_SET.contains(&dep)
            {
                continue;
            }
            if !graph.add_dependency(name, dep, DependencyEdge::unconstrained()) {
                debug!("not processed: {name} -> {dep}");
            }
        }
        Ok(graph)
    }
}

/// Resolve the dependency declarations of one APT package into edges.
///
/// Each comma-separated dependency lists alternatives separated by `|`; the
/// first alternative that is installed and architecture-compatible wins. An
/// alternative the pattern cannot read at all is a fatal parse error.
fn apt_dependency_edges(
    name: &str,
    depends: &str,
    predepends: &str,
    packages: &HashMap<String, PackageInfo>,
) -> Result<Vec<(String, DependencyEdge)>> {
    let mut edges = Vec::new();
    let combined = format!("{depends},{predepends}");
    for dep in combined.split(',').filter(|d| !d.is_empty()) {
        for alternative in dep.split('|') {
            let Some(captures) = APT_DEP.captures(alternative) else {
                bail!("could not match dependency line: '{name}' -> '{alternative}'");
            };
            let dep_name = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            let dep_arch = captures.get(2).map(|m| m.as_str());
            let Some(target) = packages.get(dep_name) else {
                continue;
            };
            let arch_ok = match dep_arch {
                None => true,
                Some("any") => true,
                Some(arch) => arch == target.architecture || target.architecture == "all",
            };
            if !arch_ok {
                continue;
            }
            let edge = match captures.get(3) {
                None => DependencyEdge::unconstrained(),
                Some(constraint) => {
                    let parts: Vec<&str> = constraint.as_str().split_whitespace().collect();
                    ensure!(
                        parts.len() == 2,
                        "could not read version constraint '{}' of dependency '{name}' -> '{dep_name}'",
                        constraint.as_str()
                    );
                    DependencyEdge {
                        constraint: true,
                        operator: parts[0].to_string(),
                        version: parts[1].to_string(),
                    }
                }
            };
            edges.push((dep_name.to_string(), edge));
            break;
        }
    }
    Ok(edges)
}

/// Run `rpmdep` in the guest and bring its output to the host. The tool
/// exits unsuccessfully on images where a virtual provider cannot be
/// resolved while still writing a usable listing, so that warning is
/// tolerated.
async fn fetch_rpmdep_listing(handle: &dyn GuestHandle) -> Result<String> {
    static FETCH_ID: AtomicU64 = AtomicU64::new(0);

    match handle
        .sh(&format!("rpmdep -level --all > {RPMDEP_GUEST_PATH}"))
        .await
    {
        Ok(_) => {}
        Err(GuestError::Shell { ref stderr, .. })
            if stderr.contains("WARNING (name2pac) can not find who provides") =>
        {
            debug!("ignoring benign rpmdep warning");
        }
        Err(e) => {
            return Err(e).context("error while fetching dependency information from guest")
        }
    }

    let host_path = std::env::temp_dir().join(format!(
        "vmsever-rpmdep-{}-{}.txt",
        std::process::id(),
        FETCH_ID.fetch_add(1, Ordering::Relaxed)
    ));
    handle.download(RPMDEP_GUEST_PATH, &host_path).await?;
    handle.rm_rf(RPMDEP_GUEST_PATH).await?;
    let listing = std::fs::read_to_string(&host_path)
        .context("unable to read downloaded dependency listing")?;
    let _ = std::fs::remove_file(&host_path);
    Ok(listing)
}
