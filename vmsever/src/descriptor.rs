//! In-memory descriptions of images and their package graphs.
//!
//! Three roles share one surface: a base image (graph plus distribution
//! quadruple), a full VMI (base plus name and declared main services), and a
//! master (base plus the aggregated main services of every VMI assigned to
//! it). Only the master can merge further subgraphs into itself.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use guest_cli_wrapper::{GuestHandle, PackageManager};

use crate::graph::{DependencyGraph, PackageCoord, PackageInfo};

/// Two architectures agree when equal or when either side is the `all`
/// wildcard.
pub(crate) fn arch_compatible(a: &str, b: &str) -> bool {
    a == b || a == "all" || b == "all"
}

#[derive(Debug, Clone)]
pub(crate) struct BaseImageDescriptor {
    pub(crate) image_path: PathBuf,
    pub(crate) distribution: String,
    pub(crate) distribution_version: String,
    pub(crate) architecture: String,
    pub(crate) package_manager: PackageManager,
    pub(crate) graph: DependencyGraph,
    pub(crate) graph_path: Option<PathBuf>,
}

impl BaseImageDescriptor {
    /// Describe the image behind an open handle by inspecting it and building
    /// its package graph.
    pub(crate) async fn from_guest(image_path: &Path, handle: &dyn GuestHandle) -> Result<Self> {
        let os = handle.os();
        Ok(Self {
            image_path: image_path.to_path_buf(),
            distribution: os.distribution.clone(),
            distribution_version: os.version(),
            architecture: os.architecture.clone(),
            package_manager: os.package_manager,
            graph: DependencyGraph::from_guest(handle).await?,
            graph_path: None,
        })
    }

    /// Rehydrate a stored base image from catalog fields and its graph file.
    pub(crate) fn from_repo(
        image_path: PathBuf,
        distribution: String,
        distribution_version: String,
        architecture: String,
        package_manager: PackageManager,
        graph_path: PathBuf,
    ) -> Result<Self> {
        let graph = DependencyGraph::load(&graph_path)?;
        Ok(Self {
            image_path,
            distribution,
            distribution_version,
            architecture,
            package_manager,
            graph,
            graph_path: Some(graph_path),
        })
    }

    /// Write the graph next to the image file, replacing any previous copy.
    pub(crate) fn save_graph(&mut self) -> Result<()> {
        let path = match &self.graph_path {
            Some(path) => path.clone(),
            None => {
                let path = graph_path_for(&self.image_path, "");
                self.graph_path = Some(path.clone());
                path
            }
        };
        if path.is_file() {
            std::fs::remove_file(&path)
                .context(format!("unable to replace graph file '{}'", path.display()))?;
        }
        self.graph.save(&path)
    }

    pub(crate) fn total_install_size(&self) -> u64 {
        self.graph.total_install_size()
    }

    /// Whether every given package that also exists in this image agrees on
    /// version and architecture. Packages this image does not carry impose no
    /// constraint.
    pub(crate) fn compatible_with<'a, I>(&self, packages: I) -> bool
    where
        I: IntoIterator<Item = &'a PackageCoord>,
    {
        for coord in packages {
            let Some(installed) = self.graph.package(&coord.name) else {
                continue;
            };
            if installed.version != coord.version
                || !arch_compatible(&installed.architecture, &coord.architecture)
            {
                log::debug!(
                    "compatibility check failed on package '{}': {} vs {}, {} vs {}",
                    coord.name,
                    installed.version,
                    coord.version,
                    installed.architecture,
                    coord.architecture,
                );
                return false;
            }
        }
        true
    }

    /// A fresh master seeded with this base's graph and no main services.
    pub(crate) fn to_master(&self) -> MasterDescriptor {
        let mut base = self.clone();
        base.graph_path = None;
        MasterDescriptor {
            base,
            main_services: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct VmiDescriptor {
    pub(crate) base: BaseImageDescriptor,
    pub(crate) name: String,
    pub(crate) main_services: Vec<String>,
}

impl VmiDescriptor {
    pub(crate) async fn from_guest(
        image_path: &Path,
        name: &str,
        main_services: Vec<String>,
        handle: &dyn GuestHandle,
    ) -> Result<Self> {
        Ok(Self {
            base: BaseImageDescriptor::from_guest(image_path, handle).await?,
            name: name.to_string(),
            main_services,
        })
    }

    /// Per main service, the packages of its dependency closure (the main
    /// service itself included).
    pub(crate) fn main_service_dep_lists(
        &self,
    ) -> Vec<(String, std::collections::HashMap<String, PackageInfo>)> {
        self.main_services
            .iter()
            .map(|ms| (ms.clone(), self.base.graph.closure(&[ms.clone()])))
            .collect()
    }

    /// The union of all main-service closures.
    pub(crate) fn main_service_closure(
        &self,
    ) -> std::collections::HashMap<String, PackageInfo> {
        self.base.graph.closure(&self.main_services)
    }

    pub(crate) fn main_service_subgraph(&self) -> DependencyGraph {
        self.base.graph.subgraph(&self.main_services)
    }
}

/// The union of main-service subgraphs of every VMI assigned to one base
/// image. Grows monotonically while the base exists and is folded into the
/// successor when the base is replaced.
#[derive(Debug, Clone)]
pub(crate) struct MasterDescriptor {
    pub(crate) base: BaseImageDescriptor,
    pub(crate) main_services: BTreeSet<String>,
}

impl MasterDescriptor {
    /// Rehydrate a stored master from catalog fields, its graph file, and
    /// the aggregated main-service names.
    pub(crate) fn from_repo(
        image_path: PathBuf,
        distribution: String,
        distribution_version: String,
        architecture: String,
        package_manager: PackageManager,
        master_graph_path: PathBuf,
        main_services: Vec<String>,
    ) -> Result<Self> {
        let base = BaseImageDescriptor::from_repo(
            image_path,
            distribution,
            distribution_version,
            architecture,
            package_manager,
            master_graph_path,
        )?;
        Ok(Self {
            base,
            main_services: main_services.into_iter().collect(),
        })
    }

    pub(crate) fn graph_path(&self) -> PathBuf {
        match &self.base.graph_path {
            Some(path) => path.clone(),
            None => graph_path_for(&self.base.image_path, "_MASTER"),
        }
    }

    /// Write the master graph next to the base image file.
    pub(crate) fn save_graph(&mut self) -> Result<()> {
        let path = self.graph_path();
        self.base.graph_path = Some(path.clone());
        if path.is_file() {
            std::fs::remove_file(&path)
                .context(format!("unable to replace graph file '{}'", path.display()))?;
        }
        self.base.graph.save(&path)
    }

    pub(crate) fn main_service_subgraph(&self) -> DependencyGraph {
        let roots: Vec<String> = self.main_services.iter().cloned().collect();
        self.base.graph.subgraph(&roots)
    }

    /// Fold a main-service subgraph into the master. Refused when any shared
    /// package disagrees on version or architecture.
    pub(crate) fn add_subgraph(
        &mut self,
        main_services: impl IntoIterator<Item = String>,
        subgraph: &DependencyGraph,
    ) -> Result<()> {
        let coords: Vec<PackageCoord> = subgraph
            .node_data()
            .values()
            .map(|info| PackageCoord::from(*info))
            .collect();
        if !self.base.compatible_with(coords.iter()) {
            bail!(
                "refusing to add incompatible packages to the master graph of '{}'",
                self.base.image_path.display()
            );
        }
        self.base.graph.union_with(subgraph);
        self.main_services.extend(main_services);
        Ok(())
    }
}

/// Graph file path belonging to an image: the extension separator is folded
/// into the name and an optional marker is appended, so
/// `BaseImages/ubuntu_16_04_apt_amd64.qcow2` keeps its graphs at
/// `..._qcow2.json` and `..._qcow2_MASTER.json`.
fn graph_path_for(image_path: &Path, marker: &str) -> PathBuf {
    let file_name = image_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let folded = match file_name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}_{ext}"),
        None => file_name.to_string(),
    };
    image_path.with_file_name(format!("{folded}{marker}.json"))
}
