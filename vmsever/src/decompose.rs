//! Decomposition of a VMI into (base image, home archive, package set).
//!
//! The steps per image: build the descriptor, export the main-service
//! closure into the package store, strip the image down to a base, pick the
//! base image to retain among all compatible ones, and record everything in
//! the catalog. Catalog rows are written in a single transaction; the base
//! image file is moved and replaced files are deleted only after commit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, ensure, Context, Result};
use guest_cli_wrapper::{GuestHandle, GuestTool};
use log::{info, warn};

use crate::catalog::{Catalog, CompatibleBase, DecompositionRecord};
use crate::config::Config;
use crate::descriptor::{BaseImageDescriptor, VmiDescriptor};
use crate::graph::{PackageCoord, PackageInfo};
use crate::manipulate::VmiManipulator;
use crate::repository;
use crate::similarity::weighted_similarity;

pub(crate) struct Decomposer<'a> {
    config: &'a Config,
    tool: &'a GuestTool,
}

/// What one decomposition did, for reporting and evaluation.
#[derive(Debug, Default)]
pub(crate) struct DecompositionOutcome {
    /// Human-readable description of how the base image was stored.
    pub(crate) base_image_treatment: String,
    /// Number of packages in the main-service closure.
    pub(crate) required_packages: usize,
    /// How many of those had to be exported (rest were already stored).
    pub(crate) exported_packages: usize,
    pub(crate) required_size: u64,
    pub(crate) exported_size: u64,
    pub(crate) handle_creation_secs: f64,
    pub(crate) export_secs: f64,
    /// Highest similarity seen against a stored master graph, with that
    /// master's image path and package count.
    pub(crate) best_master_similarity: Option<(f64, String, usize)>,
    pub(crate) master_comparisons: usize,
    pub(crate) similarity_secs: f64,
}

/// Everything gathered while the guest handle was open.
struct GuestPhase {
    vmi: VmiDescriptor,
    ms_dep_lists: Vec<(String, HashMap<String, PackageInfo>)>,
    ms_subgraph: crate::graph::DependencyGraph,
    ms_closure: HashMap<String, PackageInfo>,
    exported: Vec<PackageInfo>,
    new_base: BaseImageDescriptor,
    user_dir: PathBuf,
    outcome: DecompositionOutcome,
}

impl<'a> Decomposer<'a> {
    pub(crate) fn new(config: &'a Config, tool: &'a GuestTool) -> Self {
        Self { config, tool }
    }

    pub(crate) async fn decompose(
        &self,
        vmi_path: &Path,
        vmi_name: &str,
        main_services: Vec<String>,
    ) -> Result<DecompositionOutcome> {
        info!("decomposing VMI '{vmi_name}' at '{}'", vmi_path.display());
        ensure!(
            vmi_path.is_file(),
            "cannot decompose VMI '{vmi_name}': file '{}' does not exist",
            vmi_path.display()
        );
        let mut catalog = Catalog::open(self.config)?;
        ensure!(
            !catalog.vmi_exists(vmi_name)?,
            "cannot decompose VMI '{vmi_name}': a VMI with that name already exists"
        );

        let start = Instant::now();
        let mut handle = self.tool.open(vmi_path, true).await?;
        let handle_creation_secs = start.elapsed().as_secs_f64();

        let guest_phase = self
            .guest_phase(&*handle, &catalog, vmi_path, vmi_name, main_services)
            .await;
        let close_result = handle.close().await;
        let mut phase = guest_phase?;
        close_result.context("unable to close guest handle")?;
        phase.outcome.handle_creation_secs = handle_creation_secs;

        self.store_phase(&mut catalog, phase).await
    }

    /// Steps that need the mounted guest: descriptor construction, package
    /// export, package and home removal.
    async fn guest_phase(
        &self,
        handle: &dyn GuestHandle,
        catalog: &Catalog,
        vmi_path: &Path,
        vmi_name: &str,
        main_services: Vec<String>,
    ) -> Result<GuestPhase> {
        info!("creating VMI graph");
        let vmi = VmiDescriptor::from_guest(vmi_path, vmi_name, main_services, handle).await?;
        info!(
            "VMI information: distribution={} version={} architecture={} package manager={}",
            vmi.base.distribution,
            vmi.base.distribution_version,
            vmi.base.architecture,
            vmi.base.package_manager,
        );
        check_main_services(&vmi)?;

        let mut outcome = DecompositionOutcome::default();
        compare_with_master_graphs(&vmi, catalog, &mut outcome)?;

        let ms_dep_lists = vmi.main_service_dep_lists();
        let ms_subgraph = vmi.main_service_subgraph();
        let ms_closure = vmi.main_service_closure();

        let manipulator = VmiManipulator::new(handle, vmi_name, self.config);

        // Only packages the store does not hold yet are exported.
        let mut to_export: HashMap<String, PackageInfo> = HashMap::new();
        for (name, info) in &ms_closure {
            outcome.required_size += info.size;
            if !catalog.package_exists(
                name,
                &info.version,
                &info.architecture,
                &vmi.base.distribution,
            )? {
                outcome.exported_size += info.size;
                to_export.insert(name.clone(), info.clone());
            }
        }
        outcome.required_packages = ms_closure.len();
        outcome.exported_packages = to_export.len();
        info!(
            "package export: main services {}; {} package(s) required, {} already stored, {} to export",
            vmi.main_services.join(","),
            outcome.required_packages,
            outcome.required_packages - outcome.exported_packages,
            outcome.exported_packages,
        );
        let start = Instant::now();
        manipulator
            .export_packages(&mut to_export, &vmi.base.distribution)
            .await?;
        outcome.export_secs = start.elapsed().as_secs_f64();
        let exported: Vec<PackageInfo> = to_export.into_values().collect();

        info!(
            "package removal: removing {} main service(s) and unneeded dependencies",
            vmi.main_services.len()
        );
        manipulator.remove_packages(&vmi.main_services).await?;
        let new_base = BaseImageDescriptor::from_guest(vmi_path, handle).await?;
        info!(
            "in total, {} packages have been removed",
            vmi.base.graph.package_count() - new_base.graph.package_count()
        );

        let user_dir = manipulator.export_home_dir().await?;
        info!("user folder exported to '{}'", user_dir.display());
        manipulator.remove_home_dir().await?;

        Ok(GuestPhase {
            vmi,
            ms_dep_lists,
            ms_subgraph,
            ms_closure,
            exported,
            new_base,
            user_dir,
            outcome,
        })
    }

    /// Steps after the guest is closed: base selection, graph persistence,
    /// the catalog transaction, and the deferred file moves.
    async fn store_phase(
        &self,
        catalog: &mut Catalog,
        phase: GuestPhase,
    ) -> Result<DecompositionOutcome> {
        let GuestPhase {
            vmi,
            ms_dep_lists,
            ms_subgraph,
            ms_closure,
            exported,
            new_base,
            user_dir,
            mut outcome,
        } = phase;

        let existing = catalog.compatible_base_candidates(
            &new_base.distribution,
            &new_base.distribution_version,
            &new_base.architecture,
            new_base.package_manager,
        )?;
        let new_ms_packages: HashMap<String, PackageCoord> = ms_closure
            .values()
            .map(|info| (info.name.clone(), PackageCoord::from(info)))
            .collect();
        let selection = choose_base_image(&new_base, &new_ms_packages, &existing);

        let stripped_input = new_base.image_path.clone();
        let mut replaced_rows = Vec::new();
        for &idx in &selection.replaced_existing {
            let row = catalog
                .base_image_row(existing[idx].id)?
                .context("catalog corruption: replaced base image disappeared")?;
            replaced_rows.push(row);
        }
        let replaced_ids: Vec<i64> = replaced_rows.iter().map(|row| row.id).collect();

        let (chosen_base, mut master, move_new_base) = match selection.chosen {
            Chosen::New => {
                info!("the base image of the new VMI will remain");
                if replaced_rows.is_empty() {
                    info!("no compatible base images found in repository");
                } else {
                    for row in &replaced_rows {
                        info!("replacing base image '{}'", row.file_path.display());
                    }
                }
                let mut base = new_base.clone();
                base.image_path = reserved_base_path(self.config, &base);
                base.save_graph()?;
                let master = base.to_master();
                (base, master, true)
            }
            Chosen::Existing(idx) => {
                let chosen = &existing[idx];
                info!(
                    "the new VMI is compatible with existing base image '{}'",
                    chosen.descriptor.image_path.display()
                );
                let master = catalog
                    .master_descriptor(chosen.id)?
                    .context("catalog corruption: chosen base image has no master graph")?;
                (chosen.descriptor.clone(), master, false)
            }
        };

        // Fold the new main services in, then the masters of every replaced
        // base. A conflicting fold is refused and logged, never fatal.
        if let Err(e) = master.add_subgraph(vmi.main_services.iter().cloned(), &ms_subgraph) {
            warn!("{e:#}");
        }
        for row in &replaced_rows {
            let old_master = catalog
                .master_descriptor(row.id)?
                .context("catalog corruption: replaced base image has no master graph")?;
            let services: Vec<String> = old_master.main_services.iter().cloned().collect();
            if let Err(e) = master.add_subgraph(services, &old_master.main_service_subgraph()) {
                warn!("{e:#}");
            }
        }
        // The folded master belongs to the chosen image, wherever that is.
        master.base.image_path = chosen_base.image_path.clone();
        master.base.graph_path = None;
        let master_graph_path = master.graph_path();
        master.save_graph()?;

        catalog.record_decomposition(&DecompositionRecord {
            vmi_name: &vmi.name,
            user_dir_path: &user_dir,
            distribution: &vmi.base.distribution,
            exported_packages: &exported,
            chosen_base: &chosen_base,
            master_graph_path: &master_graph_path,
            ms_dep_lists: &ms_dep_lists,
            replaced_base_ids: &replaced_ids,
        })?;

        // Catalog state is committed; now touch the filesystem.
        if move_new_base {
            repository::move_file(&stripped_input, &chosen_base.image_path).await?;
        } else if selection.discard_new_base {
            tokio::fs::remove_file(&stripped_input).await.context(format!(
                "unable to remove superseded base image '{}'",
                stripped_input.display()
            ))?;
        }
        for row in &replaced_rows {
            for path in [&row.file_path, &row.graph_path, &row.master_graph_path] {
                if path.is_file() {
                    tokio::fs::remove_file(path).await.context(format!(
                        "unable to remove replaced base image file '{}'",
                        path.display()
                    ))?;
                }
            }
        }

        outcome.base_image_treatment = if replaced_rows.is_empty() {
            if move_new_base {
                format!(
                    "New base image added as \"{}\"",
                    file_name(&chosen_base.image_path)
                )
            } else {
                format!(
                    "Existing base image \"{}\" reused",
                    file_name(&chosen_base.image_path)
                )
            }
        } else {
            let replaced: Vec<String> = replaced_rows
                .iter()
                .map(|row| file_name(&row.file_path))
                .collect();
            format!(
                "\"{}\" replaces \"{}\"",
                file_name(&chosen_base.image_path),
                replaced.join(",")
            )
        };
        info!("VMI successfully decomposed and added to repository");
        Ok(outcome)
    }
}

/// Error out when a declared main service is not installed, suggesting
/// near-miss package names when there are any.
fn check_main_services(vmi: &VmiDescriptor) -> Result<()> {
    for ms in &vmi.main_services {
        if !vmi.base.graph.contains(ms) {
            let similar = vmi.base.graph.names_containing(ms);
            if similar.is_empty() {
                bail!("main service '{ms}' does not exist in '{}'", vmi.name);
            }
            bail!(
                "main service '{ms}' does not exist in '{}'\nDid you mean one of the following?\n{}",
                vmi.name,
                similar.join(",")
            );
        }
    }
    Ok(())
}

/// Report the similarity of a new VMI against every stored master graph.
fn compare_with_master_graphs(
    vmi: &VmiDescriptor,
    catalog: &Catalog,
    outcome: &mut DecompositionOutcome,
) -> Result<()> {
    let start = Instant::now();
    let masters = catalog.master_descriptors()?;
    outcome.master_comparisons = masters.len();
    for master in &masters {
        let similarity = weighted_similarity(vmi, master, true);
        info!(
            "similarity to master graph of '{}': {:0.2}",
            master.base.image_path.display(),
            similarity
        );
        let better = outcome
            .best_master_similarity
            .as_ref()
            .map(|(best, _, _)| similarity > *best)
            .unwrap_or(true);
        if better {
            outcome.best_master_similarity = Some((
                similarity,
                master.base.image_path.display().to_string(),
                master.base.graph.package_count(),
            ));
        }
    }
    outcome.similarity_secs = start.elapsed().as_secs_f64();
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Chosen {
    New,
    /// Index into the existing-candidate list.
    Existing(usize),
}

#[derive(Debug)]
struct Selection {
    chosen: Chosen,
    /// Indices of existing bases the chosen one replaces.
    replaced_existing: Vec<usize>,
    /// Whether the stripped input image is superseded by an existing base
    /// and its file should be discarded.
    discard_new_base: bool,
}

/// Pick the base image to retain.
///
/// Candidates are the existing compatible bases plus the new one. `C[a][b]`
/// holds when `a` can stand in for `b`, i.e. `a` is compatible with the
/// main-service packages recorded for `b`. Candidates are tried by widest
/// coverage first, then smaller install size, then existing before new; the
/// first one that covers the new VMI wins and replaces everything else it
/// covers.
fn choose_base_image(
    new_base: &BaseImageDescriptor,
    new_ms_packages: &HashMap<String, PackageCoord>,
    existing: &[CompatibleBase],
) -> Selection {
    if existing.is_empty() {
        return Selection {
            chosen: Chosen::New,
            replaced_existing: Vec::new(),
            discard_new_base: false,
        };
    }

    // Index arrangement: 0..existing.len() are the stored bases, the last
    // entry is the new base.
    let total = existing.len() + 1;
    let new_idx = existing.len();
    let descriptor = |i: usize| -> &BaseImageDescriptor {
        if i == new_idx {
            new_base
        } else {
            &existing[i].descriptor
        }
    };
    let ms_packages = |i: usize| -> &HashMap<String, PackageCoord> {
        if i == new_idx {
            new_ms_packages
        } else {
            &existing[i].ms_packages
        }
    };

    let mut covers = vec![vec![false; total]; total];
    for a in 0..total {
        for b in 0..total {
            covers[a][b] = a == b || descriptor(a).compatible_with(ms_packages(b).values());
        }
    }

    let mut order: Vec<usize> = (0..total).collect();
    order.sort_by_key(|&i| {
        let count = covers[i].iter().filter(|&&c| c).count();
        (
            -(count as i64),
            descriptor(i).total_install_size(),
            (i == new_idx) as u8,
        )
    });

    for &candidate in &order {
        if candidate != new_idx && !covers[candidate][new_idx] {
            continue;
        }
        let replaced_existing: Vec<usize> = (0..existing.len())
            .filter(|&other| other != candidate && covers[candidate][other])
            .collect();
        let discard_new_base = candidate != new_idx;
        return Selection {
            chosen: if candidate == new_idx {
                Chosen::New
            } else {
                Chosen::Existing(candidate)
            },
            replaced_existing,
            discard_new_base,
        };
    }

    // Unreachable since the new base always covers itself, but do not guess.
    Selection {
        chosen: Chosen::New,
        replaced_existing: Vec::new(),
        discard_new_base: false,
    }
}

/// Collision-safe destination for a retained base image:
/// `<distro>_<version>_<pkgmgr>_<arch>[_N].<ext>`.
fn reserved_base_path(config: &Config, base: &BaseImageDescriptor) -> PathBuf {
    let extension = base
        .image_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("qcow2");
    let stem = format!(
        "{}_{}_{}_{}",
        base.distribution, base.distribution_version, base.package_manager, base.architecture
    );
    let mut path = config.base_images_dir().join(format!("{stem}.{extension}"));
    let mut number = 0;
    while path.is_file() {
        number += 1;
        path = config
            .base_images_dir()
            .join(format!("{stem}_{number}.{extension}"));
    }
    path
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::DependencyGraph;
    use guest_cli_wrapper::PackageManager;

    fn base(name: &str, packages: &[(&str, &str, &str, u64)]) -> BaseImageDescriptor {
        let mut graph = DependencyGraph::new();
        for (pkg, version, arch, size) in packages {
            graph.add_package(PackageInfo {
                name: pkg.to_string(),
                version: version.to_string(),
                architecture: arch.to_string(),
                essential: false,
                size: *size,
                path: None,
            });
        }
        BaseImageDescriptor {
            image_path: PathBuf::from(format!("{name}.qcow2")),
            distribution: "ubuntu".to_string(),
            distribution_version: "16_04".to_string(),
            architecture: "amd64".to_string(),
            package_manager: PackageManager::Apt,
            graph,
            graph_path: None,
        }
    }

    fn coords(packages: &[(&str, &str, &str)]) -> HashMap<String, PackageCoord> {
        packages
            .iter()
            .map(|(name, version, arch)| {
                (
                    name.to_string(),
                    PackageCoord {
                        name: name.to_string(),
                        version: version.to_string(),
                        architecture: arch.to_string(),
                    },
                )
            })
            .collect()
    }

    fn candidate(
        id: i64,
        descriptor: BaseImageDescriptor,
        ms: &[(&str, &str, &str)],
    ) -> CompatibleBase {
        CompatibleBase {
            id,
            descriptor,
            ms_packages: coords(ms),
        }
    }

    #[test]
    fn no_existing_bases_keeps_the_new_one() {
        let new_base = base("new", &[("libc", "2.23", "amd64", 100)]);
        let selection = choose_base_image(&new_base, &coords(&[("nginx", "1.10", "amd64")]), &[]);
        assert_eq!(selection.chosen, Chosen::New);
        assert!(selection.replaced_existing.is_empty());
        assert!(!selection.discard_new_base);
    }

    #[test]
    fn identical_existing_base_is_preferred_over_the_new_one() {
        // Same base OS, disjoint main services: mutual coverage, tie broken
        // toward the existing base.
        let shared = &[("libc", "2.23", "amd64", 100u64)];
        let new_base = base("new", shared);
        let existing = vec![candidate(1, base("stored", shared), &[("nginx", "1.10", "amd64")])];
        let selection = choose_base_image(
            &new_base,
            &coords(&[("apache2", "2.4", "amd64")]),
            &existing,
        );
        assert_eq!(selection.chosen, Chosen::Existing(0));
        assert!(selection.replaced_existing.is_empty());
        // the stripped input is superseded and must not be kept
        assert!(selection.discard_new_base);
    }

    #[test]
    fn broader_new_base_replaces_the_stored_one() {
        // The stored base pins libc at a version the new closure conflicts
        // with, while the new base can still host the stored services.
        let existing = vec![candidate(
            7,
            base("stored", &[("libc", "2.22", "amd64", 100)]),
            &[("nginx", "1.10", "amd64")],
        )];
        let new_ms = coords(&[("apache2", "2.4", "amd64"), ("libc", "2.23", "amd64")]);
        let new_base = base("new", &[("libc", "2.23", "amd64", 100)]);
        let selection = choose_base_image(&new_base, &new_ms, &existing);
        assert_eq!(selection.chosen, Chosen::New);
        // the new base covers the stored one's services, so it replaces it
        assert_eq!(selection.replaced_existing, vec![0]);
        assert!(!selection.discard_new_base);
    }

    #[test]
    fn chosen_base_always_covers_the_new_closure() {
        // A wide-coverage candidate that cannot host the new VMI must be
        // passed over.
        let wide = candidate(
            1,
            base("wide", &[("libc", "2.22", "amd64", 50)]),
            &[("redis", "3.0", "amd64")],
        );
        let narrow = candidate(
            2,
            base("narrow", &[("libc", "2.23", "amd64", 60)]),
            &[("postgres", "9.5", "amd64")],
        );
        let new_base = base("new", &[("libc", "2.23", "amd64", 70)]);
        let new_ms = coords(&[("nginx", "1.10", "amd64"), ("libc", "2.23", "amd64")]);
        let selection = choose_base_image(&new_base, &new_ms, &[wide, narrow]);
        // "wide" conflicts with the new closure on libc; "narrow" is fine
        match selection.chosen {
            Chosen::Existing(idx) => assert_eq!(idx, 1),
            Chosen::New => panic!("expected an existing base to be chosen"),
        }
    }

    #[test]
    fn smaller_base_wins_among_equal_coverage() {
        let small = candidate(
            1,
            base("small", &[("libc", "2.23", "amd64", 10)]),
            &[("nginx", "1.10", "amd64")],
        );
        let large = candidate(
            2,
            base("large", &[("libc", "2.23", "amd64", 999)]),
            &[("apache2", "2.4", "amd64")],
        );
        let new_base = base("new", &[("libc", "2.23", "amd64", 500)]);
        let new_ms = coords(&[("redis", "3.0", "amd64")]);
        let selection = choose_base_image(&new_base, &new_ms, &[small, large]);
        // every candidate covers everything; the smallest image is kept
        assert_eq!(selection.chosen, Chosen::Existing(0));
        assert_eq!(selection.replaced_existing, vec![1]);
        assert!(selection.discard_new_base);
    }

    #[test]
    fn reserved_path_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted(dir.path());
        std::fs::create_dir_all(config.base_images_dir()).unwrap();
        let descriptor = base("source", &[]);

        let first = reserved_base_path(&config, &descriptor);
        assert_eq!(
            file_name(&first),
            "ubuntu_16_04_apt_amd64.qcow2".to_string()
        );
        std::fs::write(&first, b"image").unwrap();
        let second = reserved_base_path(&config, &descriptor);
        assert_eq!(
            file_name(&second),
            "ubuntu_16_04_apt_amd64_1.qcow2".to_string()
        );
    }
}
