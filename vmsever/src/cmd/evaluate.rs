use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, ValueEnum};
use guest_cli_wrapper::GuestTool;
use log::info;

use crate::catalog::Catalog;
use crate::cmd::{guest_tool, require_relative};
use crate::config::Config;
use crate::descriptor::VmiDescriptor;
use crate::evaluation::{save_similarity_matrix, DecompositionLog, ReassemblyLog};
use crate::reassemble::Reassembler;
use crate::repository;
use crate::sidecar::{sidecar_path, Sidecar};
use crate::similarity;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum Benchmark {
    /// Decompose a VMI set into one shared repository.
    Decomposition1,
    /// Decompose with a repository reset before every VMI.
    Decomposition2,
    /// Reassemble every stored VMI.
    Reassembly,
    /// Pairwise main-service similarity over a VMI set.
    Similarity,
}

/// Run a benchmark and write its measurements as CSV under `Evaluations/`.
#[derive(Debug, Parser)]
pub(crate) struct Evaluate {
    /// How often to repeat the whole run.
    #[clap(long, default_value_t = 1)]
    repetitions: u32,

    /// Folder with the source VMIs and their sidecar manifests, relative to
    /// the working directory. Required for everything but `reassembly`.
    #[clap(long)]
    path: Option<PathBuf>,

    #[clap(value_enum)]
    benchmark: Benchmark,
}

impl Evaluate {
    pub(crate) async fn run(&self, config: &Config) -> Result<()> {
        repository::ensure_layout(config).await?;
        tokio::fs::create_dir_all(&config.evaluations_dir).await?;
        let tool = guest_tool()?;
        match self.benchmark {
            Benchmark::Decomposition1 => {
                self.evaluate_decomposition(config, &tool, true).await?;
            }
            Benchmark::Decomposition2 => {
                self.evaluate_decomposition(config, &tool, false).await?;
            }
            Benchmark::Reassembly => self.evaluate_reassembly(config, &tool).await?,
            Benchmark::Similarity => self.evaluate_similarity(config, &tool).await?,
        }
        info!(
            "evaluation completed, results saved in '{}'",
            config.evaluations_dir.display()
        );
        Ok(())
    }

    fn source_folder(&self) -> Result<&Path> {
        let path = self
            .path
            .as_deref()
            .context("this benchmark needs --path pointing at a folder of VMIs")?;
        require_relative(path)?;
        ensure!(path.is_dir(), "'{}' is not a directory", path.display());
        Ok(path)
    }

    async fn evaluate_similarity(&self, config: &Config, tool: &GuestTool) -> Result<()> {
        let source = self.source_folder()?;
        verify_source_folder(config, source)?;
        let vmi_data = sorted_vmi_data(config, source)?;

        let mut descriptors = Vec::new();
        for (count, (path, file_name, _, main_services)) in vmi_data.iter().enumerate() {
            info!(
                "creating descriptor for VMI '{}' ({}/{})",
                file_name,
                count + 1,
                vmi_data.len()
            );
            let mut handle = tool.open(path, false).await?;
            let descriptor =
                VmiDescriptor::from_guest(path, file_name, main_services.clone(), &*handle).await;
            let close_result = handle.close().await;
            let vmi = descriptor?;
            close_result.context("unable to close guest handle")?;
            for ms in &vmi.main_services {
                ensure!(
                    vmi.base.graph.contains(ms),
                    "main service '{ms}' does not exist in '{}'",
                    path.display()
                );
            }
            descriptors.push(vmi);
        }

        let matrix = similarity::many_to_many(&descriptors, true);
        let csv_path = config.evaluations_dir.join("evaluation_simToAll_MS.csv");
        save_similarity_matrix(&csv_path, &matrix)
    }

    async fn evaluate_decomposition(
        &self,
        config: &Config,
        tool: &GuestTool,
        shared_repository: bool,
    ) -> Result<()> {
        let source = self.source_folder()?.to_path_buf();
        verify_source_folder(config, &source)?;

        for iteration in 1..=self.repetitions {
            info!(
                "evaluating decomposition ({}), iteration {}/{}",
                if shared_repository {
                    "exploiting semantic redundancy"
                } else {
                    "not exploiting semantic redundancy"
                },
                iteration,
                self.repetitions
            );

            repository::reset(config).await?;
            if config.vmi_workspace.is_dir() {
                tokio::fs::remove_dir_all(&config.vmi_workspace).await?;
            }
            copy_with_progress(&source, &config.vmi_workspace).await?;
            repository::ensure_layout(config).await?;

            let log_name = if shared_repository {
                format!("decomposition_{iteration}.csv")
            } else {
                format!("decomposition_noRedundancy{iteration}.csv")
            };
            let mut log = DecompositionLog::new(config.evaluations_dir.join(log_name));

            let vmi_data = sorted_vmi_data(config, &config.vmi_workspace)?;
            for (count, (path, file_name, _, main_services)) in vmi_data.iter().enumerate() {
                if !shared_repository {
                    repository::reset(config).await?;
                }
                info!("VMI {}/{}", count + 1, vmi_data.len());
                let orig_size = tokio::fs::metadata(path).await?.len();

                let start = Instant::now();
                let outcome = crate::cmd::decompose::decompose_vmi(config, tool, path).await?;
                let decomposition_secs = start.elapsed().as_secs_f64();

                log.add_row(
                    file_name,
                    main_services,
                    orig_size,
                    repository::dir_size(&config.repository_root),
                    tokio::fs::metadata(config.catalog_path())
                        .await
                        .map(|m| m.len())
                        .unwrap_or(0),
                    decomposition_secs,
                    &outcome,
                );
            }
            log.save()?;
        }
        Ok(())
    }

    async fn evaluate_reassembly(&self, config: &Config, tool: &GuestTool) -> Result<()> {
        for iteration in 1..=self.repetitions {
            info!(
                "evaluating reassembly, iteration {}/{}",
                iteration, self.repetitions
            );
            let mut log = ReassemblyLog::new(
                config
                    .evaluations_dir
                    .join(format!("reassembly_{iteration}.csv")),
            );
            let names = Catalog::open(config)?.all_vmi_names()?;
            let reassembler = Reassembler::new(config, tool);
            for (count, name) in names.iter().enumerate() {
                info!("VMI {}/{}", count + 1, names.len());
                // start from an empty workspace so outputs never collide
                if config.vmi_workspace.is_dir() {
                    tokio::fs::remove_dir_all(&config.vmi_workspace).await?;
                }
                tokio::fs::create_dir_all(&config.vmi_workspace).await?;

                let start = Instant::now();
                let outcome = reassembler.reassemble(name).await?;
                let reassembly_secs = start.elapsed().as_secs_f64();
                let vmi_size = tokio::fs::metadata(&outcome.output_path)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                log.add_row(reassembly_secs, vmi_size, &outcome);
            }
            log.save()?;
        }
        Ok(())
    }
}

/// Every VMI must have a sidecar and the folder must contain nothing else.
fn verify_source_folder(config: &Config, dir: &Path) -> Result<()> {
    info!("verifying source folder '{}'", dir.display());
    let vmi_paths = repository::vmi_paths(config, dir)?;
    let mut missing = Vec::new();
    let mut sidecars = Vec::new();
    for path in &vmi_paths {
        let meta = sidecar_path(path);
        if meta.is_file() {
            sidecars.push(meta);
        } else {
            missing.push(
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );
        }
    }
    if !missing.is_empty() {
        bail!(
            "the following VMIs are missing meta files: {}",
            missing.join(",")
        );
    }

    let mut extra = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !vmi_paths.contains(&path) && !sidecars.contains(&path) {
            extra.push(
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );
        }
    }
    if !extra.is_empty() {
        bail!(
            "the following files are either meta files not corresponding to any VMI or other \
             unsupported files, please remove them manually: {}",
            extra.join(",")
        );
    }
    Ok(())
}

/// VMIs of a folder with their sidecar data, ordered by (package install
/// size, file name) so runs are deterministic.
fn sorted_vmi_data(
    config: &Config,
    dir: &Path,
) -> Result<Vec<(PathBuf, String, u64, Vec<String>)>> {
    let mut data = Vec::new();
    for path in repository::vmi_paths(config, dir)? {
        let sidecar = Sidecar::load(&sidecar_path(&path))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        data.push((path, file_name, sidecar.install_size, sidecar.main_services));
    }
    data.sort_by(|a, b| (a.2, &a.1).cmp(&(b.2, &b.1)));
    Ok(data)
}

/// Copy the VMI tree in a background task while reporting progress from the
/// destination's growth. The copy is joined before returning.
async fn copy_with_progress(source: &Path, destination: &Path) -> Result<()> {
    info!(
        "copying VMIs from '{}' to '{}'",
        source.display(),
        destination.display()
    );
    let total = repository::dir_size(source).max(1);
    let src = source.to_path_buf();
    let dst = destination.to_path_buf();
    let copier = tokio::task::spawn_blocking(move || repository::copy_tree(&src, &dst));

    while !copier.is_finished() {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let done = repository::dir_size(destination);
        info!(
            "progress: {:.1}%",
            (done as f64 / total as f64 * 100.0).min(100.0)
        );
    }
    copier
        .await
        .context("copy task failed")?
        .context("unable to copy VMI tree")?;
    info!("progress: 100.0%");
    Ok(())
}
