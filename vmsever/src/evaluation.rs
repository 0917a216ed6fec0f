//! CSV writers for the benchmark harness.
//!
//! Files are `;`-separated with one header line, written in one piece when a
//! run finishes. Undefined values (the similarity matrix diagonal, missing
//! measurements) are written as `None`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::decompose::DecompositionOutcome;
use crate::reassemble::ReassemblyOutcome;
use crate::similarity::SimilarityMatrix;

fn opt<T: std::fmt::Display>(value: Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "None".to_string(),
    }
}

fn save_lines(path: &Path, lines: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, lines.join("\n"))
        .context(format!("unable to write evaluation '{}'", path.display()))
}

/// The pairwise similarity matrix as a square CSV with `None` on the
/// diagonal.
pub(crate) fn save_similarity_matrix(path: &Path, matrix: &SimilarityMatrix) -> Result<()> {
    let mut lines = vec![format!(";{}", matrix.names.join(";"))];
    for row_name in &matrix.names {
        let mut line = row_name.clone();
        for col_name in &matrix.names {
            let value = matrix
                .values
                .get(row_name)
                .and_then(|row| row.get(col_name))
                .copied()
                .flatten();
            line.push(';');
            line.push_str(&opt(value));
        }
        lines.push(line);
    }
    save_lines(path, &lines)
}

/// One decomposition evaluation file, a row per decomposed VMI.
pub(crate) struct DecompositionLog {
    path: PathBuf,
    lines: Vec<String>,
    /// Original image sizes accumulate across rows so the last row carries
    /// the total input volume.
    sum_orig_size: u64,
}

impl DecompositionLog {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            lines: vec![
                "vmiFilename;vmi main services;sumOrigStorageSize[bytes];RepoStorageSize[bytes];\
                 dbSize[bytes];timeDecomp[s];timeHandlerCreation[s];timeExport[s];\
                 reqPkgsNum;expPkgsNum;reqPkgsSize[bytes];expPkgsSize[bytes];baseImageInfo;\
                 highest similarity;base with highest similarity;numPkgs in master;comparisons;\
                 time to calc sim"
                    .to_string(),
            ],
            sum_orig_size: 0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_row(
        &mut self,
        vmi_filename: &str,
        main_services: &[String],
        vmi_orig_size: u64,
        repo_storage_size: u64,
        db_size: u64,
        decomposition_secs: f64,
        outcome: &DecompositionOutcome,
    ) {
        self.sum_orig_size += vmi_orig_size;
        let (similarity, master_path, master_packages) = match &outcome.best_master_similarity {
            Some((similarity, path, packages)) => {
                (Some(*similarity), Some(path.clone()), Some(*packages))
            }
            None => (None, None, None),
        };
        self.lines.push(format!(
            "{};{};{};{};{};{};{};{};{};{};{};{};{};{};{};{};{};{}",
            vmi_filename,
            main_services.join(","),
            self.sum_orig_size,
            repo_storage_size,
            db_size,
            decomposition_secs,
            outcome.handle_creation_secs,
            outcome.export_secs,
            outcome.required_packages,
            outcome.exported_packages,
            outcome.required_size,
            outcome.exported_size,
            outcome.base_image_treatment,
            opt(similarity),
            opt(master_path),
            opt(master_packages),
            outcome.master_comparisons,
            outcome.similarity_secs,
        ));
    }

    pub(crate) fn save(&self) -> Result<()> {
        save_lines(&self.path, &self.lines)
    }
}

/// One reassembly evaluation file, a row per reassembled VMI.
pub(crate) struct ReassemblyLog {
    path: PathBuf,
    lines: Vec<String>,
}

impl ReassemblyLog {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            lines: vec![
                "vmiFilename;used base image;base image size [bytes];vmi main services;\
                 vmi size [bytes];reassembling time [s];copy time [s];reset time [s];\
                 import time [s];handler creation time [s];number of required packages;\
                 number of imported packages;required PkgsSize[bytes];imported PkgsSize[bytes];\
                 reassembling info"
                    .to_string(),
            ],
        }
    }

    pub(crate) fn add_row(
        &mut self,
        reassembly_secs: f64,
        vmi_size: u64,
        outcome: &ReassemblyOutcome,
    ) {
        let info = outcome
            .error_log
            .as_ref()
            .map(|_| "import errors while reassembling, check manually.".to_string());
        self.lines.push(format!(
            "{};{};{};{};{};{};{};{};{};{};{};{};{};{};{}",
            outcome
                .output_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            outcome.base_file_name,
            outcome.base_size,
            outcome.main_services.join(","),
            vmi_size,
            reassembly_secs,
            outcome.copy_secs,
            outcome.reset_secs,
            outcome.import_secs,
            outcome.handle_creation_secs,
            outcome.required_packages,
            outcome.imported_packages,
            outcome.required_size,
            outcome.imported_size,
            opt(info),
        ));
    }

    pub(crate) fn save(&self) -> Result<()> {
        save_lines(&self.path, &self.lines)
    }
}
