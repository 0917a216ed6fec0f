//! Sidecar manifest accompanying a VMI file before decomposition.
//!
//! A single UTF-8 line, LF-terminated:
//! `<vmi_filename>;<sum_install_size_bytes>;<ms1,ms2,…>`. Written by
//! `inspect`, consumed and removed by `decompose`.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};

pub(crate) const SIDECAR_EXTENSION: &str = "meta";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Sidecar {
    pub(crate) vmi_file_name: String,
    pub(crate) install_size: u64,
    pub(crate) main_services: Vec<String>,
}

impl Sidecar {
    pub(crate) fn parse(content: &str) -> Result<Self> {
        let line = content.lines().next().unwrap_or_default();
        let fields: Vec<&str> = line.split(';').collect();
        ensure!(fields.len() == 3, "unparseable sidecar manifest: '{line}'");
        Ok(Self {
            vmi_file_name: fields[0].to_string(),
            install_size: fields[1]
                .trim()
                .parse()
                .context(format!("unparseable install size in sidecar: '{}'", fields[1]))?,
            main_services: fields[2]
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
        })
    }

    pub(crate) fn render(&self) -> String {
        format!(
            "{};{};{}\n",
            self.vmi_file_name,
            self.install_size,
            self.main_services.join(",")
        )
    }

    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("unable to read sidecar '{}'", path.display()))?;
        Self::parse(&content)
    }

    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render())
            .context(format!("unable to write sidecar '{}'", path.display()))
    }
}

/// The sidecar path belonging to a VMI file: same name, `.meta` extension.
pub(crate) fn sidecar_path(vmi_path: &Path) -> PathBuf {
    vmi_path.with_extension(SIDECAR_EXTENSION)
}
