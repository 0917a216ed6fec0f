use anyhow::Result;
use clap::Parser;
use log::info;

use crate::catalog::Catalog;
use crate::cmd::guest_tool;
use crate::common::confirm;
use crate::config::Config;
use crate::reassemble::Reassembler;
use crate::repository;

/// Reassemble one stored VMI by name, or all of them.
#[derive(Debug, Parser)]
pub(crate) struct Reassemble {
    /// Name of a decomposed VMI, or `all`.
    target: String,
}

impl Reassemble {
    pub(crate) async fn run(&self, config: &Config) -> Result<()> {
        repository::ensure_layout(config).await?;
        let tool = guest_tool()?;
        let reassembler = Reassembler::new(config, &tool);

        if self.target != "all" {
            let outcome = reassembler.reassemble(&self.target).await?;
            println!("VMI saved in '{}'", outcome.output_path.display());
            return Ok(());
        }

        // Leftover images in the workspace collide with reassembled output.
        let existing = repository::vmi_paths(config, &config.vmi_workspace)?;
        if !existing.is_empty()
            && confirm(&format!(
                "There are VMIs stored in folder '{}'. These might conflict with VMIs that are \
                 about to be reassembled.\nClear this folder, yes or no?",
                config.vmi_workspace.display()
            ))?
        {
            tokio::fs::remove_dir_all(&config.vmi_workspace).await?;
            tokio::fs::create_dir_all(&config.vmi_workspace).await?;
        }

        let names = Catalog::open(config)?.all_vmi_names()?;
        if names.is_empty() {
            println!("No VMIs to reassemble");
            return Ok(());
        }
        info!("reassembling {} VMIs", names.len());
        let mut output_paths = Vec::new();
        for (count, name) in names.iter().enumerate() {
            println!("VMI {}/{}", count + 1, names.len());
            let outcome = reassembler.reassemble(name).await?;
            output_paths.push(outcome.output_path.display().to_string());
        }
        println!("\nVMIs reassembled: {}", output_paths.len());
        println!("Reassembled VMIs stored at:\n\t{}", output_paths.join("\n\t"));
        Ok(())
    }
}
