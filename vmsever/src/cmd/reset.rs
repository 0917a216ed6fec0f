use anyhow::Result;
use clap::Parser;

use crate::catalog::Catalog;
use crate::common::confirm;
use crate::config::Config;
use crate::repository;

/// Delete the component repository and recreate it empty.
#[derive(Debug, Parser)]
pub(crate) struct Reset {}

impl Reset {
    pub(crate) async fn run(&self, config: &Config) -> Result<()> {
        if !confirm(&format!(
            "This deletes everything stored in '{}'. Continue, yes or no?",
            config.repository_root.display()
        ))? {
            println!("Reset aborted.");
            return Ok(());
        }
        repository::reset(config).await?;
        let catalog = Catalog::open(config)?;
        println!(
            "Repository reset. State of repository storage: {} VMIs, {} base images, {} packages.",
            catalog.vmi_count()?,
            catalog.base_image_count()?,
            catalog.package_count()?,
        );
        Ok(())
    }
}
