use anyhow::Result;
use clap::{Parser, ValueEnum};

use crate::catalog::Catalog;
use crate::common::truncate_cell;
use crate::config::Config;
use crate::repository;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum Stored {
    Vmis,
    Packages,
    Baseimages,
}

/// Show a table of VMIs, packages, or base images in the repository.
#[derive(Debug, Parser)]
pub(crate) struct List {
    /// Which kind of component to list.
    #[clap(value_enum)]
    what: Stored,
}

impl List {
    pub(crate) async fn run(&self, config: &Config) -> Result<()> {
        repository::ensure_layout(config).await?;
        let catalog = Catalog::open(config)?;
        match self.what {
            Stored::Vmis => print_vmis(&catalog),
            Stored::Packages => print_packages(&catalog),
            Stored::Baseimages => print_base_images(&catalog),
        }
    }
}

fn print_vmis(catalog: &Catalog) -> Result<()> {
    let mut rows = catalog.vmi_overview()?;
    rows.sort_by_key(|row| row.name.to_lowercase());
    println!("\nVMIs in repository:\n");
    println!(
        "{:<22} {:<10} {:<10} {:<10} {:<11} {:<13}",
        "Name", "Distro", "Version", "Arch", "PkgManager", "Main-Services"
    );
    println!("{}", "-".repeat(107));
    for row in &rows {
        println!(
            "{:<22} {:<10} {:<10} {:<10} {:<11} {}",
            truncate_cell(&row.name, 21),
            truncate_cell(&row.distribution, 9),
            truncate_cell(&row.version, 9),
            truncate_cell(&row.architecture, 9),
            truncate_cell(&row.package_manager, 10),
            row.main_services.join(", "),
        );
    }
    println!("{}", "-".repeat(107));
    println!("Overall VMIs in repository: {}\n", rows.len());
    Ok(())
}

fn print_packages(catalog: &Catalog) -> Result<()> {
    let mut rows = catalog.all_packages()?;
    rows.sort_by(|a, b| (&a.3, a.0.to_lowercase()).cmp(&(&b.3, b.0.to_lowercase())));
    println!("\nPackages in repository:\n");
    println!(
        "{:<30} {:<20} {:<10} {:<10}",
        "Name", "Version", "Arch", "Distribution"
    );
    println!("{}", "-".repeat(75));
    for (name, version, arch, distribution) in &rows {
        println!(
            "{:<30} {:<20} {:<10} {:<10}",
            truncate_cell(name, 29),
            truncate_cell(version, 19),
            truncate_cell(arch, 9),
            truncate_cell(distribution, 9),
        );
    }
    println!("{}", "-".repeat(75));
    println!("Overall Packages in repository: {}\n", rows.len());
    Ok(())
}

fn print_base_images(catalog: &Catalog) -> Result<()> {
    let mut rows = catalog.all_base_images()?;
    rows.sort_by_key(|row| row.0.to_lowercase());
    println!("\nBase images in repository:\n");
    println!(
        "{:<12} {:<10} {:<10} {:<10}",
        "Distribution", "Version", "Arch", "PkgManager"
    );
    println!("{}", "-".repeat(45));
    for (distribution, version, arch, package_manager) in &rows {
        println!(
            "{:<12} {:<10} {:<10} {:<10}",
            truncate_cell(distribution, 11),
            truncate_cell(version, 9),
            truncate_cell(arch, 9),
            truncate_cell(package_manager, 9),
        );
    }
    println!("{}", "-".repeat(45));
    println!("Overall base images in repository: {}\n", rows.len());
    Ok(())
}
