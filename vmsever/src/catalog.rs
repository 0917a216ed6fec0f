//! Persistent metadata catalog of the component repository.
//!
//! One SQLite file per repository holds packages, decomposed VMIs, retained
//! base images, and the per-VMI main-service dependency edges. All mutations
//! belonging to one logical operation run inside a single transaction; file
//! moves and deletions happen only after that transaction commits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use guest_cli_wrapper::PackageManager;
use log::debug;
use rusqlite::{params, Connection};

use crate::config::Config;
use crate::descriptor::{BaseImageDescriptor, MasterDescriptor};
use crate::graph::{PackageCoord, PackageInfo};

const SCHEMA: &str = "
    CREATE TABLE packages(
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        name          TEXT    NOT NULL,
        version       TEXT    NOT NULL,
        arch          TEXT    NOT NULL,
        distribution  TEXT    NOT NULL,
        install_size  INTEGER NOT NULL,
        file_path     TEXT    NOT NULL,
        UNIQUE(name, version, arch, distribution));
    CREATE TABLE base_images(
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        distribution      TEXT NOT NULL,
        version           TEXT NOT NULL,
        arch              TEXT NOT NULL,
        pkg_manager       TEXT NOT NULL,
        file_path         TEXT NOT NULL,
        graph_path        TEXT NOT NULL,
        master_graph_path TEXT NOT NULL);
    CREATE TABLE vmis(
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        name          TEXT    NOT NULL UNIQUE,
        user_dir_path TEXT    NOT NULL,
        base_id       INTEGER NOT NULL,
        FOREIGN KEY(base_id) REFERENCES base_images(id));
    CREATE TABLE pkg_dependencies(
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        vmi_id     INTEGER NOT NULL,
        ms_pkg_id  INTEGER NOT NULL,
        dep_pkg_id INTEGER NOT NULL,
        FOREIGN KEY(vmi_id)     REFERENCES vmis(id),
        FOREIGN KEY(ms_pkg_id)  REFERENCES packages(id),
        FOREIGN KEY(dep_pkg_id) REFERENCES packages(id));
";

/// One stored base image as the catalog sees it, graphs not loaded.
#[derive(Debug, Clone)]
pub(crate) struct BaseImageRow {
    pub(crate) id: i64,
    pub(crate) distribution: String,
    pub(crate) version: String,
    pub(crate) architecture: String,
    pub(crate) package_manager: String,
    pub(crate) file_path: PathBuf,
    pub(crate) graph_path: PathBuf,
    pub(crate) master_graph_path: PathBuf,
}

/// An existing base image eligible for the selection step, together with the
/// main-service closure packages of all VMIs assigned to it.
#[derive(Debug)]
pub(crate) struct CompatibleBase {
    pub(crate) id: i64,
    pub(crate) descriptor: BaseImageDescriptor,
    pub(crate) ms_packages: HashMap<String, PackageCoord>,
}

/// Everything reassembly needs about one stored VMI.
#[derive(Debug)]
pub(crate) struct VmiData {
    pub(crate) user_dir_path: PathBuf,
    pub(crate) base: BaseImageDescriptor,
    pub(crate) main_services: Vec<String>,
    pub(crate) packages: HashMap<String, PackageInfo>,
}

/// One line of the `list vmis` table.
#[derive(Debug)]
pub(crate) struct VmiOverview {
    pub(crate) name: String,
    pub(crate) distribution: String,
    pub(crate) version: String,
    pub(crate) architecture: String,
    pub(crate) package_manager: String,
    pub(crate) main_services: Vec<String>,
}

/// All catalog rows written at the end of one decomposition.
pub(crate) struct DecompositionRecord<'a> {
    pub(crate) vmi_name: &'a str,
    pub(crate) user_dir_path: &'a Path,
    pub(crate) distribution: &'a str,
    pub(crate) exported_packages: &'a [PackageInfo],
    pub(crate) chosen_base: &'a BaseImageDescriptor,
    pub(crate) master_graph_path: &'a Path,
    pub(crate) ms_dep_lists: &'a [(String, HashMap<String, PackageInfo>)],
    pub(crate) replaced_base_ids: &'a [i64],
}

pub(crate) struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Open the repository catalog, creating and seeding it when the file
    /// does not exist yet.
    pub(crate) fn open(config: &Config) -> Result<Self> {
        let path = config.catalog_path();
        let fresh = !path.exists();
        let conn = Connection::open(&path)
            .context(format!("unable to open catalog '{}'", path.display()))?;
        let catalog = Self { conn };
        if fresh {
            catalog
                .conn
                .execute_batch(SCHEMA)
                .context("unable to create catalog schema")?;
            for (distribution, info) in &config.basic_packages {
                insert_package(&catalog.conn, info, distribution)?;
            }
            debug!("created catalog at '{}'", path.display());
        }
        Ok(catalog)
    }

    pub(crate) fn vmi_count(&self) -> Result<u64> {
        count(&self.conn, "SELECT count(*) FROM vmis")
    }

    pub(crate) fn base_image_count(&self) -> Result<u64> {
        count(&self.conn, "SELECT count(*) FROM base_images")
    }

    pub(crate) fn package_count(&self) -> Result<u64> {
        count(&self.conn, "SELECT count(*) FROM packages")
    }

    pub(crate) fn vmi_exists(&self, name: &str) -> Result<bool> {
        Ok(vmi_id(&self.conn, name)?.is_some())
    }

    pub(crate) fn package_exists(
        &self,
        name: &str,
        version: &str,
        arch: &str,
        distribution: &str,
    ) -> Result<bool> {
        Ok(package_id(&self.conn, name, version, arch, distribution)?.is_some())
    }

    /// Names of all decomposed VMIs in the order they were added.
    pub(crate) fn all_vmi_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT name FROM vmis ORDER BY id ASC")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    pub(crate) fn all_packages(&self) -> Result<Vec<(String, String, String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, version, arch, distribution FROM packages")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub(crate) fn all_base_images(&self) -> Result<Vec<(String, String, String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT distribution, version, arch, pkg_manager FROM base_images")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub(crate) fn vmi_overview(&self) -> Result<Vec<VmiOverview>> {
        let mut stmt = self.conn.prepare(
            "SELECT v.id, v.name, b.distribution, b.version, b.arch, b.pkg_manager
             FROM vmis v JOIN base_images b ON v.base_id = b.id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(id, name, distribution, version, architecture, package_manager)| {
                Ok(VmiOverview {
                    name,
                    distribution,
                    version,
                    architecture,
                    package_manager,
                    main_services: main_services_for_vmi(&self.conn, id)?,
                })
            })
            .collect()
    }

    /// Existing base images matching a distribution quadruple, each with its
    /// graph loaded and the main-service packages of its assigned VMIs.
    /// Returns an empty list when none match.
    pub(crate) fn compatible_base_candidates(
        &self,
        distribution: &str,
        version: &str,
        architecture: &str,
        package_manager: PackageManager,
    ) -> Result<Vec<CompatibleBase>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM base_images
             WHERE distribution = ?1 AND version = ?2 AND arch = ?3 AND pkg_manager = ?4",
        )?;
        let ids = stmt
            .query_map(
                params![distribution, version, architecture, package_manager.to_string()],
                |row| row.get::<_, i64>(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut candidates = Vec::new();
        for id in ids {
            let row = base_image_row(&self.conn, id)?
                .context("catalog corruption: base image disappeared during lookup")?;
            candidates.push(CompatibleBase {
                id,
                descriptor: descriptor_from_row(&row)?,
                ms_packages: main_service_packages_for_base(&self.conn, id)?,
            });
        }
        Ok(candidates)
    }

    pub(crate) fn base_image_row(&self, id: i64) -> Result<Option<BaseImageRow>> {
        base_image_row(&self.conn, id)
    }

    /// Masters of every stored base image, for similarity reporting.
    pub(crate) fn master_descriptors(&self) -> Result<Vec<MasterDescriptor>> {
        let mut stmt = self.conn.prepare("SELECT id FROM base_images")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids.into_iter()
            .filter_map(|id| self.master_descriptor(id).transpose())
            .collect()
    }

    pub(crate) fn master_descriptor(&self, base_id: i64) -> Result<Option<MasterDescriptor>> {
        let Some(row) = base_image_row(&self.conn, base_id)? else {
            return Ok(None);
        };
        let main_services = main_services_for_base(&self.conn, base_id)?;
        let master = MasterDescriptor::from_repo(
            row.file_path,
            row.distribution,
            row.version,
            row.architecture,
            package_manager(&row.package_manager)?,
            row.master_graph_path,
            main_services,
        )?;
        Ok(Some(master))
    }

    pub(crate) fn main_services_for_base(&self, base_id: i64) -> Result<Vec<String>> {
        main_services_for_base(&self.conn, base_id)
    }

    /// Everything reassembly needs about one VMI, or None when the name is
    /// unknown.
    pub(crate) fn vmi_record(&self, name: &str) -> Result<Option<VmiData>> {
        let Some((vmi_id, user_dir_path, base_id)) = ({
            let mut stmt = self
                .conn
                .prepare("SELECT id, user_dir_path, base_id FROM vmis WHERE name = ?1")?;
            let rows = stmt
                .query_map(params![name], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ensure!(
                rows.len() <= 1,
                "catalog corruption: multiple VMIs named '{name}'"
            );
            rows.into_iter().next()
        }) else {
            return Ok(None);
        };

        let base_row = base_image_row(&self.conn, base_id)?.context(format!(
            "catalog corruption: VMI '{name}' references missing base image {base_id}"
        ))?;
        Ok(Some(VmiData {
            user_dir_path: PathBuf::from(user_dir_path),
            base: descriptor_from_row(&base_row)?,
            main_services: main_services_for_vmi(&self.conn, vmi_id)?,
            packages: dep_package_info_for_vmi(&self.conn, vmi_id)?,
        }))
    }

    /// Write every catalog row produced by one decomposition in a single
    /// transaction: exported packages, the chosen base image (inserted if
    /// new), the VMI row, its main-service dependency edges, and the
    /// reassignment plus removal of replaced base images.
    ///
    /// Only catalog state changes here. The caller moves and deletes files
    /// after this commits.
    pub(crate) fn record_decomposition(&mut self, record: &DecompositionRecord<'_>) -> Result<i64> {
        let tx = self.conn.transaction()?;

        for info in record.exported_packages {
            insert_package(&tx, info, record.distribution)?;
        }

        let base_path = path_text(&record.chosen_base.image_path);
        let base_id = match base_image_id(&tx, &base_path)? {
            Some(id) => id,
            None => {
                let graph_path = record
                    .chosen_base
                    .graph_path
                    .as_ref()
                    .context("base image graph was not saved before recording")?;
                tx.execute(
                    "INSERT INTO base_images
                     (distribution, version, arch, pkg_manager, file_path, graph_path, master_graph_path)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        record.chosen_base.distribution,
                        record.chosen_base.distribution_version,
                        record.chosen_base.architecture,
                        record.chosen_base.package_manager.to_string(),
                        base_path,
                        path_text(graph_path),
                        path_text(record.master_graph_path),
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        ensure!(
            vmi_id(&tx, record.vmi_name)?.is_none(),
            "catalog corruption: adding already existing VMI '{}'",
            record.vmi_name
        );
        tx.execute(
            "INSERT INTO vmis (name, user_dir_path, base_id) VALUES (?1, ?2, ?3)",
            params![record.vmi_name, path_text(record.user_dir_path), base_id],
        )?;
        let new_vmi_id = tx.last_insert_rowid();

        for (main_service, closure) in record.ms_dep_lists {
            let ms_info = closure.get(main_service).context(format!(
                "main service '{main_service}' missing from its own dependency closure"
            ))?;
            let ms_pkg_id = package_id(
                &tx,
                main_service,
                &ms_info.version,
                &ms_info.architecture,
                record.distribution,
            )?
            .context(format!(
                "catalog corruption: main service '{main_service}' has no package row"
            ))?;
            for (dep_name, dep_info) in closure {
                if dep_name == main_service {
                    continue;
                }
                let dep_pkg_id = package_id(
                    &tx,
                    dep_name,
                    &dep_info.version,
                    &dep_info.architecture,
                    record.distribution,
                )?
                .context(format!(
                    "catalog corruption: dependency '{dep_name}' has no package row"
                ))?;
                tx.execute(
                    "INSERT INTO pkg_dependencies (vmi_id, ms_pkg_id, dep_pkg_id)
                     VALUES (?1, ?2, ?3)",
                    params![new_vmi_id, ms_pkg_id, dep_pkg_id],
                )?;
            }
        }

        for &replaced_id in record.replaced_base_ids {
            tx.execute(
                "UPDATE vmis SET base_id = ?1 WHERE base_id = ?2",
                params![base_id, replaced_id],
            )?;
            tx.execute("DELETE FROM base_images WHERE id = ?1", params![replaced_id])?;
        }

        tx.commit()?;
        Ok(base_id)
    }
}

fn count(conn: &Connection, sql: &str) -> Result<u64> {
    let value: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(value as u64)
}

fn package_manager(text: &str) -> Result<PackageManager> {
    PackageManager::try_from(text)
        .map_err(|e| anyhow::anyhow!("catalog holds unsupported package manager: {e}"))
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn insert_package(conn: &Connection, info: &PackageInfo, distribution: &str) -> Result<()> {
    let file_path = info.path.as_ref().context(format!(
        "package '{}' has no stored file path",
        info.name
    ))?;
    conn.execute(
        "INSERT INTO packages (name, version, arch, distribution, install_size, file_path)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            info.name,
            info.version,
            info.architecture,
            distribution,
            info.size as i64,
            path_text(file_path),
        ],
    )
    .context(format!("unable to insert package '{}'", info.name))?;
    Ok(())
}

fn package_id(
    conn: &Connection,
    name: &str,
    version: &str,
    arch: &str,
    distribution: &str,
) -> Result<Option<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM packages
         WHERE name = ?1 AND version = ?2 AND arch = ?3 AND distribution = ?4",
    )?;
    let ids = stmt
        .query_map(params![name, version, arch, distribution], |row| {
            row.get::<_, i64>(0)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    ensure!(
        ids.len() <= 1,
        "catalog corruption: multiple packages for name={name}, version={version}, \
         arch={arch}, distribution={distribution}"
    );
    Ok(ids.into_iter().next())
}

fn vmi_id(conn: &Connection, name: &str) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM vmis WHERE name = ?1")?;
    let ids = stmt
        .query_map(params![name], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    ensure!(
        ids.len() <= 1,
        "catalog corruption: multiple VMIs named '{name}'"
    );
    Ok(ids.into_iter().next())
}

fn base_image_id(conn: &Connection, file_path: &str) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM base_images WHERE file_path = ?1")?;
    let ids = stmt
        .query_map(params![file_path], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    ensure!(
        ids.len() <= 1,
        "catalog corruption: multiple base images stored at '{file_path}'"
    );
    Ok(ids.into_iter().next())
}

fn base_image_row(conn: &Connection, id: i64) -> Result<Option<BaseImageRow>> {
    let mut stmt = conn.prepare(
        "SELECT distribution, version, arch, pkg_manager, file_path, graph_path, master_graph_path
         FROM base_images WHERE id = ?1",
    )?;
    let rows = stmt
        .query_map(params![id], |row| {
            Ok(BaseImageRow {
                id,
                distribution: row.get(0)?,
                version: row.get(1)?,
                architecture: row.get(2)?,
                package_manager: row.get(3)?,
                file_path: PathBuf::from(row.get::<_, String>(4)?),
                graph_path: PathBuf::from(row.get::<_, String>(5)?),
                master_graph_path: PathBuf::from(row.get::<_, String>(6)?),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows.into_iter().next())
}

fn descriptor_from_row(row: &BaseImageRow) -> Result<BaseImageDescriptor> {
    BaseImageDescriptor::from_repo(
        row.file_path.clone(),
        row.distribution.clone(),
        row.version.clone(),
        row.architecture.clone(),
        package_manager(&row.package_manager)?,
        row.graph_path.clone(),
    )
}

/// Names of the distinct main-service packages recorded for one VMI.
fn main_services_for_vmi(conn: &Connection, vmi_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM packages
         WHERE id IN (SELECT DISTINCT ms_pkg_id FROM pkg_dependencies WHERE vmi_id = ?1)",
    )?;
    let names = stmt
        .query_map(params![vmi_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// Names of the distinct main-service packages across every VMI assigned to
/// one base image.
fn main_services_for_base(conn: &Connection, base_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM packages
         WHERE id IN (
             SELECT DISTINCT ms_pkg_id FROM pkg_dependencies
             WHERE vmi_id IN (SELECT id FROM vmis WHERE base_id = ?1))",
    )?;
    let names = stmt
        .query_map(params![base_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// Main services plus their dependencies across every VMI assigned to one
/// base image, keyed by package name.
fn main_service_packages_for_base(
    conn: &Connection,
    base_id: i64,
) -> Result<HashMap<String, PackageCoord>> {
    let mut stmt = conn.prepare(
        "SELECT name, version, arch FROM packages
         WHERE id IN (
             SELECT DISTINCT dep_pkg_id FROM pkg_dependencies
             WHERE vmi_id IN (SELECT id FROM vmis WHERE base_id = ?1))
         OR id IN (
             SELECT DISTINCT ms_pkg_id FROM pkg_dependencies
             WHERE vmi_id IN (SELECT id FROM vmis WHERE base_id = ?1))",
    )?;
    let rows = stmt
        .query_map(params![base_id], |row| {
            Ok(PackageCoord {
                name: row.get(0)?,
                version: row.get(1)?,
                architecture: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows
        .into_iter()
        .map(|coord| (coord.name.clone(), coord))
        .collect())
}

/// Full stored info for every package needed to reinstall a VMI's main
/// services: the main services themselves plus all recorded dependencies.
fn dep_package_info_for_vmi(
    conn: &Connection,
    vmi_id: i64,
) -> Result<HashMap<String, PackageInfo>> {
    let mut stmt = conn.prepare(
        "SELECT name, version, arch, install_size, file_path FROM packages
         WHERE id IN (SELECT DISTINCT dep_pkg_id FROM pkg_dependencies WHERE vmi_id = ?1)
         OR id IN (SELECT DISTINCT ms_pkg_id FROM pkg_dependencies WHERE vmi_id = ?1)",
    )?;
    let rows = stmt
        .query_map(params![vmi_id], |row| {
            Ok(PackageInfo {
                name: row.get(0)?,
                version: row.get(1)?,
                architecture: row.get(2)?,
                essential: false,
                size: row.get::<_, i64>(3)? as u64,
                path: Some(PathBuf::from(row.get::<_, String>(4)?)),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows
        .into_iter()
        .map(|info| (info.name.clone(), info))
        .collect())
}
