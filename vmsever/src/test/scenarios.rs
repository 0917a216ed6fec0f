//! End-to-end decomposition and reassembly against the fake guest backend.

use std::path::PathBuf;

use guest_cli_wrapper::GuestTool;
use tempfile::TempDir;

use super::{apt_package, dnf_package, fedora_image, ubuntu_image, FakeBackend, FakeImage};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::decompose::Decomposer;
use crate::reassemble::Reassembler;
use crate::repository;

struct Rig {
    _dir: TempDir,
    config: Config,
    tool: GuestTool,
}

async fn rig() -> Rig {
    let dir = TempDir::new().unwrap();
    let config = Config::rooted(dir.path());
    repository::reset(&config).await.unwrap();
    Rig {
        _dir: dir,
        config,
        tool: GuestTool::new(Box::new(FakeBackend)),
    }
}

fn write_image(rig: &Rig, name: &str, image: &FakeImage) -> PathBuf {
    let path = rig.config.vmi_workspace.join(name);
    image.save(&path).unwrap();
    path
}

/// An ubuntu VMI running nginx on a small base system.
fn nginx_vmi() -> FakeImage {
    let mut image = ubuntu_image(vec![
        apt_package("libc", "2.23", true, false, 1000, &[]),
        apt_package("bash", "4.3", true, false, 500, &["libc"]),
        apt_package("nginx", "1.10", false, false, 300, &["libssl (>= 1.0)", "libc"]),
        apt_package("libssl", "1.0.2", false, true, 200, &["libc"]),
    ]);
    image
        .home_files
        .insert("/alice/notes.txt".to_string(), "remember the milk".to_string());
    image
}

/// Same base system as [`nginx_vmi`], running apache instead.
fn apache_vmi() -> FakeImage {
    ubuntu_image(vec![
        apt_package("libc", "2.23", true, false, 1000, &[]),
        apt_package("bash", "4.3", true, false, 500, &["libc"]),
        apt_package("apache2", "2.4", false, false, 400, &["libapr", "libc"]),
        apt_package("libapr", "1.5", false, true, 100, &["libc"]),
    ])
}

/// A redis VMI whose base carries a newer bash than [`nginx_vmi`]'s base,
/// and whose closure pins that bash version.
fn redis_vmi() -> FakeImage {
    ubuntu_image(vec![
        apt_package("libc", "2.23", true, false, 1000, &[]),
        apt_package("bash", "5.0", true, false, 500, &[]),
        apt_package("redis", "3.2", false, false, 250, &["bash (>= 5.0)", "libc"]),
    ])
}

fn httpd_vmi() -> FakeImage {
    fedora_image(vec![
        dnf_package("glibc", "2.25", false, 1_000_000, &[]),
        dnf_package("systemd", "233", false, 500_000, &["glibc"]),
        dnf_package("httpd", "2.4.27", false, 300_000, &["apr"]),
        dnf_package("apr", "1.6.2", true, 100_000, &["glibc"]),
    ])
}

async fn decompose(rig: &Rig, path: &PathBuf, main_services: &[&str]) -> crate::decompose::DecompositionOutcome {
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    Decomposer::new(&rig.config, &rig.tool)
        .decompose(path, &name, main_services.iter().map(|s| s.to_string()).collect())
        .await
        .unwrap()
}

#[tokio::test]
async fn decompose_first_vmi_into_an_empty_repository() {
    let rig = rig().await;
    let path = write_image(&rig, "web_a.qcow2", &nginx_vmi());
    let outcome = decompose(&rig, &path, &["nginx"]).await;

    // the stripped input became the retained base image
    assert!(!path.exists());
    let base_path = rig.config.base_images_dir().join("ubuntu_16_4_apt_amd64.qcow2");
    assert!(base_path.is_file());
    assert!(outcome.base_image_treatment.contains("New base image"));

    // the base holds only the essential system, the store holds the closure
    let base = FakeImage::load(&base_path).unwrap();
    assert_eq!(base.package_names(), vec!["bash", "libc"]);
    let catalog = Catalog::open(&rig.config).unwrap();
    for name in ["nginx", "libssl", "libc"] {
        assert!(
            catalog
                .package_exists(
                    name,
                    nginx_vmi().package(name).unwrap().version.as_str(),
                    "amd64",
                    "ubuntu"
                )
                .unwrap(),
            "package {name} missing from catalog"
        );
    }
    assert!(catalog.vmi_exists("web_a.qcow2").unwrap());
    assert_eq!(catalog.base_image_count().unwrap(), 1);

    // catalog rows and files agree
    let data = catalog.vmi_record("web_a.qcow2").unwrap().unwrap();
    assert!(data.user_dir_path.is_file());
    for info in data.packages.values() {
        assert!(info.path.as_ref().unwrap().is_file());
    }
    let row = catalog
        .base_image_row(catalog.compatible_base_candidates("ubuntu", "16_4", "amd64", guest_cli_wrapper::PackageManager::Apt).unwrap()[0].id)
        .unwrap()
        .unwrap();
    assert!(row.graph_path.is_file());
    assert!(row.master_graph_path.is_file());
}

#[tokio::test]
async fn reassembly_restores_the_original_package_set() {
    let rig = rig().await;
    let path = write_image(&rig, "web_a.qcow2", &nginx_vmi());
    decompose(&rig, &path, &["nginx"]).await;

    let outcome = Reassembler::new(&rig.config, &rig.tool)
        .reassemble("web_a.qcow2")
        .await
        .unwrap();
    assert!(outcome.error_log.is_none());
    assert_eq!(
        outcome.output_path,
        rig.config.vmi_workspace.join("web_a.qcow2")
    );

    let rebuilt = FakeImage::load(&outcome.output_path).unwrap();
    // mounted package set = main-service closure + retained base packages
    assert_eq!(
        rebuilt.package_names(),
        vec!["bash", "libc", "libssl", "nginx"]
    );
    for package in &rebuilt.packages {
        let original = nginx_vmi();
        let original = original.package(&package.name).unwrap();
        assert_eq!((&package.version, &package.arch), (&original.version, &original.arch));
    }
    // machine identity was reset on the copy, the home directory is back
    assert_eq!(rebuilt.identity_resets, 1);
    assert_eq!(
        rebuilt.home_files.get("/alice/notes.txt").map(String::as_str),
        Some("remember the milk")
    );
    // only the missing packages were imported
    assert_eq!(outcome.required_packages, 3);
    assert_eq!(outcome.imported_packages, 2);
}

#[tokio::test]
async fn second_vmi_on_the_same_base_reuses_it() {
    let rig = rig().await;
    let path_a = write_image(&rig, "web_a.qcow2", &nginx_vmi());
    decompose(&rig, &path_a, &["nginx"]).await;
    let path_b = write_image(&rig, "web_b.qcow2", &apache_vmi());
    let outcome = decompose(&rig, &path_b, &["apache2"]).await;

    let catalog = Catalog::open(&rig.config).unwrap();
    assert_eq!(catalog.base_image_count().unwrap(), 1);
    assert!(outcome.base_image_treatment.contains("reused"));
    // the first base file is retained, the superseded second one is gone
    let base_path = rig.config.base_images_dir().join("ubuntu_16_4_apt_amd64.qcow2");
    assert!(base_path.is_file());
    assert!(!path_b.exists());

    // the master graph covers both main-service closures
    let candidates = catalog
        .compatible_base_candidates("ubuntu", "16_4", "amd64", guest_cli_wrapper::PackageManager::Apt)
        .unwrap();
    let master = catalog.master_descriptor(candidates[0].id).unwrap().unwrap();
    for name in ["nginx", "libssl", "apache2", "libapr"] {
        assert!(master.base.graph.contains(name), "master graph misses {name}");
    }
    assert!(master.main_services.contains("nginx"));
    assert!(master.main_services.contains("apache2"));

    // both VMIs reassemble from the shared base
    for vmi in ["web_a.qcow2", "web_b.qcow2"] {
        let outcome = Reassembler::new(&rig.config, &rig.tool)
            .reassemble(vmi)
            .await
            .unwrap();
        assert!(FakeImage::load(&outcome.output_path).is_ok());
    }
}

#[tokio::test]
async fn broader_base_replaces_the_stored_one() {
    let rig = rig().await;
    let path_a = write_image(&rig, "web_a.qcow2", &nginx_vmi());
    decompose(&rig, &path_a, &["nginx"]).await;

    let catalog = Catalog::open(&rig.config).unwrap();
    let old_row = catalog
        .base_image_row(
            catalog
                .compatible_base_candidates("ubuntu", "16_4", "amd64", guest_cli_wrapper::PackageManager::Apt)
                .unwrap()[0]
                .id,
        )
        .unwrap()
        .unwrap();
    drop(catalog);

    // redis pins bash 5.0, which the stored base cannot satisfy, while the
    // redis base still hosts the stored nginx closure
    let path_c = write_image(&rig, "cache_c.qcow2", &redis_vmi());
    let outcome = decompose(&rig, &path_c, &["redis"]).await;
    assert!(outcome.base_image_treatment.contains("replaces"));

    let catalog = Catalog::open(&rig.config).unwrap();
    assert_eq!(catalog.base_image_count().unwrap(), 1);
    // the replaced base and its graphs are gone from disk
    assert!(!old_row.file_path.exists());
    assert!(!old_row.graph_path.exists());
    assert!(!old_row.master_graph_path.exists());

    // the old VMI now references the new base
    let data = catalog.vmi_record("web_a.qcow2").unwrap().unwrap();
    assert_ne!(data.base.image_path, old_row.file_path);
    assert!(data.base.image_path.is_file());
    assert!(data.base.graph.contains("bash"));

    // the folded master still covers the old VMI's closure
    let candidates = catalog
        .compatible_base_candidates("ubuntu", "16_4", "amd64", guest_cli_wrapper::PackageManager::Apt)
        .unwrap();
    let master = catalog.master_descriptor(candidates[0].id).unwrap().unwrap();
    for name in ["nginx", "libssl", "redis"] {
        assert!(master.base.graph.contains(name), "master graph misses {name}");
    }

    // and the old VMI still reassembles
    let outcome = Reassembler::new(&rig.config, &rig.tool)
        .reassemble("web_a.qcow2")
        .await
        .unwrap();
    let rebuilt = FakeImage::load(&outcome.output_path).unwrap();
    assert!(rebuilt.package_names().contains(&"nginx".to_string()));
}

#[tokio::test]
async fn fedora_vmi_gets_an_independent_base() {
    let rig = rig().await;
    let path_a = write_image(&rig, "web_a.qcow2", &nginx_vmi());
    decompose(&rig, &path_a, &["nginx"]).await;
    let path_f = write_image(&rig, "httpd_f.qcow2", &httpd_vmi());
    let outcome = decompose(&rig, &path_f, &["httpd"]).await;

    // no cross-distribution replacement
    assert!(outcome.base_image_treatment.contains("New base image"));
    let catalog = Catalog::open(&rig.config).unwrap();
    assert_eq!(catalog.base_image_count().unwrap(), 2);
    let fedora_base = rig
        .config
        .base_images_dir()
        .join("fedora_26_0_dnf_x86_64.qcow2");
    assert!(fedora_base.is_file());
    assert_eq!(
        FakeImage::load(&fedora_base).unwrap().package_names(),
        vec!["glibc", "systemd"]
    );
    drop(catalog);

    // dnf reassembly works and triggers the SELinux relabel pass
    let outcome = Reassembler::new(&rig.config, &rig.tool)
        .reassemble("httpd_f.qcow2")
        .await
        .unwrap();
    let rebuilt = FakeImage::load(&outcome.output_path).unwrap();
    assert_eq!(
        rebuilt.package_names(),
        vec!["apr", "glibc", "httpd", "systemd"]
    );
    assert_eq!(rebuilt.relabels, 1);
    assert_eq!(rebuilt.identity_resets, 1);
}

#[tokio::test]
async fn duplicate_vmi_names_are_rejected_without_side_effects() {
    let rig = rig().await;
    let path = write_image(&rig, "web_a.qcow2", &nginx_vmi());
    decompose(&rig, &path, &["nginx"]).await;

    let path_again = write_image(&rig, "web_a.qcow2", &nginx_vmi());
    let result = Decomposer::new(&rig.config, &rig.tool)
        .decompose(&path_again, "web_a.qcow2", vec!["nginx".to_string()])
        .await;
    assert!(result.is_err());
    // the duplicate was rejected before touching the guest
    assert!(path_again.is_file());
}

#[tokio::test]
async fn unknown_main_service_suggests_similar_packages() {
    let rig = rig().await;
    let path = write_image(&rig, "web_a.qcow2", &nginx_vmi());
    let result = Decomposer::new(&rig.config, &rig.tool)
        .decompose(&path, "web_a.qcow2", vec!["ngin".to_string()])
        .await;
    let message = format!("{:#}", result.unwrap_err());
    assert!(message.contains("'ngin' does not exist"));
    assert!(message.contains("nginx"));
}

#[tokio::test]
async fn missing_home_archive_fails_reassembly_without_output() {
    let rig = rig().await;
    let path = write_image(&rig, "web_a.qcow2", &nginx_vmi());
    decompose(&rig, &path, &["nginx"]).await;

    let catalog = Catalog::open(&rig.config).unwrap();
    let data = catalog.vmi_record("web_a.qcow2").unwrap().unwrap();
    drop(catalog);
    std::fs::remove_file(&data.user_dir_path).unwrap();

    let result = Reassembler::new(&rig.config, &rig.tool)
        .reassemble("web_a.qcow2")
        .await;
    assert!(result.is_err());
    assert!(!rig.config.vmi_workspace.join("web_a.qcow2").exists());
}

#[tokio::test]
async fn reassembling_twice_refuses_to_overwrite() {
    let rig = rig().await;
    let path = write_image(&rig, "web_a.qcow2", &nginx_vmi());
    decompose(&rig, &path, &["nginx"]).await;

    let reassembler = Reassembler::new(&rig.config, &rig.tool);
    reassembler.reassemble("web_a.qcow2").await.unwrap();
    let second = reassembler.reassemble("web_a.qcow2").await;
    let message = format!("{:#}", second.unwrap_err());
    assert!(message.contains("already exists"));
}
