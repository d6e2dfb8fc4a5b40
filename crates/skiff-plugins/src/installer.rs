//! Plugin package installation
//!
//! A package is a `.zip` or `.tar.gz`/`.tgz` holding exactly one
//! `manifest.json` at `[plugins/]<category>/<plugin_id>/manifest.json`.
//! It is extracted into a staging area under the base directory and
//! verified. The destination directory is then claimed with a single
//! `create_dir`, so concurrent installs of one plugin cannot both proceed,
//! and the staged tree is copied into it.

use crate::manifest::{DiskManifest, EntryResolution, MANIFEST_FILE, load_manifest, resolve_entry};
use crate::signature::{SignatureStatus, verify_plugin_dir};
use crate::{Category, PluginError, PluginResult, validate_plugin_id};
use flate2::read::GzDecoder;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    TarGz,
}

impl ArchiveKind {
    fn from_filename(filename: &str) -> PluginResult<Self> {
        let lower = filename.trim().to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Ok(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Ok(Self::TarGz)
        } else {
            Err(PluginError::Package(format!(
                "unsupported package format {filename:?} (expected .zip, .tar.gz or .tgz)"
            )))
        }
    }
}

/// A package that has been placed under the base directory
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub category: Category,
    pub plugin_id: String,
    pub manifest: DiskManifest,
    pub entry: EntryResolution,
    pub signature: SignatureStatus,
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PackageInstaller {
    base_dir: PathBuf,
    trusted_keys: Vec<[u8; 32]>,
}

impl PackageInstaller {
    pub fn new(base_dir: impl Into<PathBuf>, trusted_keys: Vec<[u8; 32]>) -> Self {
        Self {
            base_dir: base_dir.into(),
            trusted_keys,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn trusted_keys(&self) -> &[[u8; 32]] {
        &self.trusted_keys
    }

    pub fn plugin_dir(&self, category: Category, plugin_id: &str) -> PathBuf {
        self.base_dir.join(category.as_str()).join(plugin_id)
    }

    /// Install a package without blocking the async runtime
    pub async fn install(&self, filename: &str, bytes: Vec<u8>) -> PluginResult<InstalledPackage> {
        let installer = self.clone();
        let filename = filename.to_string();
        tokio::task::spawn_blocking(move || installer.install_blocking(&filename, &bytes))
            .await
            .map_err(|e| PluginError::Package(format!("install task failed: {e}")))?
    }

    pub fn install_blocking(&self, filename: &str, bytes: &[u8]) -> PluginResult<InstalledPackage> {
        let kind = ArchiveKind::from_filename(filename)?;
        fs::create_dir_all(&self.base_dir)?;

        let staging = tempfile::Builder::new()
            .prefix(".skiff-staging-")
            .tempdir_in(&self.base_dir)?;
        let root = staging.path().join("pkg");
        fs::create_dir_all(&root)?;
        match kind {
            ArchiveKind::Zip => extract_zip(bytes, &root)?,
            ArchiveKind::TarGz => extract_tar_gz(bytes, &root)?,
        }

        let manifest_path = find_single_manifest(&root)?;
        let (category, plugin_id) = locate_plugin(&root, &manifest_path)?;
        let src = manifest_path
            .parent()
            .ok_or_else(|| PluginError::Package("manifest has no parent directory".to_string()))?
            .to_path_buf();

        let manifest = load_manifest(&src)?;
        if manifest.plugin_id.trim() != plugin_id {
            return Err(PluginError::Package(format!(
                "manifest plugin_id {:?} does not match package path {plugin_id:?}",
                manifest.plugin_id
            )));
        }

        let entry = resolve_entry(&src, &manifest);
        if !entry.entry_supported {
            warn!(
                category = %category,
                plugin_id = %plugin_id,
                platform = %entry.platform,
                supported = ?entry.supported_platforms,
                "installing plugin that cannot run on this host"
            );
        }

        let signature = verify_plugin_dir(&src, &self.trusted_keys);

        let dest = self.plugin_dir(category, &plugin_id);
        fs::create_dir_all(self.base_dir.join(category.as_str()))?;
        match fs::create_dir(&dest) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(PluginError::Conflict(format!(
                    "plugin {category}/{plugin_id} is already installed"
                )));
            }
            Err(e) => return Err(PluginError::Io(e)),
        }
        // The destination is ours from here on; undo it on any failure.
        if let Err(err) = copy_dir_recursive(&src, &dest) {
            if let Err(cleanup) = fs::remove_dir_all(&dest) {
                warn!(dir = %dest.display(), error = %cleanup, "failed to remove partial plugin dir");
            }
            return Err(err);
        }

        info!(
            category = %category,
            plugin_id = %plugin_id,
            version = %manifest.version,
            signature = %signature,
            "plugin package installed"
        );
        // Re-resolve against the final location.
        let entry = resolve_entry(&dest, &manifest);
        Ok(InstalledPackage {
            category,
            plugin_id,
            manifest,
            entry,
            signature,
            dir: dest,
        })
    }

    /// Remove `<base>/<category>/<plugin_id>/`; a missing directory is fine
    pub fn remove_plugin_dir(&self, category: Category, plugin_id: &str) -> PluginResult<()> {
        validate_plugin_id(plugin_id)?;
        let dir = self.plugin_dir(category, plugin_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(dir = %dir.display(), "removed plugin files");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PluginError::Io(e)),
        }
    }
}

/// Normalize an archive entry name, rejecting traversal and drive prefixes
fn sanitize_entry_path(name: &str) -> PluginResult<Option<PathBuf>> {
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') || normalized.contains("..") || normalized.contains(':') {
        return Err(PluginError::Package(format!(
            "archive entry {name:?} has an unsafe path"
        )));
    }
    let mut out = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(PluginError::Package(format!(
                    "archive entry {name:?} has an unsafe path"
                )));
            }
        }
    }
    Ok(if out.as_os_str().is_empty() { None } else { Some(out) })
}

fn extract_zip(bytes: &[u8], dest_root: &Path) -> PluginResult<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| PluginError::Package(format!("invalid zip archive: {e}")))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| PluginError::Package(format!("invalid zip entry: {e}")))?;
        let Some(rel_path) = sanitize_entry_path(file.name())? else {
            continue;
        };
        if file.enclosed_name().is_none() {
            return Err(PluginError::Package(format!(
                "archive entry {:?} has an unsafe path",
                file.name()
            )));
        }
        if let Some(mode) = file.unix_mode() {
            if (mode & 0o170000) == 0o120000 {
                warn!(entry = %file.name(), "skipping symlink in plugin package");
                continue;
            }
        }

        let outpath = dest_root.join(&rel_path);
        if file.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = fs::File::create(&outpath)?;
            std::io::copy(&mut file, &mut outfile)?;
        }
    }
    Ok(())
}

fn extract_tar_gz(bytes: &[u8], dest_root: &Path) -> PluginResult<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(bytes)));
    archive.set_preserve_permissions(false);

    let entries = archive
        .entries()
        .map_err(|e| PluginError::Package(format!("invalid tar.gz archive: {e}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| PluginError::Package(format!("invalid tar entry: {e}")))?;
        let name = entry
            .path()
            .map_err(|e| PluginError::Package(format!("invalid tar entry path: {e}")))?
            .to_string_lossy()
            .into_owned();
        let Some(rel_path) = sanitize_entry_path(&name)? else {
            continue;
        };

        let outpath = dest_root.join(&rel_path);
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else if entry_type.is_file() {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            fs::write(&outpath, data)?;
        } else {
            warn!(entry = %name, "skipping non-regular tar entry in plugin package");
        }
    }
    Ok(())
}

fn find_single_manifest(root: &Path) -> PluginResult<PathBuf> {
    let mut found = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| PluginError::Package(format!("walk package: {e}")))?;
        if entry.file_type().is_file() && entry.file_name() == MANIFEST_FILE {
            found.push(entry.into_path());
        }
    }
    match found.len() {
        0 => Err(PluginError::Package("package contains no manifest.json".to_string())),
        1 => Ok(found.remove(0)),
        n => Err(PluginError::Package(format!(
            "package contains {n} manifest.json files, expected exactly one"
        ))),
    }
}

/// `(category, plugin_id)` from `[plugins/]<category>/<plugin_id>/manifest.json`
fn locate_plugin(root: &Path, manifest_path: &Path) -> PluginResult<(Category, String)> {
    let rel = manifest_path
        .strip_prefix(root)
        .map_err(|e| PluginError::Package(format!("manifest outside package root: {e}")))?;
    let mut parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.pop();
    if parts.first().map(String::as_str) == Some("plugins") {
        parts.remove(0);
    }
    let [category, plugin_id] = parts.as_slice() else {
        return Err(PluginError::Package(format!(
            "manifest must be at <category>/<plugin_id>/manifest.json, found {}",
            rel.display()
        )));
    };
    if category.contains("..") || category.contains(':') {
        return Err(PluginError::Package(format!("invalid category {category:?}")));
    }
    let category: Category = category
        .parse()
        .map_err(|e: PluginError| PluginError::Package(e.to_string()))?;
    validate_plugin_id(plugin_id).map_err(|e| PluginError::Package(e.to_string()))?;
    Ok((category, plugin_id.clone()))
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> PluginResult<()> {
    fs::create_dir_all(dst)?;
    set_mode(dst)?;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| PluginError::Package(format!("walk staged plugin: {e}")))?;
        let path = entry.path();
        if path == src {
            continue;
        }
        let rel = path
            .strip_prefix(src)
            .map_err(|e| PluginError::Package(format!("strip prefix: {e}")))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            set_mode(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(path, &target)?;
            set_mode(&target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::current_platform;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn manifest_json(plugin_id: &str) -> String {
        let platform = current_platform();
        json!({
            "plugin_id": plugin_id,
            "name": "Custom Pay",
            "version": "1.0.0",
            "binaries": { platform.clone(): format!("bin/{platform}/plugin") },
            "capabilities": { "payment": { "methods": ["card"] } }
        })
        .to_string()
    }

    fn zip_package(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in files {
            let options =
                SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn tar_gz_package(files: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn custom_files(prefix: &str) -> Vec<(String, Vec<u8>)> {
        let platform = current_platform();
        vec![
            (
                format!("{prefix}payment/custom/manifest.json"),
                manifest_json("custom").into_bytes(),
            ),
            (
                format!("{prefix}payment/custom/bin/{platform}/plugin"),
                b"#!/bin/sh\n".to_vec(),
            ),
        ]
    }

    fn as_refs(files: &[(String, Vec<u8>)]) -> Vec<(&str, &[u8])> {
        files.iter().map(|(n, d)| (n.as_str(), d.as_slice())).collect()
    }

    #[test]
    fn zip_package_installs_unsigned() {
        let base = TempDir::new().unwrap();
        let installer = PackageInstaller::new(base.path(), Vec::new());
        let files = custom_files("plugins/");
        let pkg = installer
            .install_blocking("custom.zip", &zip_package(&as_refs(&files)))
            .unwrap();

        assert_eq!(pkg.category, Category::Payment);
        assert_eq!(pkg.plugin_id, "custom");
        assert_eq!(pkg.signature, SignatureStatus::Unsigned);
        assert!(pkg.entry.entry_supported);
        assert!(base.path().join("payment/custom/manifest.json").is_file());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let entry = pkg.entry.entry_path.unwrap();
            let mode = fs::metadata(entry).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        let leftovers: Vec<_> = fs::read_dir(base.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn tar_gz_without_plugins_prefix_installs() {
        let base = TempDir::new().unwrap();
        let installer = PackageInstaller::new(base.path(), Vec::new());
        let files = custom_files("");
        let pkg = installer
            .install_blocking("custom.tgz", &tar_gz_package(&as_refs(&files)))
            .unwrap();
        assert_eq!(pkg.dir, base.path().join("payment/custom"));
    }

    #[test]
    fn second_install_conflicts() {
        let base = TempDir::new().unwrap();
        let installer = PackageInstaller::new(base.path(), Vec::new());
        let bytes = zip_package(&as_refs(&custom_files("")));
        installer.install_blocking("a.zip", &bytes).unwrap();
        assert!(matches!(
            installer.install_blocking("a.zip", &bytes),
            Err(PluginError::Conflict(_))
        ));
    }

    #[test]
    fn concurrent_installs_of_one_plugin_admit_one() {
        let base = TempDir::new().unwrap();
        let installer = PackageInstaller::new(base.path(), Vec::new());
        let bytes = zip_package(&as_refs(&custom_files("")));

        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| installer.install_blocking("a.zip", &bytes)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, PluginError::Conflict(_))));
        assert!(base.path().join("payment/custom/manifest.json").is_file());
    }

    #[test]
    fn existing_destination_is_left_untouched() {
        let base = TempDir::new().unwrap();
        let installer = PackageInstaller::new(base.path(), Vec::new());
        let dest = base.path().join("payment/custom");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("marker"), b"other install").unwrap();

        let bytes = zip_package(&as_refs(&custom_files("")));
        assert!(matches!(
            installer.install_blocking("a.zip", &bytes),
            Err(PluginError::Conflict(_))
        ));
        assert_eq!(fs::read(dest.join("marker")).unwrap(), b"other install");
    }

    #[test]
    fn dotted_plugin_id_is_rejected() {
        let base = TempDir::new().unwrap();
        let installer = PackageInstaller::new(base.path(), Vec::new());
        let platform = current_platform();
        let manifest = manifest_json("ez.pay");
        let entry = format!("payment/ez.pay/bin/{platform}/plugin");
        let bytes = zip_package(&[
            ("payment/ez.pay/manifest.json", manifest.as_bytes()),
            (entry.as_str(), &b"#!/bin/sh\n"[..]),
        ]);
        let err = installer.install_blocking("ez.zip", &bytes).unwrap_err();
        assert!(matches!(err, PluginError::Package(_)), "{err:?}");
        assert!(!base.path().join("payment/ez.pay").exists());
    }

    #[test]
    fn traversal_entries_are_rejected() {
        let base = TempDir::new().unwrap();
        let installer = PackageInstaller::new(base.path(), Vec::new());
        let mut files = custom_files("");
        files.push(("payment/custom/../../evil".to_string(), b"x".to_vec()));
        let err = installer
            .install_blocking("bad.zip", &zip_package(&as_refs(&files)))
            .unwrap_err();
        assert!(matches!(err, PluginError::Package(_)));
        assert!(!base.path().join("payment/custom").exists());
    }

    #[test]
    fn manifest_count_and_layout_are_checked() {
        let base = TempDir::new().unwrap();
        let installer = PackageInstaller::new(base.path(), Vec::new());

        let none = zip_package(&[("payment/custom/readme.txt", b"hi")]);
        assert!(installer.install_blocking("x.zip", &none).is_err());

        let mut two = custom_files("");
        two.push(("sms/other/manifest.json".to_string(), manifest_json("other").into_bytes()));
        assert!(installer.install_blocking("x.zip", &zip_package(&as_refs(&two))).is_err());

        let flat = zip_package(&[("manifest.json", manifest_json("custom").as_bytes())]);
        assert!(installer.install_blocking("x.zip", &flat).is_err());

        let mismatched = zip_package(&[(
            "payment/custom/manifest.json",
            manifest_json("another").as_bytes(),
        )]);
        assert!(installer.install_blocking("x.zip", &mismatched).is_err());

        assert!(installer.install_blocking("x.rar", b"").is_err());
    }

    #[test]
    fn unsupported_platform_is_still_installed() {
        let base = TempDir::new().unwrap();
        let installer = PackageInstaller::new(base.path(), Vec::new());
        let manifest = json!({
            "plugin_id": "exotic",
            "name": "Exotic",
            "version": "0.1.0",
            "binaries": { "plan9_mips": "bin/plan9_mips/plugin" }
        })
        .to_string();
        let pkg = installer
            .install_blocking(
                "exotic.zip",
                &zip_package(&[
                    ("sms/exotic/manifest.json", manifest.as_bytes()),
                    ("sms/exotic/bin/plan9_mips/plugin", b"x"),
                ]),
            )
            .unwrap();
        assert!(!pkg.entry.entry_supported);
        assert_eq!(pkg.entry.supported_platforms, vec!["plan9_mips"]);
        let err = pkg.entry.require().unwrap_err().to_string();
        assert!(err.contains("plan9_mips"));
    }

    #[test]
    fn remove_plugin_dir_is_idempotent() {
        let base = TempDir::new().unwrap();
        let installer = PackageInstaller::new(base.path(), Vec::new());
        installer
            .install_blocking("c.zip", &zip_package(&as_refs(&custom_files(""))))
            .unwrap();
        installer.remove_plugin_dir(Category::Payment, "custom").unwrap();
        assert!(!base.path().join("payment/custom").exists());
        installer.remove_plugin_dir(Category::Payment, "custom").unwrap();
    }
}
