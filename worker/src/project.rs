//! Project storage: archive validation, extraction and kind detection.
//!
//! Never-trust-the-archive discipline: every member is validated before a
//! single byte is written under `current/`.

use std::io::{Read as _, Write as _};
use std::path::{Component, Path, PathBuf};
use std::{fs, io};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use robolink_model::config::StorageConfig;
use robolink_model::ErrorCode;
use serde::Serialize;

const MAX_ARCHIVE_BYTES: usize = 20 * 1024 * 1024;
const MAX_EXPANDED_BYTES: u64 = 100 * 1024 * 1024;
const MAX_MEMBERS: usize = 10;
const MAX_COMPRESSION_RATIO: u64 = 100;

const ALLOWED_EXTENSIONS: &[&str] = &[
    "py", "txt", "md", "json", "yaml", "yml", "ini", "cfg", "toml",
];

/// Directories that are never copied when seeding `current` from `default`.
const SKIPPED_DIR_NAMES: &[&str] = &["__pycache__"];

const EXTRACT_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectKind {
    Scripted,
}

/// A project-management failure carrying its stable error code.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProjectError {
    code: ErrorCode,
    message: String,
}

impl ProjectError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

pub struct ProjectStore {
    projects_dir: PathBuf,
}

impl ProjectStore {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            projects_dir: storage.projects_dir(),
        }
    }

    pub fn current_dir(&self) -> PathBuf {
        self.projects_dir.join("current")
    }

    pub fn default_dir(&self) -> PathBuf {
        self.projects_dir.join("default")
    }

    pub fn dir_has_entries(dir: &Path) -> io::Result<bool> {
        if !dir.exists() {
            return Ok(false);
        }
        Ok(fs::read_dir(dir)?.next().is_some())
    }

    /// Copy `default` into an empty `current`, skipping cache directories.
    pub fn seed_default_project(&self) -> io::Result<()> {
        let current = self.current_dir();
        let default = self.default_dir();

        if Self::dir_has_entries(&current)? || !default.exists() {
            return Ok(());
        }

        tracing::info!("seeding current project from default");
        fs::create_dir_all(&current)?;
        copy_project_tree(&default, &current)?;

        Ok(())
    }

    /// Detect the kind of the project in `dir` by its entry file.
    pub fn detect_kind(&self, dir: &Path) -> Result<ProjectKind, ProjectError> {
        if dir.join("main.py").is_file() || dir.join("__init__.py").is_file() {
            return Ok(ProjectKind::Scripted);
        }

        Err(ProjectError::new(
            ErrorCode::ProjectInvalidFormat,
            "couldn't detect the project kind: no entry file (main.py or __init__.py)",
        ))
    }

    /// Inspect `current` on disk, for recovery after a worker respawn.
    pub fn recover_from_disk(&self) -> Result<Option<(PathBuf, ProjectKind)>, ProjectError> {
        let current = self.current_dir();

        let populated = Self::dir_has_entries(&current).map_err(|e| {
            ProjectError::new(
                ErrorCode::ProjectLoadFailed,
                format!("couldn't inspect `{}`: {e}", current.display()),
            )
        })?;
        if !populated {
            return Ok(None);
        }

        let kind = self.detect_kind(&current)?;
        Ok(Some((current, kind)))
    }

    /// Validate and extract a base64 zip archive into `current`, replacing
    /// whatever was there. Nothing under `current/` is touched until the
    /// whole archive has passed validation.
    pub fn extract_archive(&self, archive_b64: &str) -> Result<(PathBuf, ProjectKind), ProjectError> {
        let bytes = BASE64.decode(archive_b64.trim()).map_err(|e| {
            ProjectError::new(
                ErrorCode::ProjectUploadFailed,
                format!("archive is not valid base64: {e}"),
            )
        })?;
        tracing::info!(bytes = bytes.len(), "decoded archive");

        if bytes.len() > MAX_ARCHIVE_BYTES {
            return Err(ProjectError::new(
                ErrorCode::ProjectInvalidFormat,
                format!(
                    "archive too large: {} bytes (limit {MAX_ARCHIVE_BYTES})",
                    bytes.len()
                ),
            ));
        }

        let mut archive = zip::ZipArchive::new(io::Cursor::new(&bytes)).map_err(|e| {
            ProjectError::new(
                ErrorCode::ProjectInvalidFormat,
                format!("not a readable zip archive: {e}"),
            )
        })?;

        validate_members(&mut archive)?;

        // Validation passed; now it is safe to replace the old project.
        let current = self.current_dir();
        let io_err = |e: io::Error| {
            ProjectError::new(
                ErrorCode::ProjectUploadFailed,
                format!("couldn't write project files: {e}"),
            )
        };

        if current.exists() {
            tracing::info!("removing previous project");
            fs::remove_dir_all(&current).map_err(io_err)?;
        }
        fs::create_dir_all(&current).map_err(io_err)?;

        extract_members(&mut archive, &current).map_err(io_err)?;

        let kind = self.detect_kind(&current)?;
        tracing::info!(?kind, "project extracted");

        Ok((current, kind))
    }
}

fn validate_members(archive: &mut zip::ZipArchive<io::Cursor<&Vec<u8>>>) -> Result<(), ProjectError> {
    if archive.len() > MAX_MEMBERS {
        return Err(ProjectError::new(
            ErrorCode::ProjectInvalidFormat,
            format!(
                "too many archive members: {} (limit {MAX_MEMBERS})",
                archive.len()
            ),
        ));
    }

    let mut total_expanded = 0u64;
    let mut offenders = Vec::new();

    for index in 0..archive.len() {
        let member = archive.by_index(index).map_err(|e| {
            ProjectError::new(
                ErrorCode::ProjectInvalidFormat,
                format!("unreadable archive member #{index}: {e}"),
            )
        })?;

        if member.is_dir() {
            continue;
        }

        let name = member.name().to_owned();
        total_expanded += member.size();

        if !has_allowed_extension(&name) {
            offenders.push(format!("{name}: extension not allowed"));
            continue;
        }

        if !is_safe_member_path(&name) {
            offenders.push(format!("{name}: unsafe path"));
            continue;
        }

        if member.compressed_size() > 0 {
            let ratio = member.size() / member.compressed_size();
            if ratio > MAX_COMPRESSION_RATIO {
                offenders.push(format!("{name}: suspicious compression ratio ({ratio}:1)"));
            }
        }
    }

    if total_expanded > MAX_EXPANDED_BYTES {
        return Err(ProjectError::new(
            ErrorCode::ProjectInvalidFormat,
            format!("expanded size too large: {total_expanded} bytes (limit {MAX_EXPANDED_BYTES})"),
        ));
    }

    if !offenders.is_empty() {
        return Err(ProjectError::new(
            ErrorCode::ProjectSecurityViolation,
            format!(
                "{} unsafe archive member(s):\n{}",
                offenders.len(),
                offenders
                    .iter()
                    .map(|o| format!("  - {o}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            ),
        ));
    }

    Ok(())
}

fn extract_members(
    archive: &mut zip::ZipArchive<io::Cursor<&Vec<u8>>>,
    target_root: &Path,
) -> io::Result<()> {
    for index in 0..archive.len() {
        let mut member = archive
            .by_index(index)
            .map_err(|e| io::Error::other(format!("unreadable archive member #{index}: {e}")))?;

        if member.is_dir() {
            continue;
        }

        // `enclosed_name` refuses traversal; validation already rejected
        // such members, this is the second line.
        let relative = member
            .enclosed_name()
            .ok_or_else(|| io::Error::other(format!("unsafe member path `{}`", member.name())))?;
        let target = target_root.join(relative);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = fs::File::create(&target)?;
        let mut buf = [0u8; EXTRACT_CHUNK];
        loop {
            let n = member.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
        }

        if let Some(mode) = member.unix_mode() {
            use std::os::unix::fs::PermissionsExt as _;
            if let Err(error) = fs::set_permissions(&target, fs::Permissions::from_mode(mode)) {
                tracing::warn!(path = %target.display(), %error, "couldn't apply archive mode bits");
            }
        }
    }

    Ok(())
}

fn has_allowed_extension(name: &str) -> bool {
    match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some(ext) => ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        // Extensionless files (e.g. LICENSE) are fine; they can't be imported.
        None => true,
    }
}

fn is_safe_member_path(name: &str) -> bool {
    if name.starts_with('/') || name.starts_with('\\') {
        return false;
    }
    if name.contains("..") || name.contains('~') || name.contains('$') {
        return false;
    }

    Path::new(name).components().all(|component| match component {
        Component::Normal(part) => !part.to_string_lossy().starts_with('~'),
        Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
            false
        }
    })
}

fn copy_project_tree(from: &Path, to: &Path) -> io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        let target = to.join(&name);

        if entry.file_type()?.is_dir() {
            let name = name.to_string_lossy();
            if name.starts_with('.') || SKIPPED_DIR_NAMES.contains(&name.as_ref()) {
                continue;
            }
            fs::create_dir_all(&target)?;
            copy_project_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use robolink_model::config::StorageConfig;
    use std::io::Write as _;
    use zip::write::SimpleFileOptions;

    fn store(root: &Path) -> ProjectStore {
        ProjectStore::new(&StorageConfig {
            root: root.to_owned(),
        })
    }

    fn zip_archive(members: &[(&str, &[u8])]) -> String {
        let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        for (name, content) in members {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        let bytes = writer.finish().unwrap().into_inner();
        BASE64.encode(bytes)
    }

    fn tree_snapshot(dir: &Path) -> Vec<String> {
        let mut entries = Vec::new();
        if !dir.exists() {
            return entries;
        }
        for entry in walk(dir) {
            entries.push(
                entry
                    .strip_prefix(dir)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned(),
            );
        }
        entries.sort();
        entries
    }

    fn walk(dir: &Path) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                paths.extend(walk(&path));
            } else {
                paths.push(path);
            }
        }
        paths
    }

    #[test]
    fn extracts_a_valid_archive() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let archive = zip_archive(&[
            ("main.py", b"class C:\n    pass\n".as_slice()),
            ("README.md", b"hello".as_slice()),
        ]);

        let (path, kind) = store.extract_archive(&archive).unwrap();

        assert_eq!(kind, ProjectKind::Scripted);
        assert_eq!(path, store.current_dir());
        assert_eq!(tree_snapshot(&path), vec!["README.md", "main.py"]);
    }

    #[test]
    fn second_upload_replaces_the_previous_project() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        store
            .extract_archive(&zip_archive(&[("main.py", b"old".as_slice())]))
            .unwrap();
        store
            .extract_archive(&zip_archive(&[
                ("main.py", b"new".as_slice()),
                ("util.py", b"".as_slice()),
            ]))
            .unwrap();

        let current = store.current_dir();
        assert_eq!(tree_snapshot(&current), vec!["main.py", "util.py"]);
        assert_eq!(fs::read_to_string(current.join("main.py")).unwrap(), "new");
    }

    #[test]
    fn traversal_member_rejects_whole_archive_and_leaves_current_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        store
            .extract_archive(&zip_archive(&[("main.py", b"keep me".as_slice())]))
            .unwrap();
        let before = tree_snapshot(&store.current_dir());

        let err = store
            .extract_archive(&zip_archive(&[
                ("main.py", b"evil".as_slice()),
                ("../evil.py", b"evil".as_slice()),
            ]))
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ProjectSecurityViolation);
        assert_eq!(tree_snapshot(&store.current_dir()), before);
        assert_eq!(
            fs::read_to_string(store.current_dir().join("main.py")).unwrap(),
            "keep me"
        );
    }

    #[test]
    fn rejects_disallowed_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let err = store
            .extract_archive(&zip_archive(&[
                ("main.py", b"ok".as_slice()),
                ("payload.sh", b"#!/bin/sh".as_slice()),
            ]))
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ProjectSecurityViolation);
        assert!(err.to_string().contains("payload.sh"));
        assert!(!store.current_dir().exists());
    }

    #[test]
    fn rejects_absolute_and_home_relative_paths() {
        for name in ["/etc/cron.d/evil.py", "~/evil.py", "$HOME/evil.py"] {
            assert!(!is_safe_member_path(name), "{name} should be rejected");
        }
        assert!(is_safe_member_path("pkg/nested/module.py"));
    }

    #[test]
    fn rejects_too_many_members() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let names: Vec<String> = (0..11).map(|i| format!("file{i}.py")).collect();
        let members: Vec<(&str, &[u8])> = names
            .iter()
            .map(|n| (n.as_str(), b"x".as_slice()))
            .collect();

        let err = store.extract_archive(&zip_archive(&members)).unwrap_err();

        assert_eq!(err.code(), ErrorCode::ProjectInvalidFormat);
    }

    #[test]
    fn rejects_compression_bombs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        // 5 MiB of zeros deflates to a few KiB: ratio far beyond 100:1.
        let zeros = vec![0u8; 5 * 1024 * 1024];
        let err = store
            .extract_archive(&zip_archive(&[("main.py", zeros.as_slice())]))
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ProjectSecurityViolation);
        assert!(err.to_string().contains("compression ratio"));
    }

    #[test]
    fn rejects_garbage_base64_and_non_zip_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let err = store.extract_archive("!!! not base64 !!!").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProjectUploadFailed);

        let err = store
            .extract_archive(&BASE64.encode(b"this is not a zip"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProjectInvalidFormat);
    }

    #[test]
    fn archive_without_entry_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let err = store
            .extract_archive(&zip_archive(&[("helper.py", b"x".as_slice())]))
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ProjectInvalidFormat);
    }

    #[test]
    fn seeds_current_from_default_skipping_caches() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let default = store.default_dir();
        fs::create_dir_all(default.join("__pycache__")).unwrap();
        fs::create_dir_all(default.join("lib")).unwrap();
        fs::write(default.join("main.py"), "pass").unwrap();
        fs::write(default.join("__pycache__/main.cpython.pyc"), "junk").unwrap();
        fs::write(default.join("lib/util.py"), "pass").unwrap();

        store.seed_default_project().unwrap();

        assert_eq!(
            tree_snapshot(&store.current_dir()),
            vec!["lib/util.py", "main.py"]
        );
    }

    #[test]
    fn seeding_never_overwrites_a_populated_current() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        fs::create_dir_all(store.default_dir()).unwrap();
        fs::write(store.default_dir().join("main.py"), "default").unwrap();
        fs::create_dir_all(store.current_dir()).unwrap();
        fs::write(store.current_dir().join("main.py"), "live").unwrap();

        store.seed_default_project().unwrap();

        assert_eq!(
            fs::read_to_string(store.current_dir().join("main.py")).unwrap(),
            "live"
        );
    }

    #[test]
    fn recovers_project_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        assert!(store.recover_from_disk().unwrap().is_none());

        fs::create_dir_all(store.current_dir()).unwrap();
        fs::write(store.current_dir().join("main.py"), "pass").unwrap();

        let (path, kind) = store.recover_from_disk().unwrap().unwrap();
        assert_eq!(path, store.current_dir());
        assert_eq!(kind, ProjectKind::Scripted);
    }
}
