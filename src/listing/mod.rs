use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::utils::{format_size, parse_size};

/// One entry in a directory listing.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEntry {
    /// A mount/volume root (the drive-selection view).
    Drive(String),
    Folder(String),
    File { name: String, size: u64 },
}

impl DirectoryEntry {
    /// Legacy textual wire encoding, kept for compatibility with the
    /// reference protocol.
    pub fn to_wire(&self) -> String {
        match self {
            DirectoryEntry::Drive(path) => format!("[Drive] {path}"),
            DirectoryEntry::Folder(name) => format!("[Folder] {name}"),
            DirectoryEntry::File { name, size } => {
                format!("[File] {} ({})", name, format_size(*size))
            }
        }
    }

    /// Parse a legacy wire entry. Sizes come back from their human form,
    /// so remote file sizes are display-approximate.
    pub fn from_wire(text: &str) -> Option<Self> {
        if let Some(path) = text.strip_prefix("[Drive] ") {
            return Some(DirectoryEntry::Drive(path.trim().to_string()));
        }
        if let Some(name) = text.strip_prefix("[Folder] ") {
            return Some(DirectoryEntry::Folder(name.trim().to_string()));
        }
        let rest = text.strip_prefix("[File] ")?;
        let rest = rest.strip_suffix(')')?;
        let (name, size_label) = rest.rsplit_once(" (")?;
        Some(DirectoryEntry::File {
            name: name.to_string(),
            size: parse_size(size_label)?,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            DirectoryEntry::Drive(path) => path,
            DirectoryEntry::Folder(name) => name,
            DirectoryEntry::File { name, .. } => name,
        }
    }
}

/// An ordered set of entries describing one directory level. The empty path
/// is the root/drive-selection view.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DirectoryListing {
    pub path: String,
    pub entries: Vec<DirectoryEntry>,
}

impl DirectoryListing {
    pub fn wire_files(&self) -> Vec<String> {
        self.entries.iter().map(DirectoryEntry::to_wire).collect()
    }

    /// Rebuild a listing from wire strings, skipping entries that don't
    /// parse (they would only ever come from a non-conforming peer).
    pub fn from_wire(files: &[String], path: String) -> Self {
        let entries = files
            .iter()
            .filter_map(|line| {
                let entry = DirectoryEntry::from_wire(line);
                if entry.is_none() {
                    warn!(line = %line, "ignoring unparseable listing entry");
                }
                entry
            })
            .collect();
        Self { path, entries }
    }

    pub fn find_file(&self, name: &str) -> Option<&DirectoryEntry> {
        self.entries
            .iter()
            .find(|e| matches!(e, DirectoryEntry::File { .. }) && e.name() == name)
    }
}

/// Capability interface for enumerating mount/volume roots, so the lister
/// itself stays platform-neutral.
#[async_trait]
pub trait DriveProvider: Send + Sync {
    async fn drives(&self) -> Vec<String>;
}

/// Single-root filesystems: the only "drive" is `/`.
pub struct SingleRootDrives;

#[async_trait]
impl DriveProvider for SingleRootDrives {
    async fn drives(&self) -> Vec<String> {
        vec!["/".to_string()]
    }
}

/// Drive-letter filesystems: probe `A:\` through `Z:\` for mounted volumes.
pub struct DriveLetterDrives;

#[async_trait]
impl DriveProvider for DriveLetterDrives {
    async fn drives(&self) -> Vec<String> {
        let mut found = Vec::new();
        for letter in b'A'..=b'Z' {
            let root = format!("{}:\\", letter as char);
            if tokio::fs::metadata(&root).await.is_ok() {
                found.push(root);
            }
        }
        found
    }
}

/// The drive provider matching the build platform.
pub fn platform_drives() -> Arc<dyn DriveProvider> {
    #[cfg(windows)]
    {
        Arc::new(DriveLetterDrives)
    }
    #[cfg(not(windows))]
    {
        Arc::new(SingleRootDrives)
    }
}

/// Enumerate `path` into a listing.
///
/// An empty path yields the drive-root view. A path that cannot be
/// enumerated at all falls back to the drive-root view with an empty
/// effective path; that is recovery, not an error. Individual children that
/// fail to stat are skipped with a warning. Entries keep filesystem
/// discovery order.
pub async fn list(path: &str, drives: &dyn DriveProvider) -> DirectoryListing {
    if path.is_empty() {
        return drive_listing(drives).await;
    }

    let mut read_dir = match tokio::fs::read_dir(path).await {
        Ok(rd) => rd,
        Err(e) => {
            warn!(path, error = %e, "listing failed, falling back to drive roots");
            return drive_listing(drives).await;
        }
    };

    let mut entries = Vec::new();
    loop {
        match read_dir.next_entry().await {
            Ok(Some(entry)) => {
                let name = entry.file_name().to_string_lossy().to_string();
                match entry.metadata().await {
                    Ok(md) if md.is_file() => entries.push(DirectoryEntry::File {
                        name,
                        size: md.len(),
                    }),
                    Ok(_) => entries.push(DirectoryEntry::Folder(name)),
                    Err(e) => warn!(name = %name, error = %e, "skipping unreadable entry"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(path, error = %e, "directory iteration stopped early");
                break;
            }
        }
    }

    DirectoryListing {
        path: path.to_string(),
        entries,
    }
}

async fn drive_listing(drives: &dyn DriveProvider) -> DirectoryListing {
    let entries = drives
        .drives()
        .await
        .into_iter()
        .map(DirectoryEntry::Drive)
        .collect();
    DirectoryListing {
        path: String::new(),
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDrives(Vec<String>);

    #[async_trait]
    impl DriveProvider for FakeDrives {
        async fn drives(&self) -> Vec<String> {
            self.0.clone()
        }
    }

    #[test]
    fn test_wire_roundtrip() {
        let entries = [
            DirectoryEntry::Drive("C:\\".into()),
            DirectoryEntry::Folder("docs".into()),
            DirectoryEntry::File {
                name: "notes (draft).txt".into(),
                size: 512,
            },
        ];
        for entry in entries {
            assert_eq!(DirectoryEntry::from_wire(&entry.to_wire()).unwrap(), entry);
        }
    }

    #[test]
    fn test_from_wire_rejects_garbage() {
        assert_eq!(DirectoryEntry::from_wire("no tag here"), None);
        assert_eq!(DirectoryEntry::from_wire("[File] missing-size"), None);
    }

    #[tokio::test]
    async fn test_empty_path_returns_drives() {
        let drives = FakeDrives(vec!["/".into()]);
        let listing = list("", &drives).await;
        assert_eq!(listing.path, "");
        assert_eq!(listing.entries, vec![DirectoryEntry::Drive("/".into())]);
    }

    #[tokio::test]
    async fn test_listing_classifies_entries() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"hello").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();

        let drives = FakeDrives(vec![]);
        let listing = list(dir.path().to_str().unwrap(), &drives).await;
        assert_eq!(listing.entries.len(), 2);
        assert!(listing.entries.contains(&DirectoryEntry::File {
            name: "a.txt".into(),
            size: 5,
        }));
        assert!(listing.entries.contains(&DirectoryEntry::Folder("sub".into())));
        assert!(listing.find_file("a.txt").is_some());
        assert!(listing.find_file("sub").is_none());
    }

    #[tokio::test]
    async fn test_unlistable_path_falls_back_to_drives() {
        let drives = FakeDrives(vec!["/".into()]);
        let listing = list("/definitely/not/a/real/path", &drives).await;
        assert_eq!(listing.path, "");
        assert_eq!(listing.entries, vec![DirectoryEntry::Drive("/".into())]);
    }

    #[tokio::test]
    async fn test_listing_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("x"), b"1").await.unwrap();
        let drives = FakeDrives(vec![]);
        let a = list(dir.path().to_str().unwrap(), &drives).await;
        let b = list(dir.path().to_str().unwrap(), &drives).await;
        assert_eq!(a, b);
    }
}
