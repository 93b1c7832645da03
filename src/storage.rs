use serde::Serialize;
use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::ErrorKind;
use tracing::warn;

use crate::config::RESERVED_ROOT_NAMES;

/// The single directory tree exposed to clients. The root is canonicalized
/// once at startup and every resolved path must stay under it.
#[derive(Clone, Debug)]
pub struct RootDir {
    root: PathBuf,
}

impl RootDir {
    pub async fn open(root: PathBuf) -> Result<Self, io::Error> {
        let canonical = fs::canonicalize(&root).await.map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("root directory {} is not usable: {err}", root.display()),
            )
        })?;
        if !fs::metadata(&canonical).await?.is_dir() {
            return Err(io::Error::new(
                ErrorKind::NotADirectory,
                format!("root directory {} is not a directory", root.display()),
            ));
        }
        Ok(Self { root: canonical })
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Resolves a client-supplied relative path to a canonical absolute path
    /// inside the root.
    ///
    /// The substring strip mirrors the historical input cleaning; it is not
    /// load-bearing. The canonicalization plus prefix check below is the
    /// authoritative confinement test and also covers symlink escapes.
    pub async fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let cleaned = relative.replace("..", "").replace('\\', "");
        let cleaned = cleaned.trim_matches('/');

        let joined = if cleaned.is_empty() {
            self.root.clone()
        } else {
            self.root.join(cleaned)
        };
        let resolved = fs::canonicalize(&joined).await?;
        if !resolved.starts_with(&self.root) {
            return Err(StorageError::InvalidPath);
        }
        Ok(resolved)
    }

    /// Lists the immediate children of a directory, reserved top-level names
    /// filtered out at the root, directories first, case-insensitive order
    /// within each group.
    pub async fn list(&self, relative: &str) -> Result<DirectoryListing, StorageError> {
        let target = self.resolve(relative).await?;
        if !fs::metadata(&target).await?.is_dir() {
            return Err(StorageError::Io(ErrorKind::NotFound.into()));
        }
        let at_root = target == self.root;

        let mut dir = fs::read_dir(&target).await?;
        let mut items = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if at_root && RESERVED_ROOT_NAMES.contains(&name.to_lowercase().as_str()) {
                continue;
            }
            let path = entry.path();
            // follows symlinks, like the listing the clients were built against
            let metadata = match fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(name, error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            items.push(self.file_entry(name, &path, &metadata)?);
        }

        items.sort_by(|a, b| match (a.kind, b.kind) {
            (EntryKind::Directory, EntryKind::File) => Ordering::Less,
            (EntryKind::File, EntryKind::Directory) => Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        let total = items.len();
        let parent = if at_root {
            None
        } else {
            target.parent().map(|parent| self.display_subpath(parent))
        };

        Ok(DirectoryListing {
            current: self.display_subpath(&target),
            parent,
            items,
            total,
        })
    }

    fn file_entry(
        &self,
        name: String,
        path: &Path,
        metadata: &std::fs::Metadata,
    ) -> Result<FileEntry, StorageError> {
        let relative_path = path
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        let modified = metadata
            .modified()
            .ok()
            .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0);

        let is_dir = metadata.is_dir();
        let (extension, mime) = if is_dir {
            (None, None)
        } else {
            let extension = path
                .extension()
                .map(|ext| ext.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            let mime = mime_guess::from_path(path)
                .first_or_octet_stream()
                .essence_str()
                .to_string();
            (Some(extension), Some(mime))
        };
        let (readable, writable) = access_flags(metadata);

        Ok(FileEntry {
            name,
            path: path.to_string_lossy().into_owned(),
            kind: if is_dir {
                EntryKind::Directory
            } else {
                EntryKind::File
            },
            size: if is_dir { 0 } else { metadata.len() },
            modified,
            permissions: permission_string(metadata),
            readable,
            writable,
            extension,
            mime,
            relative_path,
        })
    }

    fn display_subpath(&self, target: &Path) -> String {
        match target.strip_prefix(&self.root) {
            Ok(rest) if rest.as_os_str().is_empty() => String::new(),
            Ok(rest) => format!(
                "/{}",
                rest.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/")
            ),
            Err(_) => String::new(),
        }
    }
}

/// Last four octal digits of the file mode, `0000` where modes do not exist.
fn permission_string(metadata: &std::fs::Metadata) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let octal = format!("{:o}", metadata.permissions().mode());
        let start = octal.len().saturating_sub(4);
        octal[start..].to_string()
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        String::from("0000")
    }
}

/// Approximated from mode bits; an exact answer would need an access(2)
/// probe per entry.
fn access_flags(metadata: &std::fs::Metadata) -> (bool, bool) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        (mode & 0o444 != 0, mode & 0o222 != 0)
    }
    #[cfg(not(unix))]
    {
        (true, !metadata.permissions().readonly())
    }
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
    pub modified: i64,
    pub permissions: String,
    pub readable: bool,
    pub writable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(rename = "relativePath")]
    pub relative_path: String,
}

#[derive(Debug, Serialize)]
pub struct DirectoryListing {
    pub current: String,
    pub parent: Option<String>,
    pub items: Vec<FileEntry>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::{EntryKind, RootDir, StorageError};
    use std::io::ErrorKind;
    use tempfile::tempdir;

    async fn make_root() -> (tempfile::TempDir, RootDir) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).expect("create root");
        let root = RootDir::open(root).await.expect("open root");
        (temp, root)
    }

    #[tokio::test]
    async fn resolve_rejects_escaping_paths() {
        let (temp, root) = make_root().await;
        std::fs::write(temp.path().join("outside.txt"), b"secret").expect("write outside file");

        for candidate in ["../outside.txt", "foo/../../outside.txt", "/etc/passwd"] {
            assert!(
                root.resolve(candidate).await.is_err(),
                "{candidate} must not resolve"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_rejects_symlink_escape() {
        use std::os::unix::fs::symlink;

        let (temp, root) = make_root().await;
        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write outside file");
        symlink(&outside, root.root_path().join("link")).expect("symlink");

        let result = root.resolve("link").await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));
    }

    #[tokio::test]
    async fn listing_orders_directories_before_files() {
        let (_temp, root) = make_root().await;
        let base = root.root_path();
        std::fs::create_dir(base.join("beta")).expect("create dir");
        std::fs::create_dir(base.join("Alpha")).expect("create dir");
        std::fs::write(base.join("zeta.txt"), b"z").expect("write file");
        std::fs::write(base.join("Echo.txt"), b"e").expect("write file");
        std::fs::write(base.join("apple.txt"), b"a").expect("write file");

        let listing = root.list("").await.expect("list root");
        let names: Vec<&str> = listing.items.iter().map(|item| item.name.as_str()).collect();
        assert_eq!(names, ["Alpha", "beta", "apple.txt", "Echo.txt", "zeta.txt"]);
        assert_eq!(listing.items[0].kind, EntryKind::Directory);
        assert_eq!(listing.items[1].kind, EntryKind::Directory);
        assert_eq!(listing.total, 5);
    }

    #[tokio::test]
    async fn listing_hides_reserved_names_only_at_root() {
        let (_temp, root) = make_root().await;
        let base = root.root_path();
        std::fs::create_dir(base.join("api")).expect("create dir");
        std::fs::create_dir(base.join("CSS")).expect("create dir");
        std::fs::create_dir(base.join("docs")).expect("create dir");
        std::fs::write(base.join("docs").join("api"), b"data").expect("write file");

        let listing = root.list("").await.expect("list root");
        let names: Vec<&str> = listing.items.iter().map(|item| item.name.as_str()).collect();
        assert_eq!(names, ["docs"]);

        let listing = root.list("docs").await.expect("list docs");
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.items[0].name, "api");
    }

    #[tokio::test]
    async fn listing_reports_current_and_parent() {
        let (_temp, root) = make_root().await;
        std::fs::create_dir_all(root.root_path().join("sub").join("inner"))
            .expect("create dirs");

        let listing = root.list("").await.expect("list root");
        assert_eq!(listing.current, "");
        assert_eq!(listing.parent, None);

        let listing = root.list("sub").await.expect("list sub");
        assert_eq!(listing.current, "/sub");
        assert_eq!(listing.parent.as_deref(), Some(""));

        let listing = root.list("sub/inner").await.expect("list inner");
        assert_eq!(listing.current, "/sub/inner");
        assert_eq!(listing.parent.as_deref(), Some("/sub"));
    }

    #[tokio::test]
    async fn listing_missing_directory_is_not_found() {
        let (_temp, root) = make_root().await;
        let result = root.list("nope").await;
        assert!(
            matches!(result, Err(StorageError::Io(ref err)) if err.kind() == ErrorKind::NotFound)
        );
    }

    #[tokio::test]
    async fn listing_file_target_is_not_found() {
        let (_temp, root) = make_root().await;
        std::fs::write(root.root_path().join("plain.txt"), b"data").expect("write file");
        let result = root.list("plain.txt").await;
        assert!(
            matches!(result, Err(StorageError::Io(ref err)) if err.kind() == ErrorKind::NotFound)
        );
    }
}
