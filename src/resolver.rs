//! Expansion of resource references into concrete, fingerprinted files.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::cas::ContentAddressableStore;
use crate::error::{FanoutError, Result};

/// A reference to input data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceRef {
    File(PathBuf),
    Directory(PathBuf),
    /// Opaque identifier resolved through an [`IdLookup`].
    Id(String),
}

impl FromStr for ResourceRef {
    type Err = FanoutError;

    /// `id:<name>` is an opaque id; anything else is a path, classified by
    /// what currently exists on disk.
    fn from_str(s: &str) -> Result<Self> {
        if let Some(id) = s.strip_prefix("id:") {
            if id.is_empty() {
                return Err(FanoutError::ResourceNotFound("empty resource id".into()));
            }
            return Ok(ResourceRef::Id(id.to_string()));
        }
        let path = PathBuf::from(s);
        if path.is_dir() {
            Ok(ResourceRef::Directory(path))
        } else {
            Ok(ResourceRef::File(path))
        }
    }
}

/// A concrete file with its content address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedResource {
    /// Where the file was found.
    pub path: PathBuf,
    /// Path the file gets inside each sub-task directory.
    pub relative: PathBuf,
    pub address: String,
}

/// Black box turning an opaque id into zero or more files.
pub trait IdLookup: Send + Sync {
    fn lookup(&self, id: &str) -> Result<Vec<PathBuf>>;
}

impl<T: IdLookup + ?Sized> IdLookup for std::sync::Arc<T> {
    fn lookup(&self, id: &str) -> Result<Vec<PathBuf>> {
        (**self).lookup(id)
    }
}

/// Resolves ids as entries below a root directory: `<root>/<id>` may be a
/// file or a directory.
#[derive(Debug, Clone)]
pub struct DirectoryIdLookup {
    root: PathBuf,
}

impl DirectoryIdLookup {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl IdLookup for DirectoryIdLookup {
    fn lookup(&self, id: &str) -> Result<Vec<PathBuf>> {
        if id.split('/').any(|part| part == "..") {
            return Err(FanoutError::ResourceNotFound(format!("id:{id}")));
        }
        let target = self.root.join(id);
        if target.is_file() {
            Ok(vec![target])
        } else if target.is_dir() {
            walk_files(&target)
        } else {
            Ok(Vec::new())
        }
    }
}

/// An id lookup that knows nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdLookup;

impl IdLookup for NoIdLookup {
    fn lookup(&self, _id: &str) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

fn walk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

pub struct ResourceResolver<L: IdLookup = NoIdLookup> {
    cas: ContentAddressableStore,
    lookup: L,
}

impl ResourceResolver<NoIdLookup> {
    pub fn new(cas: ContentAddressableStore) -> Self {
        Self {
            cas,
            lookup: NoIdLookup,
        }
    }
}

impl<L: IdLookup> ResourceResolver<L> {
    pub fn with_lookup(cas: ContentAddressableStore, lookup: L) -> Self {
        Self { cas, lookup }
    }

    /// Expands `refs` into files, fingerprints each one and stores it in the
    /// content store. The order of the result is not meaningful.
    ///
    /// Every file gets its own staging path. The same content reached twice
    /// under one path is kept once; different contents claiming one path are
    /// a config error.
    pub fn resolve(&self, refs: &[ResourceRef]) -> Result<Vec<ResolvedResource>> {
        let mut resolved: Vec<ResolvedResource> = Vec::new();
        let mut by_relative: HashMap<PathBuf, usize> = HashMap::new();
        for resource in refs {
            let files = self.expand(resource)?;
            if files.is_empty() {
                return Err(FanoutError::ResourceNotFound(describe(resource)));
            }
            for (path, relative) in files {
                let address = self.cas.ingest(&path)?;
                debug!(path = %path.display(), %address, "resolved resource");
                match by_relative.entry(relative.clone()) {
                    Entry::Occupied(slot) => {
                        let earlier = &resolved[*slot.get()];
                        if earlier.address != address {
                            return Err(FanoutError::Config(format!(
                                "{} and {} would both be staged as {}",
                                earlier.path.display(),
                                path.display(),
                                relative.display()
                            )));
                        }
                        debug!(path = %path.display(), "same content already staged, skipping");
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(resolved.len());
                        resolved.push(ResolvedResource {
                            path,
                            relative,
                            address,
                        });
                    }
                }
            }
        }
        Ok(resolved)
    }

    fn expand(&self, resource: &ResourceRef) -> Result<Vec<(PathBuf, PathBuf)>> {
        match resource {
            ResourceRef::File(path) => {
                if !path.is_file() {
                    return Err(FanoutError::ResourceNotFound(describe(resource)));
                }
                Ok(vec![(path.clone(), file_name(path))])
            }
            ResourceRef::Directory(dir) => {
                if !dir.is_dir() {
                    return Err(FanoutError::ResourceNotFound(describe(resource)));
                }
                let base = file_name(dir);
                Ok(walk_files(dir)?
                    .into_iter()
                    .map(|path| {
                        let relative = path
                            .strip_prefix(dir)
                            .map(|rel| base.join(rel))
                            .unwrap_or_else(|_| file_name(&path));
                        (path, relative)
                    })
                    .collect())
            }
            ResourceRef::Id(id) => Ok(self
                .lookup
                .lookup(id)?
                .into_iter()
                .map(|path| {
                    let relative = file_name(&path);
                    (path, relative)
                })
                .collect()),
        }
    }
}

fn file_name(path: &Path) -> PathBuf {
    path.file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("resource"))
}

fn describe(resource: &ResourceRef) -> String {
    match resource {
        ResourceRef::File(path) | ResourceRef::Directory(path) => path.display().to_string(),
        ResourceRef::Id(id) => format!("id:{id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::HashAlgorithm;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ContentAddressableStore) {
        let tmp = TempDir::new().unwrap();
        let cas = ContentAddressableStore::new(tmp.path().join("cas"), HashAlgorithm::Sha256);
        (tmp, cas)
    }

    #[test]
    fn directories_expand_recursively() {
        let (tmp, cas) = setup();
        let data = tmp.path().join("data");
        fs::create_dir_all(data.join("deep/er")).unwrap();
        fs::write(data.join("a.txt"), "a").unwrap();
        fs::write(data.join("deep/b.txt"), "b").unwrap();
        fs::write(data.join("deep/er/c.txt"), "c").unwrap();

        let resolver = ResourceResolver::new(cas);
        let mut resolved = resolver.resolve(&[ResourceRef::Directory(data)]).unwrap();
        resolved.sort_by(|a, b| a.relative.cmp(&b.relative));

        let relatives: Vec<_> = resolved.iter().map(|r| r.relative.clone()).collect();
        assert_eq!(
            relatives,
            vec![
                PathBuf::from("data/a.txt"),
                PathBuf::from("data/deep/b.txt"),
                PathBuf::from("data/deep/er/c.txt"),
            ]
        );
        assert!(resolved.iter().all(|r| r.address.starts_with("sha256:")));
    }

    #[test]
    fn missing_file_is_not_found() {
        let (tmp, cas) = setup();
        let resolver = ResourceResolver::new(cas);
        let err = resolver
            .resolve(&[ResourceRef::File(tmp.path().join("nope.txt"))])
            .unwrap_err();
        assert!(matches!(err, FanoutError::ResourceNotFound(_)));
    }

    #[test]
    fn empty_directory_is_not_found() {
        let (tmp, cas) = setup();
        let empty = tmp.path().join("empty");
        fs::create_dir(&empty).unwrap();
        let resolver = ResourceResolver::new(cas);
        let err = resolver.resolve(&[ResourceRef::Directory(empty)]).unwrap_err();
        assert!(matches!(err, FanoutError::ResourceNotFound(_)));
    }

    #[test]
    fn ids_go_through_the_lookup() {
        let (tmp, cas) = setup();
        let ids = tmp.path().join("ids");
        fs::create_dir_all(ids.join("dataset-7")).unwrap();
        fs::write(ids.join("dataset-7/x.csv"), "1,2").unwrap();
        fs::write(ids.join("dataset-7/y.csv"), "3,4").unwrap();

        let resolver = ResourceResolver::with_lookup(cas, DirectoryIdLookup::new(&ids));
        let resolved = resolver
            .resolve(&[ResourceRef::Id("dataset-7".into())])
            .unwrap();
        assert_eq!(resolved.len(), 2);

        let err = resolver
            .resolve(&[ResourceRef::Id("unknown".into())])
            .unwrap_err();
        assert_eq!(err.to_string(), "Resource not found: id:unknown");
    }

    #[test]
    fn same_name_from_two_directories_is_rejected() {
        let (tmp, cas) = setup();
        fs::create_dir_all(tmp.path().join("a")).unwrap();
        fs::create_dir_all(tmp.path().join("b")).unwrap();
        let a = tmp.path().join("a/x.dat");
        let b = tmp.path().join("b/x.dat");
        fs::write(&a, "AAA").unwrap();
        fs::write(&b, "BBB").unwrap();

        let resolver = ResourceResolver::new(cas);
        let err = resolver
            .resolve(&[ResourceRef::File(a), ResourceRef::File(b)])
            .unwrap_err();
        assert!(matches!(err, FanoutError::Config(_)));
        assert!(err.to_string().contains("would both be staged as x.dat"));
    }

    #[test]
    fn same_content_under_one_name_is_staged_once() {
        let (tmp, cas) = setup();
        fs::create_dir_all(tmp.path().join("a")).unwrap();
        fs::create_dir_all(tmp.path().join("b")).unwrap();
        let a = tmp.path().join("a/x.dat");
        let b = tmp.path().join("b/x.dat");
        fs::write(&a, "same").unwrap();
        fs::write(&b, "same").unwrap();

        let resolver = ResourceResolver::new(cas);
        let resolved = resolver
            .resolve(&[
                ResourceRef::File(a.clone()),
                ResourceRef::File(b),
                ResourceRef::File(a.clone()),
            ])
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].path, a);
    }

    #[test]
    fn parse_resource_refs() {
        let (tmp, _cas) = setup();
        assert_eq!(
            "id:abc".parse::<ResourceRef>().unwrap(),
            ResourceRef::Id("abc".into())
        );
        let dir = tmp.path().to_string_lossy().to_string();
        assert!(matches!(
            dir.parse::<ResourceRef>().unwrap(),
            ResourceRef::Directory(_)
        ));
        assert!(matches!(
            "some/file.txt".parse::<ResourceRef>().unwrap(),
            ResourceRef::File(_)
        ));
        assert!("id:".parse::<ResourceRef>().is_err());
    }
}
