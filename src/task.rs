//! Task specifications and their dedup fingerprint.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cas::{ContentAddressableStore, parse_address};
use crate::error::{FanoutError, Result};
use crate::resolver::{ResolvedResource, ResourceRef};

/// File name of the generated job script inside every sub-task directory.
pub const SCRIPT_NAME: &str = "run.sh";

/// What the caller asks for, before resources are resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub work_dir: PathBuf,
    pub sub_task_count: usize,
    pub command: String,
    pub resources: Vec<ResourceRef>,
    /// Glob, relative to a sub-task directory, selecting the files to merge.
    pub output_pattern: String,
}

/// A fully resolved task with its fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub hash: String,
    pub work_dir: PathBuf,
    pub sub_task_count: usize,
    pub command: String,
    pub resources: Vec<ResolvedResource>,
    pub output_pattern: String,
}

/// Fingerprint of a task: the sorted, de-duplicated resource addresses
/// followed by the digest of the command, digested once more.
///
/// Sorting makes the result independent of resolution order.
pub fn task_hash(
    cas: &ContentAddressableStore,
    resources: &[ResolvedResource],
    command: &str,
) -> String {
    let mut addresses: Vec<&str> = resources.iter().map(|r| r.address.as_str()).collect();
    addresses.sort_unstable();
    addresses.dedup();

    let mut material = String::new();
    for address in addresses {
        material.push_str(address);
        material.push('\n');
    }
    material.push_str(&cas.hash_bytes(command.as_bytes()));
    cas.hash_bytes(material.as_bytes())
}

impl TaskSpec {
    pub fn new(
        request: TaskRequest,
        resources: Vec<ResolvedResource>,
        cas: &ContentAddressableStore,
    ) -> Result<Self> {
        if request.sub_task_count == 0 {
            return Err(FanoutError::Config(
                "sub_task_count must be at least 1".into(),
            ));
        }
        if request.command.trim().is_empty() {
            return Err(FanoutError::Config("command must not be empty".into()));
        }
        if request.output_pattern.trim().is_empty() {
            return Err(FanoutError::Config(
                "output_pattern must not be empty".into(),
            ));
        }
        let hash = task_hash(cas, &resources, &request.command);
        Ok(Self {
            hash,
            work_dir: request.work_dir,
            sub_task_count: request.sub_task_count,
            command: request.command,
            resources,
            output_pattern: request.output_pattern,
        })
    }

    /// First 16 hex characters of the hash.
    pub fn short_hash(&self) -> &str {
        let digest = parse_address(&self.hash)
            .map(|(_, digest)| digest)
            .unwrap_or(&self.hash);
        &digest[..digest.len().min(16)]
    }

    /// Directory owning everything this run writes.
    pub fn run_dir(&self) -> PathBuf {
        self.work_dir.join(self.short_hash())
    }

    pub fn sub_task_dir(&self, index: usize) -> PathBuf {
        self.run_dir().join(format!("sub-{index:04}"))
    }

    /// Deterministic location of the merged artifact.
    pub fn merged_path(&self) -> PathBuf {
        let name: String = self
            .output_pattern
            .chars()
            .map(|c| match c {
                '*' | '?' => '_',
                '/' | '\\' | '[' | ']' | '{' | '}' => '-',
                c => c,
            })
            .collect();
        self.run_dir().join("merged").join(name)
    }

    /// Shell script submitted for sub-task `index`.
    pub fn script(&self, index: usize) -> String {
        format!(
            "#!/bin/sh\n\
             export FANOUT_INDEX={index}\n\
             export FANOUT_COUNT={count}\n\
             cd \"$(dirname \"$0\")\" || exit 1\n\
             {command}\n",
            count = self.sub_task_count,
            command = self.command,
        )
    }

    pub fn script_path(sub_dir: &Path) -> PathBuf {
        sub_dir.join(SCRIPT_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::HashAlgorithm;
    use crate::resolver::ResourceResolver;
    use std::fs;
    use tempfile::TempDir;

    fn request(work_dir: &Path, resources: Vec<ResourceRef>) -> TaskRequest {
        TaskRequest {
            work_dir: work_dir.to_path_buf(),
            sub_task_count: 4,
            command: "./simulate --seed $FANOUT_INDEX > out.txt".into(),
            resources,
            output_pattern: "out.txt".into(),
        }
    }

    #[test]
    fn permuted_refs_yield_the_same_hash() {
        let tmp = TempDir::new().unwrap();
        let cas = ContentAddressableStore::new(tmp.path().join("cas"), HashAlgorithm::Sha256);
        let names = ["a.in", "b.in", "c.in", "d.in", "e.in"];
        for name in names {
            fs::write(tmp.path().join(name), format!("content of {name}")).unwrap();
        }
        let refs: Vec<ResourceRef> = names
            .iter()
            .map(|n| ResourceRef::File(tmp.path().join(n)))
            .collect();
        let mut reversed = refs.clone();
        reversed.reverse();

        let resolver = ResourceResolver::new(cas.clone());
        let first = TaskSpec::new(
            request(tmp.path(), refs.clone()),
            resolver.resolve(&refs).unwrap(),
            &cas,
        )
        .unwrap();
        let second = TaskSpec::new(
            request(tmp.path(), reversed.clone()),
            resolver.resolve(&reversed).unwrap(),
            &cas,
        )
        .unwrap();
        assert_eq!(first.hash, second.hash);
        assert!(first.hash.starts_with("sha256:"));
    }

    #[test]
    fn command_changes_the_hash() {
        let tmp = TempDir::new().unwrap();
        let cas = ContentAddressableStore::new(tmp.path(), HashAlgorithm::Sha256);
        let resources = vec![ResolvedResource {
            path: tmp.path().join("x"),
            relative: "x".into(),
            address: cas.hash_bytes(b"x"),
        }];
        assert_ne!(
            task_hash(&cas, &resources, "run --fast"),
            task_hash(&cas, &resources, "run --slow")
        );
    }

    #[test]
    fn duplicate_resources_do_not_change_the_hash() {
        let tmp = TempDir::new().unwrap();
        let cas = ContentAddressableStore::new(tmp.path(), HashAlgorithm::Sha256);
        let one = ResolvedResource {
            path: tmp.path().join("x"),
            relative: "x".into(),
            address: cas.hash_bytes(b"x"),
        };
        let twice = vec![one.clone(), one.clone()];
        assert_eq!(
            task_hash(&cas, &[one], "cmd"),
            task_hash(&cas, &twice, "cmd")
        );
    }

    #[test]
    fn paths_derive_from_the_hash() {
        let tmp = TempDir::new().unwrap();
        let cas = ContentAddressableStore::new(tmp.path(), HashAlgorithm::Sha256);
        let mut req = request(tmp.path(), Vec::new());
        req.output_pattern = "results/*.csv".into();
        let spec = TaskSpec::new(req, Vec::new(), &cas).unwrap();

        assert_eq!(spec.short_hash().len(), 16);
        assert_eq!(spec.run_dir(), tmp.path().join(spec.short_hash()));
        assert_eq!(spec.sub_task_dir(3), spec.run_dir().join("sub-0003"));
        assert_eq!(spec.merged_path(), spec.run_dir().join("merged/results-_.csv"));
        let script = spec.script(3);
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("export FANOUT_INDEX=3\n"));
        assert!(script.contains("export FANOUT_COUNT=4\n"));
        assert!(script.ends_with("./simulate --seed $FANOUT_INDEX > out.txt\n"));
    }

    #[test]
    fn zero_sub_tasks_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let cas = ContentAddressableStore::new(tmp.path(), HashAlgorithm::Sha256);
        let mut req = request(tmp.path(), Vec::new());
        req.sub_task_count = 0;
        assert!(TaskSpec::new(req, Vec::new(), &cas).is_err());
    }
}
