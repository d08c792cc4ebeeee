//! Content-addressable blob store.
//!
//! Blobs are keyed by `"<algorithm>:<hex-digest>"` and laid out as
//! `<root>/<algorithm>/<first two hex chars>/<hex>`. A given address is
//! written at most once.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tracing::debug;
use uuid::Uuid;

use crate::error::{FanoutError, Result};

/// Files are streamed through the digest in blocks of this size.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Digest used for content addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }

    fn hasher(self) -> Hasher {
        match self {
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(FanoutError::Config(format!(
                "unsupported hash algorithm: {other}"
            ))),
        }
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(bytes),
            Hasher::Sha512(h) => h.update(bytes),
        }
    }

    fn finish(self) -> String {
        match self {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Splits `"<algorithm>:<hex>"` into its parts, validating both.
pub fn parse_address(address: &str) -> Result<(HashAlgorithm, &str)> {
    let malformed = || FanoutError::StorageLayout {
        path: PathBuf::from(address),
        message: "malformed content address".into(),
    };
    let (algo, digest) = address.split_once(':').ok_or_else(malformed)?;
    let algo: HashAlgorithm = algo.parse().map_err(|_| malformed())?;
    if digest.len() != algo.hex_len() || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(malformed());
    }
    Ok((algo, digest))
}

/// Blob store rooted at a directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ContentAddressableStore {
    root: PathBuf,
    algorithm: HashAlgorithm,
}

impl ContentAddressableStore {
    pub fn new(root: impl Into<PathBuf>, algorithm: HashAlgorithm) -> Self {
        Self {
            root: root.into(),
            algorithm,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Streams `file` through the digest and returns its address.
    pub fn hash(&self, file: &Path) -> Result<String> {
        let mut reader = File::open(file)?;
        let mut hasher = self.algorithm.hasher();
        let mut buf = vec![0u8; BLOCK_SIZE];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            hasher.update(&buf[..n]);
        }
        Ok(format!("{}:{}", self.algorithm, hasher.finish()))
    }

    /// Address of an in-memory byte string.
    pub fn hash_bytes(&self, bytes: &[u8]) -> String {
        let mut hasher = self.algorithm.hasher();
        hasher.update(bytes);
        format!("{}:{}", self.algorithm, hasher.finish())
    }

    /// Where the blob for `address` lives (or would live).
    pub fn path_for(&self, address: &str) -> Result<PathBuf> {
        let (algo, digest) = parse_address(address)?;
        Ok(self
            .root
            .join(algo.name())
            .join(&digest[..2])
            .join(digest))
    }

    pub fn contains(&self, address: &str) -> Result<bool> {
        Ok(self.path_for(address)?.is_file())
    }

    /// Stores `file` under `address`. Returns the existing address untouched
    /// when the blob is already present.
    pub fn put(&self, file: &Path, address: &str) -> Result<String> {
        let target = self.path_for(address)?;
        if target.is_file() {
            debug!(address, "blob already present");
            return Ok(address.to_string());
        }

        let parent = target.parent().ok_or_else(|| FanoutError::StorageLayout {
            path: target.clone(),
            message: "blob path has no parent directory".into(),
        })?;
        std::fs::create_dir_all(parent).map_err(|e| FanoutError::StorageLayout {
            path: parent.to_path_buf(),
            message: e.to_string(),
        })?;

        let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        std::fs::copy(file, &tmp)?;
        if let Err(e) = std::fs::rename(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(address, path = %target.display(), "stored blob");
        Ok(address.to_string())
    }

    /// Hashes `file` and stores it in one step.
    pub fn ingest(&self, file: &Path) -> Result<String> {
        let address = self.hash(file)?;
        self.put(file, &address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    fn store(tmp: &TempDir) -> ContentAddressableStore {
        ContentAddressableStore::new(tmp.path().join("cas"), HashAlgorithm::Sha256)
    }

    #[test]
    fn hash_is_deterministic_and_formatted() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("input.txt");
        fs::write(&file, "hello").unwrap();

        let cas = store(&tmp);
        let first = cas.hash(&file).unwrap();
        let second = cas.hash(&file).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first,
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(first, cas.hash_bytes(b"hello"));
    }

    #[test]
    fn hash_streams_files_larger_than_one_block() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("big.bin");
        let data: Vec<u8> = (0..BLOCK_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        fs::write(&file, &data).unwrap();

        let cas = store(&tmp);
        assert_eq!(cas.hash(&file).unwrap(), cas.hash_bytes(&data));
    }

    #[test]
    fn sha512_addresses_use_their_prefix() {
        let tmp = TempDir::new().unwrap();
        let cas = ContentAddressableStore::new(tmp.path(), HashAlgorithm::Sha512);
        let address = cas.hash_bytes(b"abc");
        assert!(address.starts_with("sha512:"));
        assert_eq!(address.len(), "sha512:".len() + 128);
        assert!(parse_address(&address).is_ok());
    }

    #[test]
    fn put_identical_content_keeps_one_copy() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.dat");
        let b = tmp.path().join("nested-b.dat");
        fs::write(&a, "same bytes").unwrap();
        fs::write(&b, "same bytes").unwrap();

        let cas = store(&tmp);
        let addr_a = cas.ingest(&a).unwrap();
        let addr_b = cas.ingest(&b).unwrap();
        assert_eq!(addr_a, addr_b);
        assert!(cas.contains(&addr_a).unwrap());

        let blobs = WalkDir::new(cas.root())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count();
        assert_eq!(blobs, 1);
        assert_eq!(
            fs::read_to_string(cas.path_for(&addr_a).unwrap()).unwrap(),
            "same bytes"
        );
    }

    #[test]
    fn put_fails_when_layout_cannot_be_created() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        fs::write(&blocker, "file in the way").unwrap();
        let src = tmp.path().join("src.txt");
        fs::write(&src, "payload").unwrap();

        let cas = ContentAddressableStore::new(&blocker, HashAlgorithm::Sha256);
        let address = cas.hash(&src).unwrap();
        let err = cas.put(&src, &address).unwrap_err();
        assert!(matches!(err, FanoutError::StorageLayout { .. }));
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        assert!(parse_address("nocolon").is_err());
        assert!(parse_address("md5:abcd").is_err());
        assert!(parse_address("sha256:xyz").is_err());
    }
}
