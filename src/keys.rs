//! Maps replica id -> public key, and holds the local replica's private
//! key. Loaded once at startup; public keys are cached after first read.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::common::replica_id;
use crate::error::PbftError;

const KEY_BITS: usize = 1024;

fn private_key_path(base_dir: &Path, id: &str) -> PathBuf {
    base_dir.join("Keys").join(id).join(format!("{id}_RSA_PIV"))
}

fn public_key_path(base_dir: &Path, id: &str) -> PathBuf {
    base_dir.join("Keys").join(id).join(format!("{id}_RSA_PUB"))
}

/// Generates `n + 1` key pairs (indices `0..=n`) under `{base_dir}/Keys` if
/// that directory does not already exist. The extra pair (index `n`) is
/// unused by any replica in a run of `n` replicas; this mirrors the
/// original artifact's directory layout, see DESIGN.md.
pub fn bootstrap(base_dir: &Path, n: usize) -> Result<(), PbftError> {
    let keys_dir = base_dir.join("Keys");
    if keys_dir.exists() {
        return Ok(());
    }
    fs::create_dir_all(&keys_dir)?;
    for index in 0..=n {
        let id = replica_id(index);
        fs::create_dir_all(keys_dir.join(&id))?;

        let private_key =
            RsaPrivateKey::new(&mut OsRng, KEY_BITS).map_err(PbftError::crypto)?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(PbftError::crypto)?;
        fs::write(private_key_path(base_dir, &id), private_pem.as_bytes())?;

        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(PbftError::crypto)?;
        fs::write(public_key_path(base_dir, &id), public_pem)?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct KeyDirectory {
    base_dir: PathBuf,
    private_key: RsaPrivateKey,
    public_keys: Mutex<HashMap<String, RsaPublicKey>>,
}

impl KeyDirectory {
    /// Loads `local_id`'s private key. Missing or malformed key material is
    /// fatal: it is a configuration error, not a protocol-local one.
    pub fn load(base_dir: &Path, local_id: &str) -> Result<Self, PbftError> {
        let pem = fs::read_to_string(private_key_path(base_dir, local_id))?;
        let private_key = RsaPrivateKey::from_pkcs1_pem(&pem).map_err(PbftError::crypto)?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            private_key,
            public_keys: Mutex::new(HashMap::new()),
        })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// Reads and caches the public key for `id`. Panics if the key file is
    /// missing or malformed: by the time a replica is handling traffic, the
    /// key directory is assumed fully populated.
    pub fn public_key(&self, id: &str) -> RsaPublicKey {
        let mut cache = self.public_keys.lock().unwrap();
        if let Some(key) = cache.get(id) {
            return key.clone();
        }
        let pem = fs::read_to_string(public_key_path(&self.base_dir, id))
            .unwrap_or_else(|err| panic!("cannot read public key for {id}: {err}"));
        let key = RsaPublicKey::from_public_key_pem(&pem)
            .unwrap_or_else(|err| panic!("malformed public key for {id}: {err}"));
        cache.insert(id.to_string(), key.clone());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_then_load_round_trips_signatures() {
        let dir = tempdir();
        bootstrap(dir.path(), 3).unwrap();
        let n0 = KeyDirectory::load(dir.path(), "N0").unwrap();
        let n1_pub = n0.public_key("N1");

        let n1 = KeyDirectory::load(dir.path(), "N1").unwrap();
        let digest = [3u8; 32];
        let signature = crate::crypto::sign(&digest, n1.private_key());
        assert!(crate::crypto::verify(&digest, &signature, &n1_pub));
    }

    #[test]
    fn bootstrap_generates_n_plus_one_pairs() {
        let dir = tempdir();
        bootstrap(dir.path(), 2).unwrap();
        for id in ["N0", "N1", "N2"] {
            assert!(private_key_path(dir.path(), id).exists());
            assert!(public_key_path(dir.path(), id).exists());
        }
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let dir = tempdir();
        bootstrap(dir.path(), 2).unwrap();
        let first = fs::read(private_key_path(dir.path(), "N0")).unwrap();
        bootstrap(dir.path(), 2).unwrap();
        let second = fs::read(private_key_path(dir.path(), "N0")).unwrap();
        assert_eq!(first, second);
    }

    fn tempdir() -> TempDir {
        TempDir::new()
    }

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let path = std::env::temp_dir().join(format!(
                "pbft-core-test-{}-{}",
                std::process::id(),
                rand_suffix()
            ));
            fs::create_dir_all(&path).unwrap();
            Self(path)
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn rand_suffix() -> u64 {
        use rand::Rng;
        rand::thread_rng().gen()
    }
}
