use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::Algorithm;
use russh::keys::HashAlg;
use russh::keys::PrivateKey;
use tracing::debug;
use tracing::instrument;
use zeroize::Zeroizing;

use crate::error::RunError;
use crate::error::Stage;
use crate::error::StageContext;

/// Private key passphrase. Redacted when printed and zeroed when dropped.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl<S> From<S> for Passphrase
where
    S: AsRef<str>,
{
    fn from(value: S) -> Self {
        Passphrase(Zeroizing::new(value.as_ref().into()))
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// Private key used for publickey authentication.
#[derive(Clone)]
pub struct Credential {
    key: Arc<PrivateKey>,
    path: PathBuf,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("path", &self.path)
            .field("algorithm", &self.algorithm().as_str())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl Credential {
    /// Loads an OpenSSH or PEM private key. No network I/O happens here.
    ///
    /// # Errors
    ///
    /// [`RunError::Authentication`] if the file is missing, malformed,
    /// encrypted without a matching passphrase, or of an unsupported type.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path, passphrase: Option<&Passphrase>) -> Result<Self, RunError> {
        Self::load_inner(path, passphrase).stage(Stage::Authentication)
    }

    fn load_inner(path: &Path, passphrase: Option<&Passphrase>) -> Result<Self> {
        if !path.is_file() {
            bail!("key file not found at {}", path.display());
        }

        let key = russh::keys::load_secret_key(path, passphrase.map(Passphrase::expose))
            .with_context(|| format!("unable to load private key from {}", path.display()))?;

        let credential = Self {
            key: Arc::new(key),
            path: path.to_owned(),
        };
        debug!(
            algorithm = credential.algorithm().as_str(),
            fingerprint = %credential.fingerprint(),
            "loaded private key"
        );

        Ok(credential)
    }

    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.key.algorithm()
    }

    #[must_use]
    pub fn is_rsa(&self) -> bool {
        matches!(self.algorithm(), Algorithm::Rsa { .. })
    }

    /// SHA-256 fingerprint of the public half.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        self.key.public_key().fingerprint(HashAlg::Sha256).to_string()
    }

    /// Pairs the key with the signature hash to use. Only meaningful for RSA.
    pub(crate) fn with_hash_alg(&self, hash_alg: Option<HashAlg>) -> PrivateKeyWithHashAlg {
        let hash_alg = if self.is_rsa() { hash_alg } else { None };
        PrivateKeyWithHashAlg::new(self.key.clone(), hash_alg)
    }
}
