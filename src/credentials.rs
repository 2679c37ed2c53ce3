//! API credentials and the providers that resolve them
//!
//! Credentials are opaque query parameters merged into every request. The
//! pipeline only ever sees resolved `Credentials`; prompting and persistence
//! live in the providers.

use crate::error::{IngestError, Result};
use std::fmt;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Which credential layout a service expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialKind {
    /// Two lines: account email, then key (EPA AQS)
    AccountAndKey,
    /// One line: key (Census)
    KeyOnly,
}

impl CredentialKind {
    fn fields(&self) -> &'static [&'static str] {
        match self {
            CredentialKind::AccountAndKey => &["email", "key"],
            CredentialKind::KeyOnly => &["key"],
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    params: Vec<(String, String)>,
}

impl Credentials {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn aqs(email: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            params: vec![("email".to_string(), email.into()), ("key".to_string(), key.into())],
        }
    }

    pub fn census(key: impl Into<String>) -> Self {
        Self {
            params: vec![("key".to_string(), key.into())],
        }
    }

    fn from_values(kind: CredentialKind, values: &[String]) -> Result<Self> {
        let fields = kind.fields();
        if values.len() < fields.len() || values.iter().take(fields.len()).any(|v| v.is_empty()) {
            return Err(IngestError::Credentials(format!(
                "expected {} non-empty value(s): {}",
                fields.len(),
                fields.join(", ")
            )));
        }
        Ok(Self {
            params: fields
                .iter()
                .zip(values)
                .map(|(f, v)| (f.to_string(), v.clone()))
                .collect(),
        })
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.params.iter().map(|(k, _)| k.as_str()).collect();
        write!(f, "Credentials({} = <redacted>)", names.join(", "))
    }
}

pub trait CredentialProvider: Send + Sync {
    fn resolve(&self) -> Result<Credentials>;
}

/// Reads a secret file: one value per line, in the kind's field order.
pub struct FileCredentials {
    path: PathBuf,
    kind: CredentialKind,
}

impl FileCredentials {
    pub fn new(path: impl AsRef<Path>, kind: CredentialKind) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            kind,
        }
    }
}

fn read_secret_file(path: &Path, kind: CredentialKind) -> Result<Credentials> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        IngestError::Credentials(format!("cannot read {}: {}", path.display(), e))
    })?;
    let values: Vec<String> = content.lines().map(|l| l.trim().to_string()).collect();
    Credentials::from_values(kind, &values)
}

fn write_secret_file(path: &Path, values: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, values.join("\n"))?;
    Ok(())
}

impl CredentialProvider for FileCredentials {
    fn resolve(&self) -> Result<Credentials> {
        debug!("Reading credentials from {}", self.path.display());
        read_secret_file(&self.path, self.kind)
    }
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads credentials from environment variables.
pub struct EnvCredentials {
    kind: CredentialKind,
    vars: Vec<String>,
    lookup: Lookup,
}

impl EnvCredentials {
    /// `AQS_EMAIL` / `AQS_KEY`
    pub fn aqs() -> Self {
        Self::new(CredentialKind::AccountAndKey, &["AQS_EMAIL", "AQS_KEY"])
    }

    /// `CENSUS_API_KEY`
    pub fn census() -> Self {
        Self::new(CredentialKind::KeyOnly, &["CENSUS_API_KEY"])
    }

    pub fn new(kind: CredentialKind, vars: &[&str]) -> Self {
        Self {
            kind,
            vars: vars.iter().map(|v| v.to_string()).collect(),
            lookup: Box::new(|name| std::env::var(name).ok()),
        }
    }

    pub fn with_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.lookup = Box::new(lookup);
        self
    }
}

impl CredentialProvider for EnvCredentials {
    fn resolve(&self) -> Result<Credentials> {
        let mut values = Vec::with_capacity(self.vars.len());
        for var in &self.vars {
            match (self.lookup)(var) {
                Some(v) if !v.trim().is_empty() => values.push(v.trim().to_string()),
                _ => {
                    return Err(IngestError::Credentials(format!(
                        "environment variable {} is not set",
                        var
                    )))
                }
            }
        }
        Credentials::from_values(self.kind, &values)
    }
}

/// Uses the secret file when present; otherwise prompts for each value and
/// saves the answers to the file for next time.
pub struct InteractiveCredentials<R, W> {
    path: PathBuf,
    kind: CredentialKind,
    io: Mutex<(R, W)>,
}

impl<R: BufRead, W: Write> InteractiveCredentials<R, W> {
    pub fn new(path: impl AsRef<Path>, kind: CredentialKind, input: R, output: W) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            kind,
            io: Mutex::new((input, output)),
        }
    }
}

impl<R, W> CredentialProvider for InteractiveCredentials<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    fn resolve(&self) -> Result<Credentials> {
        if self.path.exists() {
            return read_secret_file(&self.path, self.kind);
        }

        let mut guard = self
            .io
            .lock()
            .map_err(|_| IngestError::Credentials("prompt is unavailable".to_string()))?;
        let (input, output) = &mut *guard;

        let mut values = Vec::new();
        for field in self.kind.fields() {
            write!(output, "Enter {}: ", field)?;
            output.flush()?;
            let mut line = String::new();
            input.read_line(&mut line)?;
            values.push(line.trim().to_string());
        }

        let credentials = Credentials::from_values(self.kind, &values)?;
        write_secret_file(&self.path, &values)?;
        info!("Saved credentials to {}", self.path.display());
        Ok(credentials)
    }
}
