//! Version-control client: clone/update a checkout via the `git` CLI.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tracing::debug;

use crate::model::{Provider, Repository};

/// A failed git operation, already classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitFailure {
    /// Credentials were rejected or missing.
    Auth(String),
    /// Anything else: network, unknown branch, corrupt checkout.
    Other(String),
}

#[async_trait::async_trait]
pub trait VcsClient: Send + Sync {
    /// Clone `url` at `branch` into `dest` (which must not exist yet).
    async fn clone_repo(&self, url: &str, branch: &str, dest: &Path) -> Result<(), GitFailure>;

    /// Point `origin` at `url`, then bring `checkout` up to date on `branch`.
    async fn update(&self, checkout: &Path, url: &str, branch: &str) -> Result<(), GitFailure>;
}

/// [`VcsClient`] backed by the system `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: PathBuf,
}

impl GitCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    async fn git(&self, cwd: Option<&Path>, args: &[&str], secret: Option<&str>) -> Result<(), GitFailure> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            // Never block on an interactive credential prompt.
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| GitFailure::Other(format!("failed to execute {}: {}", self.binary.display(), e)))?;
        if output.status.success() {
            return Ok(());
        }

        let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            stderr = stderr.replace(secret, "***");
        }
        debug!(subcommand = args.first().copied().unwrap_or_default(), %stderr, "git command failed");
        Err(classify_failure(stderr))
    }
}

#[async_trait::async_trait]
impl VcsClient for GitCli {
    async fn clone_repo(&self, url: &str, branch: &str, dest: &Path) -> Result<(), GitFailure> {
        let dest_str = dest.to_string_lossy();
        let secret = embedded_secret(url);
        self.git(None, &["clone", "--branch", branch, url, &dest_str], secret.as_deref())
            .await
    }

    async fn update(&self, checkout: &Path, url: &str, branch: &str) -> Result<(), GitFailure> {
        let secret = embedded_secret(url);
        let secret = secret.as_deref();
        self.git(Some(checkout), &["remote", "set-url", "origin", url], secret).await?;
        self.git(Some(checkout), &["fetch", "origin", branch], secret).await?;
        self.git(Some(checkout), &["checkout", branch], secret).await?;
        self.git(Some(checkout), &["pull", "--ff-only", "origin", branch], secret).await
    }
}

const AUTH_MARKERS: &[&str] = &[
    "authentication failed",
    "could not read username",
    "could not read password",
    "invalid username or password",
    "http basic: access denied",
    "the requested url returned error: 401",
    "the requested url returned error: 403",
    "permission denied (publickey)",
];

/// Sort git stderr into auth vs. everything else.
pub fn classify_failure(stderr: String) -> GitFailure {
    let lower = stderr.to_ascii_lowercase();
    if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        GitFailure::Auth(stderr)
    } else {
        GitFailure::Other(stderr)
    }
}

fn split_url(url: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme != "https" && scheme != "http" {
        return None;
    }
    // Drop any userinfo already present.
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let host_and_path = match rest[..authority_end].rfind('@') {
        Some(at) => &rest[at + 1..],
        None => rest,
    };
    Some((scheme, host_and_path))
}

/// Remote URL with the repository token embedded the way its provider expects.
///
/// URLs that are not http(s), and repositories without a token, are returned unchanged.
pub fn authenticated_url(repo: &Repository) -> String {
    let token = match repo.auth_token.as_deref().filter(|t| !t.is_empty()) {
        Some(t) => t,
        None => return repo.url.clone(),
    };
    let (scheme, host_and_path) = match split_url(&repo.url) {
        Some(parts) => parts,
        None => return repo.url.clone(),
    };
    let userinfo = match repo.provider {
        Provider::Github | Provider::Generic => token.to_string(),
        Provider::Gitlab => format!("oauth2:{}", token),
        Provider::Bitbucket => match repo.username.as_deref().filter(|u| !u.is_empty()) {
            Some(user) => format!("{}:{}", user, token),
            None => return repo.url.clone(),
        },
    };
    format!("{}://{}@{}", scheme, userinfo, host_and_path)
}

/// The URL with any userinfo replaced by `***`, for logs.
pub fn redact_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => {
            let authority_end = rest.find('/').unwrap_or(rest.len());
            match rest[..authority_end].rfind('@') {
                Some(at) => format!("{}://***@{}", scheme, &rest[at + 1..]),
                None => url.to_string(),
            }
        }
        None => url.to_string(),
    }
}

/// The userinfo segment of a URL, if any, so it can be scrubbed from git output.
fn embedded_secret(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("://")?;
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let at = rest[..authority_end].rfind('@')?;
    let userinfo = &rest[..at];
    Some(userinfo.rsplit(':').next().unwrap_or(userinfo).to_string())
}
