use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use clap::Parser;

use crate::auth::AuthTable;

const FALLBACK_EXEC_PATH: &str = "/usr/libexec/git-core";

#[derive(Parser, Debug)]
#[command(name = "gitgate", version, about = "Serve Git repositories over smart HTTP through git-http-backend")]
pub struct Args {
    /// Directory exposed as `/`; repositories live below it.
    #[arg(env = "GITSRV_DOCROOT", default_value = ".")]
    pub docroot: PathBuf,

    #[arg(long, env = "GITSRV_HOST", default_value = "localhost")]
    pub host: String,

    #[arg(long, env = "GITSRV_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Append log output to this file instead of stderr.
    #[arg(long, env = "GITSRV_LOGFILE")]
    pub log_file: Option<PathBuf>,

    /// Log every request and the CGI environment handed to the backend.
    #[arg(long, env = "GITSRV_DEBUG")]
    pub debug: bool,

    /// Create (and `git init --bare`) missing repositories on first ref advertisement.
    #[arg(long, env = "GITSRV_CREATE_MISSING")]
    pub create_missing: bool,

    /// Allow repositories directly below the document root.
    #[arg(long, env = "GITSRV_FIRST_CHILD_OK")]
    pub first_child_ok: bool,

    /// Require repository names to end in `.git`.
    #[arg(long, env = "GITSRV_ENFORCE_DOTGIT")]
    pub enforce_dot_git: bool,

    /// Read non-existent path components before the repository as $GIT_NAMESPACE.
    #[arg(long, env = "GITSRV_USE_NAMESPACES")]
    pub use_namespaces: bool,

    /// Default for the per-rule `realaccount` auth setting.
    #[arg(long, env = "GITSRV_REQUIRE_ACCOUNT")]
    pub require_account: bool,

    /// JSON auth table, as a file path or inline object.
    #[arg(long, env = "GITSRV_AUTHFILE")]
    pub auth: Option<String>,

    /// Git executable.
    #[arg(long, env = "GITSRV_GIT", default_value = "git")]
    pub git: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Policy {
    pub create_missing: bool,
    pub first_child_ok: bool,
    pub enforce_dot_git: bool,
}

/// Everything the request path needs, fixed at startup.
#[derive(Debug)]
pub struct Config {
    pub doc_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub policy: Policy,
    pub use_namespaces: bool,
    pub auth: AuthTable,
    pub git: PathBuf,
    /// Directory holding `git-http-backend` and friends.
    pub exec_path: PathBuf,
    /// `REMOTE_USER` for pushes nobody authenticated.
    pub os_user: String,
    pub server_software: String,
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Config> {
        let doc_root = args
            .docroot
            .canonicalize()
            .with_context(|| format!("document root {}", args.docroot.display()))?;
        if !doc_root.is_dir() {
            anyhow::bail!("document root {} is not a directory", doc_root.display());
        }

        let auth = match args.auth {
            Some(ref source) => AuthTable::load(source, args.require_account)?,
            None => AuthTable::default(),
        };

        Ok(Config {
            doc_root,
            host: args.host.clone(),
            port: args.port,
            policy: Policy {
                create_missing: args.create_missing,
                first_child_ok: args.first_child_ok,
                enforce_dot_git: args.enforce_dot_git,
            },
            use_namespaces: args.use_namespaces,
            auth,
            exec_path: exec_path(&args.git),
            git: args.git.clone(),
            os_user: os_user(),
            server_software: server_software(),
        })
    }

    /// A configuration rooted at `doc_root` with everything else defaulted.
    pub fn with_doc_root<P: Into<PathBuf>>(doc_root: P) -> Config {
        Config {
            doc_root: doc_root.into(),
            host: "localhost".to_owned(),
            port: 8000,
            policy: Policy::default(),
            use_namespaces: false,
            auth: AuthTable::default(),
            git: PathBuf::from("git"),
            exec_path: PathBuf::from(FALLBACK_EXEC_PATH),
            os_user: "unknown".to_owned(),
            server_software: server_software(),
        }
    }
}

/// Asks `git --exec-path`, falling back to the usual libexec directory.
pub fn exec_path(git: &Path) -> PathBuf {
    match Command::new(git).arg("--exec-path").output() {
        Ok(ref out) if out.status.success() => {
            PathBuf::from(String::from_utf8_lossy(&out.stdout).trim())
        }
        Ok(out) => {
            warn!(
                "git --exec-path failed ({}), using {}",
                out.status, FALLBACK_EXEC_PATH
            );
            PathBuf::from(FALLBACK_EXEC_PATH)
        }
        Err(err) => {
            warn!("could not run {}: {}; using {}", git.display(), err, FALLBACK_EXEC_PATH);
            PathBuf::from(FALLBACK_EXEC_PATH)
        }
    }
}

fn os_user() -> String {
    env::var("USER")
        .or_else(|_| env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_owned())
}

fn server_software() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
