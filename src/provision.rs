use std::fs;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::config::Policy;
use crate::error::{Error, Result};
use crate::resolve::{is_repo, ResolvedLocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Existing,
    Created,
}

/// Applies the creation policy to a located repository, initializing it
/// when the request is allowed to and it does not exist yet.
///
/// `advertisement` is true for `info/refs?service=...` requests, the only
/// ones that may trigger creation. Calling this on an initialized
/// repository changes nothing.
pub fn ensure(
    git: &Path,
    doc_root: &Path,
    location: &ResolvedLocation,
    policy: &Policy,
    advertisement: bool,
) -> Result<Provisioned> {
    let repo_dir = location.repo_dir(doc_root);
    let exists = is_repo(&repo_dir);

    if !exists && !policy.create_missing {
        let what = if location.missing > 0 && location.missing == location.root.len() {
            "missing path, creation disabled"
        } else {
            "repository does not exist, creation disabled"
        };
        return Err(Error::Forbidden(what.to_owned()));
    }

    if location.is_first_child() {
        if !policy.first_child_ok {
            warn!(
                "refusing {:?} directly below the document root; start with --first-child-ok to serve it",
                location.repo
            );
            return Err(Error::Forbidden(
                "Repositories directly below the document root are disabled; \
                 the operator must enable first-child repositories"
                    .to_owned(),
            ));
        }
        if exists {
            debug!("serving first-child repository {:?} with root /", location.repo);
        }
    }

    if policy.enforce_dot_git && !location.repo.ends_with(".git") {
        return Err(Error::Forbidden("invalid repository name".to_owned()));
    }

    if exists {
        return Ok(Provisioned::Existing);
    }
    if !advertisement {
        return Err(Error::NotFound(repo_dir.display().to_string()));
    }

    create(git, &repo_dir)?;
    info!("created bare repository {}{}", location.root_uri(), location.repo);
    Ok(Provisioned::Created)
}

/// Creates `repo_dir` and its parents, then runs `git init --bare` in it.
///
/// An existing directory is fine as long as it is empty.
pub fn create(git: &Path, repo_dir: &Path) -> Result<()> {
    match fs::create_dir_all(repo_dir) {
        Ok(()) => {}
        Err(ref err) if err.kind() == io::ErrorKind::AlreadyExists => {}
        Err(err) => return Err(err.into()),
    }

    if fs::read_dir(repo_dir)?.next().is_some() {
        return Err(Error::BadRequest(format!(
            "{} exists and is not empty",
            repo_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
        )));
    }

    let output = Command::new(git)
        .arg("-C")
        .arg(repo_dir)
        .args(&["init", "--bare"])
        .stdin(Stdio::null())
        .output()
        .map_err(|err| Error::Internal(format!("exec {}: {}", git.display(), err)))?;

    if !output.status.success() {
        return Err(Error::Internal(format!(
            "git init --bare failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    debug!("git init: {}", String::from_utf8_lossy(&output.stdout).trim());
    Ok(())
}
