//! Mapping request paths onto repositories below the document root.
//!
//! A request path is split into three runs of segments: *containers*
//! (directories leading up to the repository), the *repository name*, and
//! the *tail* handed to the protocol handler (`info/refs`,
//! `git-upload-pack`, ...). With namespaces enabled, container positions
//! that do not exist on disk are read as `$GIT_NAMESPACE` components.

use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;

use crate::error::{Error, Result};

static OBJECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/.+/objects/(pack/pack-[0-9a-f]{40}\.(pack|idx)|[0-9a-f]{2}/[0-9a-f]{38})$")
        .expect("object path pattern")
});

/// Normalized request path: no `.`/`..`, no empty segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPath {
    segments: Vec<String>,
    query: Option<String>,
    fragment: Option<String>,
}

impl RequestPath {
    /// Parses a request target such as `/git/repo.git/info/refs?service=x`.
    ///
    /// Segments are percent-decoded before `..` is collapsed, so an encoded
    /// `%2e%2e` cannot climb out of the document root either. A `..` at the
    /// top is dropped.
    pub fn parse(target: &str) -> Result<RequestPath> {
        let (rest, fragment) = target.split_once('#').map_or((target, None), |(r, f)| (r, Some(f)));
        let (path, query) = rest.split_once('?').map_or((rest, None), |(p, q)| (p, Some(q)));

        let mut segments: Vec<String> = Vec::new();
        for raw in path.split('/') {
            let segment = percent_decode_str(raw)
                .decode_utf8()
                .map_err(|_| Error::BadRequest("Invalid path encoding".to_owned()))?;
            if segment.contains('/') || segment.contains('\0') {
                return Err(Error::BadRequest("Invalid path component".to_owned()));
            }
            match &*segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                _ => segments.push(segment.into_owned()),
            }
        }

        Ok(RequestPath {
            segments,
            query: query.map(str::to_owned),
            fragment: fragment.map(str::to_owned),
        })
    }

    pub fn from_parts(path: &str, query: Option<&str>) -> Result<RequestPath> {
        let mut parsed = RequestPath::parse(path)?;
        parsed.query = query.map(str::to_owned);
        Ok(parsed)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_ref().map(String::as_str)
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_ref().map(String::as_str)
    }

    /// The path with a single leading slash, without query or fragment.
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    /// Filesystem location of the path below `doc_root`.
    pub fn translate(&self, doc_root: &Path) -> PathBuf {
        self.segments.iter().fold(doc_root.to_path_buf(), |dir, seg| dir.join(seg))
    }

    /// Whether this names a loose object or packfile, which are served as
    /// plain files rather than through the protocol handler.
    pub fn is_object(&self) -> bool {
        OBJECT_RE.is_match(&self.path())
    }

    fn without(&self, drop: &[usize]) -> RequestPath {
        RequestPath {
            segments: self
                .segments
                .iter()
                .enumerate()
                .filter(|&(i, _)| !drop.contains(&i))
                .map(|(_, seg)| seg.clone())
                .collect(),
            query: self.query.clone(),
            fragment: self.fragment.clone(),
        }
    }
}

impl fmt::Display for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())?;
        if let Some(ref query) = self.query {
            write!(f, "?{}", query)?;
        }
        if let Some(ref fragment) = self.fragment {
            write!(f, "#{}", fragment)?;
        }
        Ok(())
    }
}

/// `HEAD` file or `refs/heads` directory present.
pub fn is_repo(path: &Path) -> bool {
    path.join("HEAD").is_file() || path.join("refs").join("heads").is_dir()
}

/// Number of trailing segments that address something inside a
/// repository, if the path ends in a recognized form.
pub fn tail_len<S: AsRef<str>>(segments: &[S]) -> Option<usize> {
    let segs: Vec<&str> = segments.iter().map(AsRef::as_ref).collect();
    match segs[..] {
        [.., "objects", "pack", _] | [.., "objects", "info", _] => Some(3),
        [.., "objects", dir, _] if dir.len() == 2 && dir.bytes().all(|b| b.is_ascii_hexdigit()) => {
            Some(3)
        }
        [.., "info", "refs"] => Some(2),
        [.., "HEAD"] | [.., "git-upload-pack"] | [.., "git-receive-pack"] => Some(1),
        _ => None,
    }
}

fn is_tail<S: AsRef<str>>(segments: &[S]) -> bool {
    !segments.is_empty() && tail_len(segments) == Some(segments.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    /// An existing directory that is not a repository.
    Real,
    /// Absent on disk; a namespace or new-repository candidate.
    Fake,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub status: SegmentStatus,
}

/// Outcome of walking a request path: the consumed root segments and the
/// unconsumed tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub root: Vec<Segment>,
    pub tail: Vec<String>,
}

impl Resolution {
    /// Names of the real container directories, in order.
    pub fn containers(&self) -> Vec<String> {
        self.root
            .iter()
            .filter(|seg| seg.status == SegmentStatus::Real)
            .map(|seg| seg.name.clone())
            .collect()
    }

    pub fn fakes(&self) -> Vec<String> {
        self.root
            .iter()
            .filter(|seg| seg.status == SegmentStatus::Fake)
            .map(|seg| seg.name.clone())
            .collect()
    }

    /// Real containers as a URI path; `/` when there are none.
    pub fn root_uri(&self) -> String {
        format!("/{}", self.containers().join("/"))
    }

    /// Remaining path, leading slash stripped.
    pub fn tail_str(&self) -> String {
        self.tail.join("/")
    }
}

/// Walks `path` below `doc_root`, consuming directories for as long as they
/// exist and are not repositories themselves.
///
/// In strict mode the first missing segment ends the walk. With
/// `allow_fake`, missing segments are recorded as `Fake` and the walk goes
/// on, probing later segments relative to the last real directory; it still
/// stops at a repository, at a name ending in `.git`, at the segment right
/// before a recognized repository tail, and at the last segment. Nothing on
/// disk is touched either way.
pub fn resolve(doc_root: &Path, path: &RequestPath, allow_fake: bool) -> Resolution {
    let segments = path.segments();
    let mut dir = doc_root.to_path_buf();
    let mut root = Vec::new();
    let mut consumed = 0;

    for (i, name) in segments.iter().enumerate() {
        let candidate = dir.join(name);
        if candidate.is_dir() {
            if is_repo(&candidate) {
                break;
            }
            dir = candidate;
            root.push(Segment {
                name: name.clone(),
                status: SegmentStatus::Real,
            });
            consumed = i + 1;
            continue;
        }

        let rest = &segments[i + 1..];
        if !allow_fake || candidate.exists() || name.ends_with(".git") || rest.is_empty() || is_tail(rest) {
            break;
        }
        root.push(Segment {
            name: name.clone(),
            status: SegmentStatus::Fake,
        });
        consumed = i + 1;
    }

    Resolution {
        root,
        tail: segments[consumed..].to_vec(),
    }
}

/// Where a repository request lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLocation {
    /// Containers between the document root and the repository.
    pub root: Vec<String>,
    /// How many trailing `root` entries do not exist yet.
    pub missing: usize,
    pub repo: String,
    /// Everything below the repository, with a leading slash, or empty.
    pub tail: String,
    pub namespace: Option<String>,
}

impl ResolvedLocation {
    pub fn root_uri(&self) -> String {
        format!("/{}", self.root.join("/"))
    }

    /// Repository sits directly below the document root.
    pub fn is_first_child(&self) -> bool {
        self.root.is_empty()
    }

    /// `GIT_PROJECT_ROOT`
    pub fn project_root(&self, doc_root: &Path) -> PathBuf {
        self.root.iter().fold(doc_root.to_path_buf(), |dir, seg| dir.join(seg))
    }

    pub fn repo_dir(&self, doc_root: &Path) -> PathBuf {
        self.project_root(doc_root).join(&self.repo)
    }
}

/// A located request plus the path with namespace segments spliced out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub location: ResolvedLocation,
    pub path: RequestPath,
}

/// Finds the repository a Git request addresses.
///
/// The repository name is the segment right before the recognized tail.
/// Segments before it are containers; the ones the strict walk could not
/// find are either pending creation or, with `use_namespaces`, namespace
/// components.
pub fn locate(doc_root: &Path, path: &RequestPath, use_namespaces: bool) -> Result<Located> {
    let segments = path.segments();
    let n_tail = tail_len(segments)
        .ok_or_else(|| Error::NotFound(format!("no repository tail in {}", path)))?;
    if n_tail >= segments.len() {
        return Err(Error::NotFound(format!("no repository named in {}", path)));
    }
    let repo_idx = segments.len() - n_tail - 1;

    let strict = resolve(doc_root, path, false);
    let real = strict.root.len().min(repo_idx);
    let tail = format!("/{}", segments[repo_idx + 1..].join("/"));

    let mut location = ResolvedLocation {
        root: segments[..repo_idx].to_vec(),
        missing: repo_idx - real,
        repo: segments[repo_idx].clone(),
        tail,
        namespace: None,
    };

    if use_namespaces && location.missing > 0 {
        let loose = resolve(doc_root, path, true);
        if loose.root.len() == repo_idx && !loose.fakes().is_empty() {
            let dropped: Vec<usize> = loose
                .root
                .iter()
                .enumerate()
                .filter(|&(_, seg)| seg.status == SegmentStatus::Fake)
                .map(|(i, _)| i)
                .collect();
            location.namespace = Some(loose.fakes().join("/"));
            location.root = loose.containers();
            location.missing = 0;
            debug!("namespace {:?} spliced out of {}", location.namespace, path);
            return Ok(Located {
                location,
                path: path.without(&dropped),
            });
        }
    }

    Ok(Located {
        location,
        path: path.clone(),
    })
}

/// Removes namespace segments from a non-repository request (static files,
/// objects) so the on-disk lookup does not trip over them.
pub fn splice_namespace(doc_root: &Path, path: &RequestPath) -> RequestPath {
    let repo_idx = match tail_len(path.segments()) {
        Some(len) if len < path.segments().len() => path.segments().len() - len - 1,
        _ => return path.clone(),
    };
    let loose = resolve(doc_root, path, true);
    if loose.root.len() != repo_idx {
        return path.clone();
    }
    let dropped: Vec<usize> = loose
        .root
        .iter()
        .enumerate()
        .filter(|&(_, seg)| seg.status == SegmentStatus::Fake)
        .map(|(i, _)| i)
        .collect();
    path.without(&dropped)
}
