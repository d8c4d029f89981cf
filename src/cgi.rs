//! CGI plumbing for git-http-backend: the environment going in and the
//! header block coming out.

use std::collections::btree_map::{self, BTreeMap};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::auth::Grant;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::http::Request;
use crate::resolve::{is_repo, ResolvedLocation};

static FIELD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([[:alnum:]-]+): *(.*)$").expect("header field pattern"));

pub const SCRIPT_NAME: &str = "git-http-backend";

/// RFC 3875 variables that are always exported, empty when there is no
/// value, so the backend never sees ones inherited from our own process.
const RFC_VARS: &[&str] = &[
    "QUERY_STRING",
    "REMOTE_HOST",
    "CONTENT_LENGTH",
    "HTTP_USER_AGENT",
    "HTTP_COOKIE",
    "HTTP_REFERER",
];

/// Variables that must not leak in from the parent when we do not set them.
pub const SCRUBBED_VARS: &[&str] = &["GIT_NAMESPACE", "REMOTE_USER", "AUTH_TYPE", "HTTP_GIT_PROTOCOL"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgiEnvironment {
    vars: BTreeMap<String, String>,
}

impl CgiEnvironment {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.vars.insert(key.into(), value.into());
    }

    fn set_default(&mut self, key: &str, value: &str) {
        self.vars.entry(key.to_owned()).or_insert_with(|| value.to_owned());
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

fn is_receive(location: &ResolvedLocation, query: Option<&str>) -> bool {
    location.tail.ends_with("/git-receive-pack")
        || query.map_or(false, |q| q.split('&').any(|param| param == "service=git-receive-pack"))
}

/// Rejoins `Accept` headers, including obsolete folded continuation lines,
/// into one comma separated list.
fn unfold_accept<'a, I: Iterator<Item = &'a str>>(values: I) -> String {
    let mut items: Vec<&str> = Vec::new();
    for value in values {
        for (n, line) in value.split('\n').enumerate() {
            let continued = n > 0 && line.starts_with(|c: char| c == ' ' || c == '\t');
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if continued {
                items.push(line);
            } else {
                items.extend(line.split(',').map(str::trim).filter(|item| !item.is_empty()));
            }
        }
    }
    items.join(",")
}

/// Builds the backend environment for a located repository.
///
/// Only the declared inputs flow in; identical arguments give identical
/// environments. Fails with `NotFound` when the target is not a
/// repository.
pub fn build(
    config: &Config,
    location: &ResolvedLocation,
    query: Option<&str>,
    req: &Request,
    grant: &Grant,
) -> Result<CgiEnvironment> {
    let project_root = location.project_root(&config.doc_root);
    let repo_dir = project_root.join(&location.repo);
    if !is_repo(&repo_dir) {
        return Err(Error::NotFound(repo_dir.display().to_string()));
    }

    let mut env = CgiEnvironment::default();
    env.set("GIT_PROJECT_ROOT", project_root.display().to_string());
    env.set("GIT_HTTP_EXPORT_ALL", "");
    if let Some(ref namespace) = location.namespace {
        env.set("GIT_NAMESPACE", namespace.clone());
    }
    env.set("SCRIPT_NAME", SCRIPT_NAME);
    env.set("PATH_INFO", format!("/{}{}", location.repo, location.tail));
    env.set("PATH_TRANSLATED", format!("{}{}", repo_dir.display(), location.tail));
    env.set("QUERY_STRING", query.unwrap_or(""));

    if let Some(ref user) = grant.user {
        env.set("REMOTE_USER", user.clone());
    } else if is_receive(location, query) {
        env.set("REMOTE_USER", config.os_user.clone());
    }
    if let Some(ref auth_type) = grant.auth_type {
        env.set("AUTH_TYPE", auth_type.clone());
    }

    env.set("SERVER_SOFTWARE", config.server_software.clone());
    env.set("SERVER_NAME", req.server_name.clone());
    env.set("GATEWAY_INTERFACE", "CGI/1.1");
    env.set("SERVER_PROTOCOL", req.protocol.clone());
    env.set("SERVER_PORT", req.server_port.to_string());
    env.set("REQUEST_METHOD", req.method.clone());
    env.set("REMOTE_ADDR", req.remote_addr.clone());
    env.set("CONTENT_TYPE", req.header("Content-Type").unwrap_or(""));
    if let Some(length) = req.header("Content-Length") {
        env.set("CONTENT_LENGTH", length.trim());
    }

    env.set("HTTP_ACCEPT", unfold_accept(req.headers_all("Accept")));
    if let Some(agent) = req.header("User-Agent") {
        env.set("HTTP_USER_AGENT", agent);
    }
    let cookies: Vec<&str> = req.headers_all("Cookie").filter(|c| !c.is_empty()).collect();
    if !cookies.is_empty() {
        env.set("HTTP_COOKIE", cookies.join(", "));
    }
    if let Some(referer) = req.header("Referer") {
        env.set("HTTP_REFERER", referer);
    }
    if let Some(protocol) = req.header("Git-Protocol") {
        env.set("HTTP_GIT_PROTOCOL", protocol);
    }

    for key in RFC_VARS {
        env.set_default(key, "");
    }

    if log_enabled!(log::Level::Debug) {
        for (key, value) in env.iter() {
            debug!("  {}={:?}", key, value);
        }
    }
    Ok(env)
}

/// Backend output split into its header block and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiResponse {
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl CgiResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|&&(ref key, _)| key.eq_ignore_ascii_case(name))
            .map(|&(_, ref value)| value.as_str())
    }
}

/// Splits raw CGI output on the first blank line. Without one, everything
/// is header and the payload is empty.
pub fn parse(stdout: &[u8]) -> CgiResponse {
    let (head, payload) = match find(stdout, b"\r\n\r\n") {
        Some(at) => (&stdout[..at], &stdout[at + 4..]),
        None => match find(stdout, b"\n\n") {
            Some(at) => (&stdout[..at], &stdout[at + 2..]),
            None => (stdout, &[][..]),
        },
    };

    let mut headers = Vec::new();
    for line in String::from_utf8_lossy(head).lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match FIELD_RE.captures(line) {
            Some(caps) => headers.push((caps[1].to_owned(), caps[2].trim().to_owned())),
            None => warn!("ignoring malformed CGI header line {:?}", line),
        }
    }

    CgiResponse {
        headers,
        payload: payload.to_vec(),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
