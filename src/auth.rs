//! Basic access authentication for protected path prefixes.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::Context;
use base64::Engine as _;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::http::Request;
use crate::resolve::RequestPath;

/// Checks a username/password pair against some secrets store.
pub trait CredentialSource: Send + Sync {
    fn verify(&self, user: &str, password: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// `$apr1$salt$hash`
    Apr1,
    /// `{SHA}` + base64 of the raw digest
    Sha1,
    /// Traditional 13 character DES crypt(3)
    Crypt,
    /// `$2y$`, `$2a$`, `$2b$`
    Bcrypt,
}

impl Scheme {
    pub fn detect(stored: &str) -> Option<Scheme> {
        if stored.starts_with("$apr1$") {
            Some(Scheme::Apr1)
        } else if stored.starts_with("{SHA}") {
            Some(Scheme::Sha1)
        } else if stored.starts_with("$2y$") || stored.starts_with("$2a$") || stored.starts_with("$2b$") {
            Some(Scheme::Bcrypt)
        } else if stored.len() == 13 {
            Some(Scheme::Crypt)
        } else {
            None
        }
    }
}

pub trait Verifier: Send + Sync {
    fn verify(&self, stored: &str, candidate: &str) -> bool;
}

/// Verifier implementations keyed by hash scheme. A scheme registered as
/// `None` is known but unsupported.
pub struct Registry {
    verifiers: HashMap<Scheme, Option<Box<dyn Verifier>>>,
}

impl Registry {
    pub fn empty() -> Registry {
        Registry {
            verifiers: HashMap::new(),
        }
    }

    pub fn register(&mut self, scheme: Scheme, verifier: Option<Box<dyn Verifier>>) {
        self.verifiers.insert(scheme, verifier);
    }

    pub fn verifier(&self, stored: &str) -> Option<&dyn Verifier> {
        Scheme::detect(stored)
            .and_then(|scheme| self.verifiers.get(&scheme))
            .and_then(|slot| slot.as_ref())
            .map(|verifier| &**verifier)
    }
}

impl Default for Registry {
    fn default() -> Registry {
        let mut registry = Registry::empty();
        registry.register(Scheme::Apr1, Some(Box::new(OpensslApr1::default())));
        registry.register(Scheme::Sha1, Some(Box::new(Sha1Verifier)));
        registry.register(Scheme::Crypt, Some(Box::new(DesCrypt)));
        registry.register(Scheme::Bcrypt, None);
        registry
    }
}

/// Delegates to `openssl passwd -apr1`, when openssl is installed.
#[derive(Default)]
pub struct OpensslApr1 {
    available: OnceCell<bool>,
}

impl OpensslApr1 {
    fn available(&self) -> bool {
        *self.available.get_or_init(|| {
            let found = Command::new("openssl")
                .arg("version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|status| status.success())
                .unwrap_or(false);
            if !found {
                error!("$apr1$ secrets need the openssl executable, which was not found");
            }
            found
        })
    }
}

impl Verifier for OpensslApr1 {
    fn verify(&self, stored: &str, candidate: &str) -> bool {
        if !self.available() {
            return false;
        }
        let salt = match stored.split('$').nth(2) {
            Some(salt) => salt,
            None => return false,
        };
        match Command::new("openssl")
            .args(&["passwd", "-apr1", "-salt", salt, candidate])
            .stdin(Stdio::null())
            .output()
        {
            Ok(ref out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim() == stored,
            Ok(out) => {
                warn!("openssl passwd failed: {}", String::from_utf8_lossy(&out.stderr).trim());
                false
            }
            Err(err) => {
                warn!("exec openssl: {}", err);
                false
            }
        }
    }
}

pub struct Sha1Verifier;

impl Verifier for Sha1Verifier {
    fn verify(&self, stored: &str, candidate: &str) -> bool {
        let encoded = &stored["{SHA}".len()..];
        match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(digest) => Sha1::digest(candidate.as_bytes()).as_slice() == digest.as_slice(),
            Err(_) => false,
        }
    }
}

pub struct DesCrypt;

impl Verifier for DesCrypt {
    fn verify(&self, stored: &str, candidate: &str) -> bool {
        pwhash::unix_crypt::verify(candidate, stored)
    }
}

/// Parses `user:hash` lines. Lines without a colon and entries whose hash
/// scheme the registry cannot verify are skipped.
pub fn parse_secrets(text: &str, registry: &Registry) -> HashMap<String, String> {
    let mut secrets = HashMap::new();
    for line in text.lines() {
        let (user, hash) = match line.find(':') {
            Some(at) => (line[..at].trim(), line[at + 1..].trim()),
            None => continue,
        };
        if registry.verifier(hash).is_none() {
            warn!("skipping secrets entry for {:?}: unsupported hash format", user);
            continue;
        }
        secrets.insert(user.to_owned(), hash.to_owned());
    }
    secrets
}

/// An htpasswd-like file, re-read on every check.
pub struct HtpasswdFile {
    path: PathBuf,
    registry: Arc<Registry>,
}

impl HtpasswdFile {
    pub fn new<P: Into<PathBuf>>(path: P, registry: Arc<Registry>) -> HtpasswdFile {
        HtpasswdFile {
            path: path.into(),
            registry,
        }
    }
}

impl CredentialSource for HtpasswdFile {
    fn verify(&self, user: &str, password: &str) -> Result<bool> {
        let text = fs::read_to_string(&self.path)
            .map_err(|err| Error::Internal(format!("reading {}: {}", self.path.display(), err)))?;
        let secrets = parse_secrets(&text, &self.registry);
        let stored = match secrets.get(user) {
            Some(stored) => stored,
            None => return Ok(false),
        };
        Ok(self
            .registry
            .verifier(stored)
            .map_or(false, |verifier| verifier.verify(stored, password)))
    }
}

pub struct AuthRule {
    pub prefix: String,
    pub description: String,
    pub source: Arc<dyn CredentialSource>,
    /// Export the authenticated user as `REMOTE_USER`.
    pub real_account: bool,
    /// Require credentials for reads too, not just pushes.
    pub private_repo: bool,
}

impl AuthRule {
    fn matches(&self, path: &str) -> bool {
        let prefix = self.prefix.trim_end_matches('/');
        prefix.is_empty()
            || path == prefix
            || (path.starts_with(prefix) && path[prefix.len()..].starts_with('/'))
    }
}

impl fmt::Debug for AuthRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRule")
            .field("prefix", &self.prefix)
            .field("description", &self.description)
            .field("real_account", &self.real_account)
            .field("private_repo", &self.private_repo)
            .finish()
    }
}

#[derive(Deserialize)]
struct RuleRecord {
    description: Option<String>,
    secretsfile: PathBuf,
    realaccount: Option<bool>,
    privaterepo: Option<bool>,
}

/// Who the request was authenticated as, if anyone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grant {
    pub user: Option<String>,
    pub auth_type: Option<String>,
}

#[derive(Debug)]
pub enum Outcome {
    Proceed(Grant),
    Challenge(String),
    Reject(Error),
}

impl Outcome {
    pub fn into_result(self) -> Result<Grant> {
        match self {
            Outcome::Proceed(grant) => Ok(grant),
            Outcome::Challenge(realm) => Err(Error::Unauthorized { realm }),
            Outcome::Reject(err) => Err(err),
        }
    }
}

#[derive(Debug, Default)]
pub struct AuthTable {
    rules: Vec<AuthRule>,
}

impl AuthTable {
    pub fn new(rules: Vec<AuthRule>) -> AuthTable {
        AuthTable { rules }
    }

    /// Loads the table from a JSON file, or from inline JSON when `source` is
    /// not an existing path.
    pub fn load(source: &str, require_account: bool) -> anyhow::Result<AuthTable> {
        let json = if Path::new(source).is_file() {
            fs::read_to_string(source).with_context(|| format!("reading auth file {}", source))?
        } else {
            source.to_owned()
        };
        let records: HashMap<String, RuleRecord> =
            serde_json::from_str(&json).context("parsing auth table")?;

        let registry = Arc::new(Registry::default());
        let rules = records
            .into_iter()
            .map(|(prefix, record)| AuthRule {
                prefix,
                description: record.description.unwrap_or_else(|| "Basic auth requested".to_owned()),
                source: Arc::new(HtpasswdFile::new(record.secretsfile, registry.clone())),
                real_account: record.realaccount.unwrap_or(require_account),
                private_repo: record.privaterepo.unwrap_or(true),
            })
            .collect();
        Ok(AuthTable::new(rules))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Longest matching prefix wins.
    pub fn rule_for(&self, path: &str) -> Option<&AuthRule> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(path))
            .max_by_key(|rule| rule.prefix.trim_end_matches('/').len())
    }

    pub fn authorize(&self, path: &RequestPath, req: &Request) -> Outcome {
        let rule = match self.rule_for(&path.path()) {
            Some(rule) => rule,
            None => return Outcome::Proceed(Grant::default()),
        };
        if !rule.private_repo && !is_receive(path, &req.method) {
            return Outcome::Proceed(Grant::default());
        }

        let header = match req.header("Authorization") {
            Some(header) => header,
            None => return Outcome::Challenge(rule.description.clone()),
        };
        let (user, password) = match parse_basic(header) {
            Ok(creds) => creds,
            Err(err) => return Outcome::Reject(err),
        };

        match rule.source.verify(&user, &password) {
            Ok(true) => {
                debug!("authenticated {:?} for {}", user, rule.prefix);
                Outcome::Proceed(Grant {
                    user: if rule.real_account { Some(user) } else { None },
                    auth_type: Some("Basic".to_owned()),
                })
            }
            Ok(false) => {
                warn!("bad credentials for {:?} under {}", user, rule.prefix);
                Outcome::Reject(Error::Forbidden("No permission".to_owned()))
            }
            Err(err) => Outcome::Reject(err),
        }
    }
}

/// Push requests: the receive-pack advertisement or RPC.
pub fn is_receive(path: &RequestPath, method: &str) -> bool {
    if method == "POST" {
        return path.segments().last().map_or(false, |seg| seg == "git-receive-pack");
    }
    path.query()
        .map_or(false, |query| query.split('&').any(|param| param == "service=git-receive-pack"))
}

fn parse_basic(header: &str) -> Result<(String, String)> {
    let mut parts = header.split_whitespace();
    let scheme = parts.next().unwrap_or("");
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(Error::NotAcceptable(scheme.to_owned()));
    }
    let encoded = match (parts.next(), parts.next()) {
        (Some(encoded), None) => encoded,
        _ => return Err(Error::Unprocessable),
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| Error::Unprocessable)?;
    let decoded = String::from_utf8(decoded).map_err(|_| Error::Unprocessable)?;
    let mut creds = decoded.split(':');
    match (creds.next(), creds.next(), creds.next()) {
        (Some(user), Some(password), None) => Ok((user.to_owned(), password.to_owned())),
        _ => Err(Error::Unprocessable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixed(&'static str, &'static str);

    impl CredentialSource for Fixed {
        fn verify(&self, user: &str, password: &str) -> Result<bool> {
            Ok(user == self.0 && password == self.1)
        }
    }

    fn table(private_repo: bool, real_account: bool) -> AuthTable {
        AuthTable::new(vec![AuthRule {
            prefix: "/private".to_owned(),
            description: "Private repos".to_owned(),
            source: Arc::new(Fixed("alice", "s3cret")),
            real_account,
            private_repo,
        }])
    }

    fn basic(user_pass: &str) -> String {
        format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(user_pass))
    }

    fn path(target: &str) -> RequestPath {
        RequestPath::parse(target).unwrap()
    }

    #[test]
    fn unprotected_paths_proceed() {
        let req = Request::new("GET", "/public/x.git/info/refs");
        let p = path("/public/x.git/info/refs?service=git-receive-pack");
        assert!(matches!(table(true, false).authorize(&p, &req), Outcome::Proceed(_)));
        // prefix must end at a segment boundary
        let p = path("/privateer/x.git/info/refs?service=git-receive-pack");
        assert!(matches!(table(true, false).authorize(&p, &req), Outcome::Proceed(_)));
    }

    #[test]
    fn public_reads_proceed_but_pushes_challenge() {
        let gate = table(false, false);
        let req = Request::new("GET", "/private/x.git/info/refs");
        let read = path("/private/x.git/info/refs?service=git-upload-pack");
        assert!(matches!(gate.authorize(&read, &req), Outcome::Proceed(_)));

        let push = path("/private/x.git/info/refs?service=git-receive-pack");
        match gate.authorize(&push, &req) {
            Outcome::Challenge(realm) => assert_eq!(realm, "Private repos"),
            other => panic!("unexpected {:?}", other),
        }

        let rpc = path("/private/x.git/git-receive-pack");
        let post = Request::new("POST", "/private/x.git/git-receive-pack");
        assert!(matches!(gate.authorize(&rpc, &post), Outcome::Challenge(_)));
    }

    #[test]
    fn challenge_maps_to_unauthorized() {
        let req = Request::new("GET", "/private/x.git/info/refs");
        let p = path("/private/x.git/info/refs?service=git-upload-pack");
        let err = table(true, false).authorize(&p, &req).into_result().unwrap_err();
        assert!(matches!(err, Error::Unauthorized { ref realm } if realm == "Private repos"));
    }

    #[test]
    fn header_problems_are_rejected() {
        let gate = table(true, false);
        let p = path("/private/x.git/info/refs?service=git-upload-pack");
        let with = |value: &str| Request::new("GET", "/private").with_header("Authorization", value);

        match gate.authorize(&p, &with("Digest abc")) {
            Outcome::Reject(Error::NotAcceptable(scheme)) => assert_eq!(scheme, "Digest"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(gate.authorize(&p, &with("Basic !!!")), Outcome::Reject(Error::Unprocessable)));
        assert!(matches!(gate.authorize(&p, &with(&basic("nocolon"))), Outcome::Reject(Error::Unprocessable)));
        assert!(matches!(gate.authorize(&p, &with(&basic("a:b:c"))), Outcome::Reject(Error::Unprocessable)));
        assert!(matches!(gate.authorize(&p, &with(&basic("alice:wrong"))), Outcome::Reject(Error::Forbidden(_))));
    }

    #[test]
    fn good_credentials_expose_user_only_for_real_accounts() {
        let p = path("/private/x.git/info/refs?service=git-upload-pack");
        let req = Request::new("GET", "/private").with_header("authorization", basic("alice:s3cret"));

        match table(true, true).authorize(&p, &req) {
            Outcome::Proceed(grant) => {
                assert_eq!(grant.user.as_deref(), Some("alice"));
                assert_eq!(grant.auth_type.as_deref(), Some("Basic"));
            }
            other => panic!("unexpected {:?}", other),
        }
        match table(true, false).authorize(&p, &req) {
            Outcome::Proceed(grant) => assert_eq!(grant.user, None),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn longest_prefix_governs() {
        let rule = |prefix: &str, description: &str| AuthRule {
            prefix: prefix.to_owned(),
            description: description.to_owned(),
            source: Arc::new(Fixed("a", "b")),
            real_account: false,
            private_repo: true,
        };
        let table = AuthTable::new(vec![rule("/", "everything"), rule("/git/team/", "team")]);
        assert_eq!(table.rule_for("/git/team/x.git/info/refs").unwrap().description, "team");
        assert_eq!(table.rule_for("/git/other.git").unwrap().description, "everything");
    }

    #[test]
    fn scheme_detection() {
        assert_eq!(Scheme::detect("$apr1$abcdefgh$0123456789abcdefghijkl"), Some(Scheme::Apr1));
        assert_eq!(Scheme::detect("{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g="), Some(Scheme::Sha1));
        assert_eq!(Scheme::detect("$2y$05$abcdefghijklmnopqrstuv"), Some(Scheme::Bcrypt));
        assert_eq!(Scheme::detect("rl0Xa8cEVpDjI"), Some(Scheme::Crypt));
        assert_eq!(Scheme::detect("plaintext"), None);
    }

    #[test]
    fn sha1_and_crypt_verify() {
        let registry = Registry::default();
        // sha1("password")
        let sha = "{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=";
        assert!(registry.verifier(sha).unwrap().verify(sha, "password"));
        assert!(!registry.verifier(sha).unwrap().verify(sha, "Password"));

        let des = pwhash::unix_crypt::hash_with("ab", "hunter2").unwrap();
        assert_eq!(des.len(), 13);
        assert!(registry.verifier(&des).unwrap().verify(&des, "hunter2"));
        assert!(!registry.verifier(&des).unwrap().verify(&des, "hunter3"));
    }

    #[test]
    fn apr1_verifies_through_openssl() {
        let missing = OpensslApr1 {
            available: OnceCell::with_value(false),
        };
        assert!(!missing.verify("$apr1$abcdefgh$ckT15POyCRlen.h6XtGAZ1", "anything"));

        let out = match Command::new("openssl")
            .args(&["passwd", "-apr1", "-salt", "abcdefgh", "opensesame"])
            .output()
        {
            Ok(out) if out.status.success() => out,
            _ => return,
        };
        let stored = String::from_utf8(out.stdout).unwrap().trim().to_owned();
        assert!(stored.starts_with("$apr1$abcdefgh$"));

        let registry = Registry::default();
        let verifier = registry.verifier(&stored).unwrap();
        assert!(verifier.verify(&stored, "opensesame"));
        assert!(!verifier.verify(&stored, "opensesamE"));
    }

    #[test]
    fn unsupported_entries_are_skipped() {
        let registry = Registry::default();
        let text = "alice:{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=\n\
                    bob:$2y$05$abcdefghijklmnopqrstuuJ1hGdM0lSa0XyJr4E7dRZ8w0bZy6nq\n\
                    # comment without separator\n";
        let secrets = parse_secrets(text, &registry);
        assert!(secrets.contains_key("alice"));
        assert!(!secrets.contains_key("bob"));
        assert_eq!(secrets.len(), 1);
    }

    #[test]
    fn htpasswd_file_and_table_loading() {
        let tmp = TempDir::new().unwrap();
        let secrets = tmp.path().join("htpasswd");
        fs::write(&secrets, "alice:{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=\n").unwrap();

        let json = format!(
            r#"{{"/private": {{"description": "Team", "secretsfile": {:?}, "privaterepo": false}}}}"#,
            secrets.display().to_string()
        );
        let table = AuthTable::load(&json, true).unwrap();
        let rule = table.rule_for("/private/x.git").unwrap();
        assert_eq!(rule.description, "Team");
        assert!(rule.real_account);
        assert!(!rule.private_repo);
        assert!(rule.source.verify("alice", "password").unwrap());
        assert!(!rule.source.verify("mallory", "password").unwrap());

        let file = tmp.path().join("auth.json");
        fs::write(&file, &json).unwrap();
        assert!(AuthTable::load(file.to_str().unwrap(), false).is_ok());

        let missing = HtpasswdFile::new(tmp.path().join("nope"), Arc::new(Registry::default()));
        assert!(matches!(missing.verify("alice", "x"), Err(Error::Internal(_))));
    }
}
