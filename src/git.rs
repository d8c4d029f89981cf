use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use hyper::header::{ContentLength, Headers};
use hyper::status::StatusCode;
use iron::prelude::*;
use iron::Handler;
use url::form_urlencoded;

use crate::auth::Grant;
use crate::cgi;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::http::{self, Body};
use crate::invoke::{self, HttpBackend, ProtocolBackend};
use crate::provision::{self, Provisioned};
use crate::resolve::{self, is_repo, Located, RequestPath, ResolvedLocation};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// `GET .../info/refs?service=git-*-pack`
    Advertise,
    /// `POST .../git-upload-pack` or `.../git-receive-pack`
    Rpc,
    /// Loose object or packfile, read straight from disk.
    Object,
    /// `POST .../name.git` asking for a new repository.
    Create,
    /// Any other file below the document root.
    Static,
}

fn service(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .filter_map(|param| param.strip_prefix("service="))
        .find(|svc| *svc == "git-upload-pack" || *svc == "git-receive-pack")
}

pub fn route(method: &str, path: &RequestPath) -> Result<Route> {
    let segments = path.segments();
    let last = segments.last().map(String::as_str);
    match method {
        "GET" | "HEAD" => {
            if path.is_object() {
                Ok(Route::Object)
            } else if method == "GET" && segments.ends_with(&["info".to_owned(), "refs".to_owned()]) && service(path.query()).is_some() {
                Ok(Route::Advertise)
            } else {
                Ok(Route::Static)
            }
        }
        "POST" => match last {
            Some("git-upload-pack") | Some("git-receive-pack") => Ok(Route::Rpc),
            Some(name) if name.ends_with(".git") => Ok(Route::Create),
            _ => Err(Error::MethodNotAllowed(
                "Non-git POST only allowed when creating new repos".to_owned(),
            )),
        },
        other => Err(Error::MethodNotAllowed(format!("{} not supported", other))),
    }
}

/// Request handling independent of the HTTP server: resolve, authorize,
/// provision, then hand off to the backend or the filesystem.
pub struct Gateway<B> {
    config: Arc<Config>,
    backend: B,
}

impl<B: ProtocolBackend> Gateway<B> {
    pub fn new(config: Arc<Config>, backend: B) -> Gateway<B> {
        Gateway { config, backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn serve(&self, req: &http::Request, body: &mut dyn Read) -> Result<http::Response> {
        let path = RequestPath::from_parts(&req.path, req.query.as_deref())?;
        let route = route(&req.method, &path)?;
        debug!("{} {} -> {:?}", req.method, path, route);

        // Namespace segments are spliced out before authorization so rules
        // see the repository path as stored on disk.
        match route {
            Route::Advertise | Route::Rpc => {
                let located = resolve::locate(&self.config.doc_root, &path, self.config.use_namespaces)?;
                let grant = self.authorize(&located.path, req)?;
                self.git(req, &located, route, &grant, body)
            }
            Route::Create => {
                self.authorize(&path, req)?;
                self.create(req, &path, body)
            }
            Route::Object | Route::Static => {
                let path = if self.config.use_namespaces {
                    resolve::splice_namespace(&self.config.doc_root, &path)
                } else {
                    path
                };
                self.authorize(&path, req)?;
                self.file(req, &path)
            }
        }
    }

    fn authorize(&self, path: &RequestPath, req: &http::Request) -> Result<Grant> {
        self.config.auth.authorize(path, req).into_result()
    }

    fn git(
        &self,
        req: &http::Request,
        located: &Located,
        route: Route,
        grant: &Grant,
        body: &mut dyn Read,
    ) -> Result<http::Response> {
        let config = &*self.config;
        let location = &located.location;
        debug!(
            "root {} repo {} tail {} namespace {:?}",
            location.root_uri(),
            location.repo,
            location.tail,
            location.namespace
        );

        provision::ensure(
            &config.git,
            &config.doc_root,
            location,
            &config.policy,
            route == Route::Advertise,
        )?;

        let env = cgi::build(config, location, located.path.query(), req, grant)?;
        invoke::invoke(&self.backend, &env, req, body)
    }

    fn create(&self, req: &http::Request, path: &RequestPath, body: &mut dyn Read) -> Result<http::Response> {
        let config = &*self.config;
        if !config.policy.create_missing {
            return Err(Error::Forbidden("Repository creation disabled".to_owned()));
        }

        let segments = path.segments();
        let (repo, root) = match segments.split_last() {
            Some(split) => split,
            None => return Err(Error::BadRequest("No repository named".to_owned())),
        };
        let existing = (1..=root.len())
            .take_while(|&n| root[..n].iter().fold(config.doc_root.clone(), |dir, seg| dir.join(seg)).is_dir())
            .count();
        let location = ResolvedLocation {
            root: root.to_vec(),
            missing: root.len() - existing,
            repo: repo.clone(),
            tail: String::new(),
            namespace: None,
        };

        let input = invoke::read_body(req, body)?;
        if !wants_init(req.header("Content-Type").unwrap_or(""), &input) {
            return Err(if location.repo_dir(&config.doc_root).exists() {
                Error::BadRequest("Invalid content".to_owned())
            } else {
                Error::NotFound("Repo does not exist".to_owned())
            });
        }
        if is_repo(&location.repo_dir(&config.doc_root)) {
            return Err(Error::BadRequest("Repository already exists".to_owned()));
        }

        match provision::ensure(&config.git, &config.doc_root, &location, &config.policy, true)? {
            Provisioned::Created => Ok(http::Response::new(201)),
            Provisioned::Existing => Err(Error::BadRequest("Repository already exists".to_owned())),
        }
    }

    fn file(&self, req: &http::Request, path: &RequestPath) -> Result<http::Response> {
        let config = &*self.config;
        let target = path.translate(&config.doc_root);
        if !target.is_file() {
            return Err(Error::NotFound(target.display().to_string()));
        }

        let file = File::open(&target)?;
        let length = file.metadata()?.len();
        let mut response = http::Response::new(200);
        response
            .headers
            .push(("Content-Type".to_owned(), util::content_type(&path.path()).to_owned()));
        response.headers.push(("Content-Length".to_owned(), length.to_string()));
        // iron sends an empty body as `Content-Length: 0`, so HEAD answers
        // carry the type but not the real length.
        if req.method != "HEAD" {
            response.body = Body::File(file);
        }
        Ok(response)
    }
}

/// `init=1` as a form field or plain text, or `{"init": 1}` as JSON.
fn wants_init(content_type: &str, body: &[u8]) -> bool {
    if content_type.to_ascii_lowercase().contains("json") {
        return serde_json::from_slice::<serde_json::Value>(body)
            .map(|value| value.get("init").and_then(|v| v.as_i64()) == Some(1))
            .unwrap_or(false);
    }
    form_urlencoded::parse(body).any(|(key, value)| key.trim() == "init" && value.trim() == "1")
}

fn header_lines(headers: &Headers) -> Vec<(String, String)> {
    let mut lines = Vec::new();
    for view in headers.iter() {
        let name = view.name().to_owned();
        match headers.get_raw(&name) {
            Some(raw) => {
                for value in raw {
                    lines.push((name.clone(), String::from_utf8_lossy(value).into_owned()));
                }
            }
            None => lines.push((name, view.value_string())),
        }
    }
    lines
}

fn request_meta(r: &Request) -> http::Request {
    http::Request {
        method: r.method.to_string(),
        path: format!("/{}", r.url.path().join("/")),
        query: r.url.query().map(str::to_owned),
        protocol: r.version.to_string(),
        server_name: r.url.host().to_string(),
        server_port: r.url.port(),
        remote_addr: r.remote_addr.ip().to_string(),
        headers: header_lines(&r.headers),
    }
}

fn into_iron(resp: http::Response) -> Response {
    let mut out = Response::new();
    out.status = Some(StatusCode::from_u16(resp.status));
    for (name, value) in resp.headers {
        match value.parse() {
            Ok(length) if name.eq_ignore_ascii_case("Content-Length") => out.headers.set(ContentLength(length)),
            _ => out.headers.append_raw(name, value.into_bytes()),
        }
    }
    match resp.body {
        Body::Empty => {}
        Body::Bytes(bytes) => out.body = Some(Box::new(bytes)),
        Body::File(file) => out.body = Some(Box::new(file)),
    }
    out
}

/// The iron handler serving everything below the document root.
pub struct Server {
    gateway: Gateway<HttpBackend>,
}

impl Server {
    pub fn new(config: Arc<Config>) -> Server {
        let backend = HttpBackend::new(config.exec_path.clone());
        Server {
            gateway: Gateway::new(config, backend),
        }
    }
}

impl Handler for Server {
    fn handle(&self, r: &mut Request) -> IronResult<Response> {
        let req = request_meta(r);
        match self.gateway.serve(&req, &mut r.body) {
            Ok(resp) => Ok(into_iron(resp)),
            Err(err) => {
                if err.status().is_server_error() {
                    error!("{} {}: {}", req.method, req.path, err);
                } else {
                    info!("{} {}: {}", req.method, req.path, err);
                }
                Err(err.into())
            }
        }
    }
}
