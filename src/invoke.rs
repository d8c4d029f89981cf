//! Running the protocol handler and relaying what it prints.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use crate::cgi::{self, CgiEnvironment, SCRUBBED_VARS};
use crate::error::{Error, Result};
use crate::http::{Body, Request, Response};
use crate::util;

/// Raw result of one handler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code; `None` when killed by a signal.
    pub status: Option<i32>,
}

/// Something that speaks the Git smart HTTP protocol given a CGI
/// environment and request body.
pub trait ProtocolBackend: Send + Sync {
    fn handle(&self, env: &CgiEnvironment, body: &[u8]) -> Result<BackendOutput>;
}

/// `git-http-backend` from the Git exec-path, run as a child process.
pub struct HttpBackend {
    exec_path: PathBuf,
}

impl HttpBackend {
    pub fn new<P: Into<PathBuf>>(exec_path: P) -> HttpBackend {
        HttpBackend {
            exec_path: exec_path.into(),
        }
    }

    /// Full path of the handler, if it is there and executable.
    pub fn program(&self) -> Result<PathBuf> {
        executable(&self.exec_path, cgi::SCRIPT_NAME)
    }
}

fn executable(dir: &Path, name: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    let meta = fs::metadata(&path).map_err(|_| Error::NotFound(path.display().to_string()))?;
    if !meta.is_file() {
        return Err(Error::NotFound(path.display().to_string()));
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(Error::PreconditionFailed(format!("{} is not executable", path.display())));
    }
    Ok(path)
}

impl ProtocolBackend for HttpBackend {
    fn handle(&self, env: &CgiEnvironment, body: &[u8]) -> Result<BackendOutput> {
        let program = self.program()?;

        let mut cmd = Command::new(&program);
        for key in SCRUBBED_VARS {
            cmd.env_remove(key);
        }
        cmd.envs(env.iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|err| Error::Internal(format!("spawn {}: {}", program.display(), err)))?;

        // Feed stdin from its own thread so a chatty backend cannot fill
        // its stdout pipe while we are still writing.
        let stdin = child.stdin.take();
        let input = body.to_vec();
        let writer = thread::spawn(move || -> io::Result<()> {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input)?;
            }
            Ok(())
        });

        let output = child.wait_with_output()?;
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("writing request body to {}: {}", cgi::SCRIPT_NAME, err),
            Err(_) => warn!("stdin writer for {} panicked", cgi::SCRIPT_NAME),
        }

        Ok(BackendOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            status: output.status.code(),
        })
    }
}

/// Reads the part of the request body meant for the backend.
///
/// `POST` with a declared length gets exactly that many bytes, or what
/// arrives before EOF; chunked `POST` is read to the end. Whatever the
/// body reader still yields after that is drained and dropped.
pub fn read_body(req: &Request, body: &mut dyn Read) -> Result<Vec<u8>> {
    let mut input = Vec::new();
    if req.method == "POST" {
        if let Some(length) = req.content_length() {
            (&mut *body).take(length).read_to_end(&mut input)?;
            if (input.len() as u64) < length {
                warn!("client declared {} bytes but sent {}", length, input.len());
            }
        } else if req.is_chunked() {
            body.read_to_end(&mut input)?;
        }
    }
    let extra = util::drain(body);
    if extra > 0 {
        warn!("discarded {} bytes past the declared request body", extra);
    }
    Ok(input)
}

/// Turns backend output into the response for the client.
///
/// The handler's stderr and a non-zero exit only reach the log. The
/// response is always announced as 200; `Content-Length` is computed from
/// the payload unless the handler already sent one.
pub fn relay(output: BackendOutput) -> Response {
    if !output.stderr.is_empty() {
        warn!(
            "{} stderr: {}",
            cgi::SCRIPT_NAME,
            String::from_utf8_lossy(&output.stderr).trim_end()
        );
    }
    match output.status {
        Some(0) => debug!("{} exited OK", cgi::SCRIPT_NAME),
        Some(code) => error!("{} exit status {:#x}", cgi::SCRIPT_NAME, code),
        None => error!("{} killed by signal", cgi::SCRIPT_NAME),
    }

    let parsed = cgi::parse(&output.stdout);
    if let Some(status) = parsed.header("Status") {
        debug!("{} reported status {:?}", cgi::SCRIPT_NAME, status);
    }

    let mut response = Response::new(200);
    response.headers = parsed.headers;
    if let Some(declared) = response.header("Content-Length") {
        error!("Content-Length already present in backend headers: {}", declared);
    } else {
        response
            .headers
            .push(("Content-Length".to_owned(), parsed.payload.len().to_string()));
    }
    response.body = Body::Bytes(parsed.payload);
    response
}

/// One backend round trip: stream the body in, run, relay the output.
pub fn invoke<B: ProtocolBackend + ?Sized>(
    backend: &B,
    env: &CgiEnvironment,
    req: &Request,
    body: &mut dyn Read,
) -> Result<Response> {
    let input = read_body(req, body)?;
    let output = backend.handle(env, &input)?;
    Ok(relay(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Echo {
        seen: Mutex<Vec<u8>>,
    }

    impl ProtocolBackend for Echo {
        fn handle(&self, env: &CgiEnvironment, body: &[u8]) -> Result<BackendOutput> {
            *self.seen.lock().unwrap() = body.to_vec();
            let mut stdout = format!(
                "Content-Type: text/plain\r\nX-Path-Info: {}\r\n\r\n",
                env.get("PATH_INFO").unwrap_or("")
            )
            .into_bytes();
            stdout.extend_from_slice(body);
            Ok(BackendOutput {
                stdout,
                stderr: b"warning: something\n".to_vec(),
                status: Some(0),
            })
        }
    }

    fn bytes(resp: &Response) -> &[u8] {
        match resp.body {
            Body::Bytes(ref bytes) => bytes,
            _ => panic!("expected byte body"),
        }
    }

    #[test]
    fn posts_exactly_the_declared_length() {
        let backend = Echo { seen: Mutex::new(Vec::new()) };
        let mut env = CgiEnvironment::default();
        env.set("PATH_INFO", "/r.git/git-upload-pack");
        let req = Request::new("POST", "/r.git/git-upload-pack").with_header("Content-Length", "4");
        let mut body = Cursor::new(b"0000extra".to_vec());

        let resp = invoke(&backend, &env, &req, &mut body).unwrap();
        assert_eq!(*backend.seen.lock().unwrap(), b"0000".to_vec());
        assert_eq!(body.position(), 9, "over-sent bytes are drained");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("X-Path-Info"), Some("/r.git/git-upload-pack"));
        assert_eq!(resp.header("Content-Length"), Some("4"));
        assert_eq!(bytes(&resp), b"0000");
    }

    #[test]
    fn gets_feed_nothing() {
        let backend = Echo { seen: Mutex::new(b"stale".to_vec()) };
        let req = Request::new("GET", "/r.git/info/refs").with_header("Content-Length", "3");
        let resp = invoke(&backend, &CgiEnvironment::default(), &req, &mut Cursor::new(b"abc".to_vec())).unwrap();
        assert!(backend.seen.lock().unwrap().is_empty());
        assert_eq!(resp.header("Content-Length"), Some("0"));
    }

    #[test]
    fn chunked_posts_read_to_end() {
        let req = Request::new("POST", "/r.git/git-receive-pack").with_header("Transfer-Encoding", "chunked");
        let input = read_body(&req, &mut Cursor::new(b"whole body".to_vec())).unwrap();
        assert_eq!(input, b"whole body".to_vec());
    }

    #[test]
    fn declared_length_is_kept() {
        let resp = relay(BackendOutput {
            stdout: b"Content-Length: 2\r\n\r\nok".to_vec(),
            stderr: Vec::new(),
            status: Some(1),
        });
        assert_eq!(resp.status, 200);
        let lengths: Vec<_> = resp.headers.iter().filter(|h| h.0 == "Content-Length").collect();
        assert_eq!(lengths.len(), 1);
        assert_eq!(bytes(&resp), b"ok");
    }

    #[test]
    fn missing_or_non_executable_backend() {
        let tmp = TempDir::new().unwrap();
        let backend = HttpBackend::new(tmp.path());
        assert!(matches!(backend.program(), Err(Error::NotFound(_))));

        let script = tmp.path().join(cgi::SCRIPT_NAME);
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(backend.program(), Err(Error::PreconditionFailed(_))));

        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(backend.program().unwrap(), script);
    }

    #[test]
    fn runs_a_real_process() {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join(cgi::SCRIPT_NAME);
        fs::write(
            &script,
            "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n\\r\\n'\nprintf '%s:' \"$PATH_INFO\"\ncat\necho oops >&2\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut env = CgiEnvironment::default();
        env.set("PATH_INFO", "/r.git/git-upload-pack");
        let out = HttpBackend::new(tmp.path()).handle(&env, b"0000").unwrap();
        assert_eq!(out.status, Some(0));
        assert_eq!(out.stderr, b"oops\n".to_vec());

        let resp = relay(out);
        assert_eq!(bytes(&resp), b"/r.git/git-upload-pack:0000");
        assert_eq!(resp.header("Content-Length"), Some("27"));
    }
}
