//! Application loading.
//!
//! An application is a directory containing an executable entry point. The
//! entry is run CGI-style once per request: request metadata goes into the
//! environment, the body onto stdin, and stdout is parsed as a CGI response.

use crate::error::{Result, WorkerError};
use crate::handler::{AppService, Handler, HandlerProvider};
use async_trait::async_trait;
use bytes::Bytes;
use common::wire::HotReload;
use http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use parking_lot::Mutex;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Entry file names probed in order when no explicit entry is given.
pub const ENTRY_CANDIDATES: [&str; 6] = [
    "index.cgi",
    "app.cgi",
    "index.sh",
    "app.sh",
    "index",
    "app",
];

/// Resolve the application entry point.
///
/// An explicit entry (absolute, or relative to `app_dir`) wins; otherwise the
/// first existing candidate from [`ENTRY_CANDIDATES`].
pub fn resolve_entry(app_dir: &Path, entry: Option<&Path>) -> Result<PathBuf> {
    if let Some(entry) = entry {
        let path = if entry.is_absolute() {
            entry.to_path_buf()
        } else {
            app_dir.join(entry)
        };
        return if path.is_file() {
            Ok(path)
        } else {
            Err(WorkerError::load(format!(
                "entry {} does not exist",
                path.display()
            )))
        };
    }

    ENTRY_CANDIDATES
        .iter()
        .map(|name| app_dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            WorkerError::load(format!(
                "no entry point found in {} (tried {})",
                app_dir.display(),
                ENTRY_CANDIDATES.join(", ")
            ))
        })
}

/// How the entry gets executed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Launch {
    /// Entry has an executable bit
    Direct,
    /// Entry is run through `/bin/sh`
    Shell,
}

/// Executable application run once per request.
#[derive(Debug, Clone)]
pub struct ExecApp {
    entry: PathBuf,
    app_dir: PathBuf,
    launch: Launch,
}

impl ExecApp {
    /// Inspect `entry` and decide how to launch it.
    pub fn load(app_dir: &Path, entry: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(entry)
            .map_err(|e| WorkerError::load(format!("{}: {}", entry.display(), e)))?;
        let launch = if metadata.permissions().mode() & 0o111 != 0 {
            Launch::Direct
        } else {
            Launch::Shell
        };

        Ok(Self {
            entry: entry.to_path_buf(),
            app_dir: app_dir.to_path_buf(),
            launch,
        })
    }

    pub fn entry(&self) -> &Path {
        &self.entry
    }

    fn command(&self, request: &Request<Bytes>) -> Command {
        let mut command = match self.launch {
            Launch::Direct => Command::new(&self.entry),
            Launch::Shell => {
                let mut c = Command::new("/bin/sh");
                c.arg(&self.entry);
                c
            }
        };

        let uri = request.uri();
        command
            .current_dir(&self.app_dir)
            .env("GATEWAY_INTERFACE", "CGI/1.1")
            .env("SERVER_PROTOCOL", format!("{:?}", request.version()))
            .env("REQUEST_METHOD", request.method().as_str())
            .env("PATH_INFO", uri.path())
            .env("QUERY_STRING", uri.query().unwrap_or(""))
            .env("CONTENT_LENGTH", request.body().len().to_string());

        for (name, value) in request.headers() {
            let Ok(value) = value.to_str() else {
                continue;
            };
            if name == http::header::CONTENT_TYPE {
                command.env("CONTENT_TYPE", value);
            } else if name != http::header::CONTENT_LENGTH {
                let key = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
                command.env(key, value);
            }
        }

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl AppService for ExecApp {
    async fn fetch(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let mut child = self.command(&request).spawn().map_err(|e| {
            WorkerError::handler(format!("failed to run {}: {}", self.entry.display(), e))
        })?;

        // The body is written concurrently so a large response cannot block
        // on a full stdout pipe while stdin is still being fed.
        if let Some(mut stdin) = child.stdin.take() {
            let body = request.into_body();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&body).await {
                    debug!(error = %e, "App did not consume the request body");
                }
            });
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(WorkerError::handler(format!(
                "{} exited with {}",
                self.entry.display(),
                output.status
            )));
        }

        parse_cgi_output(&output.stdout)
    }
}

/// Parse CGI output into a response.
///
/// Header lines end with `\n` or `\r\n`; an empty line separates headers
/// from the body. `Status:` sets the status code, a bare `Location:` implies
/// `302 Found`.
pub fn parse_cgi_output(output: &[u8]) -> Result<Response<Bytes>> {
    let (head, body) = split_head(output)
        .ok_or_else(|| WorkerError::handler("malformed CGI output: missing header terminator"))?;
    let head = std::str::from_utf8(head)
        .map_err(|_| WorkerError::handler("malformed CGI output: headers are not UTF-8"))?;

    let mut builder = Response::builder();
    let mut status = None;
    let mut has_location = false;

    for line in head.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| WorkerError::handler(format!("malformed CGI header '{}'", line)))?;
        let value = value.trim();

        if name.eq_ignore_ascii_case("status") {
            let code = value
                .split_whitespace()
                .next()
                .and_then(|code| code.parse::<u16>().ok())
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| WorkerError::handler(format!("invalid CGI status '{}'", value)))?;
            status = Some(code);
            continue;
        }

        if name.eq_ignore_ascii_case("location") {
            has_location = true;
        }
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| WorkerError::handler(format!("invalid CGI header name: {}", e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| WorkerError::handler(format!("invalid CGI header value: {}", e)))?;
        builder = builder.header(name, value);
    }

    let status = status.unwrap_or(if has_location {
        StatusCode::FOUND
    } else {
        StatusCode::OK
    });

    Ok(builder
        .status(status)
        .body(Bytes::copy_from_slice(body))?)
}

fn split_head(output: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut line_start = 0;
    for (i, byte) in output.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        let line = &output[line_start..i];
        if line.is_empty() || line == b"\r" {
            return Some((&output[..line_start], &output[i + 1..]));
        }
        line_start = i + 1;
    }
    None
}

struct Loaded {
    handler: Handler,
    entry: PathBuf,
    modified: Option<SystemTime>,
}

/// Provider that loads the application from its directory.
///
/// In [`HotReload::Module`] mode, [`HandlerProvider::refresh`] reloads the
/// handler whenever the entry file's modify-time advances.
pub struct LoaderProvider {
    app_dir: PathBuf,
    entry: Option<PathBuf>,
    hot_reload: HotReload,
    state: Mutex<Option<Loaded>>,
}

impl LoaderProvider {
    pub fn new(app_dir: impl Into<PathBuf>, entry: Option<PathBuf>, hot_reload: HotReload) -> Self {
        Self {
            app_dir: app_dir.into(),
            entry,
            hot_reload,
            state: Mutex::new(None),
        }
    }

    /// Load eagerly; the worker treats a failure here as fatal.
    pub fn load(&self) -> Result<PathBuf> {
        let loaded = self.load_fresh()?;
        let entry = loaded.entry.clone();
        *self.state.lock() = Some(loaded);
        Ok(entry)
    }

    fn load_fresh(&self) -> Result<Loaded> {
        let entry = resolve_entry(&self.app_dir, self.entry.as_deref())?;
        let app = ExecApp::load(&self.app_dir, &entry)?;
        info!(entry = %entry.display(), launch = ?app.launch, "Application loaded");
        Ok(Loaded {
            handler: Handler::service(app),
            modified: modified_time(&entry),
            entry,
        })
    }
}

impl HandlerProvider for LoaderProvider {
    fn get(&self) -> Result<Handler> {
        let mut state = self.state.lock();
        if let Some(loaded) = state.as_ref() {
            return Ok(loaded.handler.clone());
        }
        let loaded = self.load_fresh()?;
        let handler = loaded.handler.clone();
        *state = Some(loaded);
        Ok(handler)
    }

    fn invalidate(&self) {
        *self.state.lock() = None;
    }

    fn is_loaded(&self) -> bool {
        self.state.lock().is_some()
    }

    fn refresh(&self) -> Result<bool> {
        if self.hot_reload != HotReload::Module {
            return Ok(false);
        }

        let changed = match self.state.lock().as_ref() {
            Some(loaded) => match (modified_time(&loaded.entry), loaded.modified) {
                (Some(now), Some(then)) => now > then,
                (Some(_), None) => true,
                (None, _) => true,
            },
            None => true,
        };

        // The previous handler stays in place until the new one loads
        if changed {
            let loaded = self.load_fresh()?;
            info!(entry = %loaded.entry.display(), "Application reloaded after change");
            *self.state.lock() = Some(loaded);
        }
        Ok(changed)
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_script(dir: &Path, name: &str, body: &str, executable: bool) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let mode = if executable { 0o755 } else { 0o644 };
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn test_resolve_entry_probes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_entry(dir.path(), None).is_err());

        write_script(dir.path(), "app.sh", "", false);
        assert_eq!(resolve_entry(dir.path(), None).unwrap(), dir.path().join("app.sh"));

        write_script(dir.path(), "index.cgi", "", false);
        assert_eq!(resolve_entry(dir.path(), None).unwrap(), dir.path().join("index.cgi"));
    }

    #[test]
    fn test_resolve_explicit_entry() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "server.sh", "", false);
        write_script(dir.path(), "index.cgi", "", false);

        let entry = resolve_entry(dir.path(), Some(Path::new("server.sh"))).unwrap();
        assert_eq!(entry, dir.path().join("server.sh"));
        assert!(resolve_entry(dir.path(), Some(Path::new("missing.sh"))).is_err());
    }

    #[test]
    fn test_parse_cgi_output() {
        let response =
            parse_cgi_output(b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nnope")
                .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(response.body(), &Bytes::from("nope"));

        let response = parse_cgi_output(b"X-Thing: 1\n\nbody\n\nwith blank line").unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from("body\n\nwith blank line"));

        let response = parse_cgi_output(b"Location: /elsewhere\n\n").unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    #[test]
    fn test_parse_cgi_output_rejects_garbage() {
        assert!(parse_cgi_output(b"").is_err());
        assert!(parse_cgi_output(b"no header terminator").is_err());
        assert!(parse_cgi_output(b"not a header\n\nbody").is_err());
        assert!(parse_cgi_output(b"Status: abc\n\n").is_err());
    }

    #[tokio::test]
    async fn test_exec_app_runs_script() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_script(
            dir.path(),
            "index.sh",
            "printf 'Content-Type: text/plain\\n\\n'\nprintf '%s %s %s ' \"$REQUEST_METHOD\" \"$PATH_INFO\" \"$HTTP_X_NAME\"\ncat\n",
            false,
        );

        let app = ExecApp::load(dir.path(), &entry).unwrap();
        let request = Request::post("/greet?x=1")
            .header("x-name", "rip")
            .body(Bytes::from("body"))
            .unwrap();
        let response = app.fetch(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from("POST /greet rip body"));
    }

    #[tokio::test]
    async fn test_exec_app_failure_is_handler_error() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_script(dir.path(), "index.sh", "exit 3\n", false);
        let app = ExecApp::load(dir.path(), &entry).unwrap();

        let result = app
            .fetch(Request::get("/").body(Bytes::new()).unwrap())
            .await;
        assert!(matches!(result, Err(WorkerError::Handler(_))));
    }

    #[test]
    fn test_module_reload_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_script(dir.path(), "index.sh", "echo v1\n", false);

        let provider = LoaderProvider::new(dir.path(), None, HotReload::Module);
        provider.load().unwrap();
        assert!(provider.is_loaded());
        assert!(!provider.refresh().unwrap());

        let file = std::fs::File::options().write(true).open(&entry).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        assert!(provider.refresh().unwrap());
        assert!(!provider.refresh().unwrap());
    }

    #[test]
    fn test_failed_reload_keeps_previous_handler() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_script(dir.path(), "index.sh", "echo v1\n", false);

        let provider = LoaderProvider::new(dir.path(), None, HotReload::Module);
        provider.load().unwrap();

        std::fs::remove_file(&entry).unwrap();
        assert!(provider.refresh().is_err());
        assert!(provider.is_loaded());
        assert!(provider.get().is_ok());

        let entry = write_script(dir.path(), "index.sh", "echo v2\n", false);
        let file = std::fs::File::options().write(true).open(&entry).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        assert!(provider.refresh().unwrap());
        assert!(provider.is_loaded());
    }

    #[test]
    fn test_refresh_is_noop_without_module_mode() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_script(dir.path(), "index.sh", "echo v1\n", false);

        let provider = LoaderProvider::new(dir.path(), None, HotReload::Process);
        provider.load().unwrap();

        let file = std::fs::File::options().write(true).open(&entry).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        assert!(!provider.refresh().unwrap());

        provider.invalidate();
        assert!(!provider.is_loaded());
        assert!(provider.get().is_ok());
        assert!(provider.is_loaded());
    }
}
