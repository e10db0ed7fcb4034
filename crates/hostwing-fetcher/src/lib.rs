//! Downloads install assets over HTTPS and stamps `{{key}}` template
//! variables into the files that land on an instance's volume.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download of {url} failed after retries: {message}")]
    DownloadFailed { url: String, message: String },
}

pub type Result<T> = std::result::Result<T, FetchError>;

impl From<FetchError> for hostwing_common::AgentError {
    fn from(err: FetchError) -> Self {
        hostwing_common::AgentError::Internal(err.to_string())
    }
}

const MAX_ATTEMPTS: u32 = 3;
const ORIGIN_TIMEOUT_WAIT: Duration = Duration::from_secs(60);
const ORIGIN_TIMEOUT_STATUS: u16 = 522;

/// Fetches `url` into `dir/filename`. Retries up to [`MAX_ATTEMPTS`] times;
/// an HTTP 522 (origin timeout) waits [`ORIGIN_TIMEOUT_WAIT`] before the
/// next attempt, any other non-200 fails the attempt immediately. A
/// partially written file is deleted on every failed attempt.
#[instrument(skip(client))]
pub async fn download_file(
    client: &reqwest::Client,
    url: &str,
    dir: &Path,
    filename: &str,
) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let dest = dir.join(filename);

    let mut last_err = String::new();
    for attempt in 1..=MAX_ATTEMPTS {
        match try_download(client, url, &dest).await {
            Ok(()) => {
                debug!(%url, attempt, "download succeeded");
                return Ok(());
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                let is_origin_timeout = matches!(&e, DownloadAttemptError::Status(s) if *s == ORIGIN_TIMEOUT_STATUS);
                last_err = e.to_string();
                warn!(%url, attempt, error = %last_err, "download attempt failed");
                if is_origin_timeout && attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(ORIGIN_TIMEOUT_WAIT).await;
                }
            }
        }
    }

    Err(FetchError::DownloadFailed {
        url: url.to_string(),
        message: last_err,
    })
}

#[derive(Debug)]
enum DownloadAttemptError {
    Status(u16),
    Transport(reqwest::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for DownloadAttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(s) => write!(f, "HTTP status {s}"),
            Self::Transport(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

async fn try_download(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> std::result::Result<(), DownloadAttemptError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(DownloadAttemptError::Transport)?;

    if !response.status().is_success() {
        return Err(DownloadAttemptError::Status(response.status().as_u16()));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(DownloadAttemptError::Transport)?;
    tokio::fs::write(dest, &bytes)
        .await
        .map_err(DownloadAttemptError::Io)?;
    Ok(())
}

/// One install-script manifest entry, already substituted and ready to
/// fetch.
pub struct ScriptTarget<'a> {
    pub uri: &'a str,
    pub path: &'a str,
}

/// Downloads every entry in `scripts` into `dir`, substituting `{{key}}`
/// placeholders in each URI from `variables` first. A single script's
/// failure is logged and does not abort the remaining downloads —
/// deployments prefer best-effort provisioning.
#[instrument(skip(client, scripts, variables))]
pub async fn download_install_scripts(
    client: &reqwest::Client,
    scripts: &[ScriptTarget<'_>],
    dir: &Path,
    variables: &HashMap<String, String>,
) {
    for script in scripts {
        let uri = substitute(script.uri, variables);
        let (subdir, filename) = match script.path.rsplit_once('/') {
            Some((parent, name)) => (dir.join(parent), name.to_string()),
            None => (dir.to_path_buf(), script.path.to_string()),
        };
        if let Err(e) = download_file(client, &uri, &subdir, &filename).await {
            warn!(uri = %uri, path = %script.path, error = %e, "install script download failed, continuing");
        }
    }
}

/// Walks `dir` and replaces every `{{key}}` occurrence in regular,
/// UTF-8-readable files whose name does not end in `.jar`.
#[instrument(skip(variables))]
pub async fn replace_variables(dir: &Path, variables: &HashMap<String, String>) -> Result<()> {
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.ends_with(".jar") {
            continue;
        }

        let path = entry.path().to_path_buf();
        let Ok(content) = tokio::fs::read_to_string(&path).await else {
            continue;
        };
        let replaced = substitute(&content, variables);
        if replaced != content {
            tokio::fs::write(&path, replaced).await?;
        }
    }
    Ok(())
}

fn substitute(input: &str, variables: &HashMap<String, String>) -> String {
    let mut out = input.to_string();
    for (key, value) in variables {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn substitute_replaces_all_occurrences() {
        let mut vars = HashMap::new();
        vars.insert("NAME".to_string(), "svc".to_string());
        vars.insert("PORT".to_string(), "8080".to_string());
        let out = substitute("hello {{NAME}} on {{PORT}}, {{NAME}} again", &vars);
        assert_eq!(out, "hello svc on 8080, svc again");
    }

    #[test]
    fn substitute_is_idempotent_for_absent_keys() {
        let vars = HashMap::new();
        let out = substitute("hello {{MISSING}}", &vars);
        assert_eq!(out, "hello {{MISSING}}");
    }

    #[tokio::test]
    async fn replace_variables_skips_jar_files_but_not_jar_txt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("x.jar"))
            .unwrap()
            .write_all(b"{{NAME}}")
            .unwrap();
        std::fs::File::create(dir.path().join("x.jar.txt"))
            .unwrap()
            .write_all(b"{{NAME}}")
            .unwrap();

        let mut vars = HashMap::new();
        vars.insert("NAME".to_string(), "svc".to_string());
        replace_variables(dir.path(), &vars).await.unwrap();

        let jar = std::fs::read_to_string(dir.path().join("x.jar")).unwrap();
        let jar_txt = std::fs::read_to_string(dir.path().join("x.jar.txt")).unwrap();
        assert_eq!(jar, "{{NAME}}");
        assert_eq!(jar_txt, "svc");
    }

    /// Minimal hand-rolled HTTP/1.0 server: returns the configured status
    /// once per connection, with no body, so we can exercise the 522
    /// retry-and-wait path without a mocking crate in the dependency tree.
    async fn spawn_status_server(statuses: Vec<u16>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for status in statuses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let body = format!("HTTP/1.1 {status} X\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = socket.write_all(body.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn download_file_fails_immediately_on_non_522_non_200() {
        let base = spawn_status_server(vec![404]).await;
        let client = reqwest::Client::new();
        let dir = tempfile::tempdir().unwrap();

        let result = download_file(&client, &format!("{base}/asset.txt"), dir.path(), "asset.txt").await;
        assert!(result.is_err());
        assert!(!dir.path().join("asset.txt").exists());
    }

    #[tokio::test]
    async fn download_file_writes_body_on_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let payload = b"hello world";
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\nhello world",
                payload.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });

        let client = reqwest::Client::new();
        let dir = tempfile::tempdir().unwrap();
        download_file(&client, &format!("http://{addr}/asset.txt"), dir.path(), "asset.txt")
            .await
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("asset.txt")).unwrap();
        assert_eq!(content, "hello world");
    }
}
