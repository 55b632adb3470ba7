//! Streaming HTTP and local file downloads.

use crate::{ImportError, Result, log_debug, log_info};
use futures::StreamExt;
use reqwest::{Client, ClientBuilder, RequestBuilder};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Where an artifact lives: a remote URL or a path on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Remote(String),
    Local(PathBuf),
}

impl Location {
    pub fn parse(url: &str) -> Result<Self> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Location::Remote(url.to_string()))
        } else if let Some(path) = url.strip_prefix("file://") {
            Ok(Location::Local(PathBuf::from(path)))
        } else if url.starts_with('/') {
            Ok(Location::Local(PathBuf::from(url)))
        } else {
            Err(ImportError::Validation(format!(
                "unsupported URL scheme in '{}'",
                url
            )))
        }
    }
}

/// Client builder whose `timeout` bounds connecting and each idle read, never
/// a whole transfer. Callers add per-request deadlines to short API calls.
pub fn client_builder(timeout: Duration) -> ClientBuilder {
    Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
}

pub fn build_client(builder: ClientBuilder) -> Result<Client> {
    builder
        .build()
        .map_err(|e| ImportError::Transfer(format!("failed to build HTTP client: {}", e)))
}

pub fn http_client(timeout: Duration) -> Result<Client> {
    build_client(client_builder(timeout))
}

/// Send `request` and stream the body into `destination`.
///
/// The body is written to a `.part` file that is renamed into place only once
/// the transfer completes.
pub async fn fetch_to_file(request: RequestBuilder, destination: &Path) -> Result<u64> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ImportError::Transfer(format!(
            "{} returned {}",
            response.url(),
            status
        )));
    }
    log_info!("Downloading {} to {}", response.url(), destination.display());

    let partial = partial_path(destination);
    let mut file = tokio::fs::File::create(&partial).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e.into());
            }
        };
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&partial, destination).await?;
    log_debug!("Downloaded {} bytes to {}", written, destination.display());
    Ok(written)
}

/// Copy a local artifact, or download a remote one, into `destination`.
pub async fn fetch_location(
    client: &Client,
    location: &Location,
    basic_auth: Option<(&str, &str)>,
    destination: &Path,
) -> Result<u64> {
    match location {
        Location::Local(path) => {
            log_info!("Copying {} to {}", path.display(), destination.display());
            Ok(tokio::fs::copy(path, destination).await?)
        }
        Location::Remote(url) => {
            let mut request = client.get(url);
            if let Some((username, password)) = basic_auth {
                request = request.basic_auth(username, Some(password));
            }
            fetch_to_file(request, destination).await
        }
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_parsing() {
        assert_eq!(
            Location::parse("https://files.lab/web.ova").unwrap(),
            Location::Remote("https://files.lab/web.ova".into())
        );
        assert_eq!(
            Location::parse("file:///srv/web.ova").unwrap(),
            Location::Local(PathBuf::from("/srv/web.ova"))
        );
        assert_eq!(
            Location::parse("/srv/web.ova").unwrap(),
            Location::Local(PathBuf::from("/srv/web.ova"))
        );
        assert!(Location::parse("ftp://files.lab/web.ova").is_err());
    }

    #[test]
    fn partial_file_sits_next_to_destination() {
        assert_eq!(
            partial_path(Path::new("/work/web.ova")),
            PathBuf::from("/work/web.ova.part")
        );
    }

    #[tokio::test]
    async fn local_locations_are_copied() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("in.ova");
        std::fs::write(&source, b"archive").unwrap();
        let dest = dir.path().join("out.ova");

        let client = http_client(Duration::from_secs(5)).unwrap();
        let written = fetch_location(&client, &Location::Local(source), None, &dest)
            .await
            .unwrap();
        assert_eq!(written, 7);
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive");
    }

    /// Serve `chunks` as one response announcing `length` bytes, sleeping
    /// `gap` before each chunk.
    async fn trickle_server(length: usize, chunks: Vec<&'static str>, gap: Duration) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
            let head = format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n", length);
            socket.write_all(head.as_bytes()).await.unwrap();
            for chunk in chunks {
                tokio::time::sleep(gap).await;
                if socket.write_all(chunk.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        format!("http://{}/disk.img", addr)
    }

    #[tokio::test]
    async fn slow_transfers_outlive_the_client_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("disk.img");
        let url = trickle_server(8, vec!["ab", "cd", "ef", "gh"], Duration::from_millis(150)).await;

        // Whole transfer takes ~600ms, each read waits ~150ms.
        let client = http_client(Duration::from_millis(400)).unwrap();
        let written = fetch_to_file(client.get(&url), &dest).await.unwrap();
        assert_eq!(written, 8);
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdefgh");
    }

    #[tokio::test]
    async fn stalled_transfers_fail_and_drop_the_partial_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("disk.img");
        // Headers promise more bytes than are ever sent.
        let url = trickle_server(8, vec!["ab"], Duration::ZERO).await;

        let client = http_client(Duration::from_millis(200)).unwrap();
        let result = fetch_to_file(client.get(&url), &dest).await;
        assert!(result.is_err());
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }
}
