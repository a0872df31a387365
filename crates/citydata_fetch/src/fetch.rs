//! Concurrent district download + extraction.
//!
//! Every district is one task in a `JoinSet`; a semaphore caps how many run at once.
//! Failures are collected per district instead of aborting the others.

use crate::districts::District;
use crate::extract::extract_archive;
use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub output_dir: PathBuf,
    pub retries: u32,
    pub backoff: Duration,
    pub overwrite: bool,
    pub keep_archives: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Fetched { files: usize, bytes: u64 },
    Skipped,
}

#[derive(Debug, Default)]
pub struct FetchReport {
    pub fetched: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl FetchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

fn archive_path(opts: &FetchOptions, name: &str) -> PathBuf {
    opts.output_dir.join(format!("{}.zip", name))
}

fn part_path(archive: &Path) -> PathBuf {
    let mut s = archive.as_os_str().to_owned();
    s.push(".part");
    PathBuf::from(s)
}

fn partial_dir(opts: &FetchOptions, name: &str) -> PathBuf {
    opts.output_dir.join(format!("{}.partial", name))
}

async fn is_populated(dir: &Path) -> Result<bool> {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => Ok(entries.next_entry().await?.is_some()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("inspecting {}", dir.display())),
    }
}

/// Stream `url` into `dest`, going through a `.part` file so a torn download never
/// looks like an archive.
async fn download_once(client: &reqwest::Client, url: &str, dest: &Path) -> Result<u64> {
    let response = client.get(url).send().await?.error_for_status()?;

    let part = part_path(dest);
    let mut file = tokio::fs::File::create(&part)
        .await
        .with_context(|| format!("creating {}", part.display()))?;

    let mut total = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&part, dest).await?;
    Ok(total)
}

/// Upper bound for a single retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// `base * 2^(attempt - 1)`, capped at [`MAX_BACKOFF`].
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.checked_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}

/// 4xx answers will not change on retry.
fn is_permanent(err: &anyhow::Error) -> bool {
    err.downcast_ref::<reqwest::Error>()
        .and_then(reqwest::Error::status)
        .map_or(false, |s| s.is_client_error())
}

async fn download(
    client: &reqwest::Client,
    district: &District,
    dest: &Path,
    opts: &FetchOptions,
) -> Result<u64> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match download_once(client, &district.url, dest).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if attempt <= opts.retries && !is_permanent(&e) => {
                let delay = backoff_delay(opts.backoff, attempt);
                tracing::warn!(
                    district = %district.name,
                    url = %district.url,
                    attempt,
                    error = %format!("{:#}", e),
                    delay_ms = delay.as_millis() as u64,
                    "Download failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(part_path(dest)).await;
                return Err(e.context(format!("downloading {}", district.url)));
            }
        }
    }
}

/// Remove what a failed extraction left behind, so neither the archive nor a half-filled
/// `.partial` directory looks like a finished district.
async fn discard(partial: &Path, archive: &Path, opts: &FetchOptions) {
    let _ = tokio::fs::remove_dir_all(partial).await;
    if !opts.keep_archives {
        let _ = tokio::fs::remove_file(archive).await;
    }
}

/// Download and unpack one district into `<output_dir>/<name>`.
pub async fn fetch_district(
    client: &reqwest::Client,
    district: &District,
    opts: &FetchOptions,
) -> Result<Outcome> {
    let target = opts.output_dir.join(&district.name);
    if !opts.overwrite && is_populated(&target).await? {
        tracing::info!(district = %district.name, "Already extracted, skipping");
        return Ok(Outcome::Skipped);
    }

    let archive = archive_path(opts, &district.name);
    tracing::info!(district = %district.name, url = %district.url, "Downloading");
    let bytes = download(client, district, &archive, opts).await?;

    let partial = partial_dir(opts, &district.name);
    let extracted = {
        let archive = archive.clone();
        let partial = partial.clone();
        tokio::task::spawn_blocking(move || extract_archive(&archive, &partial)).await
    };
    let files = match extracted {
        Ok(Ok(files)) if files > 0 => files,
        other => {
            discard(&partial, &archive, opts).await;
            return Err(match other {
                Ok(Ok(_)) => anyhow!("Archive {} contained no files", archive.display()),
                Ok(Err(e)) => e.context(format!("extracting {}", archive.display())),
                Err(e) => e.into(),
            });
        }
    };

    if tokio::fs::try_exists(&target).await? {
        tokio::fs::remove_dir_all(&target)
            .await
            .with_context(|| format!("replacing {}", target.display()))?;
    }
    tokio::fs::rename(&partial, &target)
        .await
        .with_context(|| format!("moving {} into place", partial.display()))?;

    if !opts.keep_archives {
        tokio::fs::remove_file(&archive).await?;
    }

    Ok(Outcome::Fetched { files, bytes })
}

/// Fetch all districts, at most `concurrency` at a time (0 = unbounded).
pub async fn fetch_all(
    client: reqwest::Client,
    districts: Vec<District>,
    opts: FetchOptions,
    concurrency: usize,
) -> Result<FetchReport> {
    tokio::fs::create_dir_all(&opts.output_dir)
        .await
        .with_context(|| format!("creating {}", opts.output_dir.display()))?;

    let limit = if concurrency == 0 { districts.len().max(1) } else { concurrency };
    let semaphore = Arc::new(Semaphore::new(limit));
    let opts = Arc::new(opts);

    let mut set = JoinSet::new();
    for district in districts {
        let client = client.clone();
        let opts = opts.clone();
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => fetch_district(&client, &district, &opts).await,
                Err(e) => Err(e.into()),
            };
            (district.name, result)
        });
    }

    let mut report = FetchReport::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((name, Ok(Outcome::Fetched { files, bytes }))) => {
                tracing::info!(district = %name, files, bytes, "District ready");
                report.fetched.push(name);
            }
            Ok((name, Ok(Outcome::Skipped))) => report.skipped.push(name),
            Ok((name, Err(e))) => {
                let msg = format!("{:#}", e);
                tracing::error!(district = %name, error = %msg, "District failed");
                report.failed.push((name, msg));
            }
            Err(e) => {
                tracing::error!(error = %e, "Download task panicked");
                report.failed.push(("<unknown>".to_string(), e.to_string()));
            }
        }
    }

    report.fetched.sort();
    report.skipped.sort();
    report.failed.sort();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::districts::from_base_url;
    use crate::extract::tests::zip_bytes;
    use axum::extract::{Path as UrlPath, State};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Hits(Arc<AtomicUsize>);

    /// Serves `Mitte.zip`, `Empty.zip`, a zip-slip `Slip.zip` and an HTML page as `Html.zip`;
    /// everything else is a 404.
    async fn archive(State(hits): State<Hits>, UrlPath(file): UrlPath<String>) -> (StatusCode, Vec<u8>) {
        hits.0.fetch_add(1, Ordering::SeqCst);
        match file.as_str() {
            "Mitte.zip" => (
                StatusCode::OK,
                zip_bytes(&[("LoD2_Mitte/", b""), ("LoD2_Mitte/385_5818.gml", b"<CityModel/>")]),
            ),
            "Empty.zip" => (StatusCode::OK, zip_bytes(&[])),
            "Slip.zip" => (
                StatusCode::OK,
                zip_bytes(&[("ok.gml", b"<CityModel/>"), ("../escape.gml", b"x")]),
            ),
            "Html.zip" => (StatusCode::OK, b"<html>moved</html>".to_vec()),
            _ => (StatusCode::NOT_FOUND, Vec::new()),
        }
    }

    async fn serve(hits: Hits) -> SocketAddr {
        let app = Router::new().route("/:file", get(archive)).with_state(hits);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn options(dir: &Path) -> FetchOptions {
        FetchOptions {
            output_dir: dir.to_path_buf(),
            retries: 2,
            backoff: Duration::from_millis(1),
            overwrite: false,
            keep_archives: false,
        }
    }

    #[tokio::test]
    async fn fetches_isolates_failures_and_skips_on_rerun() {
        let hits = Hits::default();
        let addr = serve(hits.clone()).await;
        let dir = std::env::temp_dir().join(format!("citydata-{}", uuid::Uuid::new_v4()));
        let base = format!("http://{}", addr);
        let districts = from_base_url(&base, ["Mitte", "Pankow", "Empty"]);

        let report = fetch_all(reqwest::Client::new(), districts.clone(), options(&dir), 0)
            .await
            .unwrap();

        assert_eq!(report.fetched, vec!["Mitte".to_string()]);
        let failed: Vec<&str> = report.failed.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(failed, vec!["Empty", "Pankow"]);
        assert!(report.failed[0].1.contains("no files"));
        assert!(!report.is_success());

        let gml = dir.join("Mitte/LoD2_Mitte/385_5818.gml");
        assert_eq!(std::fs::read(&gml).unwrap(), b"<CityModel/>");
        assert!(!dir.join("Mitte.zip").exists());
        assert!(!dir.join("Mitte.partial").exists());
        assert!(!dir.join("Empty").exists());
        assert!(!dir.join("Empty.zip").exists());
        // 404s are not retried.
        assert_eq!(hits.0.load(Ordering::SeqCst), 3);

        let again = fetch_all(reqwest::Client::new(), districts[..1].to_vec(), options(&dir), 1)
            .await
            .unwrap();
        assert_eq!(again.skipped, vec!["Mitte".to_string()]);
        assert!(again.is_success());
        assert_eq!(hits.0.load(Ordering::SeqCst), 3);

        let mut opts = options(&dir);
        opts.overwrite = true;
        opts.keep_archives = true;
        let forced = fetch_all(reqwest::Client::new(), districts[..1].to_vec(), opts, 1)
            .await
            .unwrap();
        assert_eq!(forced.fetched, vec!["Mitte".to_string()]);
        assert!(dir.join("Mitte.zip").exists());
        assert!(gml.exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn failed_extraction_leaves_nothing_behind() {
        let addr = serve(Hits::default()).await;
        let dir = std::env::temp_dir().join(format!("citydata-{}", uuid::Uuid::new_v4()));
        let districts = from_base_url(&format!("http://{}", addr), ["Slip", "Html"]);

        let report = fetch_all(reqwest::Client::new(), districts.clone(), options(&dir), 0)
            .await
            .unwrap();
        let failed: Vec<&str> = report.failed.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(failed, vec!["Html", "Slip"]);
        assert!(report.failed[1].1.contains("unsafe"));
        assert!(dir_entries(&dir).is_empty(), "{:?}", dir_entries(&dir));

        // With --keep-archives only the downloads remain.
        let mut opts = options(&dir);
        opts.keep_archives = true;
        fetch_all(reqwest::Client::new(), districts, opts, 0).await.unwrap();
        assert_eq!(dir_entries(&dir), vec!["Html.zip", "Slip.zip"]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        let base = Duration::from_millis(1000);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 40), MAX_BACKOFF);
        assert_eq!(backoff_delay(Duration::from_secs(u64::MAX), 2), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn unreachable_host_fails_after_retries() {
        let dir = std::env::temp_dir().join(format!("citydata-{}", uuid::Uuid::new_v4()));
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let districts = from_base_url(&format!("http://127.0.0.1:{}", port), ["Spandau"]);

        let report = fetch_all(reqwest::Client::new(), districts, options(&dir), 0)
            .await
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "Spandau");
        assert!(!dir.join("Spandau.zip.part").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
