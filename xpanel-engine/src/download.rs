//! Engine binary acquisition.
//!
//! Install order: a pre-downloaded archive under `downloads/`, then each
//! configured mirror with exponential backoff, then the upstream release URL.
//! Downloads resume via `Range` on retry; every attempt publishes a download
//! event with its progress.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use xpanel_core::{Error, Result};

use crate::events::{EventBus, EventStatus, XrayEvent, XrayEventType};
use crate::EngineOptions;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const OVERALL_TIMEOUT: Duration = Duration::from_secs(300);
const ATTEMPTS_PER_SOURCE: u32 = 3;
const RELEASE_BASE: &str = "https://github.com/XTLS/Xray-core/releases/download";

/// Release asset OS tag for the running platform.
pub fn os_tag() -> &'static str {
    match std::env::consts::OS {
        // Upstream names darwin builds "macos".
        "macos" => "macos",
        "windows" => "windows",
        _ => "linux",
    }
}

/// Release asset architecture tag for the running platform.
pub fn arch_tag() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "64",
        "x86" => "32",
        "aarch64" => "arm64-v8a",
        "arm" => "arm32-v7a",
        other => other,
    }
}

pub fn archive_name() -> String {
    format!("Xray-{}-{}.zip", os_tag(), arch_tag())
}

pub fn binary_name() -> &'static str {
    if cfg!(windows) { "xray.exe" } else { "xray" }
}

fn release_url(version: &str) -> String {
    format!("{RELEASE_BASE}/{version}/{}", archive_name())
}

fn mirror_url(mirror: &str, version: &str) -> String {
    format!("https://{mirror}/{}", release_url(version))
}

pub fn binary_path(opts: &EngineOptions, version: &str) -> PathBuf {
    opts.base_dir.join("bin").join(version).join(binary_name())
}

/// Ensure `bin/<version>/` holds a runnable binary, installing it if absent.
pub async fn ensure_installed(opts: &EngineOptions, version: &str, bus: &EventBus) -> Result<()> {
    let target = binary_path(opts, version);
    if target.exists() {
        return Ok(());
    }
    bus.publish(XrayEvent::new(
        XrayEventType::Download,
        EventStatus::Start,
        0,
        format!("installing engine {version}"),
    ));

    let install_dir = target.parent().expect("binary path has a parent").to_path_buf();
    let downloads_dir = opts.base_dir.join("downloads");
    tokio::fs::create_dir_all(&install_dir).await?;
    tokio::fs::create_dir_all(&downloads_dir).await?;

    let archive = downloads_dir.join(archive_name());

    // 1. A pre-downloaded archive wins outright.
    if archive.exists() {
        match unpack(&archive, &install_dir).await {
            Ok(()) => {
                bus.publish(XrayEvent::new(
                    XrayEventType::Download,
                    EventStatus::Completed,
                    100,
                    format!("engine {version} installed from local archive"),
                ));
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(error = %e, "local archive unusable, falling back to download");
                let _ = tokio::fs::remove_file(&archive).await;
            }
        }
    }

    // 2. Mirrors in order, then 3. the direct release URL.
    let mut sources: Vec<String> =
        opts.mirrors.iter().map(|m| mirror_url(m, version)).collect();
    sources.push(release_url(version));

    let mut last_err = Error::upstream("no download sources configured");
    for source in &sources {
        match download_with_resume(source, &archive, bus).await {
            Ok(()) => {
                unpack(&archive, &install_dir).await?;
                bus.publish(XrayEvent::new(
                    XrayEventType::Download,
                    EventStatus::Completed,
                    100,
                    format!("engine {version} installed"),
                ));
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(source, error = %e, "download source failed");
                last_err = e;
            }
        }
    }

    bus.publish(
        XrayEvent::new(
            XrayEventType::Download,
            EventStatus::Error,
            0,
            format!("engine {version} could not be installed"),
        )
        .with_details(serde_json::json!({"error": last_err.to_string()})),
    );
    Err(last_err)
}

/// Fetch `url` into `dest`, resuming a partial `.part` file via `Range`.
async fn download_with_resume(url: &str, dest: &Path, bus: &EventBus) -> Result<()> {
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| Error::internal(format!("http client: {e}")))?;

    let part = dest.with_extension("zip.part");
    let mut backoff = Duration::from_secs(1);
    let mut last_err = Error::upstream("download never attempted");

    for attempt in 1..=ATTEMPTS_PER_SOURCE {
        if attempt > 1 {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
        match tokio::time::timeout(OVERALL_TIMEOUT, fetch_once(&client, url, &part, bus)).await {
            Ok(Ok(())) => {
                tokio::fs::rename(&part, dest).await?;
                return Ok(());
            }
            Ok(Err(e)) => last_err = e,
            Err(_) => last_err = Error::upstream(format!("download of {url} timed out")),
        }
        tracing::warn!(url, attempt, error = %last_err, "download attempt failed");
    }
    Err(last_err)
}

async fn fetch_once(
    client: &reqwest::Client,
    url: &str,
    part: &Path,
    bus: &EventBus,
) -> Result<()> {
    let resume_from = match tokio::fs::metadata(part).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    let mut request = client.get(url);
    if resume_from > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={resume_from}-"));
    }
    let response = request
        .send()
        .await
        .map_err(|e| Error::upstream(format!("request to {url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::upstream(format!("{url} answered {status}")));
    }
    // A server that ignores Range restarts the body from zero.
    let resuming = status == reqwest::StatusCode::PARTIAL_CONTENT && resume_from > 0;
    let total = response
        .content_length()
        .map(|len| len + if resuming { resume_from } else { 0 });

    let mut file = if resuming {
        tokio::fs::OpenOptions::new().append(true).open(part).await?
    } else {
        tokio::fs::File::create(part).await?
    };

    let mut written = if resuming { resume_from } else { 0 };
    let mut last_percent = 0u8;
    let mut response = response;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| Error::upstream(format!("read from {url}: {e}")))?
    {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        if let Some(total) = total {
            let percent = ((written * 100) / total.max(1)) as u8;
            if percent >= last_percent + 10 {
                last_percent = percent;
                bus.publish(XrayEvent::new(
                    XrayEventType::Download,
                    EventStatus::Progress,
                    percent,
                    format!("downloaded {written}/{total} bytes"),
                ));
            }
        }
    }
    file.flush().await?;
    Ok(())
}

/// Unpack the release archive into the install directory and mark the engine
/// binary executable.
async fn unpack(archive: &Path, install_dir: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let install_dir_owned = install_dir.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_blocking(&archive, &install_dir_owned))
        .await
        .map_err(|e| Error::internal(format!("unpack task: {e}")))??;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let binary = install_dir.join(binary_name());
        if binary.exists() {
            tokio::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).await?;
        }
    }
    Ok(())
}

fn unpack_blocking(archive: &Path, install_dir: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| Error::upstream(format!("archive {}: {e}", archive.display())))?;

    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| Error::upstream(format!("archive entry {index}: {e}")))?;
        // Zip-slip guard: entries escaping the install dir are skipped.
        let Some(name) = entry.enclosed_name() else {
            tracing::warn!(entry = entry.name(), "archive entry with unsafe path skipped");
            continue;
        };
        let dest = install_dir.join(name);
        if entry.is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}
