//! OpenScanCloud client.
//!
//! The service takes a zip of images uploaded in parts, processes it as a
//! named project and exposes the result behind a download link once the
//! project reports `done`.

use super::api::{CloudError, PhotogrammetryApi, Submission};
use super::job::JobStatus;
use crate::config::CloudConfig;
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::Value;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Image extensions accepted for upload.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Mesh extensions looked for in a downloaded archive.
pub const MESH_EXTENSIONS: [&str; 4] = ["obj", "glb", "stl", "ply"];

#[allow(clippy::expect_used)]
static LABEL_UNSAFE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]").expect("label pattern is valid"));

/// Token quota reported by `getTokenInfo`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenInfo {
    /// Remaining credit.
    #[serde(default)]
    pub credit: Option<Value>,
    /// Maximum photos per project.
    #[serde(default)]
    pub limit_photos: Option<u64>,
    /// Maximum upload size in bytes.
    #[serde(default)]
    pub limit_filesize: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CreatedProject {
    #[serde(default)]
    ulink: Vec<String>,
}

/// HTTP client for OpenScanCloud.
#[derive(Debug, Clone)]
pub struct OpenScanCloudClient {
    server: String,
    token: String,
    user: String,
    password: String,
    max_part_size: u64,
    client: Client,
}

impl OpenScanCloudClient {
    /// Creates a client from the cloud section.
    pub fn from_config(config: &CloudConfig) -> Result<Self, CloudError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;
        Ok(Self::with_client(config, client))
    }

    /// Creates a client with a preconfigured HTTP client.
    #[must_use]
    pub fn with_client(config: &CloudConfig, client: Client) -> Self {
        Self {
            server: format!("{}/", config.server.trim_end_matches('/')),
            token: config.token.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            max_part_size: config.max_part_size.max(1),
            client,
        }
    }

    async fn get(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Response, CloudError> {
        let mut query: Vec<(&str, String)> = vec![("token", self.token.clone())];
        query.extend(params.iter().cloned());
        let response = self
            .client
            .get(format!("{}{endpoint}", self.server))
            .basic_auth(&self.user, Some(&self.password))
            .query(&query)
            .send()
            .await?;
        check_status(endpoint, response).await
    }

    /// Verifies the token and returns its quota.
    pub async fn token_info(&self) -> Result<TokenInfo, CloudError> {
        if self.token.is_empty() {
            return Err(CloudError::Rejected("cloud.token is not set".to_string()));
        }
        let info: TokenInfo = self.get("getTokenInfo", &[]).await?.json().await?;
        info!(
            credit = ?info.credit,
            limit_photos = ?info.limit_photos,
            limit_filesize = ?info.limit_filesize,
            "cloud token verified"
        );
        Ok(info)
    }

    async fn project_info(&self, job_id: &str) -> Result<Value, CloudError> {
        Ok(self
            .get("getProjectInfo", &[("project", job_id.to_string())])
            .await?
            .json()
            .await?)
    }

    async fn upload_part(&self, link: &str, part: &Path) -> Result<(), CloudError> {
        let body = tokio::fs::read(part).await?;
        debug!(part = %part.display(), bytes = body.len(), "uploading part");
        let response = self
            .client
            .post(link)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;
        check_status("upload", response).await?;
        Ok(())
    }
}

async fn check_status(endpoint: &str, response: Response) -> Result<Response, CloudError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CloudError::Http {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl PhotogrammetryApi for OpenScanCloudClient {
    async fn submit(&self, submission: &Submission) -> Result<String, CloudError> {
        let quota = self.token_info().await?;

        let images_dir = submission.images.clone();
        let images = tokio::task::spawn_blocking(move || collect_images(&images_dir))
            .await
            .map_err(|e| CloudError::Archive(e.to_string()))??;
        if images.is_empty() {
            return Err(CloudError::Rejected(format!(
                "no images found in {}",
                submission.images.display()
            )));
        }
        let photo_limit = quota.limit_photos.unwrap_or(999);
        if u64::try_from(images.len()).unwrap_or(u64::MAX) > photo_limit {
            return Err(CloudError::Rejected(format!(
                "too many photos: {} > limit {photo_limit}",
                images.len()
            )));
        }

        let job_id = job_name(&submission.label, Utc::now().timestamp_millis() / 10);
        let temp_dir = submission.work_dir.join("temp");
        let archive = temp_dir.join(&job_id);
        let part_size = self.max_part_size;
        let photo_count = images.len();
        let (parts, filesize) = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&temp_dir)?;
            zip_and_split(&images, &archive, part_size)
        })
        .await
        .map_err(|e| CloudError::Archive(e.to_string()))??;

        let size_limit = quota.limit_filesize.unwrap_or(2_000_000_000);
        if filesize > size_limit {
            return Err(CloudError::Rejected(format!(
                "archive too large: {filesize} > limit {size_limit}"
            )));
        }

        let created: CreatedProject = self
            .get(
                "createProject",
                &[
                    ("project", job_id.clone()),
                    ("photos", photo_count.to_string()),
                    ("parts", parts.len().to_string()),
                    ("filesize", filesize.to_string()),
                ],
            )
            .await?
            .json()
            .await?;
        if created.ulink.len() < parts.len() {
            return Err(CloudError::Decode(format!(
                "expected {} upload links, got {}",
                parts.len(),
                created.ulink.len()
            )));
        }
        info!(job_id = %job_id, photos = photo_count, parts = parts.len(), filesize, "cloud project created");

        for (index, (part, link)) in parts.iter().zip(&created.ulink).enumerate() {
            info!(job_id = %job_id, part = index + 1, total = parts.len(), "uploading");
            self.upload_part(link, part).await?;
        }

        self.get("startProject", &[("project", job_id.clone())]).await?;
        info!(job_id = %job_id, "cloud processing started");

        for part in &parts {
            if let Err(e) = tokio::fs::remove_file(part).await {
                debug!(part = %part.display(), error = %e, "could not remove upload part");
            }
        }
        Ok(job_id)
    }

    async fn status(&self, job_id: &str) -> Result<JobStatus, CloudError> {
        let info = self.project_info(job_id).await?;
        Ok(interpret_project_info(&info))
    }

    async fn download(&self, job_id: &str, dest_dir: &Path) -> Result<PathBuf, CloudError> {
        let info = self.project_info(job_id).await?;
        let link = info
            .get("dlink")
            .and_then(Value::as_str)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| CloudError::Decode("processing done but no download link".to_string()))?
            .to_string();

        info!(job_id, link = %link, "downloading cloud result");
        let response = check_status("download", self.client.get(&link).send().await?).await?;
        let bytes = response.bytes().await?;

        tokio::fs::create_dir_all(dest_dir).await?;
        let result_path = dest_dir.join(result_file_name(job_id, &link));
        tokio::fs::write(&result_path, &bytes).await?;
        info!(job_id, path = %result_path.display(), bytes = bytes.len(), "cloud result saved");

        if has_extension(&result_path, &["zip"]) {
            let dest = dest_dir.to_path_buf();
            return tokio::task::spawn_blocking(move || extract_mesh(&result_path, &dest))
                .await
                .map_err(|e| CloudError::Archive(e.to_string()))?;
        }
        Ok(result_path)
    }
}

/// Maps a `getProjectInfo` body onto a job status.
#[must_use]
pub fn interpret_project_info(info: &Value) -> JobStatus {
    let status = info
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let lowered = status.to_lowercase();

    if lowered == "done" {
        JobStatus::complete()
    } else if lowered.contains("failed") || lowered.contains("error") {
        JobStatus::failed(info.to_string())
    } else {
        JobStatus {
            progress: info.get("progress").and_then(Value::as_f64),
            ..JobStatus::processing(status)
        }
    }
}

/// Builds the service's project name: `<centiseconds>-<label>-OSC.zip`.
#[must_use]
pub fn job_name(label: &str, centiseconds: i64) -> String {
    let label = label.trim_end_matches(".zip");
    let label = if label.is_empty() {
        "scan".to_string()
    } else {
        LABEL_UNSAFE.replace_all(label, "_").into_owned()
    };
    format!("{centiseconds}-{label}-OSC.zip")
}

fn result_file_name(job_id: &str, link: &str) -> String {
    let last = link.rsplit('/').next().unwrap_or_default();
    let last = last.split('?').next().unwrap_or_default();
    let ext = last
        .rsplit_once('.')
        .map_or("zip", |(_, ext)| ext);
    format!("{}_result.{ext}", job_id.trim_end_matches(".zip"))
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

/// Lists the images in `dir`, sorted by name.
pub fn collect_images(dir: &Path) -> Result<Vec<PathBuf>, CloudError> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_extension(path, &IMAGE_EXTENSIONS))
        .collect();
    images.sort();
    Ok(images)
}

/// Zips `images` into `archive` and splits it into parts of at most
/// `part_size` bytes. Returns the parts and the total archive size.
pub fn zip_and_split(
    images: &[PathBuf],
    archive: &Path,
    part_size: u64,
) -> Result<(Vec<PathBuf>, u64), CloudError> {
    let mut writer = ZipWriter::new(BufWriter::new(File::create(archive)?));
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);
    for image in images {
        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        writer.start_file(name, options)?;
        std::io::copy(&mut File::open(image)?, &mut writer)?;
    }
    writer.finish()?.flush()?;

    let filesize = std::fs::metadata(archive)?.len();
    if filesize <= part_size {
        return Ok((vec![archive.to_path_buf()], filesize));
    }

    let chunk = usize::try_from(part_size).unwrap_or(usize::MAX);
    let mut source = File::open(archive)?;
    let mut buffer = vec![0u8; chunk];
    let mut parts = Vec::new();
    loop {
        let filled = read_full(&mut source, &mut buffer)?;
        if filled == 0 {
            break;
        }
        let part = PathBuf::from(format!("{}_part{}", archive.display(), parts.len() + 1));
        std::fs::write(&part, &buffer[..filled])?;
        parts.push(part);
        if filled < chunk {
            break;
        }
    }
    std::fs::remove_file(archive)?;
    Ok((parts, filesize))
}

fn read_full(source: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = source.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Extracts `archive` into `dest` and returns the first mesh file inside.
pub fn extract_mesh(archive: &Path, dest: &Path) -> Result<PathBuf, CloudError> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    let mut names = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        names.push(zip.by_index(index)?.name().to_string());
    }
    zip.extract(dest)?;

    let mesh = names
        .iter()
        .find(|name| has_extension(Path::new(name.as_str()), &MESH_EXTENSIONS))
        .map(|name| dest.join(name))
        .ok_or_else(|| {
            CloudError::Archive(format!("no mesh file found in {}", archive.display()))
        })?;
    info!(mesh = %mesh.display(), "extracted mesh");
    Ok(mesh)
}
