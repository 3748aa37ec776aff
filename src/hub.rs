//! Uploading a saved model directory to the Hugging Face hub.
//!
//! Small text files go inline in a single NDJSON commit; weights and other large files are
//! first sent through the Git LFS batch API and referenced from the commit by their sha256.

use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{
    blocking::{Client, RequestBuilder, Response},
    header::{CONTENT_TYPE, ETAG},
    StatusCode,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{
    checkpoint::CHECKPOINT_PREFIX,
    error::{Error, Result},
};

const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
const LFS_CONTENT_TYPE: &str = "application/vnd.git-lfs+json";
const LFS_SIZE_THRESHOLD: u64 = 10 * 1024 * 1024;
const LFS_EXTENSIONS: [&str; 7] = ["safetensors", "bin", "pt", "pth", "h5", "msgpack", "ckpt"];

#[derive(Debug, Clone, PartialEq)]
pub struct UploadFile {
    pub path_in_repo: String,
    pub content: Vec<u8>,
    pub sha256: String,
    pub lfs: bool,
}

impl UploadFile {
    pub fn new(path_in_repo: String, content: Vec<u8>) -> Self {
        let sha256 = hex::encode(Sha256::digest(&content));
        let lfs = needs_lfs(&path_in_repo, content.len() as u64);
        Self {
            path_in_repo,
            content,
            sha256,
            lfs,
        }
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

pub fn needs_lfs(path: &str, size: u64) -> bool {
    let binary = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| LFS_EXTENSIONS.contains(&ext));
    binary || size > LFS_SIZE_THRESHOLD
}

/// Every file under `folder`, except intermediate `checkpoint-*` directories.
pub fn collect_files(folder: &Path) -> Result<Vec<UploadFile>> {
    let mut files = Vec::new();
    let mut pending = vec![folder.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let relative = relative_path(folder, &path);
            if path.is_dir() {
                if !relative.starts_with(CHECKPOINT_PREFIX) {
                    pending.push(path);
                }
            } else {
                files.push(UploadFile::new(relative, fs::read(&path)?));
            }
        }
    }
    files.sort_by(|a, b| a.path_in_repo.cmp(&b.path_in_repo));
    Ok(files)
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// NDJSON body of a commit: a header line, then one line per file.
pub fn commit_payload(summary: &str, files: &[UploadFile]) -> Result<String> {
    let mut lines = vec![json!({
        "key": "header",
        "value": { "summary": summary, "description": "" },
    })];
    for file in files {
        lines.push(if file.lfs {
            json!({
                "key": "lfsFile",
                "value": { "path": file.path_in_repo, "algo": "sha256", "oid": file.sha256 },
            })
        } else {
            json!({
                "key": "file",
                "value": {
                    "content": STANDARD.encode(&file.content),
                    "path": file.path_in_repo,
                    "encoding": "base64",
                },
            })
        });
    }
    let mut payload = String::new();
    for line in lines {
        payload.push_str(&serde_json::to_string(&line)?);
        payload.push('\n');
    }
    Ok(payload)
}

/// `name` or `namespace/name`.
pub fn split_repo_id(repo_id: &str) -> (Option<&str>, &str) {
    match repo_id.split_once('/') {
        Some((namespace, name)) => (Some(namespace), name),
        None => (None, repo_id),
    }
}

#[derive(Debug, Deserialize)]
struct LfsBatchResponse {
    #[serde(default)]
    transfer: Option<String>,
    objects: Vec<LfsObject>,
}

#[derive(Debug, Deserialize)]
struct LfsObject {
    oid: String,
    size: u64,
    #[serde(default)]
    actions: Option<LfsActions>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct LfsActions {
    upload: Option<LfsAction>,
    verify: Option<LfsAction>,
}

#[derive(Debug, Deserialize)]
struct LfsAction {
    href: String,
    #[serde(default)]
    header: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    #[serde(rename = "commitUrl", default)]
    commit_url: Option<String>,
}

pub struct HubClient {
    client: Client,
    endpoint: String,
    token: String,
}

impl HubClient {
    /// Reads the token from `HF_TOKEN`, `HUGGING_FACE_HUB_TOKEN` or the hf-hub token file,
    /// and the endpoint from `HF_ENDPOINT`.
    pub fn from_env() -> Result<Self> {
        let token = env::var("HF_TOKEN")
            .or_else(|_| env::var("HUGGING_FACE_HUB_TOKEN"))
            .ok()
            .or_else(|| hf_hub::Cache::default().token())
            .ok_or_else(|| {
                Error::Hub("no token found, set HF_TOKEN or log in with the hub CLI".to_string())
            })?;
        let endpoint = env::var("HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        Self::new(endpoint, token)
    }

    pub fn new(endpoint: String, token: String) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(600)).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }

    fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().to_string();
        let body = response.text().unwrap_or_default();
        Err(Error::Hub(format!("{url} returned {status}: {body}")))
    }

    pub fn whoami(&self) -> Result<String> {
        let url = format!("{}/api/whoami-v2", self.endpoint);
        let response = Self::check(self.authed(self.client.get(url)).send()?)?;
        let body: Value = response.json()?;
        body.get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Hub("whoami response has no user name".to_string()))
    }

    /// Prefixes a bare repository name with the authenticated user's namespace.
    pub fn resolve_repo_id(&self, repo_id: &str) -> Result<String> {
        match split_repo_id(repo_id) {
            (Some(_), _) => Ok(repo_id.to_string()),
            (None, name) => Ok(format!("{}/{}", self.whoami()?, name)),
        }
    }

    /// Creating a repository that already exists is not an error.
    pub fn create_repo(&self, repo_id: &str) -> Result<()> {
        let (organization, name) = split_repo_id(repo_id);
        let url = format!("{}/api/repos/create", self.endpoint);
        let response = self
            .authed(self.client.post(url))
            .json(&json!({
                "type": "model",
                "name": name,
                "organization": organization,
                "private": false,
            }))
            .send()?;
        if response.status() == StatusCode::CONFLICT {
            debug!(repo_id, "repository already exists");
            return Ok(());
        }
        Self::check(response)?;
        info!(repo_id, "created repository");
        Ok(())
    }

    pub fn upload_lfs_files(&self, repo_id: &str, files: &[&UploadFile]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let url = format!("{}/{}.git/info/lfs/objects/batch", self.endpoint, repo_id);
        let objects: Vec<Value> = files
            .iter()
            .map(|file| json!({ "oid": file.sha256, "size": file.size() }))
            .collect();
        let response = self
            .authed(self.client.post(url))
            .header("Accept", LFS_CONTENT_TYPE)
            .header(CONTENT_TYPE, LFS_CONTENT_TYPE)
            .json(&json!({
                "operation": "upload",
                "transfers": ["basic", "multipart"],
                "hash_algo": "sha256",
                "objects": objects,
            }))
            .send()?;
        let batch: LfsBatchResponse = Self::check(response)?.json()?;
        let multipart = batch.transfer.as_deref() == Some("multipart");

        for object in batch.objects {
            if let Some(error) = object.error {
                return Err(Error::Hub(format!("lfs object {}: {error}", object.oid)));
            }
            let file = files
                .iter()
                .find(|file| file.sha256 == object.oid)
                .ok_or_else(|| Error::Hub(format!("unexpected lfs object {}", object.oid)))?;
            let Some(actions) = object.actions else {
                debug!(path = %file.path_in_repo, "already uploaded");
                continue;
            };
            if let Some(upload) = actions.upload {
                info!(path = %file.path_in_repo, size = object.size, "uploading lfs object");
                if multipart || upload.header.contains_key("chunk_size") {
                    self.upload_multipart(&upload, file)?;
                } else {
                    Self::check(self.client.put(&upload.href).body(file.content.clone()).send()?)?;
                }
            }
            if let Some(verify) = actions.verify {
                let mut request = self.authed(self.client.post(&verify.href));
                for (key, value) in &verify.header {
                    request = request.header(key, value);
                }
                Self::check(
                    request
                        .json(&json!({ "oid": object.oid, "size": object.size }))
                        .send()?,
                )?;
            }
        }
        Ok(())
    }

    fn upload_multipart(&self, upload: &LfsAction, file: &UploadFile) -> Result<()> {
        let chunk_size: usize = upload
            .header
            .get("chunk_size")
            .and_then(|size| size.parse().ok())
            .ok_or_else(|| Error::Hub("multipart upload without chunk_size".to_string()))?;
        let part_urls = multipart_urls(&upload.header);

        let mut parts = Vec::with_capacity(part_urls.len());
        for (part_number, url) in part_urls {
            let start = (part_number - 1) * chunk_size;
            let end = (start + chunk_size).min(file.content.len());
            let chunk = file.content.get(start..end).ok_or_else(|| {
                Error::Hub(format!("part {part_number} is past the end of {}", file.path_in_repo))
            })?;
            let response = Self::check(self.client.put(url).body(chunk.to_vec()).send()?)?;
            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|etag| etag.to_str().ok())
                .unwrap_or_default()
                .to_string();
            parts.push(json!({ "partNumber": part_number, "etag": etag }));
        }

        Self::check(
            self.authed(self.client.post(&upload.href))
                .json(&json!({ "oid": file.sha256, "parts": parts }))
                .send()?,
        )?;
        Ok(())
    }

    pub fn commit(
        &self,
        repo_id: &str,
        summary: &str,
        files: &[UploadFile],
    ) -> Result<Option<String>> {
        let url = format!("{}/api/models/{}/commit/main", self.endpoint, repo_id);
        let response = self
            .authed(self.client.post(url))
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(commit_payload(summary, files)?)
            .send()?;
        let commit: CommitResponse = Self::check(response)?.json()?;
        Ok(commit.commit_url)
    }
}

/// Presigned part urls keyed by their 1-based part number, in order.
fn multipart_urls(header: &HashMap<String, String>) -> Vec<(usize, &str)> {
    let mut urls: Vec<(usize, &str)> = header
        .iter()
        .filter_map(|(key, url)| key.parse::<usize>().ok().map(|n| (n, url.as_str())))
        .filter(|(n, _)| *n > 0)
        .collect();
    urls.sort_by_key(|(n, _)| *n);
    urls
}

/// Uploads the contents of `folder` to the model repository `repo_id`, creating it when
/// needed. Returns the resolved repository id.
pub fn push_to_hub(folder: &Path, repo_id: &str, summary: &str) -> Result<String> {
    let client = HubClient::from_env()?;
    let repo_id = client.resolve_repo_id(repo_id)?;
    client.create_repo(&repo_id)?;

    let files = collect_files(folder)?;
    let lfs_files: Vec<&UploadFile> = files.iter().filter(|file| file.lfs).collect();
    client.upload_lfs_files(&repo_id, &lfs_files)?;

    let commit_url = client.commit(&repo_id, summary, &files)?;
    info!(
        repo_id,
        files = files.len(),
        commit = commit_url.as_deref().unwrap_or("-"),
        "pushed to the hub"
    );
    Ok(repo_id)
}

/// Repository name used when no hub id is configured: the output directory's name.
pub fn default_repo_name(output_dir: &Path) -> Result<String> {
    output_dir
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from(output_dir))
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            let dir = output_dir.display();
            Error::Hub(format!("cannot derive a repository name from {dir}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_lfs() {
        assert!(needs_lfs("model.safetensors", 10));
        assert!(needs_lfs("tokenizer.json", LFS_SIZE_THRESHOLD + 1));
        assert!(!needs_lfs("tokenizer.json", 2_000_000));
        assert!(!needs_lfs("config.json", 10));
    }

    #[test]
    fn test_collect_files_skips_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), b"{}").unwrap();
        fs::write(dir.path().join("model.safetensors"), b"weights").unwrap();
        fs::create_dir_all(dir.path().join("checkpoint-500")).unwrap();
        fs::write(dir.path().join("checkpoint-500").join("config.json"), b"{}").unwrap();
        fs::create_dir_all(dir.path().join("runs")).unwrap();
        fs::write(dir.path().join("runs").join("log.txt"), b"x").unwrap();

        let files = collect_files(dir.path()).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path_in_repo.as_str()).collect();
        assert_eq!(paths, vec!["config.json", "model.safetensors", "runs/log.txt"]);
        assert!(files[1].lfs);
        assert_eq!(
            files[1].sha256,
            hex::encode(Sha256::digest(b"weights"))
        );
    }

    #[test]
    fn test_commit_payload() {
        let files = vec![
            UploadFile::new("config.json".to_string(), b"{}".to_vec()),
            UploadFile::new("model.safetensors".to_string(), b"weights".to_vec()),
        ];
        let payload = commit_payload("End of training", &files).unwrap();
        let lines: Vec<Value> = payload
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["key"], "header");
        assert_eq!(lines[0]["value"]["summary"], "End of training");
        assert_eq!(lines[1]["key"], "file");
        assert_eq!(lines[1]["value"]["content"], STANDARD.encode(b"{}"));
        assert_eq!(lines[1]["value"]["encoding"], "base64");
        assert_eq!(lines[2]["key"], "lfsFile");
        assert_eq!(lines[2]["value"]["oid"], files[1].sha256.as_str());
        assert_eq!(lines[2]["value"]["algo"], "sha256");
    }

    #[test]
    fn test_split_repo_id() {
        assert_eq!(split_repo_id("user/model"), (Some("user"), "model"));
        assert_eq!(split_repo_id("model"), (None, "model"));
    }

    #[test]
    fn test_lfs_batch_response() {
        let body = r#"{
            "transfer": "multipart",
            "objects": [{
                "oid": "abc", "size": 12,
                "actions": {
                    "upload": {
                        "href": "https://hub/complete",
                        "header": {
                            "chunk_size": "5",
                            "2": "https://s3/2",
                            "1": "https://s3/1",
                            "3": "https://s3/3"
                        }
                    },
                    "verify": {"href": "https://hub/verify"}
                }
            }, {"oid": "def", "size": 3}]
        }"#;
        let batch: LfsBatchResponse = serde_json::from_str(body).unwrap();
        assert_eq!(batch.transfer.as_deref(), Some("multipart"));
        assert!(batch.objects[1].actions.is_none());

        let actions = batch.objects[0].actions.as_ref().unwrap();
        let upload = actions.upload.as_ref().unwrap();
        assert_eq!(
            multipart_urls(&upload.header),
            vec![(1, "https://s3/1"), (2, "https://s3/2"), (3, "https://s3/3")]
        );
        assert!(actions.verify.as_ref().unwrap().header.is_empty());
    }

    #[test]
    fn test_default_repo_name() {
        assert_eq!(
            default_repo_name(Path::new("runs/t5_small_ko_en_translation")).unwrap(),
            "t5_small_ko_en_translation"
        );
    }
}
