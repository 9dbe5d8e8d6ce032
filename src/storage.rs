//! Storage summary and folder listing endpoints.
//!
//! Response bodies are decoded leniently: every field is optional and counts
//! may arrive either as JSON numbers or as numeric strings.

use http::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Number;
use tracing::debug;

use crate::error::Error;
use crate::request::ExecuteRequest;
use crate::service::{Dispatched, ServiceClient};
use crate::util::{append_query, redact_uri_for_logs};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FolderInfo {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub repo: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub created: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_modified: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub modified_by: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_updated: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FolderInfoChild>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FolderInfoChild {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(skip_serializing_if = "is_false")]
    pub folder: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileList {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub created: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileListEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileListEntry {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_number"
    )]
    pub size: Option<Number>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_modified: String,
    #[serde(skip_serializing_if = "is_false")]
    pub folder: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageInfo {
    pub binaries_summary: BinariesSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub repositories_summary_list: Vec<RepositorySummary>,
    pub file_store_summary: FileStoreSummary,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BinariesSummary {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub binaries_count: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub binaries_size: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub artifacts_size: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub optimization: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub items_count: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub artifacts_count: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepositorySummary {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub repo_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub repo_type: String,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_number"
    )]
    pub folders_count: Option<Number>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_number"
    )]
    pub files_count: Option<Number>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub used_space: String,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_number"
    )]
    pub used_space_in_bytes: Option<Number>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_number"
    )]
    pub items_count: Option<Number>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileStoreSummary {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub storage_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub storage_directory: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub total_space: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub used_space: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub free_space: String,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(Number),
    String(String),
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<Number>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(number)) => Ok(Some(number)),
        Some(NumberOrString::String(text)) if text.trim().is_empty() => Ok(None),
        Some(NumberOrString::String(text)) => text
            .trim()
            .parse::<Number>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Query options of a file list request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileListParams {
    pub deep: bool,
    pub depth: Option<u32>,
    pub list_folders: bool,
    pub md_timestamps: bool,
    pub include_root_path: bool,
}

impl FileListParams {
    fn query(&self) -> Vec<(&'static str, Option<String>)> {
        let flag = |value: bool| Some(u8::from(value).to_string());
        let mut params = vec![("list", None), ("deep", flag(self.deep))];
        if let Some(depth) = self.depth {
            params.push(("depth", Some(depth.to_string())));
        }
        params.push(("listFolders", flag(self.list_folders)));
        params.push(("mdTimestamps", flag(self.md_timestamps)));
        params.push(("includeRootPath", flag(self.include_root_path)));
        params
    }
}

/// Storage endpoints of the service.
#[derive(Clone, Debug)]
pub struct StorageService {
    client: ServiceClient,
}

impl StorageService {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ServiceClient {
        &self.client
    }

    /// Last calculated storage summary.
    pub async fn storage_info(&self) -> crate::Result<StorageInfo> {
        self.client
            .fetch(ExecuteRequest::get("api/storageinfo"))
            .await?
            .json()
    }

    /// Asks the service to refresh its storage summary. Skipped in dry-run
    /// mode; returns whether the request was actually sent.
    pub async fn calculate_storage_info(&self) -> crate::Result<bool> {
        match self
            .client
            .send(ExecuteRequest::post("api/storageinfo/calculate"))
            .await?
        {
            Dispatched::DryRun { .. } => Ok(false),
            Dispatched::Sent(response) => {
                if response.status() != StatusCode::ACCEPTED {
                    debug!(
                        status = response.status().as_u16(),
                        "storage calculation answered without 202"
                    );
                }
                Ok(true)
            }
        }
    }

    /// Folder metadata and direct children of `path` (`repo/dir/...`).
    pub async fn folder_info(&self, path: &str) -> crate::Result<FolderInfo> {
        let url = self.storage_url(path)?;
        self.client.fetch(ExecuteRequest::get(url)).await?.json()
    }

    pub async fn file_list(&self, path: &str, params: FileListParams) -> crate::Result<FileList> {
        let url = append_query(&self.storage_url(path)?, &params.query());
        self.client.fetch(ExecuteRequest::get(url)).await?.json()
    }

    fn storage_url(&self, path: &str) -> crate::Result<String> {
        let base_url = self.client.base_url();
        let invalid = || Error::InvalidUri {
            uri: redact_uri_for_logs(base_url),
        };
        let mut url = url::Url::parse(base_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(["api", "storage"])
            .extend(path.split('/').filter(|segment| !segment.is_empty()));
        Ok(url.to_string())
    }
}
