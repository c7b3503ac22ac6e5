use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
    /// Leading path segment for every key this tool writes, e.g. `pmn`
    pub key_prefix: String,
    /// Public host used to build download links, e.g. `https://maps.example.org`
    pub public_base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            bucket: "survey".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
            key_prefix: "pmn".to_string(),
            public_base_url: "http://localhost:9000".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: Some(endpoint.clone()),
            bucket: bucket.into(),
            path_style: true,
            public_base_url: endpoint,
            ..Self::default()
        }
    }

    /// Public download link for an object key
    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.public_base_url.trim_end_matches('/'),
            self.bucket,
            key.trim_start_matches('/')
        )
    }
}
