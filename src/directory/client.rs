//! Blocking HTTP client for the Directory.
//!
//! Each RPC method is a JSON POST to `<base_url>/<method>`. Node identity
//! and the shared secret come from the enclave file (`enc.json`) the
//! management plane deploys to every host.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::{
    Directory, DirectoryError, EndItem, PostponeItem, Result, ScheduleItem, ScheduledWindow,
};
use crate::types::RequestId;

/// Directory endpoint and node identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEndpoint {
    pub url: String,
    pub node: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Shape of the enclave file: `{"name": ..., "parameters": {...}}`.
#[derive(Debug, Deserialize)]
struct EncFile {
    name: String,
    parameters: EncParameters,
}

#[derive(Debug, Deserialize)]
struct EncParameters {
    #[serde(default)]
    directory_url: Option<String>,

    #[serde(default)]
    directory_password: Option<String>,
}

const DEFAULT_DIRECTORY_URL: &str = "https://directory.example.org/v2/api";

impl DirectoryEndpoint {
    /// Loads endpoint and identity from an enc.json file.
    pub fn from_enc_file(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read(path)?;
        let enc: EncFile = serde_json::from_slice(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(DirectoryEndpoint {
            url: enc
                .parameters
                .directory_url
                .unwrap_or_else(|| DEFAULT_DIRECTORY_URL.to_string()),
            node: enc.name,
            password: enc.parameters.directory_password,
        })
    }
}

pub struct DirectoryClient {
    endpoint: DirectoryEndpoint,
    http: reqwest::blocking::Client,
}

impl DirectoryClient {
    pub fn new(endpoint: DirectoryEndpoint) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| DirectoryError::permanent("client", e.to_string()))?;
        Ok(DirectoryClient { endpoint, http })
    }

    pub fn node(&self) -> &str {
        &self.endpoint.node
    }

    fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        call: &'static str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}/{}", self.endpoint.url.trim_end_matches('/'), call);
        let mut request = self.http.post(&url).json(body);
        if let Some(password) = &self.endpoint.password {
            request = request.basic_auth(&self.endpoint.node, Some(password));
        }
        let response = request.send().map_err(|e| {
            // Connection-level failures are worth retrying on the next run.
            DirectoryError::transient(call, e.to_string())
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(DirectoryError::transient(
                call,
                format!("HTTP {}", status.as_u16()),
            ));
        }
        if !status.is_success() {
            return Err(DirectoryError::permanent(
                call,
                format!("HTTP {}", status.as_u16()),
            ));
        }
        response
            .json()
            .map_err(|e| DirectoryError::permanent(call, format!("bad response body: {e}")))
    }
}

impl Directory for DirectoryClient {
    fn schedule_maintenance(
        &self,
        requests: &BTreeMap<RequestId, ScheduleItem>,
    ) -> Result<BTreeMap<RequestId, ScheduledWindow>> {
        self.post("schedule_maintenance", requests)
    }

    fn postpone_maintenance(&self, requests: &BTreeMap<RequestId, PostponeItem>) -> Result<()> {
        let _: serde_json::Value = self.post("postpone_maintenance", requests)?;
        Ok(())
    }

    fn end_maintenance(&self, requests: &BTreeMap<RequestId, EndItem>) -> Result<()> {
        let _: serde_json::Value = self.post("end_maintenance", requests)?;
        Ok(())
    }

    fn mark_node_service_status(&self, node: &str, in_service: bool) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            node: &'a str,
            in_service: bool,
        }
        let _: serde_json::Value =
            self.post("mark_node_service_status", &Body { node, in_service })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn endpoint_from_enc_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("enc.json");
        std::fs::write(
            &path,
            r#"{
                "name": "node00",
                "parameters": {
                    "directory_url": "https://directory.example.org/v2/api",
                    "directory_password": "secret"
                }
            }"#,
        )
        .unwrap();
        let endpoint = DirectoryEndpoint::from_enc_file(&path).unwrap();
        assert_eq!(endpoint.node, "node00");
        assert_eq!(endpoint.url, "https://directory.example.org/v2/api");
        assert_eq!(endpoint.password.as_deref(), Some("secret"));
    }

    #[test]
    fn endpoint_defaults_url_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("enc.json");
        std::fs::write(&path, r#"{"name": "node01", "parameters": {}}"#).unwrap();
        let endpoint = DirectoryEndpoint::from_enc_file(&path).unwrap();
        assert_eq!(endpoint.url, DEFAULT_DIRECTORY_URL);
        assert_eq!(endpoint.password, None);
    }

    #[test]
    fn endpoint_rejects_malformed_enc() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("enc.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(DirectoryEndpoint::from_enc_file(&path).is_err());
    }
}
