//! Remote HTTP client to one compute server (C1).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::error::{ComputeError, Result};

/// Compute id reserved for the in-process compute; biases capture placement.
pub const LOCAL_COMPUTE_ID: &str = "local";

/// Tunable behavior of a [`ComputeClient`], independent of any config-file
/// loading layer (out of scope for this crate).
#[derive(Debug, Clone)]
pub struct ComputeClientConfig {
    /// Default request timeout for GET/DELETE/short POSTs.
    pub default_timeout: Duration,
}

impl Default for ComputeClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// One network interface reported by a compute, used for subnet negotiation.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ComputeInterface {
    pub ip_address: std::net::IpAddr,
    pub netmask: std::net::IpAddr,
}

fn same_subnet(a: &ComputeInterface, b: &ComputeInterface) -> bool {
    match (a.ip_address, a.netmask, b.ip_address) {
        (std::net::IpAddr::V4(ip_a), std::net::IpAddr::V4(mask), std::net::IpAddr::V4(ip_b)) => {
            let mask = u32::from(mask);
            u32::from(ip_a) & mask == u32::from(ip_b) & mask
        }
        _ => false,
    }
}

/// Remote HTTP client for a single compute server. Reuses one
/// `reqwest::Client` across calls (connection pool = "one logical session").
#[derive(Debug, Clone)]
pub struct ComputeClient {
    id: String,
    host: String,
    http: reqwest::Client,
    config: ComputeClientConfig,
}

impl ComputeClient {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Arc<Self> {
        Self::with_config(id, host, ComputeClientConfig::default())
    }

    pub fn with_config(
        id: impl Into<String>,
        host: impl Into<String>,
        config: ComputeClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            host: host.into(),
            http: reqwest::Client::new(),
            config,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_local(&self) -> bool {
        self.id == LOCAL_COMPUTE_ID
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .timeout(self.config.default_timeout)
            .send()
            .await?;
        Self::decode(resp).await
    }

    #[instrument(level = "debug", skip(self, body))]
    pub async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&B>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let mut req = self
            .http
            .post(self.url(path))
            .timeout(timeout.unwrap_or(self.config.default_timeout));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        Self::decode(resp).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn delete(&self, path: &str, timeout: Option<Duration>) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(path))
            .timeout(timeout.unwrap_or(self.config.default_timeout))
            .send()
            .await?;
        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(ComputeError::from_status(status, body))
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ComputeError::from_status(status, body));
        }
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Lazy, finite, non-restartable byte stream of a file under the
    /// compute's project-scoped filesystem.
    #[instrument(level = "debug", skip(self))]
    pub async fn stream_file(
        &self,
        project_id: &str,
        relative_path: &str,
    ) -> Result<impl Stream<Item = Result<Bytes>> + Send + 'static> {
        let url = self.url(&format!(
            "/projects/{project_id}/files/{relative_path}",
        ));
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ComputeError::from_status(status, body));
        }
        Ok(futures::StreamExt::map(resp.bytes_stream(), |chunk| {
            chunk.map_err(ComputeError::from)
        }))
    }

    /// Given another compute, return `(self_ip, other_ip)` such that a UDP
    /// packet from one reaches the other. Resolved by comparing each
    /// compute's reported interfaces and picking a pair that share a subnet.
    #[instrument(level = "debug", skip(self, other))]
    pub async fn get_ip_on_same_subnet(
        &self,
        other: &ComputeClient,
    ) -> Result<(std::net::IpAddr, std::net::IpAddr)> {
        let my_ifaces: Vec<ComputeInterface> = self.get("/interfaces").await?;
        let other_ifaces: Vec<ComputeInterface> = other.get("/interfaces").await?;

        for mine in &my_ifaces {
            for theirs in &other_ifaces {
                if same_subnet(mine, theirs) {
                    debug!(
                        self_ip = %mine.ip_address,
                        other_ip = %theirs.ip_address,
                        "found mutually routable subnet"
                    );
                    return Ok((mine.ip_address, theirs.ip_address));
                }
            }
        }
        Err(ComputeError::Conflict(format!(
            "no mutually routable subnet between compute {} and compute {}",
            self.id, other.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_subnet_matches_within_mask() {
        let a = ComputeInterface {
            ip_address: "10.0.0.1".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
        };
        let b = ComputeInterface {
            ip_address: "10.0.0.2".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
        };
        assert!(same_subnet(&a, &b));
    }

    #[test]
    fn same_subnet_rejects_different_networks() {
        let a = ComputeInterface {
            ip_address: "10.0.0.1".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
        };
        let b = ComputeInterface {
            ip_address: "10.0.1.2".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
        };
        assert!(!same_subnet(&a, &b));
    }

    #[test]
    fn local_compute_id_is_recognized() {
        let c = ComputeClient::new(LOCAL_COMPUTE_ID, "http://127.0.0.1:8000");
        assert!(c.is_local());
    }
}
