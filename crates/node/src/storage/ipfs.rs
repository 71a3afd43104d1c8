//! Thin client for the IPFS daemon HTTP API. The daemon is an external
//! collaborator; this client only covers the calls the node makes.

use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;

#[derive(Clone)]
pub struct IpfsClient {
    api_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpfsStat {
    #[serde(rename = "Type")]
    pub object_type: String,
    #[serde(rename = "CumulativeSize")]
    pub cumulative_size: u64,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

impl IpfsClient {
    pub fn new(api_url: &str) -> Self {
        IpfsClient {
            api_url: api_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v0/{path}", self.api_url)
    }

    /// Adds a block and returns its CID. `only_hash` computes the CID
    /// without persisting, which is how fetched IPFS content is verified
    /// against its expected hash.
    pub async fn add_bytes(
        &self,
        content: Vec<u8>,
        cid_version: u64,
        only_hash: bool,
    ) -> anyhow::Result<String> {
        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(content));
        let response: AddResponse = self
            .http
            .post(self.endpoint(&format!(
                "add?cid-version={cid_version}&only-hash={only_hash}"
            )))
            .multipart(form)
            .send()
            .await
            .context("ipfs add request")?
            .error_for_status()
            .context("ipfs add")?
            .json()
            .await
            .context("decoding ipfs add response")?;
        Ok(response.hash)
    }

    pub async fn cat(&self, cid: &str, timeout: Duration) -> anyhow::Result<Vec<u8>> {
        let response = self
            .http
            .post(self.endpoint(&format!("cat?arg={cid}")))
            .timeout(timeout)
            .send()
            .await
            .context("ipfs cat request")?
            .error_for_status()
            .context("ipfs cat")?;
        Ok(response.bytes().await.context("reading ipfs cat body")?.to_vec())
    }

    /// Lazy byte stream of a large object.
    pub async fn cat_stream(
        &self,
        cid: &str,
    ) -> anyhow::Result<impl Stream<Item = reqwest::Result<Bytes>>> {
        let response = self
            .http
            .post(self.endpoint(&format!("cat?arg={cid}")))
            .send()
            .await
            .context("ipfs cat request")?
            .error_for_status()
            .context("ipfs cat")?;
        Ok(response.bytes_stream())
    }

    pub async fn files_stat(&self, cid: &str, timeout: Duration) -> anyhow::Result<IpfsStat> {
        let stat = self
            .http
            .post(self.endpoint(&format!("files/stat?arg=/ipfs/{cid}")))
            .timeout(timeout)
            .send()
            .await
            .context("ipfs stat request")?
            .error_for_status()
            .context("ipfs stat")?
            .json()
            .await
            .context("decoding ipfs stat response")?;
        Ok(stat)
    }

    pub async fn pin_add(&self, cid: &str, timeout: Duration) -> anyhow::Result<()> {
        self.http
            .post(self.endpoint(&format!("pin/add?arg={cid}&recursive=true")))
            .timeout(timeout)
            .send()
            .await
            .context("ipfs pin add request")?
            .error_for_status()
            .context("ipfs pin add")?;
        Ok(())
    }

    /// Unpins a CID. "Not pinned" is not an error: the pin may have been
    /// removed by an operator or never created.
    pub async fn pin_rm(&self, cid: &str) -> anyhow::Result<()> {
        let response = self
            .http
            .post(self.endpoint(&format!("pin/rm?arg={cid}")))
            .send()
            .await
            .context("ipfs pin rm request")?;
        if response.status().is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if body.contains("not pinned") {
            tracing::debug!(cid, "pin already absent");
            return Ok(());
        }
        anyhow::bail!("ipfs pin rm failed: {body}");
    }

    pub async fn repo_gc(&self) -> anyhow::Result<()> {
        self.http
            .post(self.endpoint("repo/gc"))
            .send()
            .await
            .context("ipfs repo gc request")?
            .error_for_status()
            .context("ipfs repo gc")?;
        Ok(())
    }
}
