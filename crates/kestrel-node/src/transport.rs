//! Peer delivery over HTTP: every envelope is POSTed to `/consensus/message`.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use kestrel_consensus::Transport;
use kestrel_core::Address;
use reqwest::header::CONTENT_TYPE;
use tokio::runtime::Handle;
use tracing::{debug, warn};

pub const MESSAGE_PATH: &str = "/consensus/message";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Fire-and-forget transport: each delivery runs in its own task
pub struct HttpTransport {
    client: reqwest::Client,
    peers: HashMap<Address, String>,
    runtime: Handle,
}

impl HttpTransport {
    /// `peers` maps every validator, ourselves included, to its base URL.
    /// Must be called inside a Tokio runtime.
    pub fn new(peers: HashMap<Address, String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        let runtime = Handle::try_current().context("transport needs a Tokio runtime")?;
        Ok(HttpTransport {
            client,
            peers,
            runtime,
        })
    }

    fn post(&self, to: Address, base: &str, payload: Vec<u8>) {
        let url = format!("{}{}", base, MESSAGE_PATH);
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(payload);
        self.runtime.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    debug!(peer = %to, status = %response.status(), "Peer rejected message");
                }
                Err(e) => warn!(peer = %to, "Failed to reach peer: {}", e),
            }
        });
    }
}

impl Transport for HttpTransport {
    fn broadcast(&self, payload: Vec<u8>) {
        for (address, base) in &self.peers {
            self.post(*address, base, payload.clone());
        }
    }

    fn send(&self, to: &Address, payload: Vec<u8>) {
        match self.peers.get(to) {
            Some(base) => self.post(*to, base, payload),
            None => warn!(peer = %to, "No endpoint for peer, dropping message"),
        }
    }
}
