//! The HTTP config stream: `GET /pools/default/bs/<bucket>` emits one
//! JSON cluster config per line (blank lines are keepalives), with
//! `$HOST` standing for the queried host. Endpoints are tried in turn;
//! when the whole list fails the stream backs off before the next sweep.

use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use shoal_core::config::BucketConfig;
use shoal_core::error::Error;
use shoal_core::node::{ConfigEvent, ConfigOrigin, ConfigPublisher};
use shoal_core::options::ClusterOptions;

const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// The reconnect backoff: immediate, then growing tenfold per failed
/// sweep, capped at ten seconds.
#[derive(Debug)]
pub(crate) struct SweepBackoff {
    next: Duration,
}

impl SweepBackoff {
    pub(crate) fn new() -> Self {
        SweepBackoff {
            next: Duration::from_millis(0),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.next = Duration::from_millis(0);
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = if current.is_zero() {
            Duration::from_secs(1)
        } else {
            (current * 10).min(BACKOFF_CAP)
        };
        current
    }
}

/// Split completed lines out of the receive buffer, leaving any partial
/// line in place.
pub(crate) fn drain_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(position) = buffer.iter().position(|byte| *byte == b'\n') {
        let mut line: Vec<u8> = buffer.drain(..=position).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if !line.iter().all(|byte| byte.is_ascii_whitespace()) {
            lines.push(line);
        }
    }
    lines
}

pub struct ConfigStream {
    hosts: Vec<String>,
    port: u16,
    tls: bool,
    bucket: String,
    username: String,
    password: String,
    publisher: ConfigPublisher,
    shutdown: CancellationToken,
}

impl ConfigStream {
    pub fn new(
        hosts: Vec<String>,
        bucket: &str,
        options: &ClusterOptions,
        publisher: ConfigPublisher,
        shutdown: CancellationToken,
    ) -> Self {
        ConfigStream {
            hosts,
            port: options.bootstrap_http_port,
            tls: options.tls_enabled,
            bucket: bucket.to_string(),
            username: options.username.clone(),
            password: options.password.clone(),
            publisher,
            shutdown,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let client = reqwest::Client::new();
        let mut backoff = SweepBackoff::new();
        loop {
            let mut streamed = false;
            for host in &self.hosts {
                if self.shutdown.is_cancelled() {
                    return;
                }
                match self.stream_from(&client, host).await {
                    Ok(()) => {
                        // the stream ran and ended (node restart or
                        // shutdown); start a fresh sweep promptly
                        streamed = true;
                    }
                    Err(err) => {
                        tracing::debug!(
                            host = %host,
                            bucket = %self.bucket,
                            error = %err,
                            "config stream endpoint failed"
                        );
                    }
                }
            }
            if self.shutdown.is_cancelled() {
                return;
            }
            if streamed {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => return,
                }
            }
        }
    }

    async fn stream_from(&self, client: &reqwest::Client, host: &str) -> Result<(), Error> {
        let scheme = if self.tls { "https" } else { "http" };
        let url = format!(
            "{}://{}:{}/pools/default/bs/{}",
            scheme, host, self.port, self.bucket
        );
        let response = client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(into_io_error)?;
        if !response.status().is_success() {
            return Err(Error::InvalidConfig(format!(
                "config stream for '{}' answered {}",
                self.bucket,
                response.status()
            )));
        }
        tracing::debug!(host = %host, bucket = %self.bucket, "config stream connected");

        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                _ = self.shutdown.cancelled() => return Ok(()),
            };
            let chunk = match chunk {
                Some(chunk) => chunk.map_err(into_io_error)?,
                None => return Ok(()),
            };
            buffer.extend_from_slice(&chunk);
            for line in drain_lines(&mut buffer) {
                match BucketConfig::parse(&line, host) {
                    Ok(config) => {
                        let _ = self.publisher.send(ConfigEvent {
                            config,
                            origin: ConfigOrigin::Stream,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(
                            host = %host,
                            bucket = %self.bucket,
                            error = %err,
                            "dropping malformed streamed config"
                        );
                    }
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct PoolsResponse {
    #[serde(default)]
    nodes: Vec<PoolsNode>,
}

#[derive(Debug, Deserialize)]
struct PoolsNode {
    #[serde(default)]
    version: String,
}

/// The cluster compatibility version is the minimum version across
/// nodes, read from `/pools/default`.
pub async fn probe_cluster_version(hosts: &[String], options: &ClusterOptions) -> Option<String> {
    let client = reqwest::Client::new();
    let scheme = if options.tls_enabled { "https" } else { "http" };
    for host in hosts {
        let url = format!("{}://{}:{}/pools/default", scheme, host, options.bootstrap_http_port);
        let response = match client
            .get(&url)
            .basic_auth(&options.username, Some(&options.password))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            _ => continue,
        };
        let raw = match response.bytes().await {
            Ok(raw) => raw,
            Err(_) => continue,
        };
        if let Some(version) = min_version(&raw) {
            return Some(version);
        }
    }
    None
}

pub(crate) fn min_version(raw: &[u8]) -> Option<String> {
    let pools: PoolsResponse = serde_json::from_slice(raw).ok()?;
    pools
        .nodes
        .into_iter()
        .map(|node| node.version)
        .filter(|version| !version.is_empty())
        .min()
}

fn into_io_error(err: reqwest::Error) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        err.to_string(),
    ))
}
