//! Tokio binding for the shoal client core: a TCP (optionally TLS)
//! connector, DNS-SRV bootstrap expansion, the HTTP cluster-config
//! stream, and a `connect` facade tying them together. For example:
//!
//! ```ignore
//! use shoal_tokio::{connect, ClusterOptions};
//!
//! let options = ClusterOptions::new("app", "secret");
//! let cluster = connect("shoal://db1.example.com/travel", options).await?;
//! let bucket = cluster.bucket("travel").await?;
//! ```

pub mod config_stream;
pub mod dns;

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use shoal_core::connstr::ConnectionString;
use shoal_core::error::Error;

pub use shoal_core::bucket::{Bucket, BucketType, CollectionRef};
pub use shoal_core::cluster::ClusterContext;
pub use shoal_core::connection::{Connector, Endpoint};
pub use shoal_core::options::{ClusterOptions, NetworkResolution, ServiceType};
pub use shoal_core::pool::PoolOptions;

use config_stream::ConfigStream;

/// Dials plain TCP, or TLS when built with the `tls` feature and
/// configured with a client config.
pub struct TcpConnector {
    connect_timeout: Duration,
    #[cfg(feature = "tls")]
    tls: Option<Arc<tokio_rustls::rustls::ClientConfig>>,
}

impl TcpConnector {
    pub fn new() -> Self {
        TcpConnector {
            connect_timeout: Duration::from_secs(10),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Use the webpki root store for server verification.
    #[cfg(feature = "tls")]
    pub fn with_default_tls(mut self) -> Self {
        let mut roots = tokio_rustls::rustls::RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
            tokio_rustls::rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                anchor.subject,
                anchor.spki,
                anchor.name_constraints,
            )
        }));
        let config = tokio_rustls::rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        self.tls = Some(Arc::new(config));
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        TcpConnector::new()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type IO = MaybeTlsStream;

    async fn connect(&self, endpoint: &Endpoint) -> Result<MaybeTlsStream, Error> {
        let address = (endpoint.host.as_str(), endpoint.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", endpoint),
                ))
            })??;
        stream.set_nodelay(true)?;
        tracing::debug!(endpoint = %endpoint, "tcp connection established");

        #[cfg(feature = "tls")]
        if let Some(config) = &self.tls {
            let server_name = tokio_rustls::rustls::ServerName::try_from(endpoint.host.as_str())
                .map_err(|_| {
                    Error::InvalidConnectionString(format!(
                        "'{}' is not a valid TLS server name",
                        endpoint.host
                    ))
                })?;
            let connector = tokio_rustls::TlsConnector::from(config.clone());
            let tls = connector.connect(server_name, stream).await?;
            return Ok(MaybeTlsStream::Tls(Box::new(tls)));
        }

        Ok(MaybeTlsStream::Plain(stream))
    }
}

/// A stream that is either plain TCP or TLS over TCP.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A connected cluster: the context plus the per-bucket config streams
/// feeding it.
pub struct Cluster {
    context: Arc<ClusterContext<TcpConnector>>,
    options: ClusterOptions,
    http_hosts: Vec<String>,
    streams: std::sync::Mutex<StreamSet>,
}

struct StreamSet {
    buckets: HashSet<String>,
    shutdowns: Vec<CancellationToken>,
}

/// Resolve the connection string (expanding DNS-SRV when eligible),
/// bootstrap the cluster context, and kick off the version probe.
pub async fn connect(connection_string: &str, options: ClusterOptions) -> Result<Cluster, Error> {
    let connstr = ConnectionString::parse(connection_string)?;
    let mut options = if connstr.tls && !options.tls_enabled {
        options.with_tls(true)
    } else {
        options
    };
    if let Some(network) = connstr.params.get("network") {
        options.network_resolution = match network.as_str() {
            "default" => NetworkResolution::Default,
            "external" => NetworkResolution::External,
            "auto" => NetworkResolution::Auto,
            other => {
                return Err(Error::InvalidConnectionString(format!(
                    "unknown network resolution '{}'",
                    other
                )));
            }
        };
    }

    let mut endpoints: Vec<Endpoint> = Vec::new();
    if let Some(srv_name) = connstr.srv_name() {
        match dns::resolve_srv(&srv_name).await {
            Ok(records) if !records.is_empty() => {
                tracing::debug!(name = %srv_name, records = records.len(), "bootstrap list from DNS-SRV");
                endpoints = records
                    .into_iter()
                    .map(|(host, port)| Endpoint::new(host, port))
                    .collect();
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(name = %srv_name, error = %err, "DNS-SRV lookup failed, using hosts verbatim");
            }
        }
    }
    if endpoints.is_empty() {
        endpoints = connstr
            .bootstrap_endpoints(options.kv_port)
            .into_iter()
            .map(|(host, port)| Endpoint::new(host, port))
            .collect();
    }

    #[allow(unused_mut)]
    let mut connector = TcpConnector::new();
    #[cfg(feature = "tls")]
    {
        if options.tls_enabled {
            connector = connector.with_default_tls();
        }
    }
    #[cfg(not(feature = "tls"))]
    {
        if options.tls_enabled {
            tracing::warn!("TLS requested but this build lacks the 'tls' feature; connecting in plaintext");
        }
    }

    let context = ClusterContext::new(connector, options.clone());
    context
        .bootstrap(endpoints.clone(), &CancellationToken::new())
        .await?;

    let http_hosts: Vec<String> = endpoints
        .iter()
        .map(|endpoint| endpoint.host.clone())
        .collect();

    let cluster = Cluster {
        context,
        options,
        http_hosts,
        streams: std::sync::Mutex::new(StreamSet {
            buckets: HashSet::new(),
            shutdowns: Vec::new(),
        }),
    };
    cluster.spawn_version_probe();

    if let Some(bucket) = &connstr.bucket {
        cluster.bucket(bucket).await?;
    }
    Ok(cluster)
}

impl Cluster {
    pub fn context(&self) -> &Arc<ClusterContext<TcpConnector>> {
        &self.context
    }

    /// Open (or return) a bucket and make sure its config stream runs.
    pub async fn bucket(&self, name: &str) -> Result<Arc<Bucket<TcpConnector>>, Error> {
        let bucket = self
            .context
            .get_or_create_bucket(name, &CancellationToken::new())
            .await?;

        if self.options.enable_config_polling {
            let mut streams = match self.streams.lock() {
                Ok(streams) => streams,
                Err(poisoned) => poisoned.into_inner(),
            };
            if streams.buckets.insert(name.to_string()) {
                let shutdown = CancellationToken::new();
                streams.shutdowns.push(shutdown.clone());
                ConfigStream::new(
                    self.http_hosts.clone(),
                    name,
                    &self.options,
                    self.context.config_publisher(),
                    shutdown,
                )
                .spawn();
            }
        }
        Ok(bucket)
    }

    /// Stop the config streams and dispose every node.
    pub async fn shutdown(&self) {
        let shutdowns = {
            let mut streams = match self.streams.lock() {
                Ok(streams) => streams,
                Err(poisoned) => poisoned.into_inner(),
            };
            streams.buckets.clear();
            std::mem::take(&mut streams.shutdowns)
        };
        for shutdown in shutdowns {
            shutdown.cancel();
        }
        self.context.shutdown().await;
    }

    fn spawn_version_probe(&self) {
        let context = self.context.clone();
        let hosts = self.http_hosts.clone();
        let options = self.options.clone();
        tokio::spawn(async move {
            if let Some(version) =
                config_stream::probe_cluster_version(&hosts, &options).await
            {
                tracing::debug!(version = %version, "cluster compatibility version");
                context.set_cluster_version(version);
            }
        });
    }
}
