//! Latency probing through a core instance
//!
//! Issues an HTTP GET over a connection dialed by the instance itself, so the
//! measured time covers the whole proxy path.

use crate::config::CoreConfig;
use crate::engine::{CoreEngine, CoreInstance, ProxyConnection};
use crate::common::net::Destination;
use crate::{Error, Phase, Result};
use bytes::Bytes;
use http::header::{CONNECTION, HOST, USER_AGENT};
use http::{Request, StatusCode};
use http_body_util::Empty;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};
use url::Url;

/// Probe target used when the caller passes an empty URL
pub const DEFAULT_PROBE_URL: &str = "https://www.google.com/generate_204";

/// Delay reported to the host when a probe fails
pub const DELAY_FAILED: i64 = -1;

/// Probe timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTimeouts {
    /// Dial and TLS handshake, each
    pub handshake: Duration,
    /// Whole request
    pub overall: Duration,
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        ProbeTimeouts {
            handshake: Duration::from_secs(6),
            overall: Duration::from_secs(12),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProbeTarget {
    tls: bool,
    host: String,
    port: u16,
    authority: String,
    path: String,
}

impl ProbeTarget {
    fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| Error::address(format!("{}: {}", raw, e)))?;
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(Error::address(format!("unsupported scheme: {}", other))),
        };
        let host_str = url
            .host_str()
            .ok_or_else(|| Error::address(format!("missing host in {}", raw)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::address(format!("missing port in {}", raw)))?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host_str, port),
            None => host_str.to_string(),
        };
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        Ok(ProbeTarget {
            tls,
            host: host_str.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            authority,
            path,
        })
    }
}

fn tls_connector() -> TlsConnector {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn probe(
    instance: &dyn CoreInstance,
    target: &ProbeTarget,
    handshake: Duration,
) -> Result<StatusCode> {
    let dest = Destination::tcp(target.host.as_str(), target.port);
    let conn = timeout(handshake, instance.dial(&dest))
        .await
        .map_err(|_| Error::timeout(format!("dial {} timed out", dest)))??;

    let conn: Box<dyn ProxyConnection> = if target.tls {
        let server_name: ServerName<'static> = target
            .host
            .clone()
            .try_into()
            .map_err(|_| Error::tls(format!("invalid server name: {}", target.host)))?;
        let stream = timeout(handshake, tls_connector().connect(server_name, conn))
            .await
            .map_err(|_| Error::timeout(format!("TLS handshake with {} timed out", target.host)))?
            .map_err(|e| Error::tls(format!("TLS handshake failed: {}", e)))?;
        Box::new(stream)
    } else {
        conn
    };

    let (mut sender, connection) = http1::handshake(TokioIo::new(conn))
        .await
        .map_err(|e| Error::connection(format!("HTTP handshake failed: {}", e)))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            trace!("Probe connection ended: {}", e);
        }
    });

    let request = Request::get(target.path.as_str())
        .header(HOST, target.authority.as_str())
        .header(USER_AGENT, concat!("libv2ray-mobile/", env!("CARGO_PKG_VERSION")))
        .header(CONNECTION, "close")
        .body(Empty::<Bytes>::new())
        .map_err(|e| Error::parse(format!("invalid probe request: {}", e)))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| Error::connection(format!("HTTP request failed: {}", e)))?;
    Ok(response.status())
}

/// Time an HTTP GET of `url` (empty: [`DEFAULT_PROBE_URL`]) through `instance`.
///
/// Succeeds with elapsed milliseconds only on 200 or 204.
pub async fn measure_instance_delay(
    instance: &dyn CoreInstance,
    url: &str,
    timeouts: ProbeTimeouts,
) -> Result<i64> {
    let url = if url.is_empty() { DEFAULT_PROBE_URL } else { url };
    let target = ProbeTarget::parse(url)?;

    let start = Instant::now();
    let status = timeout(timeouts.overall, probe(instance, &target, timeouts.handshake))
        .await
        .map_err(|_| Error::timeout(format!("probe {} exceeded {:?}", url, timeouts.overall)))??;

    if status != StatusCode::OK && status != StatusCode::NO_CONTENT {
        return Err(Error::status(status.to_string()));
    }
    let elapsed = start.elapsed().as_millis() as i64;
    debug!("Probe {} took {}ms", url, elapsed);
    Ok(elapsed)
}

/// Build a temporary instance from `config_json` (inbounds stripped), probe
/// through it, then close it
pub fn measure_outbound_delay(engine: &dyn CoreEngine, config_json: &str, url: &str) -> Result<i64> {
    let mut config = CoreConfig::from_str(config_json).map_err(|e| e.in_phase(Phase::ConfigLoad))?;
    config.inbounds.clear();

    let instance = engine
        .new_instance(config)
        .map_err(|e| e.in_phase(Phase::CoreInit))?;
    if let Err(e) = instance.start() {
        if let Err(close_err) = instance.close() {
            warn!("Failed to close probe instance: {}", close_err);
        }
        return Err(e.in_phase(Phase::Startup));
    }

    let result = block_on(measure_instance_delay(
        instance.as_ref(),
        url,
        ProbeTimeouts::default(),
    ));
    if let Err(e) = instance.close() {
        warn!("Failed to close probe instance: {}", e);
    }
    result?
}

/// Flatten a probe result for the host: the delay, or [`DELAY_FAILED`]
pub fn delay_or_failed(result: Result<i64>) -> i64 {
    match result {
        Ok(ms) => ms,
        Err(e) => {
            warn!("Delay probe failed: {}", e);
            DELAY_FAILED
        }
    }
}

/// Run a future to completion on a fresh current-thread runtime.
///
/// Fails with `Error::Runtime` on a thread already driving a runtime.
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(Error::runtime(
            "blocking probe called inside an async runtime, use the async variant",
        ));
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(future))
}
