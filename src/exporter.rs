//! Prometheus Exporter
//!
//! Mirrors [`CacheStats`] into a dedicated registry and serves it over
//! HTTP together with a liveness endpoint.
//!
//! # Endpoints
//!
//! - `/metrics` - Prometheus text format
//! - `/healthz`, `/livez` - `ok` while the maintenance task is running

use std::convert::Infallible;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::{CacheManager, CacheStats};
use crate::error::{Error, Result};

const NAMESPACE: &str = "tiercache";

fn registry_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registry error: {}", e))
}

/// Cache statistics as Prometheus collectors
pub struct CacheExporter {
    registry: Registry,

    lookups: IntCounterVec,
    puts: IntCounter,
    put_failures: IntCounter,
    evictions: IntCounter,
    disk_healed: IntCounter,
    promotions: IntCounter,
    prefetches: IntCounterVec,
    cleanup_runs: IntCounter,
    cleanup_removed: IntCounter,

    hit_rate: Gauge,
    l2_read_latency: Gauge,
    memory_entries: IntGauge,
    memory_capacity: IntGauge,
    bitmap_bytes: IntGauge,
    bitmap_capacity: IntGauge,
    disk_bytes: IntGauge,
    disk_capacity: IntGauge,
}

impl CacheExporter {
    /// Create the collectors and register them in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
                .map_err(registry_error)?;
            registry.register(Box::new(c.clone())).map_err(registry_error)?;
            Ok(c)
        };
        let counter_vec = |name: &str, help: &str, label: &str| -> Result<IntCounterVec> {
            let c = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), &[label])
                .map_err(registry_error)?;
            registry.register(Box::new(c.clone())).map_err(registry_error)?;
            Ok(c)
        };
        let int_gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let g = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))
                .map_err(registry_error)?;
            registry.register(Box::new(g.clone())).map_err(registry_error)?;
            Ok(g)
        };
        let gauge = |name: &str, help: &str| -> Result<Gauge> {
            let g = Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))
                .map_err(registry_error)?;
            registry.register(Box::new(g.clone())).map_err(registry_error)?;
            Ok(g)
        };

        Ok(Self {
            lookups: counter_vec("lookups_total", "Cache lookups by outcome", "result")?,
            puts: counter("puts_total", "Values written through both tiers")?,
            put_failures: counter("put_failures_total", "Writes rejected by the disk tier")?,
            evictions: counter("evictions_total", "Entries evicted for capacity")?,
            disk_healed: counter(
                "disk_healed_total",
                "Corrupted or unreadable disk entries deleted",
            )?,
            promotions: counter("promotions_total", "Disk hits promoted to memory")?,
            prefetches: counter_vec("prefetch_total", "Prefetched keys by outcome", "outcome")?,
            cleanup_runs: counter("cleanup_runs_total", "Disk cleanup sweeps")?,
            cleanup_removed: counter("cleanup_removed_total", "Entries removed by cleanup")?,
            hit_rate: gauge("hit_rate", "Hits over all lookups")?,
            l2_read_latency: gauge(
                "l2_read_latency_seconds",
                "Smoothed disk tier read latency",
            )?,
            memory_entries: int_gauge("memory_entries", "Objects held in memory")?,
            memory_capacity: int_gauge("memory_capacity_entries", "Memory tier capacity")?,
            bitmap_bytes: int_gauge("bitmap_bytes", "Bytes held by the bitmap tier")?,
            bitmap_capacity: int_gauge("bitmap_capacity_bytes", "Bitmap tier byte budget")?,
            disk_bytes: int_gauge("disk_bytes", "Bytes held by the disk tier")?,
            disk_capacity: int_gauge("disk_capacity_bytes", "Disk tier byte budget")?,
            registry,
        })
    }

    /// Copy a stats snapshot into the collectors
    pub fn update(&self, stats: &CacheStats) {
        advance(&self.lookups.with_label_values(&["l1_hit"]), stats.l1_hits);
        advance(&self.lookups.with_label_values(&["l2_hit"]), stats.l2_hits);
        advance(&self.lookups.with_label_values(&["miss"]), stats.misses);
        advance(&self.puts, stats.puts);
        advance(&self.put_failures, stats.put_failures);
        advance(&self.evictions, stats.evictions);
        advance(&self.disk_healed, stats.disk_healed);
        advance(&self.promotions, stats.promotions);
        advance(
            &self.prefetches.with_label_values(&["succeeded"]),
            stats.prefetch_succeeded,
        );
        advance(
            &self.prefetches.with_label_values(&["failed"]),
            stats.prefetch_failed,
        );
        advance(&self.cleanup_runs, stats.cleanup_runs);
        advance(&self.cleanup_removed, stats.cleanup_removed);

        self.hit_rate.set(stats.hit_rate);
        self.l2_read_latency.set(stats.l2_read_latency.as_secs_f64());
        self.memory_entries.set(to_i64(stats.memory_entries));
        self.memory_capacity.set(to_i64(stats.memory_capacity));
        self.bitmap_bytes.set(to_i64(stats.bitmap_bytes));
        self.bitmap_capacity.set(to_i64(stats.bitmap_capacity));
        self.disk_bytes.set(to_i64(stats.disk_bytes));
        self.disk_capacity.set(to_i64(stats.disk_capacity));
    }

    /// Update from `stats` and encode the registry in text format
    pub fn render(&self, stats: &CacheStats) -> Result<Vec<u8>> {
        self.update(stats);

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(registry_error)?;
        Ok(buffer)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Counters only move forward; a snapshot below the current value is ignored
fn advance(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Build the response for `path`
pub async fn route(
    path: &str,
    manager: &CacheManager,
    exporter: &CacheExporter,
) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => {
            let stats = manager.get_stats().await;
            match exporter.render(&stats) {
                Ok(buffer) => {
                    let mut response = text_response(StatusCode::OK, buffer);
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    response
                }
                Err(e) => {
                    error!("Failed to render metrics: {}", e);
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
                }
            }
        }
        "/healthz" | "/livez" => {
            if manager.is_running() {
                text_response(StatusCode::OK, "ok")
            } else {
                text_response(StatusCode::SERVICE_UNAVAILABLE, "maintenance stopped")
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Serve `/metrics` and `/healthz` on `listener` until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    manager: CacheManager,
    exporter: Arc<CacheExporter>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?,
        };

        let io = TokioIo::new(stream);
        let manager = manager.clone();
        let exporter = Arc::clone(&exporter);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let manager = manager.clone();
                let exporter = Arc::clone(&exporter);
                async move {
                    Ok::<_, Infallible>(route(req.uri().path(), &manager, &exporter).await)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }

    info!("Metrics server stopped");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
