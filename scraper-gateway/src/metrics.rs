use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    upstream_requests: IntCounterVec,
    warmup_attempts: IntCounterVec,
    account_retirements: prometheus::IntCounter,
    rate_limit_skips: prometheus::IntCounter,
    paginated_items: prometheus::IntCounter,
    active_sessions: IntGauge,
    upstream_latency: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let upstream_requests = IntCounterVec::new(
            Opts::new(
                "gateway_upstream_requests_total",
                "Upstream requests grouped by status class",
            ),
            &["class"],
        )?;
        let warmup_attempts = IntCounterVec::new(
            Opts::new(
                "gateway_warmup_attempts_total",
                "Session warm-up attempts grouped by result",
            ),
            &["result"],
        )?;
        let account_retirements = prometheus::IntCounter::new(
            "gateway_account_retirements_total",
            "Accounts dropped from the warm pool after auth failures",
        )?;
        let rate_limit_skips = prometheus::IntCounter::new(
            "gateway_rate_limit_skips_total",
            "Dispatch passes that skipped a rate-limited session",
        )?;
        let paginated_items = prometheus::IntCounter::new(
            "gateway_paginated_items_total",
            "Items yielded by paginated stream drivers",
        )?;
        let active_sessions = IntGauge::with_opts(Opts::new(
            "gateway_active_sessions",
            "Currently warm, logged-in upstream sessions",
        ))?;
        let upstream_latency = Histogram::with_opts(HistogramOpts::new(
            "gateway_upstream_request_seconds",
            "Upstream request latency (seconds)",
        ))?;
        registry.register(Box::new(upstream_requests.clone()))?;
        registry.register(Box::new(warmup_attempts.clone()))?;
        registry.register(Box::new(account_retirements.clone()))?;
        registry.register(Box::new(rate_limit_skips.clone()))?;
        registry.register(Box::new(paginated_items.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        Ok(Self {
            registry,
            upstream_requests,
            warmup_attempts,
            account_retirements,
            rate_limit_skips,
            paginated_items,
            active_sessions,
            upstream_latency,
        })
    }

    pub fn record_upstream_status(&self, status: u16) {
        let class = match status {
            200..=299 => "2xx",
            401 | 403 => "auth",
            429 => "rate_limited",
            400..=499 => "4xx",
            500..=599 => "5xx",
            _ => "other",
        };
        self.upstream_requests.with_label_values(&[class]).inc();
    }

    pub fn record_upstream_network_error(&self) {
        self.upstream_requests.with_label_values(&["network"]).inc();
    }

    pub fn record_warmup(&self, result: &str) {
        self.warmup_attempts.with_label_values(&[result]).inc();
    }

    pub fn record_account_retired(&self) {
        self.account_retirements.inc();
    }

    pub fn record_rate_limit_skip(&self) {
        self.rate_limit_skips.inc();
    }

    pub fn record_paginated_items(&self, count: u64) {
        self.paginated_items.inc_by(count);
    }

    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.set(count as i64);
    }

    pub fn observe_upstream_latency(&self, secs: f64) {
        self.upstream_latency.observe(secs);
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
