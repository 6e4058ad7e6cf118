use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
};
use std::sync::LazyLock;

pub static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("parcel-report"));

// --- LLM client ---

pub static GEN_AI_TOKEN_USAGE: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("gen_ai.client.token.usage")
        .with_description("Number of tokens used per LLM call")
        .with_unit("{token}")
        .build()
});

pub static GEN_AI_OPERATION_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("gen_ai.client.operation.duration")
        .with_description("Duration of LLM operations in seconds")
        .with_unit("s")
        .build()
});

pub static GEN_AI_RETRY_COUNT: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("gen_ai.client.retry.count")
        .with_description("Number of LLM call retries")
        .with_unit("{retry}")
        .build()
});

pub static GEN_AI_FALLBACK_COUNT: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("gen_ai.client.fallback.count")
        .with_description("Number of secondary LLM provider activations")
        .with_unit("{fallback}")
        .build()
});

pub static GEN_AI_ERROR_COUNT: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("gen_ai.client.error.count")
        .with_description("Number of LLM call errors")
        .with_unit("{error}")
        .build()
});

// --- Report pipeline ---

pub static REPORT_GENERATION_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("report.generation.duration")
        .with_description("Total report generation duration in seconds")
        .with_unit("s")
        .build()
});

pub static REPORT_SYNTHESIS_PATH: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("report.synthesis.path")
        .with_description("Reports produced by the LLM path or the deterministic fallback")
        .with_unit("{report}")
        .build()
});

pub static REPORT_SOURCE_FACTS: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("report.source_facts")
        .with_description("Number of source facts backing a report")
        .with_unit("{fact}")
        .build()
});

pub static VALUATION_TIER: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("valuation.tier")
        .with_description("Valuation runs by formula tier")
        .with_unit("{valuation}")
        .build()
});

pub static UPSTREAM_REQUESTS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("upstream.requests")
        .with_description("Outbound provider requests by outcome")
        .with_unit("{request}")
        .build()
});

pub static RATE_LIMIT_REJECTIONS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("rate_limit.rejections")
        .with_description("Requests rejected by the per-client rate limiter")
        .with_unit("{request}")
        .build()
});

pub static ENTITLEMENT_TRANSITIONS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("entitlement.transitions")
        .with_description("Report entitlement operations by outcome")
        .with_unit("{operation}")
        .build()
});

// --- HTTP Metrics ---

pub static HTTP_REQUESTS_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("http.requests.total")
        .with_description("Total number of HTTP requests")
        .with_unit("{request}")
        .build()
});

pub static HTTP_REQUEST_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("http.request.duration")
        .with_description("HTTP request duration in milliseconds")
        .with_unit("ms")
        .with_boundaries(vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
        ])
        .build()
});
