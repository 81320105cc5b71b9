use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and register the proxy's metrics.
pub fn init() -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    let builder = PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("ttft_seconds".to_string()),
        &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
    )?;

    let handle = builder.install_recorder()?;

    describe_counter!(
        "proxy_requests_total",
        "Requests dispatched to a backend, by provider and mode"
    );
    describe_counter!("tokens_total", "Tokens processed, by direction and provider");
    describe_counter!("errors_total", "Errors emitted to the client, by type");
    describe_histogram!("ttft_seconds", "Time to first translated event in seconds");

    Ok(handle)
}

pub fn record_request(provider: &str, streaming: bool) {
    let labels = [
        ("provider", provider.to_string()),
        ("streaming", streaming.to_string()),
    ];
    counter!("proxy_requests_total", &labels).increment(1);
}

pub fn record_tokens(provider: &str, input_tokens: u32, output_tokens: u32) {
    counter!(
        "tokens_total",
        &[
            ("type", "input".to_string()),
            ("provider", provider.to_string()),
        ]
    )
    .increment(input_tokens as u64);
    counter!(
        "tokens_total",
        &[
            ("type", "output".to_string()),
            ("provider", provider.to_string()),
        ]
    )
    .increment(output_tokens as u64);
}

pub fn record_error(error_type: &str) {
    counter!("errors_total", &[("type", error_type.to_string())]).increment(1);
}

pub fn record_ttft(seconds: f64) {
    histogram!("ttft_seconds").record(seconds);
}
