use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider, UpDownCounter},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    request_counter: Counter<u64>,
    draw_requests: Counter<u64>,
    predictions_received: Counter<u64>,
    normalize_duration: Histogram<u64>,
    inference_connections: UpDownCounter<i64>,
    pub registry: Registry,
    _provider: SdkMeterProvider,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter("digit_canvas");
        // the global slot may be replaced later, keep our own handle alive
        global::set_meter_provider(provider.clone());

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let draw_requests = meter
            .u64_counter("draw_requests_total")
            .with_description("Normalized drawings submitted to the inference channel, by outcome")
            .build();

        let predictions_received = meter
            .u64_counter("predictions_received_total")
            .with_description("Prediction events received from the backend, by status")
            .build();

        let boundaries =
            generate_boundaries(&[(100, 1000, 100), (1000, 5000, 500), (5000, 20000, 5000)]);

        let normalize_duration = meter
            .u64_histogram("normalize_duration_us")
            .with_boundaries(boundaries)
            .with_description("Duration of glyph location and normalization in microseconds")
            .build();

        let inference_connections = meter
            .i64_up_down_counter("inference_connections")
            .with_description("Open connections to the inference backend")
            .build();

        Ok(Metrics {
            request_counter,
            draw_requests,
            predictions_received,
            normalize_duration,
            inference_connections,
            registry,
            _provider: provider,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_draw_request(&self, outcome: &str) {
        let attributes = vec![KeyValue::new("outcome", outcome.to_string())];
        self.draw_requests.add(1, &attributes);
    }

    pub fn record_prediction(&self, status: &str) {
        let attributes = vec![KeyValue::new("status", status.to_string())];
        self.predictions_received.add(1, &attributes);
    }

    pub fn record_normalize_duration(&self, duration_us: u64) {
        self.normalize_duration.record(duration_us, &[]);
    }

    pub fn record_connection(&self, connected: bool) {
        self.inference_connections.add(if connected { 1 } else { -1 }, &[]);
    }
}

/// Builds histogram bucket boundaries from `(start, end, step)` segments.
fn generate_boundaries(segments: &[(u64, u64, usize)]) -> Vec<f64> {
    let mut seen = HashSet::new();
    segments
        .iter()
        .flat_map(|&(start, end, step)| (start..=end).step_by(step.max(1)))
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::TextEncoder;

    #[test]
    fn test_generate_boundaries() {
        let get = generate_boundaries(&[(2, 22, 10), (22, 26, 2), (26, 46, 20), (46, 146, 100)]);
        let expected = vec![2.0, 12.0, 22.0, 24.0, 26.0, 46.0, 146.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_metrics_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("/ws");
        metrics.record_draw_request("accepted");
        metrics.record_prediction("valid");

        let exposition = TextEncoder::new()
            .encode_to_string(&metrics.registry.gather())
            .unwrap();

        assert!(exposition.contains("draw_requests_total"));
        assert!(exposition.contains("outcome=\"accepted\""));
        assert!(exposition.contains("requests_total"));
    }
}
