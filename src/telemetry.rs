use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::collections::HashSet;

pub struct Metrics {
    request_counter: IntCounterVec,
    detection_duration: HistogramVec,
    persons_detected: IntCounter,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let request_counter = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of requests"),
            &["route"],
        )?;

        let boundaries = generate_boundaries((10, 50, 100, 500, 2000));
        let detection_duration = HistogramVec::new(
            HistogramOpts::new(
                "detection_duration_ms",
                "Duration of detection pipeline runs in milliseconds",
            )
            .buckets(boundaries),
            &["outcome"],
        )?;

        let persons_detected = IntCounter::new(
            "persons_detected_total",
            "Total number of target-class detections returned",
        )?;

        registry.register(Box::new(request_counter.clone()))?;
        registry.register(Box::new(detection_duration.clone()))?;
        registry.register(Box::new(persons_detected.clone()))?;

        Ok(Metrics {
            request_counter,
            detection_duration,
            persons_detected,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        self.request_counter.with_label_values(&[route]).inc();
    }

    pub fn record_detection_duration(&self, duration_ms: u64, outcome: &str) {
        self.detection_duration
            .with_label_values(&[outcome])
            .observe(duration_ms as f64);
    }

    pub fn record_detections(&self, count: usize) {
        self.persons_detected.inc_by(count as u64);
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 25;
    let end_step: usize = 100;
    let tail_step: usize = 500;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
