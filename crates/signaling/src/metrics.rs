use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use lumicast_common::types::StreamId;

const FINALIZE_STATES: [&str; 3] = ["started", "completed", "failed"];
static GLOBAL_METRICS: OnceLock<Arc<SignalingMetrics>> = OnceLock::new();

pub struct SignalingMetrics {
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_rate_total: Mutex<HashMap<String, u64>>,
    active_streams: AtomicU64,
    viewer_count: Mutex<HashMap<String, u64>>,
    finalize_jobs_total: Mutex<HashMap<String, u64>>,
    relay_dropped_total: AtomicU64,
}

impl Default for SignalingMetrics {
    fn default() -> Self {
        let mut finalize_jobs_total = HashMap::new();
        for state in FINALIZE_STATES {
            finalize_jobs_total.insert(state.to_string(), 0);
        }

        Self {
            ws_duration_count: Mutex::new(HashMap::new()),
            ws_duration_sum_ms: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            ws_rate_total: Mutex::new(HashMap::new()),
            active_streams: AtomicU64::new(0),
            viewer_count: Mutex::new(HashMap::new()),
            finalize_jobs_total: Mutex::new(finalize_jobs_total),
            relay_dropped_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<SignalingMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<SignalingMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_ws_event(event: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_event(event, is_error, latency_ms);
    }
}

pub fn set_active_streams(count: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.set_active_streams(count);
    }
}

pub fn set_viewer_count(stream_id: &StreamId, count: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.set_viewer_count(stream_id, count);
    }
}

pub fn clear_viewer_count(stream_id: &StreamId) {
    if let Some(metrics) = global_metrics() {
        metrics.clear_viewer_count(stream_id);
    }
}

pub fn increment_finalize_jobs(state: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.increment_finalize_jobs(state);
    }
}

pub fn increment_relay_dropped() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_relay_dropped();
    }
}

impl SignalingMetrics {
    pub fn record_ws_event(&self, event: &str, is_error: bool, latency_ms: u64) {
        let label = normalize_event(event);
        increment_label_counter(&self.ws_rate_total, &label, 1);
        increment_label_counter(&self.ws_duration_sum_ms, &label, latency_ms);
        increment_label_counter(&self.ws_duration_count, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &label, 1);
        }
    }

    pub fn set_active_streams(&self, count: u64) {
        self.active_streams.store(count, Ordering::SeqCst);
    }

    pub fn set_viewer_count(&self, stream_id: &StreamId, count: u64) {
        let mut guard = self.viewer_count.lock().expect("metrics map lock poisoned");
        guard.insert(stream_id.to_string(), count);
    }

    pub fn clear_viewer_count(&self, stream_id: &StreamId) {
        let mut guard = self.viewer_count.lock().expect("metrics map lock poisoned");
        guard.remove(stream_id.as_str());
    }

    pub fn increment_finalize_jobs(&self, state: &str) {
        let mut guard = self.finalize_jobs_total.lock().expect("metrics map lock poisoned");
        let normalized = normalize_finalize_state(state);
        let value = guard.entry(normalized).or_insert(0);
        *value = value.saturating_add(1);
    }

    pub fn increment_relay_dropped(&self) {
        self.relay_dropped_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP signaling_ws_rate_total Total websocket events by type.\n");
        output.push_str("# TYPE signaling_ws_rate_total counter\n");
        append_label_counter_lines(&mut output, "signaling_ws_rate_total", "event", &self.ws_rate_total);

        output.push_str("# HELP signaling_ws_errors_total Total websocket event errors by type.\n");
        output.push_str("# TYPE signaling_ws_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "signaling_ws_errors_total",
            "event",
            &self.ws_errors_total,
        );

        output.push_str(
            "# HELP signaling_ws_duration_ms_sum Sum of websocket event latency in milliseconds by type.\n",
        );
        output.push_str("# TYPE signaling_ws_duration_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "signaling_ws_duration_ms_sum",
            "event",
            &self.ws_duration_sum_ms,
        );

        output.push_str(
            "# HELP signaling_ws_duration_ms_count Count of websocket event latency samples by type.\n",
        );
        output.push_str("# TYPE signaling_ws_duration_ms_count counter\n");
        append_label_counter_lines(
            &mut output,
            "signaling_ws_duration_ms_count",
            "event",
            &self.ws_duration_count,
        );

        output.push_str("# HELP signaling_active_streams Currently live channels.\n");
        output.push_str("# TYPE signaling_active_streams gauge\n");
        output.push_str(&format!(
            "signaling_active_streams {}\n",
            self.active_streams.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP signaling_viewer_count Current watchers per live stream.\n");
        output.push_str("# TYPE signaling_viewer_count gauge\n");
        append_gauge_lines(&mut output, "signaling_viewer_count", "stream_id", &self.viewer_count);

        output.push_str("# HELP signaling_finalize_jobs_total Channel finalizations by state.\n");
        output.push_str("# TYPE signaling_finalize_jobs_total counter\n");
        append_label_counter_lines(
            &mut output,
            "signaling_finalize_jobs_total",
            "state",
            &self.finalize_jobs_total,
        );

        output.push_str(
            "# HELP signaling_relay_dropped_total Relay messages dropped because the target was gone.\n",
        );
        output.push_str("# TYPE signaling_relay_dropped_total counter\n");
        output.push_str(&format!(
            "signaling_relay_dropped_total {}\n",
            self.relay_dropped_total.load(Ordering::SeqCst)
        ));

        output
    }
}

fn normalize_event(event: &str) -> String {
    let normalized = event.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn normalize_finalize_state(state: &str) -> String {
    let normalized = state.trim().to_ascii_lowercase();
    if FINALIZE_STATES.contains(&normalized.as_str()) {
        normalized
    } else {
        "unknown".to_string()
    }
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    if guard.is_empty() {
        return;
    }

    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn append_gauge_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));
    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_prometheus_includes_ws_and_stream_metrics() {
        let metrics = SignalingMetrics::default();
        metrics.record_ws_event("watcher", false, 3);
        metrics.record_ws_event("watcher", true, 8);
        metrics.record_ws_event("offer", false, 1);
        metrics.set_active_streams(2);
        metrics.set_viewer_count(&StreamId::new("stream-1"), 4);
        metrics.increment_finalize_jobs("started");
        metrics.increment_finalize_jobs("completed");
        metrics.increment_finalize_jobs("not-a-state");
        metrics.increment_relay_dropped();

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains("signaling_ws_rate_total{event=\"watcher\"} 2"));
        assert!(rendered.contains("signaling_ws_errors_total{event=\"watcher\"} 1"));
        assert!(rendered.contains("signaling_ws_rate_total{event=\"offer\"} 1"));
        assert!(rendered.contains("signaling_active_streams 2"));
        assert!(rendered.contains("signaling_viewer_count{stream_id=\"stream-1\"} 4"));
        assert!(rendered.contains("signaling_finalize_jobs_total{state=\"started\"} 1"));
        assert!(rendered.contains("signaling_finalize_jobs_total{state=\"completed\"} 1"));
        assert!(rendered.contains("signaling_finalize_jobs_total{state=\"failed\"} 0"));
        assert!(rendered.contains("signaling_finalize_jobs_total{state=\"unknown\"} 1"));
        assert!(rendered.contains("signaling_relay_dropped_total 1"));
    }

    #[test]
    fn clearing_a_viewer_gauge_removes_the_series() {
        let metrics = SignalingMetrics::default();
        let id = StreamId::new("stream-9");
        metrics.set_viewer_count(&id, 3);
        metrics.clear_viewer_count(&id);
        assert!(!metrics.render_prometheus().contains("stream-9"));
    }
}
