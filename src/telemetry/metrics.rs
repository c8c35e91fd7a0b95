//! Prometheus metrics export

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

pub fn init_metrics(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    register_metrics();
    info!("Prometheus metrics server started on {}", addr);
    Ok(())
}

fn register_metrics() {
    // Connection
    describe_gauge!(
        "sweep_push_connection_state",
        "0=disconnected 1=connecting 2=connected 3=error"
    );
    describe_gauge!(
        "sweep_push_reconnect_attempts",
        "Reconnect attempts since last successful connect"
    );

    // Traffic
    describe_counter!("sweep_push_frames_sent_total", "Envelopes written to the channel");
    describe_counter!("sweep_push_frames_received_total", "Text frames read from the channel");
    describe_counter!("sweep_push_pings_total", "Heartbeat pings sent");

    // Failures
    describe_counter!(
        "sweep_push_decode_failures_total",
        "Inbound frames discarded as undecodable"
    );
    describe_counter!(
        "sweep_push_listener_failures_total",
        "Listener errors or panics during dispatch"
    );
    describe_counter!("sweep_push_errors_total", "Transport faults");
}

pub fn record_connection_state(code: u8) {
    gauge!("sweep_push_connection_state").set(code as f64);
}

pub fn record_reconnect_attempts(attempts: u32) {
    gauge!("sweep_push_reconnect_attempts").set(attempts as f64);
}

pub fn record_frame_sent() {
    counter!("sweep_push_frames_sent_total").increment(1);
}

pub fn record_frame_received() {
    counter!("sweep_push_frames_received_total").increment(1);
}

pub fn record_ping() {
    counter!("sweep_push_pings_total").increment(1);
}

pub fn record_decode_failure() {
    counter!("sweep_push_decode_failures_total").increment(1);
}

pub fn record_listener_failure() {
    counter!("sweep_push_listener_failures_total").increment(1);
}

pub fn record_error() {
    counter!("sweep_push_errors_total").increment(1);
}
