use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::thread;
use tiny_http::{Response, Server};

use crate::netflow::FlowSetKind;

const NAMESPACE: &str = "netflow";
const SUBSYSTEM: &str = "decoder";

/// Counters and gauges reported by the decoder.
///
/// Cheap to clone: every vector is reference counted by prometheus.
#[derive(Clone)]
pub struct DecoderMetrics {
    packets: IntCounterVec,
    flowsets: IntCounterVec,
    flowset_records: IntCounterVec,
    templates: IntGaugeVec,
    errors: IntCounterVec,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE).subsystem(SUBSYSTEM)
}

impl DecoderMetrics {
    /// Create the metrics and register them into `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let packets = IntCounterVec::new(
            opts("count", "NetFlow packets received"),
            &["exporter", "version"],
        )?;
        let flowsets = IntCounterVec::new(
            opts("flowset_sum", "Flowsets received, by type"),
            &["exporter", "version", "type"],
        )?;
        let flowset_records = IntCounterVec::new(
            opts("flowset_records_sum", "Records contained in flowsets, by flowset type"),
            &["exporter", "version", "type"],
        )?;
        let templates = IntGaugeVec::new(
            opts("templates_count", "Templates registered by exporters"),
            &["exporter", "version", "obs_domain_id", "template_id", "type"],
        )?;
        let errors = IntCounterVec::new(
            opts("errors_count", "Decoding errors, by kind"),
            &["exporter", "error"],
        )?;

        registry.register(Box::new(packets.clone()))?;
        registry.register(Box::new(flowsets.clone()))?;
        registry.register(Box::new(flowset_records.clone()))?;
        registry.register(Box::new(templates.clone()))?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self {
            packets,
            flowsets,
            flowset_records,
            templates,
            errors,
        })
    }

    pub fn packet(&self, exporter: &str, version: u16) {
        self.packets
            .with_label_values(&[exporter, &version.to_string()])
            .inc();
    }

    /// Count one flowset and the records it contained
    pub fn flowset(&self, exporter: &str, version: u16, kind: FlowSetKind, records: u64) {
        let version = version.to_string();
        let labels = [exporter, version.as_str(), kind.as_str()];
        self.flowsets.with_label_values(&labels).inc();
        self.flowset_records.with_label_values(&labels).inc_by(records);
    }

    pub fn template(&self, exporter: &str, version: u16, obs_domain_id: u32, template_id: u16, kind: &str) {
        self.templates
            .with_label_values(&[
                exporter,
                &version.to_string(),
                &obs_domain_id.to_string(),
                &template_id.to_string(),
                kind,
            ])
            .set(1);
    }

    pub fn error(&self, exporter: &str, kind: &str) {
        self.errors.with_label_values(&[exporter, kind]).inc();
    }
}

/// Serve the registry in the Prometheus text format on `/metrics`
pub fn start_server(addr: SocketAddr, registry: Registry) {
    thread::spawn(move || {
        let server = match Server::http(addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server: {}", e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", addr);

        for request in server.incoming_requests() {
            let response = if request.url() == "/metrics" {
                let encoder = TextEncoder::new();
                let mut buffer = Vec::new();
                match encoder.encode(&registry.gather(), &mut buffer) {
                    Ok(()) => {
                        let mut response = Response::from_data(buffer);
                        if let Ok(header) = tiny_http::Header::from_bytes(
                            &b"Content-Type"[..],
                            encoder.format_type().as_bytes(),
                        ) {
                            response = response.with_header(header);
                        }
                        response
                    }
                    Err(e) => {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        Response::from_data(e.to_string().into_bytes()).with_status_code(500)
                    }
                }
            } else {
                Response::from_data(b"Not Found".to_vec()).with_status_code(404)
            };

            let _ = request.respond(response);
        }
    });
}
