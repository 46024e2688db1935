use deku::prelude::*;
use std::net::IpAddr;
use thiserror::Error;

use super::record::{decode_options_record, decode_record, FlowMessage, RecordContext};
use super::template::{DataTemplate, OptionsTemplate, Template, TemplateCache, TemplateKey};
use super::{
    FlowSetHeader, FlowSetKind, OptionsTemplateRecord, PacketHeader, TemplateRecord,
    FLOWSET_HEADER_LEN, MIN_DATA_FLOWSET_ID, NETFLOW_V9_VERSION, OPTIONS_TEMPLATE_FLOWSET_ID,
    PACKET_HEADER_LEN, TEMPLATE_FLOWSET_ID,
};
use crate::metrics::DecoderMetrics;

/// Flowsets are padded to 4 bytes, so a shorter tail is never a record
const MAX_PADDING: usize = 3;

/// Errors that discard a whole packet
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("packet too short: {len} bytes")]
    TooShort { len: usize },
    #[error("unsupported NetFlow version {0}")]
    UnsupportedVersion(u16),
    #[error("invalid packet header: {0}")]
    Header(#[from] DekuError),
}

impl DecodeError {
    /// Label used for the error counter
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::TooShort { .. } => "too_short",
            DecodeError::UnsupportedVersion(_) => "unsupported_version",
            DecodeError::Header(_) => "header",
        }
    }
}

/// Per-packet state shared by the flowset handlers
struct Packet<'a> {
    header: PacketHeader,
    exporter: IpAddr,
    label: &'a str,
}

impl Packet<'_> {
    fn key(&self, template_id: u16) -> TemplateKey {
        TemplateKey::new(self.exporter, self.header.source_id, template_id)
    }

    fn record_context(&self) -> RecordContext {
        RecordContext {
            exporter: self.exporter,
            obs_domain_id: self.header.source_id,
            sequence_number: self.header.sequence_number,
            sys_uptime: self.header.sys_uptime,
            unix_secs: self.header.unix_secs,
        }
    }
}

/// NetFlow v9 decoder.
///
/// One instance serves every exporter; it owns the template cache and may be
/// shared between threads.
pub struct Decoder {
    templates: TemplateCache,
    metrics: DecoderMetrics,
}

impl Decoder {
    pub fn new(templates: TemplateCache, metrics: DecoderMetrics) -> Self {
        Self { templates, metrics }
    }

    #[cfg(test)]
    pub(crate) fn templates(&self) -> &TemplateCache {
        &self.templates
    }

    /// Decode one NetFlow v9 packet received from `exporter`.
    ///
    /// Only an invalid header is an error. Malformed flowsets or records are
    /// dropped and counted, and an empty vector is a valid outcome for packets
    /// carrying only templates or options.
    pub fn decode(&self, payload: &[u8], exporter: IpAddr) -> Result<Vec<FlowMessage>, DecodeError> {
        let exporter = exporter.to_canonical();
        let label = exporter.to_string();

        let header = self.parse_header(payload, &label).map_err(|e| {
            tracing::debug!("Dropping packet from {}: {}", label, e);
            self.metrics.error(&label, e.kind());
            e
        })?;
        let packet = Packet {
            header,
            exporter,
            label: &label,
        };

        let mut flows = Vec::new();
        let mut rest = &payload[PACKET_HEADER_LEN..];

        while rest.len() >= FLOWSET_HEADER_LEN {
            let flowset_header = match FlowSetHeader::from_bytes((rest, 0)) {
                Ok((_, header)) => header,
                Err(e) => {
                    tracing::warn!("Invalid flowset header from {}: {}", label, e);
                    self.metrics.error(&label, "flowset_length");
                    break;
                }
            };

            let length = flowset_header.length as usize;
            if length < FLOWSET_HEADER_LEN || length > rest.len() {
                tracing::warn!(
                    "Flowset {} from {} claims {} bytes, {} remaining",
                    flowset_header.flowset_id,
                    label,
                    length,
                    rest.len()
                );
                self.metrics.error(&label, "flowset_length");
                break;
            }

            let (flowset, next) = rest.split_at(length);
            let body = &flowset[FLOWSET_HEADER_LEN..];

            match flowset_header.flowset_id {
                TEMPLATE_FLOWSET_ID => self.template_flowset(&packet, body),
                OPTIONS_TEMPLATE_FLOWSET_ID => self.options_template_flowset(&packet, body),
                id if id >= MIN_DATA_FLOWSET_ID => self.data_flowset(&packet, id, body, &mut flows),
                id => tracing::debug!("Skipping reserved flowset {} from {}", id, label),
            }

            rest = next;
        }

        Ok(flows)
    }

    fn parse_header(&self, payload: &[u8], label: &str) -> Result<PacketHeader, DecodeError> {
        let version = match payload {
            [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
            _ => return Err(DecodeError::TooShort { len: payload.len() }),
        };
        self.metrics.packet(label, version);

        if payload.len() < PACKET_HEADER_LEN {
            return Err(DecodeError::TooShort { len: payload.len() });
        }
        if version != NETFLOW_V9_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let (_, header) = PacketHeader::from_bytes((payload, 0))?;
        Ok(header)
    }

    fn template_flowset(&self, packet: &Packet, body: &[u8]) {
        let mut rest = body;
        let mut count = 0;

        while rest.len() > MAX_PADDING && !is_padding(rest) {
            let record = match TemplateRecord::from_bytes((rest, 0)) {
                Ok(((next, _), record)) => {
                    rest = next;
                    record
                }
                Err(e) => {
                    tracing::warn!("Malformed template from {}: {}", packet.label, e);
                    self.metrics.error(packet.label, "template");
                    break;
                }
            };
            count += 1;

            let template = DataTemplate::new(record.fields);
            if self.check_template(packet, record.template_id, template.record_length()) {
                let key = packet.key(record.template_id);
                self.register(packet, key, "template", |cache| {
                    cache.put_data_template(key, template.fields)
                });
            }
        }

        self.metrics
            .flowset(packet.label, NETFLOW_V9_VERSION, FlowSetKind::Template, count);
    }

    fn options_template_flowset(&self, packet: &Packet, body: &[u8]) {
        let mut rest = body;
        let mut count = 0;

        while rest.len() > MAX_PADDING && !is_padding(rest) {
            let record = match OptionsTemplateRecord::from_bytes((rest, 0)) {
                Ok(((next, _), record)) => {
                    rest = next;
                    record
                }
                Err(e) => {
                    tracing::warn!("Malformed options template from {}: {}", packet.label, e);
                    self.metrics.error(packet.label, "template");
                    break;
                }
            };
            count += 1;

            let template = OptionsTemplate::new(record.scope_fields, record.option_fields);
            if self.check_template(packet, record.template_id, template.record_length()) {
                let key = packet.key(record.template_id);
                self.register(packet, key, "options_template", |cache| {
                    cache.put_options_template(key, template.scope_fields, template.option_fields)
                });
            }
        }

        self.metrics.flowset(
            packet.label,
            NETFLOW_V9_VERSION,
            FlowSetKind::OptionsTemplate,
            count,
        );
    }

    /// Reject templates that could never be referenced or would consume no bytes
    fn check_template(&self, packet: &Packet, template_id: u16, record_length: usize) -> bool {
        if template_id < MIN_DATA_FLOWSET_ID || record_length == 0 {
            tracing::warn!(
                "Ignoring template {} from {} ({} bytes per record)",
                template_id,
                packet.label,
                record_length
            );
            self.metrics.error(packet.label, "template");
            return false;
        }
        true
    }

    fn register<F>(&self, packet: &Packet, key: TemplateKey, kind: &str, put: F)
    where
        F: FnOnce(&TemplateCache) -> Result<(), super::template::CacheError>,
    {
        match put(&self.templates) {
            Ok(()) => {
                tracing::debug!(
                    "Registered {} {} for {} (domain {})",
                    kind,
                    key.template_id,
                    packet.label,
                    key.obs_domain_id
                );
                self.metrics.template(
                    packet.label,
                    NETFLOW_V9_VERSION,
                    key.obs_domain_id,
                    key.template_id,
                    kind,
                );
            }
            Err(e) => {
                tracing::warn!("Refusing {} {}: {}", kind, key.template_id, e);
                self.metrics.error(packet.label, "template_limit");
            }
        }
    }

    fn data_flowset(&self, packet: &Packet, template_id: u16, body: &[u8], flows: &mut Vec<FlowMessage>) {
        match self.templates.get_template(&packet.key(template_id)) {
            Some(Template::Data(template)) => {
                let records = self.data_records(packet, &template, body, flows);
                self.metrics
                    .flowset(packet.label, NETFLOW_V9_VERSION, FlowSetKind::Data, records);
            }
            Some(Template::Options(template)) => {
                let records = self.options_records(packet, &template, body);
                self.metrics.flowset(
                    packet.label,
                    NETFLOW_V9_VERSION,
                    FlowSetKind::OptionsData,
                    records,
                );
            }
            None => {
                // Data may legitimately arrive before its template
                tracing::debug!(
                    "No template {} for {} (domain {}), skipping flowset",
                    template_id,
                    packet.label,
                    packet.header.source_id
                );
                self.metrics
                    .flowset(packet.label, NETFLOW_V9_VERSION, FlowSetKind::Data, 0);
            }
        }
    }

    /// Split `body` into records of `record_length` bytes. The tail is either
    /// padding or a truncated record.
    fn split_records<'a>(&self, packet: &Packet, record_length: usize, body: &'a [u8]) -> (Vec<&'a [u8]>, Option<&'a [u8]>) {
        if record_length == 0 {
            return (Vec::new(), None);
        }
        let chunks = body.chunks_exact(record_length);
        let tail = chunks.remainder();
        let records = chunks.collect();
        if tail.len() > MAX_PADDING && !is_padding(tail) {
            tracing::debug!("Truncated record of {} bytes from {}", tail.len(), packet.label);
            return (records, Some(tail));
        }
        (records, None)
    }

    fn data_records(
        &self,
        packet: &Packet,
        template: &DataTemplate,
        body: &[u8],
        flows: &mut Vec<FlowMessage>,
    ) -> u64 {
        let ctx = packet.record_context();
        let (records, truncated) = self.split_records(packet, template.record_length(), body);

        for record in records.iter().copied().chain(truncated) {
            match decode_record(template, record, &ctx, &self.templates) {
                Ok(flow) => flows.push(flow),
                Err(e) => {
                    tracing::debug!("Dropping record from {}: {}", packet.label, e);
                    self.metrics.error(packet.label, "record_too_short");
                }
            }
        }

        records.len() as u64
    }

    fn options_records(&self, packet: &Packet, template: &OptionsTemplate, body: &[u8]) -> u64 {
        let (records, truncated) = self.split_records(packet, template.record_length(), body);

        for record in records.iter().copied().chain(truncated) {
            let resolved = match decode_options_record(template, record) {
                Ok(resolved) => resolved,
                Err(e) => {
                    tracing::debug!("Dropping options record from {}: {}", packet.label, e);
                    self.metrics.error(packet.label, "record_too_short");
                    continue;
                }
            };
            if let Some(rate) = resolved.sampling_rate {
                for scope in resolved.scopes() {
                    let stored = self.templates.put_options_scalar(
                        packet.exporter,
                        packet.header.source_id,
                        scope,
                        rate,
                    );
                    if let Err(e) = stored {
                        tracing::debug!("Refusing sampling rate from {}: {}", packet.label, e);
                        self.metrics.error(packet.label, "sampler_limit");
                    }
                }
                tracing::debug!(
                    "Sampling rate {} for {} (domain {}, sampler {:?})",
                    rate,
                    packet.label,
                    packet.header.source_id,
                    resolved.sampler_id
                );
            }
        }

        records.len() as u64
    }
}

fn is_padding(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0)
}
