use serde::Serialize;
use std::net::{IpAddr, Ipv6Addr};
use thiserror::Error;

use super::fields::{FieldType, FieldValue};
use super::template::{DataTemplate, OptionsScope, OptionsTemplate, TemplateCache};
use super::FieldSpec;

pub const ETYPE_IPV4: u16 = 0x0800;
pub const ETYPE_IPV6: u16 = 0x86dd;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record too short: need {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

/// Normalized flow record produced for each data record.
///
/// Addresses are always 16 bytes wide, IPv4 being mapped into IPv6.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowMessage {
    /// Set by the receiver, never by the decoder
    pub time_received: u64,
    pub sequence_num: u32,
    pub sampling_rate: u64,
    pub exporter_address: Ipv6Addr,
    pub time_flow_start: u64,
    pub time_flow_end: u64,
    pub bytes: u64,
    pub packets: u64,
    pub src_addr: Ipv6Addr,
    pub dst_addr: Ipv6Addr,
    pub src_net: u8,
    pub dst_net: u8,
    pub etype: u16,
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub in_if: u32,
    pub out_if: u32,
    pub forwarding_status: u8,
    pub tcp_flags: u8,
    pub next_hop: Ipv6Addr,
    pub bgp_next_hop: Ipv6Addr,
    pub src_as: u32,
    pub dst_as: u32,
}

impl Default for FlowMessage {
    fn default() -> Self {
        Self {
            time_received: 0,
            sequence_num: 0,
            sampling_rate: 0,
            exporter_address: Ipv6Addr::UNSPECIFIED,
            time_flow_start: 0,
            time_flow_end: 0,
            bytes: 0,
            packets: 0,
            src_addr: Ipv6Addr::UNSPECIFIED,
            dst_addr: Ipv6Addr::UNSPECIFIED,
            src_net: 0,
            dst_net: 0,
            etype: 0,
            proto: 0,
            src_port: 0,
            dst_port: 0,
            in_if: 0,
            out_if: 0,
            forwarding_status: 0,
            tcp_flags: 0,
            next_hop: Ipv6Addr::UNSPECIFIED,
            bgp_next_hop: Ipv6Addr::UNSPECIFIED,
            src_as: 0,
            dst_as: 0,
        }
    }
}

/// Map any exporter address to its 16-byte form
pub fn normalize_addr(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Per-packet information needed to decode a record
#[derive(Debug, Clone, Copy)]
pub struct RecordContext {
    pub exporter: IpAddr,
    pub obs_domain_id: u32,
    pub sequence_number: u32,
    /// Milliseconds since the exporter booted
    pub sys_uptime: u32,
    pub unix_secs: u32,
}

impl RecordContext {
    /// Convert an uptime timestamp (FIRST/LAST_SWITCHED) to epoch seconds
    fn uptime_to_epoch(&self, uptime_ms: u32) -> u64 {
        let age_secs = self.sys_uptime.wrapping_sub(uptime_ms) / 1000;
        u64::from(self.unix_secs).saturating_sub(u64::from(age_secs))
    }
}

/// Walk `fields` over `record`, yielding each field with its bytes.
/// Unknown type codes are consumed but not yielded.
fn walk<'a>(
    fields: &'a [FieldSpec],
    record: &'a [u8],
) -> impl Iterator<Item = (FieldType, FieldValue)> + 'a {
    fields
        .iter()
        .scan(0usize, |offset, spec| {
            let start = *offset;
            *offset += spec.length as usize;
            Some((spec.field_type, record.get(start..*offset)))
        })
        .filter_map(|(code, bytes)| {
            let field_type = FieldType::lookup(code)?;
            let value = field_type.decoding().decode(bytes?);
            Some((field_type, value))
        })
}

fn check_length(expected: usize, record: &[u8]) -> Result<(), RecordError> {
    if record.len() < expected {
        return Err(RecordError::TooShort {
            expected,
            actual: record.len(),
        });
    }
    Ok(())
}

/// Decode one data record against its template.
///
/// When the record carries no sampling rate of its own, the rate is taken
/// from the options scalar cache: first for the sampler named in the record,
/// then for the whole observation domain. Missing rates decode as 0.
pub fn decode_record(
    template: &DataTemplate,
    record: &[u8],
    ctx: &RecordContext,
    cache: &TemplateCache,
) -> Result<FlowMessage, RecordError> {
    check_length(template.record_length(), record)?;

    let mut msg = FlowMessage {
        sequence_num: ctx.sequence_number,
        exporter_address: normalize_addr(ctx.exporter),
        ..Default::default()
    };
    let mut sampling_rate = None;
    let mut sampler_id = None;

    for (field_type, value) in walk(&template.fields, record) {
        match (field_type, value) {
            (FieldType::InBytes | FieldType::OutBytes, FieldValue::Unsigned(v)) => msg.bytes = v,
            (FieldType::InPkts | FieldType::OutPkts, FieldValue::Unsigned(v)) => msg.packets = v,
            (FieldType::Protocol, FieldValue::Unsigned(v)) => msg.proto = v as u8,
            (FieldType::TcpFlags, FieldValue::Unsigned(v)) => msg.tcp_flags = v as u8,
            (FieldType::L4SrcPort, FieldValue::Unsigned(v)) => msg.src_port = v as u16,
            (FieldType::L4DstPort, FieldValue::Unsigned(v)) => msg.dst_port = v as u16,
            (FieldType::InputSnmp, FieldValue::Unsigned(v)) => msg.in_if = v as u32,
            (FieldType::OutputSnmp, FieldValue::Unsigned(v)) => msg.out_if = v as u32,
            (FieldType::SrcAs, FieldValue::Unsigned(v)) => msg.src_as = v as u32,
            (FieldType::DstAs, FieldValue::Unsigned(v)) => msg.dst_as = v as u32,
            (FieldType::ForwardingStatus, FieldValue::Unsigned(v)) => msg.forwarding_status = v as u8,
            (FieldType::Ipv4SrcAddr, FieldValue::Address(a)) => {
                msg.src_addr = a;
                msg.etype = ETYPE_IPV4;
            }
            (FieldType::Ipv4DstAddr, FieldValue::Address(a)) => {
                msg.dst_addr = a;
                msg.etype = ETYPE_IPV4;
            }
            (FieldType::Ipv6SrcAddr, FieldValue::Address(a)) => {
                msg.src_addr = a;
                msg.etype = ETYPE_IPV6;
            }
            (FieldType::Ipv6DstAddr, FieldValue::Address(a)) => {
                msg.dst_addr = a;
                msg.etype = ETYPE_IPV6;
            }
            (FieldType::Ipv4NextHop | FieldType::Ipv6NextHop, FieldValue::Address(a)) => msg.next_hop = a,
            (FieldType::BgpIpv4NextHop | FieldType::BgpIpv6NextHop, FieldValue::Address(a)) => {
                msg.bgp_next_hop = a
            }
            (FieldType::SrcMask | FieldType::Ipv6SrcMask, FieldValue::MaskLength(len)) => msg.src_net = len,
            (FieldType::DstMask | FieldType::Ipv6DstMask, FieldValue::MaskLength(len)) => msg.dst_net = len,
            (FieldType::FirstSwitched, FieldValue::Unsigned(v)) => {
                msg.time_flow_start = ctx.uptime_to_epoch(v as u32)
            }
            (FieldType::LastSwitched, FieldValue::Unsigned(v)) => {
                msg.time_flow_end = ctx.uptime_to_epoch(v as u32)
            }
            (FieldType::FlowStartMilliseconds, FieldValue::Unsigned(v)) => msg.time_flow_start = v / 1000,
            (FieldType::FlowEndMilliseconds, FieldValue::Unsigned(v)) => msg.time_flow_end = v / 1000,
            (FieldType::IpProtocolVersion, FieldValue::Unsigned(4)) => msg.etype = ETYPE_IPV4,
            (FieldType::IpProtocolVersion, FieldValue::Unsigned(6)) => msg.etype = ETYPE_IPV6,
            (t, FieldValue::Unsigned(v)) if t.is_sampling_rate() => sampling_rate = Some(v),
            (t, FieldValue::Unsigned(v)) if t.is_sampler_id() => sampler_id = Some(v),
            _ => {}
        }
    }

    msg.sampling_rate = match sampling_rate {
        Some(rate) => rate,
        None => sampler_id
            .and_then(|id| {
                cache.get_options_scalar(ctx.exporter, ctx.obs_domain_id, OptionsScope::Sampler(id))
            })
            .or_else(|| cache.get_options_scalar(ctx.exporter, ctx.obs_domain_id, OptionsScope::Domain))
            .unwrap_or(0),
    };

    Ok(msg)
}

/// Values resolved from one options data record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptionsRecord {
    pub sampler_id: Option<u64>,
    pub sampling_rate: Option<u64>,
}

impl OptionsRecord {
    /// Scopes this record's scalar should be stored under
    pub fn scopes(&self) -> Vec<OptionsScope> {
        let mut scopes = vec![OptionsScope::Domain];
        if let Some(id) = self.sampler_id {
            scopes.push(OptionsScope::Sampler(id));
        }
        scopes
    }
}

/// Decode one options data record: scope fields first, then option fields
pub fn decode_options_record(template: &OptionsTemplate, record: &[u8]) -> Result<OptionsRecord, RecordError> {
    check_length(template.record_length(), record)?;

    let (scope, options) = record.split_at(template.scope_length());
    let mut resolved = OptionsRecord::default();
    let values = walk(&template.scope_fields, scope).chain(walk(&template.option_fields, options));

    for (field_type, value) in values {
        if let Some(v) = value.as_u64() {
            if field_type.is_sampler_id() {
                resolved.sampler_id = Some(v);
            } else if field_type.is_sampling_rate() {
                resolved.sampling_rate = Some(v);
            }
        }
    }

    Ok(resolved)
}
