use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Information element type codes understood by the decoder (RFC 3954 Section 8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u16)]
pub enum FieldType {
    InBytes = 1,
    InPkts = 2,
    Protocol = 4,
    TcpFlags = 6,
    L4SrcPort = 7,
    Ipv4SrcAddr = 8,
    SrcMask = 9,
    InputSnmp = 10,
    L4DstPort = 11,
    Ipv4DstAddr = 12,
    DstMask = 13,
    OutputSnmp = 14,
    Ipv4NextHop = 15,
    SrcAs = 16,
    DstAs = 17,
    BgpIpv4NextHop = 18,
    LastSwitched = 21,
    FirstSwitched = 22,
    OutBytes = 23,
    OutPkts = 24,
    Ipv6SrcAddr = 27,
    Ipv6DstAddr = 28,
    Ipv6SrcMask = 29,
    Ipv6DstMask = 30,
    SamplingInterval = 34,
    FlowSamplerId = 48,
    FlowSamplerRandomInterval = 50,
    IpProtocolVersion = 60,
    Ipv6NextHop = 62,
    BgpIpv6NextHop = 63,
    ForwardingStatus = 89,
    FlowStartMilliseconds = 152,
    FlowEndMilliseconds = 153,
    SelectorId = 302,
}

/// How the bytes of a field are turned into a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoding {
    /// Big-endian unsigned integer
    Unsigned,
    /// IPv6-typed address; a 4-byte width carries an IPv4 address instead
    Address,
    /// IPv4-typed address, zero-padded to 4 bytes and mapped into IPv6
    PaddedAddress,
    /// Prefix length, copied verbatim
    MaskLength,
}

/// Decoded value of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Unsigned(u64),
    Address(Ipv6Addr),
    MaskLength(u8),
    Ignored,
}

impl FieldValue {
    /// Integer view of the value, used for scope identifiers
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Unsigned(v) => Some(*v),
            FieldValue::MaskLength(v) => Some(u64::from(*v)),
            _ => None,
        }
    }
}

impl FieldType {
    /// Look up a type code. Unknown codes are not an error: the caller
    /// still consumes the field at its declared width.
    pub fn lookup(type_code: u16) -> Option<Self> {
        Self::from_u16(type_code)
    }

    pub fn decoding(&self) -> Decoding {
        match self {
            FieldType::Ipv4SrcAddr
            | FieldType::Ipv4DstAddr
            | FieldType::Ipv4NextHop
            | FieldType::BgpIpv4NextHop => Decoding::PaddedAddress,
            FieldType::Ipv6SrcAddr
            | FieldType::Ipv6DstAddr
            | FieldType::Ipv6NextHop
            | FieldType::BgpIpv6NextHop => Decoding::Address,
            FieldType::SrcMask
            | FieldType::DstMask
            | FieldType::Ipv6SrcMask
            | FieldType::Ipv6DstMask => Decoding::MaskLength,
            _ => Decoding::Unsigned,
        }
    }

    /// Whether this field carries a sampling rate
    pub fn is_sampling_rate(&self) -> bool {
        matches!(self, FieldType::SamplingInterval | FieldType::FlowSamplerRandomInterval)
    }

    /// Whether this field identifies a sampler, linking data records to options data
    pub fn is_sampler_id(&self) -> bool {
        matches!(self, FieldType::FlowSamplerId | FieldType::SelectorId)
    }
}

impl Decoding {
    /// Decode `bytes`, which is exactly the width announced by the template.
    /// Only bounds matter here: every byte pattern is a legal value.
    pub fn decode(&self, bytes: &[u8]) -> FieldValue {
        match self {
            Decoding::Unsigned => FieldValue::Unsigned(decode_unsigned(bytes)),
            Decoding::Address => decode_address(bytes),
            Decoding::PaddedAddress => decode_padded_address(bytes),
            Decoding::MaskLength => match bytes.last() {
                Some(&len) => FieldValue::MaskLength(len),
                None => FieldValue::Ignored,
            },
        }
    }
}

/// Decode a big-endian unsigned integer. Values wider than 8 bytes keep
/// their low-order 8 bytes.
pub fn decode_unsigned(bytes: &[u8]) -> u64 {
    let start = bytes.len().saturating_sub(8);
    bytes[start..]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn decode_address(bytes: &[u8]) -> FieldValue {
    match bytes.len() {
        0 => FieldValue::Ignored,
        4 => decode_padded_address(bytes),
        _ => {
            let mut octets = [0u8; 16];
            let len = bytes.len().min(16);
            octets[..len].copy_from_slice(&bytes[..len]);
            FieldValue::Address(Ipv6Addr::from(octets))
        }
    }
}

fn decode_padded_address(bytes: &[u8]) -> FieldValue {
    if bytes.is_empty() {
        return FieldValue::Ignored;
    }
    let mut octets = [0u8; 4];
    let len = bytes.len().min(4);
    octets[..len].copy_from_slice(&bytes[..len]);
    FieldValue::Address(Ipv4Addr::from(octets).to_ipv6_mapped())
}
