pub mod decoder;
pub mod fields;
pub mod record;
pub mod template;

use deku::prelude::*;

pub const NETFLOW_V9_VERSION: u16 = 9;
pub const PACKET_HEADER_LEN: usize = 20;
pub const FLOWSET_HEADER_LEN: usize = 4;

pub const TEMPLATE_FLOWSET_ID: u16 = 0;
pub const OPTIONS_TEMPLATE_FLOWSET_ID: u16 = 1;
/// Flowset ids below this are reserved; data flowsets reuse their template id.
pub const MIN_DATA_FLOWSET_ID: u16 = 256;

/// NetFlow v9 packet header (RFC 3954 Section 5.1)
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
pub struct PacketHeader {
    #[deku(endian = "big")]
    pub version: u16,
    /// Number of records in the packet, informational only
    #[deku(endian = "big")]
    pub count: u16,
    #[deku(endian = "big")]
    pub sys_uptime: u32,
    #[deku(endian = "big")]
    pub unix_secs: u32,
    #[deku(endian = "big")]
    pub sequence_number: u32,
    /// Observation domain id
    #[deku(endian = "big")]
    pub source_id: u32,
}

impl PacketHeader {
    pub fn new(count: u16, sys_uptime: u32, unix_secs: u32, sequence_number: u32, source_id: u32) -> Self {
        Self {
            version: NETFLOW_V9_VERSION,
            count,
            sys_uptime,
            unix_secs,
            sequence_number,
            source_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
pub struct FlowSetHeader {
    #[deku(endian = "big")]
    pub flowset_id: u16,
    /// Length of the flowset in bytes, header and padding included
    #[deku(endian = "big")]
    pub length: u16,
}

/// Kind of a flowset, as reported in metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowSetKind {
    Template,
    OptionsTemplate,
    Data,
    OptionsData,
}

impl FlowSetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowSetKind::Template => "TemplateFlowSet",
            FlowSetKind::OptionsTemplate => "OptionsTemplateFlowSet",
            FlowSetKind::Data => "DataFlowSet",
            FlowSetKind::OptionsData => "OptionsDataFlowSet",
        }
    }
}

impl std::fmt::Display for FlowSetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field specifier inside a template: information element type and width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, DekuRead, DekuWrite)]
pub struct FieldSpec {
    #[deku(endian = "big")]
    pub field_type: u16,
    #[deku(endian = "big")]
    pub length: u16,
}

impl FieldSpec {
    pub const fn new(field_type: u16, length: u16) -> Self {
        Self { field_type, length }
    }
}

/// Template record inside a Template FlowSet
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
pub struct TemplateRecord {
    #[deku(endian = "big")]
    pub template_id: u16,
    #[deku(endian = "big", update = "self.fields.len()")]
    pub field_count: u16,
    #[deku(count = "field_count")]
    pub fields: Vec<FieldSpec>,
}

impl TemplateRecord {
    pub fn new(template_id: u16, fields: Vec<FieldSpec>) -> Self {
        Self {
            template_id,
            field_count: fields.len() as u16,
            fields,
        }
    }
}

/// Options template record inside an Options Template FlowSet.
///
/// Unlike the template record, scope and option lengths are expressed in
/// bytes, each field specifier taking 4 of them.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
pub struct OptionsTemplateRecord {
    #[deku(endian = "big")]
    pub template_id: u16,
    #[deku(
        endian = "big",
        assert = "*scope_length % 4 == 0",
        update = "self.scope_fields.len() * 4"
    )]
    pub scope_length: u16,
    #[deku(
        endian = "big",
        assert = "*option_length % 4 == 0",
        update = "self.option_fields.len() * 4"
    )]
    pub option_length: u16,
    #[deku(count = "scope_length / 4")]
    pub scope_fields: Vec<FieldSpec>,
    #[deku(count = "option_length / 4")]
    pub option_fields: Vec<FieldSpec>,
}

impl OptionsTemplateRecord {
    pub fn new(template_id: u16, scope_fields: Vec<FieldSpec>, option_fields: Vec<FieldSpec>) -> Self {
        Self {
            template_id,
            scope_length: (scope_fields.len() * 4) as u16,
            option_length: (option_fields.len() * 4) as u16,
            scope_fields,
            option_fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader::new(4, 944951609, 1647285926, 44797001, 0);
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), PACKET_HEADER_LEN);
        assert_eq!(&bytes[0..2], &[0x00, 0x09]);

        let (_, parsed) = PacketHeader::from_bytes((&bytes, 0)).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_too_short() {
        let bytes = [0x00, 0x09, 0x00, 0x01];
        assert!(PacketHeader::from_bytes((&bytes, 0)).is_err());
    }

    #[test]
    fn test_template_record_parse() {
        // Template 260 with IPV4_SRC_ADDR/4 and L4_SRC_PORT/2
        let data = [0x01, 0x04, 0x00, 0x02, 0x00, 0x08, 0x00, 0x04, 0x00, 0x07, 0x00, 0x02];
        let ((rest, _), record) = TemplateRecord::from_bytes((&data, 0)).unwrap();
        assert!(rest.is_empty());
        assert_eq!(record.template_id, 260);
        assert_eq!(record.fields, vec![FieldSpec::new(8, 4), FieldSpec::new(7, 2)]);
    }

    #[test]
    fn test_template_record_truncated() {
        // Announces 3 fields but carries only one
        let data = [0x01, 0x04, 0x00, 0x03, 0x00, 0x08, 0x00, 0x04];
        assert!(TemplateRecord::from_bytes((&data, 0)).is_err());
    }

    #[test]
    fn test_options_template_record_parse() {
        let record = OptionsTemplateRecord::new(
            257,
            vec![FieldSpec::new(1, 4)],
            vec![FieldSpec::new(48, 1), FieldSpec::new(50, 4)],
        );
        let bytes = record.to_bytes().unwrap();
        assert_eq!(&bytes[2..6], &[0x00, 0x04, 0x00, 0x08]);

        let (_, parsed) = OptionsTemplateRecord::from_bytes((&bytes, 0)).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_options_template_bad_scope_length() {
        // Scope length of 3 bytes cannot hold field specifiers
        let data = [0x01, 0x01, 0x00, 0x03, 0x00, 0x00];
        assert!(OptionsTemplateRecord::from_bytes((&data, 0)).is_err());
    }
}
