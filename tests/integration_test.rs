use deku::DekuContainerWrite;
use nf9_collector::netflow::{FieldSpec, OptionsTemplateRecord, PacketHeader, TemplateRecord};
use nf9_collector::{Decoder, DecoderMetrics, FlowMessage, TemplateCache};
use prometheus::proto::MetricType;
use prometheus::Registry;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// Integration tests for the NetFlow v9 decoder

const PREFIX: &str = "netflow_decoder_";

fn new_decoder() -> (Decoder, Registry) {
    let registry = Registry::new();
    let metrics = DecoderMetrics::new(&registry).unwrap();
    (Decoder::new(TemplateCache::new(), metrics), registry)
}

fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn mapped(addr: &str) -> Ipv6Addr {
    addr.parse::<Ipv4Addr>().unwrap().to_ipv6_mapped()
}

/// Flatten the registry into `name{label="value",...} -> value`, the
/// metric prefix stripped and labels sorted by name
fn gather(registry: &Registry) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for family in registry.gather() {
        let Some(name) = family.get_name().strip_prefix(PREFIX) else {
            continue;
        };
        for metric in family.get_metric() {
            let mut labels: Vec<(String, String)> = metric
                .get_label()
                .iter()
                .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
                .collect();
            labels.sort();
            let labels: Vec<String> = labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v))
                .collect();
            let value = match family.get_field_type() {
                MetricType::GAUGE => metric.get_gauge().get_value(),
                _ => metric.get_counter().get_value(),
            };
            out.insert(format!("{}{{{}}}", name, labels.join(",")), value.to_string());
        }
    }
    out
}

fn expected(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn packet(flowsets: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let mut bytes = PacketHeader::new(flowsets.len() as u16, 5_000, 1_700_000_000, 10, 0)
        .to_bytes()
        .unwrap();
    for (id, body) in flowsets {
        bytes.extend_from_slice(&id.to_be_bytes());
        bytes.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
        bytes.extend_from_slice(body);
    }
    bytes
}

fn template(id: u16, fields: &[(u16, u16)]) -> Vec<u8> {
    let fields = fields.iter().map(|&(t, l)| FieldSpec::new(t, l)).collect();
    TemplateRecord::new(id, fields).to_bytes().unwrap()
}

mod end_to_end {
    use super::*;

    const OPTIONS_TEMPLATE: &[u8] = include_bytes!("fixtures/options-template-257.bin");
    const OPTIONS_DATA: &[u8] = include_bytes!("fixtures/options-data-257.bin");
    const TEMPLATE: &[u8] = include_bytes!("fixtures/template-260.bin");
    const DATA: &[u8] = include_bytes!("fixtures/data-260.bin");

    #[allow(clippy::too_many_arguments)]
    fn flow(
        src: &str,
        dst: &str,
        next_hop: &str,
        in_if: u32,
        out_if: u32,
        bytes: u64,
        dst_port: u16,
        src_net: u8,
        dst_net: u8,
    ) -> FlowMessage {
        FlowMessage {
            sequence_num: 44797001,
            exporter_address: mapped("127.0.0.1"),
            sampling_rate: 30000,
            time_flow_start: 1647285926,
            time_flow_end: 1647285926,
            bytes,
            packets: 1,
            src_addr: mapped(src),
            dst_addr: mapped(dst),
            src_net,
            dst_net,
            etype: 0x800,
            proto: 6,
            src_port: 443,
            dst_port,
            in_if,
            out_if,
            forwarding_status: 64,
            tcp_flags: 16,
            next_hop: mapped(next_hop),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_fixtures() {
        let (decoder, registry) = new_decoder();

        // Options template
        let got = decoder.decode(OPTIONS_TEMPLATE, localhost()).unwrap();
        assert!(got.is_empty(), "options template produced flows");
        assert_eq!(
            gather(&registry),
            expected(&[
                (r#"count{exporter="127.0.0.1",version="9"}"#, "1"),
                (r#"flowset_records_sum{exporter="127.0.0.1",type="OptionsTemplateFlowSet",version="9"}"#, "1"),
                (r#"flowset_sum{exporter="127.0.0.1",type="OptionsTemplateFlowSet",version="9"}"#, "1"),
                (r#"templates_count{exporter="127.0.0.1",obs_domain_id="0",template_id="257",type="options_template",version="9"}"#, "1"),
            ])
        );

        // Options data
        let got = decoder.decode(OPTIONS_DATA, localhost()).unwrap();
        assert!(got.is_empty(), "options data produced flows");
        assert_eq!(
            gather(&registry),
            expected(&[
                (r#"count{exporter="127.0.0.1",version="9"}"#, "2"),
                (r#"flowset_records_sum{exporter="127.0.0.1",type="OptionsDataFlowSet",version="9"}"#, "4"),
                (r#"flowset_records_sum{exporter="127.0.0.1",type="OptionsTemplateFlowSet",version="9"}"#, "1"),
                (r#"flowset_sum{exporter="127.0.0.1",type="OptionsDataFlowSet",version="9"}"#, "1"),
                (r#"flowset_sum{exporter="127.0.0.1",type="OptionsTemplateFlowSet",version="9"}"#, "1"),
                (r#"templates_count{exporter="127.0.0.1",obs_domain_id="0",template_id="257",type="options_template",version="9"}"#, "1"),
            ])
        );

        // Regular template
        let got = decoder.decode(TEMPLATE, localhost()).unwrap();
        assert!(got.is_empty(), "template produced flows");
        assert_eq!(
            gather(&registry),
            expected(&[
                (r#"count{exporter="127.0.0.1",version="9"}"#, "3"),
                (r#"flowset_records_sum{exporter="127.0.0.1",type="OptionsDataFlowSet",version="9"}"#, "4"),
                (r#"flowset_records_sum{exporter="127.0.0.1",type="OptionsTemplateFlowSet",version="9"}"#, "1"),
                (r#"flowset_records_sum{exporter="127.0.0.1",type="TemplateFlowSet",version="9"}"#, "1"),
                (r#"flowset_sum{exporter="127.0.0.1",type="OptionsDataFlowSet",version="9"}"#, "1"),
                (r#"flowset_sum{exporter="127.0.0.1",type="OptionsTemplateFlowSet",version="9"}"#, "1"),
                (r#"flowset_sum{exporter="127.0.0.1",type="TemplateFlowSet",version="9"}"#, "1"),
                (r#"templates_count{exporter="127.0.0.1",obs_domain_id="0",template_id="257",type="options_template",version="9"}"#, "1"),
                (r#"templates_count{exporter="127.0.0.1",obs_domain_id="0",template_id="260",type="template",version="9"}"#, "1"),
            ])
        );

        // Data
        let got = decoder.decode(DATA, localhost()).unwrap();
        let expected_flows = vec![
            flow("198.38.121.178", "91.170.143.87", "194.149.174.63", 335, 450, 1500, 19624, 24, 14),
            flow("198.38.121.219", "88.122.57.97", "194.149.174.71", 335, 452, 1500, 2444, 24, 14),
            flow("173.194.190.106", "37.165.129.20", "252.223.0.0", 461, 306, 1400, 53697, 20, 18),
            flow("74.125.100.234", "88.120.219.117", "194.149.174.61", 461, 451, 1448, 52300, 16, 14),
        ];
        assert_eq!(got, expected_flows);
        assert_eq!(
            gather(&registry),
            expected(&[
                (r#"count{exporter="127.0.0.1",version="9"}"#, "4"),
                (r#"flowset_records_sum{exporter="127.0.0.1",type="DataFlowSet",version="9"}"#, "4"),
                (r#"flowset_records_sum{exporter="127.0.0.1",type="OptionsDataFlowSet",version="9"}"#, "4"),
                (r#"flowset_records_sum{exporter="127.0.0.1",type="OptionsTemplateFlowSet",version="9"}"#, "1"),
                (r#"flowset_records_sum{exporter="127.0.0.1",type="TemplateFlowSet",version="9"}"#, "1"),
                (r#"flowset_sum{exporter="127.0.0.1",type="DataFlowSet",version="9"}"#, "1"),
                (r#"flowset_sum{exporter="127.0.0.1",type="OptionsDataFlowSet",version="9"}"#, "1"),
                (r#"flowset_sum{exporter="127.0.0.1",type="OptionsTemplateFlowSet",version="9"}"#, "1"),
                (r#"flowset_sum{exporter="127.0.0.1",type="TemplateFlowSet",version="9"}"#, "1"),
                (r#"templates_count{exporter="127.0.0.1",obs_domain_id="0",template_id="257",type="options_template",version="9"}"#, "1"),
                (r#"templates_count{exporter="127.0.0.1",obs_domain_id="0",template_id="260",type="template",version="9"}"#, "1"),
            ])
        );
    }

    #[test]
    fn test_data_before_options_has_no_sampling_rate() {
        let (decoder, _) = new_decoder();
        decoder.decode(TEMPLATE, localhost()).unwrap();

        let got = decoder.decode(DATA, localhost()).unwrap();
        assert_eq!(got.len(), 4);
        assert!(got.iter().all(|f| f.sampling_rate == 0));

        decoder.decode(OPTIONS_TEMPLATE, localhost()).unwrap();
        decoder.decode(OPTIONS_DATA, localhost()).unwrap();
        let got = decoder.decode(DATA, localhost()).unwrap();
        assert!(got.iter().all(|f| f.sampling_rate == 30000));
    }

    #[test]
    fn test_data_from_other_exporter_is_skipped() {
        let (decoder, _) = new_decoder();
        decoder.decode(TEMPLATE, localhost()).unwrap();

        let other = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        assert!(decoder.decode(DATA, other).unwrap().is_empty());
    }
}

mod flowsets {
    use super::*;

    #[test]
    fn test_records_in_wire_order() {
        let (decoder, _) = new_decoder();
        decoder
            .decode(&packet(&[(0, template(300, &[(7, 2)]))]), localhost())
            .unwrap();

        let body: Vec<u8> = (1..=5u16).flat_map(|p| p.to_be_bytes()).collect();
        let flows = decoder.decode(&packet(&[(300, body)]), localhost()).unwrap();
        let ports: Vec<u16> = flows.iter().map(|f| f.src_port).collect();
        assert_eq!(ports, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_unknown_template_is_benign() {
        let (decoder, registry) = new_decoder();
        let flows = decoder
            .decode(&packet(&[(999, vec![1, 2, 3, 4])]), localhost())
            .unwrap();
        assert!(flows.is_empty());
        assert_eq!(
            gather(&registry),
            expected(&[
                (r#"count{exporter="127.0.0.1",version="9"}"#, "1"),
                (r#"flowset_records_sum{exporter="127.0.0.1",type="DataFlowSet",version="9"}"#, "0"),
                (r#"flowset_sum{exporter="127.0.0.1",type="DataFlowSet",version="9"}"#, "1"),
            ])
        );
    }

    #[test]
    fn test_template_redefinition() {
        let (decoder, _) = new_decoder();
        decoder
            .decode(&packet(&[(0, template(300, &[(7, 2)]))]), localhost())
            .unwrap();
        decoder
            .decode(&packet(&[(0, template(300, &[(11, 2), (4, 1), (6, 1)]))]), localhost())
            .unwrap();

        let flows = decoder
            .decode(&packet(&[(300, vec![0x00, 0x35, 17, 0])]), localhost())
            .unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].src_port, 0);
        assert_eq!(flows[0].dst_port, 53);
        assert_eq!(flows[0].proto, 17);
    }

    #[test]
    fn test_short_record_dropped_siblings_kept() {
        let (decoder, registry) = new_decoder();
        decoder
            .decode(&packet(&[(0, template(300, &[(8, 4), (7, 2)]))]), localhost())
            .unwrap();

        // Two full records and a 5-byte truncated one
        let body = vec![10, 0, 0, 1, 0, 1, 10, 0, 0, 2, 0, 2, 10, 0, 0, 3, 0];
        let flows = decoder.decode(&packet(&[(300, body)]), localhost()).unwrap();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[1].src_addr, mapped("10.0.0.2"));

        let metrics = gather(&registry);
        assert_eq!(
            metrics[r#"errors_count{error="record_too_short",exporter="127.0.0.1"}"#],
            "1"
        );
        assert_eq!(
            metrics[r#"flowset_records_sum{exporter="127.0.0.1",type="DataFlowSet",version="9"}"#],
            "2"
        );
    }

    #[test]
    fn test_bad_version_counted() {
        let (decoder, registry) = new_decoder();
        let mut bytes = packet(&[]);
        bytes[1] = 10;
        assert!(decoder.decode(&bytes, localhost()).is_err());
        assert_eq!(
            gather(&registry),
            expected(&[
                (r#"count{exporter="127.0.0.1",version="10"}"#, "1"),
                (r#"errors_count{error="unsupported_version",exporter="127.0.0.1"}"#, "1"),
            ])
        );
    }

    #[test]
    fn test_truncated_packet_never_panics() {
        let (decoder, _) = new_decoder();
        let full = packet(&[
            (0, template(300, &[(8, 4), (7, 2)])),
            (300, vec![10, 0, 0, 1, 0, 1]),
        ]);
        for len in 0..full.len() {
            let _ = decoder.decode(&full[..len], localhost());
        }
        assert_eq!(decoder.decode(&full, localhost()).unwrap().len(), 1);
    }
}

mod options {
    use super::*;

    fn options_template() -> Vec<u8> {
        OptionsTemplateRecord::new(
            257,
            vec![FieldSpec::new(1, 4)],
            vec![FieldSpec::new(48, 1), FieldSpec::new(34, 4)],
        )
        .to_bytes()
        .unwrap()
    }

    fn options_data(sampler: u8, rate: u32) -> Vec<u8> {
        let mut body = vec![0, 0, 0, 0, sampler];
        body.extend_from_slice(&rate.to_be_bytes());
        body
    }

    #[test]
    fn test_options_update_applies_to_later_records() {
        let (decoder, _) = new_decoder();
        let data_template = template(300, &[(7, 2)]);
        decoder
            .decode(&packet(&[(1, options_template()), (0, data_template)]), localhost())
            .unwrap();

        let data = || packet(&[(300, vec![0, 80])]);
        assert_eq!(decoder.decode(&data(), localhost()).unwrap()[0].sampling_rate, 0);

        decoder
            .decode(&packet(&[(257, options_data(1, 1000))]), localhost())
            .unwrap();
        assert_eq!(decoder.decode(&data(), localhost()).unwrap()[0].sampling_rate, 1000);

        decoder
            .decode(&packet(&[(257, options_data(1, 2000))]), localhost())
            .unwrap();
        assert_eq!(decoder.decode(&data(), localhost()).unwrap()[0].sampling_rate, 2000);
    }

    #[test]
    fn test_sampler_scoped_rates() {
        let (decoder, _) = new_decoder();
        let data_template = template(300, &[(48, 1), (7, 2)]);
        decoder
            .decode(&packet(&[(1, options_template()), (0, data_template)]), localhost())
            .unwrap();

        let mut body = options_data(1, 100);
        body.extend(options_data(2, 200));
        decoder.decode(&packet(&[(257, body)]), localhost()).unwrap();

        let flows = decoder
            .decode(&packet(&[(300, vec![1, 0, 80, 2, 0, 81, 7, 0, 82])]), localhost())
            .unwrap();
        let rates: Vec<u64> = flows.iter().map(|f| f.sampling_rate).collect();
        // Sampler 7 was never announced and falls back to the last domain-wide rate
        assert_eq!(rates, vec![100, 200, 200]);
    }
}

mod limits {
    use super::*;

    #[test]
    fn test_sampler_ids_are_bounded() {
        let registry = Registry::new();
        let metrics = DecoderMetrics::new(&registry).unwrap();
        let templates = TemplateCache::with_limit(Some(2)).with_sampler_limit(16);
        let decoder = Decoder::new(templates, metrics);

        let options = OptionsTemplateRecord::new(
            257,
            vec![FieldSpec::new(48, 4)],
            vec![FieldSpec::new(34, 4)],
        )
        .to_bytes()
        .unwrap();
        decoder.decode(&packet(&[(1, options)]), localhost()).unwrap();

        for round in 0..20u32 {
            let body: Vec<u8> = (0..1000u32)
                .flat_map(|i| [(round * 1000 + i).to_be_bytes(), 512u32.to_be_bytes()].concat())
                .collect();
            decoder.decode(&packet(&[(257, body)]), localhost()).unwrap();
        }

        let metrics = gather(&registry);
        assert_eq!(
            metrics[r#"errors_count{error="sampler_limit",exporter="127.0.0.1"}"#],
            "19984"
        );

        // A refused sampler falls back to the domain-wide rate
        decoder
            .decode(&packet(&[(0, template(300, &[(48, 4), (7, 2)]))]), localhost())
            .unwrap();
        let flows = decoder
            .decode(&packet(&[(300, vec![0, 0, 0x4e, 0x1f, 0, 80])]), localhost())
            .unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].sampling_rate, 512);
    }
}

mod concurrency {
    use super::*;

    #[test]
    fn test_concurrent_exporters() {
        let (decoder, registry) = new_decoder();
        std::thread::scope(|s| {
            for i in 1..=8u8 {
                let decoder = &decoder;
                s.spawn(move || {
                    let exporter = IpAddr::V4(Ipv4Addr::new(192, 0, 2, i));
                    decoder
                        .decode(&packet(&[(0, template(300, &[(7, 2)]))]), exporter)
                        .unwrap();
                    for _ in 0..50 {
                        let body = vec![0, i, 0, i];
                        let flows = decoder.decode(&packet(&[(300, body)]), exporter).unwrap();
                        assert_eq!(flows.len(), 2);
                        assert!(flows.iter().all(|f| f.src_port == u16::from(i)));
                    }
                });
            }
        });

        let templates: Vec<String> = gather(&registry)
            .into_keys()
            .filter(|k| k.starts_with("templates_count"))
            .collect();
        assert_eq!(templates.len(), 8);
        assert!(templates.iter().all(|k| k.contains(r#"template_id="300""#)));
        assert!(!templates.iter().any(|k| k.contains(r#"exporter="127.0.0.1""#)));
    }
}

mod config_parsing {
    use nf9_collector::config::Config;

    #[test]
    fn test_example_config_is_valid() {
        let config = Config::load("config/collector.toml").expect("Config should load");
        assert_eq!(config.collector.listen.port(), 2055);
        assert!(config.metrics.is_some());
    }
}
