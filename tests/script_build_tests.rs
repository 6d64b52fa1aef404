//! End-to-end builds against a miniature network catalog.
//!
//! These tests register a small skb/IP/TCP catalog the way a front end
//! would and check complete rendered scripts: cast chains, sanity filter
//! nesting, alias resolution with preprocessors, and the error chains
//! reported for bad requests.

use std::rc::Rc;

use indexmap::IndexMap;

use trazar::field_helpers::{fpp_pton_inet, new_bswap_conv};
use trazar::{
    AggrFunc, Builder, BuildError, CommonDumpOptions, CoreFeatures, ErrorLevel, Field,
    FeatureComponent, FeatureComponentSpec, FeatureRegistry, FieldGroup, Filter, FilterOptions,
    Object, Probe, TimeMode, TraceCommonOptions, TraceDumpOptions, Version, VersionProvider,
};

struct FixedProvider;

impl VersionProvider for FixedProvider {
    fn get(&self) -> anyhow::Result<String> {
        Ok("bpftrace v0.18.0".to_string())
    }
    fn parse(&self, text: &str) -> anyhow::Result<Version> {
        trazar::BpftraceVersionProvider::default().parse(text)
    }
    fn default_version(&self) -> Version {
        Version::new(0, 9, 2)
    }
}

const IPHDR_DEF: &str = "uint8 ihl_version;\nuint8 tos;\n";
const TCPHDR_DEF: &str = "uint16 source;\nuint16 dest;\n";

fn test_builder() -> Builder {
    let mut registry = FeatureRegistry::new();
    let features = CoreFeatures::register(&mut registry);
    let spec = FeatureComponentSpec {
        component: FeatureComponent::Bpftrace,
        provider: Box::new(FixedProvider),
    };
    let mask = spec.process_features(&registry, "", "").unwrap();

    let mut b = Builder::new();
    b.set_features(&mask, &features);

    b.add_objects(vec![
        Object {
            variable: "skb".to_string(),
            ..Default::default()
        },
        Object {
            variable: "$skb".to_string(),
            header_files: vec!["linux/skbuff.h".to_string()],
            casts: IndexMap::from([(
                "skb".to_string(),
                "{{ .Dst }} = ({{ StructKeyword }}sk_buff*) {{ .Src }}".to_string(),
            )]),
            ..Default::default()
        },
        Object {
            variable: "$iph".to_string(),
            header_files: vec!["linux/ip.h".to_string()],
            struct_defs: vec!["iphdr".to_string()],
            casts: IndexMap::from([(
                "$skb".to_string(),
                "{{ .Dst }} = ({{ StructKeyword }}iphdr*) ({{ .Src }}->head + {{ .Src }}->network_header)"
                    .to_string(),
            )]),
            ..Default::default()
        },
        Object {
            variable: "$tcph".to_string(),
            struct_defs: vec!["tcphdr".to_string()],
            sanity_filter: Some(Filter::new("$iph", "protocol", "==", "6")),
            casts: IndexMap::from([(
                "$skb".to_string(),
                "{{ .Dst }} = ({{ StructKeyword }}tcphdr*) ({{ .Src }}->head + {{ .Src }}->network_header + 20)"
                    .to_string(),
            )]),
            ..Default::default()
        },
    ]);
    b.add_struct_def("iphdr", IPHDR_DEF);
    b.add_struct_def("tcphdr", TCPHDR_DEF);

    b.add_probes(vec![Probe {
        name: "kprobe:dev_queue_xmit".to_string(),
        aliases: vec!["xmit".to_string()],
        args: IndexMap::from([("skb".to_string(), "arg0".to_string())]),
        help: "dev_queue_xmit() is called when kernel tries to put skb to a send queue".to_string(),
        ..Default::default()
    }]);

    b.add_field_groups(vec![FieldGroup {
        object: "$iph".to_string(),
        row: "ip".to_string(),
        fields: vec![
            Field {
                fmt_spec: Some("%x".to_string()),
                sanity_filter: Some(Filter::new("", "", "==", "0x45")),
                ..Field::named("ihl_version")
            },
            Field::named("ttl"),
            Field::named("protocol"),
            Field {
                alias: Some("src".to_string()),
                preprocessor: Some(Rc::new(fpp_pton_inet)),
                ..Field::named("saddr")
            },
        ],
        ..Default::default()
    }]);
    b.add_field_groups(vec![FieldGroup {
        object: "$tcph".to_string(),
        row: "tcp".to_string(),
        fields: vec![
            Field {
                converter: Some(new_bswap_conv(&mask, &features, 16)),
                ..Field::named("source")
            },
            Field {
                converter: Some(new_bswap_conv(&mask, &features, 16)),
                ..Field::named("dest")
            },
        ],
        ..Default::default()
    }]);

    b
}

fn dump_request(rows: &[&str], raw_filters: &[&str]) -> TraceDumpOptions {
    TraceDumpOptions {
        trace: TraceCommonOptions {
            probe_names: vec!["xmit".to_string()],
            filter_options: FilterOptions {
                raw_filters: raw_filters.iter().map(|f| f.to_string()).collect(),
                ..Default::default()
            },
            ..Default::default()
        },
        dump: CommonDumpOptions {
            field_group_rows: rows.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        },
    }
}

#[test]
fn test_full_dump_script() {
    let b = test_builder();
    let prog = b
        .build_dump_trace(&dump_request(&["tcp"], &["src == 127.0.0.1"]))
        .unwrap();

    let localhost = format!("{:#x}", u32::from_ne_bytes([127, 0, 0, 1]));
    let expected = format!(
        "#include <linux/skbuff.h>\n\
         #include <linux/ip.h>\n\
         \n\
         struct iphdr {{\n\
         \x20   uint8 ihl_version;\n\
         \x20   uint8 tos;\n\
         }}\n\
         \n\
         struct tcphdr {{\n\
         \x20   uint16 source;\n\
         \x20   uint16 dest;\n\
         }}\n\
         \n\
         interval:s:60 {{\n\
         \x20   exit();\n\
         }}\n\
         \n\
         kprobe:dev_queue_xmit {{\n\
         \x20   $skb = (struct sk_buff*) arg0;\n\
         \x20   $iph = (struct iphdr*) ($skb->head + $skb->network_header);\n\
         \x20   if ($iph->ihl_version == 0x45) {{\n\
         \x20       if ($iph->saddr == {localhost}) {{\n\
         \x20           if ($iph->protocol == 6) {{\n\
         \x20               $tcph = (struct tcphdr*) ($skb->head + $skb->network_header + 20);\n\
         \x20               time(\"%H:%M:%S.\");\n\
         \x20               printf(\"%09ld - kprobe:dev_queue_xmit\\n\", nsecs % 1000000000);\n\
         \x20               printf(\"tcp: source %d dest %d\\n\", bswap((uint16)$tcph->source), bswap((uint16)$tcph->dest));\n\
         \x20           }}\n\
         \x20           @hits[\"xmit:filtered\"] = count();\n\
         \x20       }}\n\
         \x20   }}\n\
         \x20   @hits[\"xmit\"] = count();\n\
         }}"
    );
    assert_eq!(prog.render(), expected);
}

#[test]
fn test_dump_script_without_filters() {
    let b = test_builder();
    let prog = b.build_dump_trace(&dump_request(&["ip"], &[])).unwrap();
    let rendered = prog.render();

    // One cast chain, one sanity guard, the row prints inside the guard.
    assert_eq!(rendered.matches("$skb = (struct sk_buff*) arg0").count(), 1);
    assert_eq!(rendered.matches("if ($iph->ihl_version == 0x45)").count(), 1);
    assert!(rendered.contains("ip: ihl_version %x ttl %d protocol %d saddr %d"));
}

#[test]
fn test_rows_share_cast() {
    let b = test_builder();
    let prog = b.build_dump_trace(&dump_request(&["ip", "tcp"], &[])).unwrap();
    let rendered = prog.render();

    // Both rows derive from $skb; the cast must not be duplicated.
    assert_eq!(rendered.matches("$skb = (struct sk_buff*) arg0").count(), 1);
    assert_eq!(
        rendered
            .matches("$iph = (struct iphdr*) ($skb->head + $skb->network_header)")
            .count(),
        1
    );
}

#[test]
fn test_repeated_build_is_deterministic() {
    let b = test_builder();
    let opt = dump_request(&["tcp"], &["$iph->ttl >= 50"]);
    let first = b.build_dump_trace(&opt).unwrap().render();
    let second = b.build_dump_trace(&opt).unwrap().render();
    assert_eq!(first, second);
}

#[test]
fn test_ipv6_literal_hint_cause() {
    let b = test_builder();
    let err = b
        .build_dump_trace(&dump_request(&["ip"], &["src == fc00::1"]))
        .unwrap_err();

    // Walk the chain to the preprocessor failure and downcast it the way a
    // front end selecting the IPv6 usage hint would.
    let mut cause: Option<&(dyn std::error::Error + 'static)> = err.cause();
    let mut found = false;
    while let Some(inner) = cause {
        if let Some(addr_err) =
            inner.downcast_ref::<trazar::field_helpers::InvalidIpv4Address>()
        {
            assert!(addr_err.looks_like_ipv6);
            found = true;
            break;
        }
        cause = inner.source();
    }
    assert!(found, "InvalidIpv4Address not found in chain: {err}");
}

#[test]
fn test_unknown_probe_and_row_errors() {
    let b = test_builder();

    let mut opt = dump_request(&["ip"], &[]);
    opt.trace.probe_names = vec!["recv".to_string()];
    let err = b.build_dump_trace(&opt).unwrap_err();
    assert_eq!(
        (err.level(), err.message()),
        (ErrorLevel::Probe, trazar::MSG_NOT_FOUND)
    );

    let err = b
        .build_dump_trace(&dump_request(&["netdev"], &[]))
        .unwrap_err();
    let cause = err.cause().unwrap().downcast_ref::<BuildError>().unwrap();
    assert_eq!(
        (cause.level(), cause.message()),
        (ErrorLevel::Row, trazar::MSG_NOT_FOUND)
    );
}

#[test]
fn test_empty_probe_name_error() {
    let b = test_builder();
    let mut opt = dump_request(&["ip"], &[]);
    opt.trace.probe_names = vec![String::new()];

    let err = b.build_dump_trace(&opt).unwrap_err();
    assert_eq!(err.message(), trazar::MSG_NOT_SPECIFIED);
}

#[test]
fn test_aggregate_script() {
    let b = test_builder();
    let opt = trazar::TraceAggregateOptions {
        trace: TraceCommonOptions {
            probe_names: vec!["xmit".to_string()],
            ..Default::default()
        },
        func: AggrFunc::Count,
        arg: String::new(),
        keys: vec!["$iph->ttl".to_string()],
        interval: std::time::Duration::from_secs(2),
    };

    let prog = b.build_aggregate(&opt).unwrap();
    let rendered = prog.render();
    assert!(rendered.contains("@[$iph->ttl] = count()"));
    assert!(rendered.contains("interval:s:2 {"));
    assert!(rendered.contains("print(@)"));
}

#[test]
fn test_time_mode_delta() {
    let b = test_builder();
    let mut opt = dump_request(&["ip"], &[]);
    opt.dump.time_mode = TimeMode::Delta;

    let rendered = b.build_dump_trace(&opt).unwrap().render();
    assert!(rendered.contains("printf(\"+%ld - kprobe:dev_queue_xmit\\n\", elapsed - @last_event)"));
    assert!(rendered.contains("@last_event = elapsed"));
}

mod weak_aliases {
    use super::*;

    // IPv4 and IPv6 rows share `src` weakly, as the real protocol catalogs
    // do; the request context decides which object backs it.
    fn weak_builder() -> Builder {
        let mut b = test_builder();
        b.add_objects(vec![Object {
            variable: "$ipv6h".to_string(),
            casts: IndexMap::from([(
                "$skb".to_string(),
                "{{ .Dst }} = ({{ StructKeyword }}ipv6hdr*) ({{ .Src }}->head + {{ .Src }}->network_header)"
                    .to_string(),
            )]),
            ..Default::default()
        }]);
        b.add_field_groups(vec![FieldGroup {
            object: "$ipv6h".to_string(),
            row: "ipv6".to_string(),
            fields: vec![
                Field::named("hop_limit"),
                Field {
                    alias: Some("wsrc".to_string()),
                    weak_alias: true,
                    ..Field::named("saddr8")
                },
            ],
            ..Default::default()
        }]);
        // Retrofit the IPv4 side of the shared alias.
        b.add_field_groups(vec![FieldGroup {
            object: "$iph".to_string(),
            row: "ip4w".to_string(),
            fields: vec![Field {
                alias: Some("wsrc".to_string()),
                weak_alias: true,
                ..Field::named("saddr")
            }],
            ..Default::default()
        }]);
        b
    }

    #[test]
    fn test_weak_alias_resolved_by_row() {
        let b = weak_builder();
        let rendered = b
            .build_dump_trace(&dump_request(&["ipv6"], &["wsrc == 1"]))
            .unwrap()
            .render();
        assert!(rendered.contains("if ($ipv6h->saddr8 == 1)"));
    }

    #[test]
    fn test_weak_alias_resolved_by_hint() {
        let b = weak_builder();
        let mut opt = dump_request(&["tcp"], &["wsrc == 1"]);
        opt.trace.common.hints = vec!["ipv6".to_string()];

        let rendered = b.build_dump_trace(&opt).unwrap().render();
        assert!(rendered.contains("if ($ipv6h->saddr8 == 1)"));
    }

    #[test]
    fn test_weak_alias_ambiguity_fails() {
        let b = weak_builder();
        let err = b
            .build_dump_trace(&dump_request(&["tcp"], &["wsrc == 1"]))
            .unwrap_err();
        assert_eq!(err.level(), ErrorLevel::Filter);
        assert_eq!(err.ident(), "wsrc");
    }
}
