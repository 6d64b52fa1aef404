//! Minimal collaborator example: registers a toy skb/IP catalog and prints
//! the script a dump request compiles to.
//!
//! Run with `cargo run --example skb_dump`; set `RUST_LOG=debug` to watch
//! the resolver work.

use anyhow::Result;
use indexmap::IndexMap;
use tracing_subscriber::EnvFilter;

use trazar::{
    Builder, CommonDumpOptions, CoreFeatures, FeatureComponent, FeatureComponentSpec,
    FeatureRegistry, Field, FieldGroup, FilterOptions, Object, Probe, TimeMode,
    TraceCommonOptions, TraceDumpOptions,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut registry = FeatureRegistry::new();
    let features = CoreFeatures::register(&mut registry);
    let spec = FeatureComponentSpec {
        component: FeatureComponent::Bpftrace,
        provider: Box::new(trazar::BpftraceVersionProvider::default()),
    };
    let mask = spec.process_features(&registry, "", "")?;

    let mut builder = Builder::new();
    builder.set_features(&mask, &features);

    builder.add_objects(vec![
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
            casts: IndexMap::from([(
                "$skb".to_string(),
                "{{ .Dst }} = ({{ StructKeyword }}iphdr*) ({{ .Src }}->head + {{ .Src }}->network_header)"
                    .to_string(),
            )]),
            ..Default::default()
        },
    ]);

    builder.add_probes(vec![Probe {
        name: "kprobe:dev_queue_xmit".to_string(),
        aliases: vec!["xmit".to_string()],
        args: IndexMap::from([("skb".to_string(), "arg0".to_string())]),
        help: "dev_queue_xmit() puts an skb on a device send queue".to_string(),
        ..Default::default()
    }]);

    builder.add_field_groups(vec![FieldGroup {
        object: "$iph".to_string(),
        row: "ip".to_string(),
        fields: vec![
            Field::named("ttl"),
            Field::named("protocol"),
            Field {
                alias: Some("src".to_string()),
                preprocessor: Some(std::rc::Rc::new(trazar::field_helpers::fpp_pton_inet)),
                ..Field::named("saddr")
            },
        ],
        ..Default::default()
    }]);

    let prog = builder.build_dump_trace(&TraceDumpOptions {
        trace: TraceCommonOptions {
            probe_names: vec!["xmit".to_string()],
            filter_options: FilterOptions {
                raw_filters: vec!["src == 127.0.0.1".to_string()],
                ..Default::default()
            },
            ..Default::default()
        },
        dump: CommonDumpOptions {
            field_group_rows: vec!["ip".to_string()],
            time_mode: TimeMode::Time,
            ..Default::default()
        },
    })?;

    println!("{}", prog.render());
    Ok(())
}
