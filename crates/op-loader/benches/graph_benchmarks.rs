//! Benchmarks for dependency graph firing and identity resolution

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use op_format::{PackageBuilder, PackageHeader, PackageIndex};
use op_loader::resolve::{export_paths, import_identities};
use op_loader::{DependencyGraph, ExportLookup, NodeId, NodePhase, NodeSpec};

/// Drain the fired queue, removing each node as it fires
fn drain(graph: &mut DependencyGraph<u32>) -> usize {
    let mut removed = 0;
    while let Some(fired) = graph.pop_fired() {
        graph.remove_node(fired.id);
        removed += 1;
    }
    removed
}

fn bench_chain_firing(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_chain");

    for len in [64u32, 1024, 16384].iter() {
        group.throughput(Throughput::Elements(*len as u64));

        group.bench_with_input(BenchmarkId::new("fire", len), len, |b, &len| {
            b.iter(|| {
                let mut graph = DependencyGraph::new();
                let mut previous: Option<NodeId> = None;
                for slot in 0..len {
                    let id = graph.add_node(0, NodePhase::ExportSerialize, Some(slot), true, 0);
                    if let Some(previous) = previous {
                        graph.add_arc(previous, id);
                    }
                    graph.done_adding_prerequisites(id);
                    previous = Some(id);
                }
                black_box(drain(&mut graph));
            });
        });
    }

    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_fan");

    for width in [16u32, 256, 4096].iter() {
        group.throughput(Throughput::Elements(*width as u64));

        group.bench_with_input(BenchmarkId::new("release", width), width, |b, &width| {
            b.iter(|| {
                let mut graph = DependencyGraph::new();
                let root = graph.add_node(0, NodePhase::PackageSummary, None, false, 1);
                let specs: Vec<NodeSpec<u32>> = (0..width)
                    .map(|slot| NodeSpec {
                        owner: 1,
                        slot: Some(slot),
                        phase: NodePhase::ExportCreate,
                        hold: true,
                        implicit: 0,
                    })
                    .collect();
                let range = graph.add_nodes(&specs);
                for offset in 0..range.len() {
                    if let Some(id) = range.node(offset) {
                        graph.add_arc(root, id);
                        graph.done_adding_prerequisites(id);
                    }
                }
                graph.release_implicit(root);
                black_box(drain(&mut graph));
            });
        });
    }

    group.finish();
}

fn bench_range_recycling(c: &mut Criterion) {
    let specs: Vec<NodeSpec<u32>> = (0..32)
        .map(|slot| NodeSpec {
            owner: slot,
            slot: Some(slot),
            phase: NodePhase::ExportStartIo,
            hold: true,
            implicit: 0,
        })
        .collect();

    c.bench_function("graph_retire_range", |b| {
        let mut graph = DependencyGraph::new();
        b.iter(|| {
            let range = graph.add_nodes(black_box(&specs));
            graph.retire_range(range);
            black_box(graph.live_count());
        });
    });
}

/// A package whose exports nest five deep under each other
fn nested_header(exports: u32) -> PackageHeader {
    let mut builder = PackageBuilder::new("/Game/Bench");
    let class = builder.import_class("/Script/Core", "Blob");
    let mut outer = PackageIndex::NULL;
    for i in 0..exports {
        if i % 5 == 0 {
            outer = PackageIndex::NULL;
        }
        outer = builder.add_export(&format!("Obj{}", i), class, outer, vec![0; 4]);
    }
    let built = builder.build(op_format::Layout::Combined);
    match PackageHeader::parse(&built.header) {
        Ok(header) => header,
        Err(e) => panic!("generated header does not parse: {}", e),
    }
}

fn bench_identity_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity_resolution");

    for exports in [100u32, 1000, 10000].iter() {
        let header = nested_header(*exports);
        let imports = import_identities(&header);
        group.throughput(Throughput::Elements(*exports as u64));

        group.bench_with_input(BenchmarkId::new("export_paths", exports), &header, |b, header| {
            b.iter(|| black_box(export_paths("/Game/Bench", header, &imports)));
        });

        let paths = export_paths("/Game/Bench", &header, &imports);
        let lookup = ExportLookup::new(&paths);
        group.bench_with_input(BenchmarkId::new("lookup", exports), &paths, |b, paths| {
            b.iter(|| {
                let mut found = 0;
                for path in paths.iter() {
                    if lookup.get(black_box(path)).is_some() {
                        found += 1;
                    }
                }
                black_box(found);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_chain_firing,
    bench_fan_out,
    bench_range_recycling,
    bench_identity_resolution
);
criterion_main!(benches);
