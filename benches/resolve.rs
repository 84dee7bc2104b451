use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ferrous_conductor::*;
use std::sync::Arc;

// ===== Resolution =====

fn bench_singleton_hit(c: &mut Criterion) {
    let container = Container::new();
    container
        .register_singleton("answer", Dependencies::none(), 0, Factory::instance(42u64))
        .unwrap();
    let key = Key::named("answer");
    let _ = container.resolve(&key).unwrap();

    c.bench_function("singleton_hit_u64", |b| {
        b.iter(|| {
            let v = container.resolve_as::<u64>(black_box(&key)).unwrap();
            black_box(v);
        })
    });
}

fn bench_singleton_cold(c: &mut Criterion) {
    struct ExpensiveToCreate {
        data: Vec<u64>,
    }

    c.bench_function("singleton_cold_expensive", |b| {
        b.iter_batched(
            || {
                let container = Container::new();
                container
                    .register_singleton(
                        "expensive",
                        Dependencies::none(),
                        0,
                        Factory::service(|_| {
                            Ok(ExpensiveToCreate {
                                data: (0..1000).collect(),
                            })
                        }),
                    )
                    .unwrap();
                container
            },
            |container| {
                let v = container
                    .resolve_as::<ExpensiveToCreate>(&Key::named("expensive"))
                    .unwrap();
                black_box(v.data.len());
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_scoped_vs_transient(c: &mut Criterion) {
    struct Service {
        data: [u8; 64],
    }

    let mut group = c.benchmark_group("scoped_vs_transient");
    let container = Container::new();
    container
        .register_scoped("scoped", Dependencies::none(), 0, Factory::service(|_| Ok(Service { data: [0; 64] })))
        .unwrap();
    container
        .register_transient(
            "transient",
            Dependencies::none(),
            0,
            Factory::service(|_| Ok(Service { data: [0; 64] })),
        )
        .unwrap();
    let scope = container.create_scope();

    for name in ["scoped", "transient"] {
        let key = Key::named(name);
        group.bench_with_input(BenchmarkId::from_parameter(name), &key, |b, key| {
            b.iter(|| {
                let v = scope.resolve_as::<Service>(key).unwrap();
                black_box(v.data[0]);
            })
        });
    }
    group.finish();
}

fn bench_dependency_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("transient_chain");
    for depth in [1usize, 4, 16] {
        let container = Container::new();
        container
            .register_singleton("link-0", Dependencies::none(), 0, Factory::instance(0usize))
            .unwrap();
        for i in 1..=depth {
            let previous = format!("link-{}", i - 1);
            let dependency = previous.clone();
            container
                .register_transient(
                    format!("link-{i}"),
                    Dependencies::on([previous]),
                    0,
                    Factory::service(move |ctx| Ok(*ctx.get::<usize>(dependency.as_str())? + 1)),
                )
                .unwrap();
        }
        let top = Key::named(format!("link-{depth}"));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &top, |b, top| {
            b.iter(|| black_box(container.resolve_as::<usize>(top).unwrap()))
        });
    }
    group.finish();
}

// ===== Graph =====

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan");
    for size in [50usize, 500] {
        let registry = Arc::new(Registry::new());
        for i in 0..size {
            let deps = Dependencies::on((i.saturating_sub(3)..i).map(|d| format!("n{d}")));
            registry
                .register(ServiceDescriptor::singleton(format!("n{i}"), Factory::instance(())).with_dependencies(deps))
                .unwrap();
        }
        let snapshot = registry.snapshot();
        group.bench_with_input(BenchmarkId::from_parameter(size), &snapshot, |b, snapshot| {
            b.iter(|| {
                let (graph, errors) = DependencyGraph::build(snapshot);
                debug_assert!(errors.is_empty());
                black_box(plan(&graph).unwrap().len())
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_singleton_hit,
    bench_singleton_cold,
    bench_scoped_vs_transient,
    bench_dependency_chain,
    bench_plan
);
criterion_main!(benches);
