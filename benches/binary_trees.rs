use std::sync::Arc;

use beltway::{Address, Config, Heap, Hub, Mutator, ScavengeMode, StandardObjectModel};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

const TREE: Hub = Hub(2);

pub fn bench_gcs(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary trees");
    group.sample_size(20);
    let n = 12;

    for i in n..17 {
        let min_depth = 4;
        let mut max_depth = min_depth + 2;
        if max_depth < i {
            max_depth = i;
        }
        let modes = [
            ("sequential", ScavengeMode::Sequential),
            ("parallel:2", ScavengeMode::Parallel { workers: 2 }),
            ("parallel:4", ScavengeMode::Parallel { workers: 4 }),
        ];
        for (name, mode) in modes.iter() {
            group.bench_function(BenchmarkId::new(*name, i), |b| {
                b.iter_batched(
                    || heap(*mode),
                    |heap| {
                        let mut mutator = heap.attach_mutator().unwrap();
                        let mut depth = min_depth;
                        while depth < max_depth {
                            let iterations = 1 << (max_depth - depth + min_depth);
                            for _ in 0..iterations {
                                let tree = bottom_up_tree(&mut mutator, depth);
                                assert_eq!(item_check(tree), (1 << (depth + 1)) - 1);
                            }
                            depth += 2;
                        }
                    },
                    criterion::BatchSize::LargeInput,
                );
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_gcs);
criterion_main!(benches);

fn heap(mode: ScavengeMode) -> Arc<Heap> {
    let mut config = Config::default();
    config.heap_size = 16 * 1024 * 1024;
    config.boot_region_size = 0;
    config.code_region_size = 0;
    config.scavenge_mode = mode;
    Heap::new(config, Arc::new(StandardObjectModel::new())).unwrap()
}

fn bottom_up_tree(mutator: &mut Mutator, depth: usize) -> Address {
    let size = StandardObjectModel::cell_size(2, 0);
    if depth == 0 {
        let leaf = mutator.allocate(size).unwrap();
        unsafe { StandardObjectModel::new().initialize(leaf, TREE, size, 2) };
        return leaf;
    }
    let first = bottom_up_tree(mutator, depth - 1);
    let first = mutator.push_root(first);
    let second = bottom_up_tree(mutator, depth - 1);
    let second = mutator.push_root(second);
    let node = mutator.allocate(size).unwrap();
    unsafe { StandardObjectModel::new().initialize(node, TREE, size, 2) };
    let heap = mutator.heap().clone();
    heap.write_reference(StandardObjectModel::reference_slot(node, 0), mutator.root(first));
    heap.write_reference(StandardObjectModel::reference_slot(node, 1), mutator.root(second));
    mutator.truncate_roots(first);
    node
}

fn item_check(tree: Address) -> usize {
    let first = unsafe { StandardObjectModel::read_reference(tree, 0) };
    if first.is_null() {
        return 1;
    }
    let second = unsafe { StandardObjectModel::read_reference(tree, 1) };
    1 + item_check(first) + item_check(second)
}
