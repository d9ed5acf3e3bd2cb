use std::sync::Arc;

use beltway::{Address, Config, Heap, Hub, ScavengeMode, StandardObjectModel};

const NODE: Hub = Hub(2);

fn main() {
    simple_logger::init().unwrap();
    let mode = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<ScavengeMode>().unwrap(),
        None => ScavengeMode::Sequential,
    };

    let mut config = Config::default();
    config.heap_size = 4 * 1024 * 1024;
    config.scavenge_mode = mode;
    config.verify_after_gc = true;
    config.verbose = true;
    let heap = Heap::new(config, Arc::new(StandardObjectModel::new())).unwrap();
    let model = StandardObjectModel::new();
    let mut mutator = heap.attach_mutator().unwrap();

    let size = StandardObjectModel::cell_size(1, 8);
    let head = mutator.push_root(Address::null());
    for value in 0..200_000usize {
        let node = mutator.allocate(size).unwrap();
        unsafe {
            model.initialize(node, NODE, size, 1);
            StandardObjectModel::payload(node).store_word(value);
        }
        // Only every thousandth node stays reachable.
        if value % 1000 == 0 {
            let next = mutator.root(head);
            heap.write_reference(StandardObjectModel::reference_slot(node, 0), next);
            mutator.set_root(head, node);
        }
    }
    mutator.collect(0).unwrap();

    let mut length = 0;
    let mut node = mutator.root(head);
    while node.is_non_null() {
        length += 1;
        node = unsafe { StandardObjectModel::read_reference(node, 0) };
    }
    assert_eq!(length, 200);
    println!("{}", heap.statistics());
}
