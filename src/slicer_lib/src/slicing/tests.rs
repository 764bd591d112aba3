use super::*;
use crate::prelude::*;

fn tid(name: &str) -> Tid {
    Tid::new(name)
}

/// main: a -> b -> c (data edges), plus an unrelated node d.
fn linear_module() -> (SliceModule, DgId, [DgNodeId; 4]) {
    let mut module = SliceModule::new();
    let main = module.create_graph("main");
    let block = module.add_block(main, tid("blk"));
    module.set_entry_block(main, block);
    let a = module.add_node(main, tid("a")).unwrap();
    let b = module.add_node(main, tid("b")).unwrap();
    let c = module.add_node(main, tid("c")).unwrap();
    let d = module.add_node(main, tid("d")).unwrap();
    for node in [a, b, c, d] {
        module.push_node_to_block(block, node);
    }
    module.add_data_edge(a, b);
    module.add_data_edge(b, c);
    (module, main, [a, b, c, d])
}

#[test]
fn mark_closes_over_incoming_edges() {
    let (mut module, _main, [a, b, c, d]) = linear_module();
    let mut slicer = Slicer::new();
    let slice_id = slicer.mark(&mut module, c, 0);
    assert!(slice_id > 0);
    for node in [a, b, c] {
        assert_eq!(module.node(node).slice_id, slice_id);
    }
    assert_ne!(module.node(d).slice_id, slice_id);

    slicer.slice(&mut module, slice_id);
    assert!(!module.node(d).is_alive());
    for node in [a, b, c] {
        assert!(module.node(node).is_alive());
    }
    let (total, removed) = slicer.get_statistics();
    assert_eq!(total, 4);
    assert_eq!(removed, 1);
}

#[test]
fn marking_twice_is_idempotent() {
    let (mut module, _main, [a, b, c, _d]) = linear_module();
    let mut slicer = Slicer::new();
    let slice_id = slicer.mark(&mut module, c, 0);
    let ids_after_first: Vec<u64> = [a, b, c]
        .iter()
        .map(|node| module.node(*node).slice_id)
        .collect();
    let second_id = slicer.mark(&mut module, c, slice_id);
    assert_eq!(second_id, slice_id);
    let ids_after_second: Vec<u64> = [a, b, c]
        .iter()
        .map(|node| module.node(*node).slice_id)
        .collect();
    assert_eq!(ids_after_first, ids_after_second);
}

#[test]
fn slice_ids_advance_between_sessions() {
    let (mut module, _main, [_a, _b, c, d]) = linear_module();
    let mut slicer = Slicer::new();
    let first = slicer.mark(&mut module, c, 0);
    let second = slicer.mark(&mut module, d, 0);
    assert!(second > first);
    // nodes of the first session count as unmarked in the second
    assert_ne!(module.node(c).slice_id, second);
}

#[test]
fn marking_ascends_into_callers() {
    let mut module = SliceModule::new();
    let main = module.create_graph("main");
    let main_block = module.add_block(main, tid("main_blk"));
    let helper = module.create_graph("helper");
    let helper_block = module.add_block(helper, tid("helper_blk"));

    // main: f_def -> call helper; helper: store (linked to load in main)
    let f_def = module.add_node(main, tid("f_def")).unwrap();
    let call = module.add_node(main, tid("call")).unwrap();
    module.add_use_edge(f_def, call);
    module.set_callee(call, helper);
    module.push_node_to_block(main_block, f_def);
    module.push_node_to_block(main_block, call);

    let store = module.add_node(helper, tid("store")).unwrap();
    module.push_node_to_block(helper_block, store);
    let load = module.add_node(main, tid("load")).unwrap();
    module.push_node_to_block(main_block, load);
    module.add_data_edge(store, load);

    let mut slicer = Slicer::new();
    let slice_id = slicer.mark(&mut module, load, 0);

    // the walk reaches the store, pulls in its procedure
    // and from there the call site and its operands
    assert_eq!(module.node(store).slice_id, slice_id);
    assert_eq!(module.graph(helper).slice_id, slice_id);
    assert_eq!(module.node(call).slice_id, slice_id);
    assert_eq!(module.node(f_def).slice_id, slice_id);
}

#[test]
fn untouched_procedures_are_not_pruned() {
    let mut module = SliceModule::new();
    let main = module.create_graph("main");
    let checker = module.create_graph("check_state");
    let kept = module.add_node(checker, tid("kept")).unwrap();
    let criterion = module.add_node(main, tid("criterion")).unwrap();

    let mut slicer = Slicer::new();
    slicer.keep_function_untouched("check_state");
    let slice_id = slicer.mark(&mut module, criterion, 0);
    slicer.slice(&mut module, slice_id);

    assert!(module.node(kept).is_alive());
    assert_ne!(module.node(kept).slice_id, slice_id);
}

#[test]
fn emptied_blocks_are_removed_and_the_cfg_is_stitched() {
    let mut module = SliceModule::new();
    let main = module.create_graph("main");
    let first = module.add_block(main, tid("blk1"));
    let middle = module.add_block(main, tid("blk2"));
    let last = module.add_block(main, tid("blk3"));
    module.connect_blocks(first, middle);
    module.connect_blocks(middle, last);
    module.set_entry_block(main, first);

    let criterion = module.add_node(main, tid("criterion")).unwrap();
    module.push_node_to_block(first, criterion);
    let pruned = module.add_node(main, tid("pruned")).unwrap();
    module.push_node_to_block(middle, pruned);
    let kept = module.add_node(main, tid("kept")).unwrap();
    module.push_node_to_block(last, kept);
    module.add_data_edge(kept, criterion);

    let mut slicer = Slicer::new();
    let slice_id = slicer.mark(&mut module, criterion, 0);
    slicer.slice(&mut module, slice_id);

    assert!(!module.block(middle).is_alive());
    assert!(module.block(first).successors().contains(&last));
}

#[test]
fn procedures_without_callers_are_removed() {
    let mut module = SliceModule::new();
    let main = module.create_graph("main");
    let helper = module.create_graph("helper");
    let call = module.add_node(main, tid("call")).unwrap();
    module.set_callee(call, helper);
    let criterion = module.add_node(main, tid("criterion")).unwrap();

    let mut slicer = Slicer::new();
    let slice_id = slicer.mark(&mut module, criterion, 0);
    slicer.slice(&mut module, slice_id);
    // the call was not in the slice, so the helper lost its only call site
    assert!(!module.node(call).is_alive());

    let keep: BTreeSet<String> = ["main".to_string()].into_iter().collect();
    let removed = remove_unused_graphs(&mut module, &keep);
    assert_eq!(removed, vec!["helper".to_string()]);
    assert!(!module.graph(helper).is_alive());
    assert!(module.graph(main).is_alive());
}
