use super::*;
use crate::pointer::subgraph::{AllocationData, NULLPTR};
use crate::utils::log::LogThread;

fn local(size: u64) -> PsNodeKind {
    PsNodeKind::Alloc(AllocationData {
        size: Offset::new(size),
        zero_initialized: false,
        is_heap: false,
        is_global: false,
    })
}

fn zeroed(size: u64) -> PsNodeKind {
    PsNodeKind::Alloc(AllocationData {
        size: Offset::new(size),
        zero_initialized: true,
        is_heap: false,
        is_global: false,
    })
}

/// Wire the given nodes into a successor chain.
fn chain(subgraph: &mut PointerSubgraph, nodes: &[PsNodeId]) {
    for window in nodes.windows(2) {
        subgraph.add_successor(window[0], window[1]);
    }
}

/// Run the analysis with the default configuration and a discarding log sink.
fn run(subgraph: &mut PointerSubgraph, roots: &[PsNodeId]) -> PointsToResults {
    run_with_config(subgraph, roots, Config::default())
}

fn run_with_config(
    subgraph: &mut PointerSubgraph,
    roots: &[PsNodeId],
    config: Config,
) -> PointsToResults {
    let sender = LogThread::create_disconnected_sender();
    let mut analysis = PointerAnalysis::new(subgraph, FlowInsensitiveContext, config, sender);
    analysis.run(roots).unwrap();
    analysis.into_results()
}

#[test]
fn store_then_load() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let slot = subgraph.add_node(local(8));
    let value = subgraph.add_node(local(8));
    let store = subgraph.add_node(PsNodeKind::Store);
    subgraph.add_operand(store, value);
    subgraph.add_operand(store, slot);
    let load = subgraph.add_node(PsNodeKind::Load);
    subgraph.add_operand(load, slot);
    chain(&mut subgraph, &[entry, slot, value, store, load]);

    let results = run(&mut subgraph, &[entry]);
    let loaded = &subgraph.node(load).points_to;
    assert_eq!(loaded.len(), 1);
    assert!(loaded.contains(&Pointer::new(value, Offset::new(0))));
    let object = results.object_of(slot).unwrap();
    assert!(object
        .pointers_at(Offset::new(0))
        .unwrap()
        .contains(&Pointer::new(value, Offset::new(0))));
}

#[test]
fn load_from_zero_initialized_memory_yields_null() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let slot = subgraph.add_node(zeroed(8));
    let load = subgraph.add_node(PsNodeKind::Load);
    subgraph.add_operand(load, slot);
    chain(&mut subgraph, &[entry, slot, load]);

    let log_thread = LogThread::spawn(LogThread::collect_and_deduplicate);
    let mut analysis = PointerAnalysis::new(
        &mut subgraph,
        FlowInsensitiveContext,
        Config::default(),
        log_thread.get_msg_sender(),
    );
    analysis.run(&[entry]).unwrap();
    let (logs, warnings) = log_thread.collect();

    let loaded = &subgraph.node(load).points_to;
    assert_eq!(loaded.len(), 1);
    assert!(loaded.contains(&Pointer::null()));
    // reading zero-initialized memory is not an error
    assert!(logs.is_empty());
    assert!(warnings.is_empty());
}

#[test]
fn load_from_unwritten_memory_is_reported() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let slot = subgraph.add_node(local(8));
    let load = subgraph.add_node(PsNodeKind::Load);
    subgraph.add_operand(load, slot);
    subgraph.node_mut(load).tid = Some(Tid::new("load_1"));
    chain(&mut subgraph, &[entry, slot, load]);

    let log_thread = LogThread::spawn(LogThread::collect_and_deduplicate);
    let mut analysis = PointerAnalysis::new(
        &mut subgraph,
        FlowInsensitiveContext,
        Config::default(),
        log_thread.get_msg_sender(),
    );
    analysis.run(&[entry]).unwrap();
    let (_logs, warnings) = log_thread.collect();

    assert!(subgraph.node(load).points_to.is_empty());
    assert!(warnings
        .iter()
        .any(|warning| warning.kind == WarningKind::EmptyPointsToLoad));
}

#[test]
fn empty_load_operand_is_reported() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let address = subgraph.add_node(PsNodeKind::Noop);
    let load = subgraph.add_node(PsNodeKind::Load);
    subgraph.add_operand(load, address);
    chain(&mut subgraph, &[entry, address, load]);

    let log_thread = LogThread::spawn(LogThread::collect_and_deduplicate);
    let mut analysis = PointerAnalysis::new(
        &mut subgraph,
        FlowInsensitiveContext,
        Config::default(),
        log_thread.get_msg_sender(),
    );
    analysis.run(&[entry]).unwrap();
    let (logs, _warnings) = log_thread.collect();

    // the warning has no term ID attached, so it ends up as an error log
    assert!(logs
        .iter()
        .any(|log| log.text.contains("has no points-to set")));
}

#[test]
fn gep_within_bounds_keeps_concrete_offset() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let alloc = subgraph.add_node(local(16));
    let gep = subgraph.add_node(PsNodeKind::Gep {
        offset: Offset::new(8),
    });
    subgraph.add_operand(gep, alloc);
    chain(&mut subgraph, &[entry, alloc, gep]);

    run(&mut subgraph, &[entry]);
    let pointers = &subgraph.node(gep).points_to;
    assert_eq!(pointers.len(), 1);
    assert!(pointers.contains(&Pointer::new(alloc, Offset::new(8))));
}

#[test]
fn gep_past_the_allocation_size_saturates() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let alloc = subgraph.add_node(local(16));
    let gep = subgraph.add_node(PsNodeKind::Gep {
        offset: Offset::new(32),
    });
    subgraph.add_operand(gep, alloc);
    chain(&mut subgraph, &[entry, alloc, gep]);

    run(&mut subgraph, &[entry]);
    let pointers = &subgraph.node(gep).points_to;
    assert_eq!(pointers.len(), 1);
    assert!(pointers.contains(&Pointer::new(alloc, Offset::UNKNOWN)));
}

#[test]
fn gep_saturates_at_the_configured_ceiling() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let alloc = subgraph.add_node(local(1024));
    let gep = subgraph.add_node(PsNodeKind::Gep {
        offset: Offset::new(512),
    });
    subgraph.add_operand(gep, alloc);
    chain(&mut subgraph, &[entry, alloc, gep]);

    // 512 is in bounds, but above the field-sensitivity ceiling
    run(&mut subgraph, &[entry]);
    let pointers = &subgraph.node(gep).points_to;
    assert!(pointers.contains(&Pointer::new(alloc, Offset::UNKNOWN)));
}

#[test]
fn phi_and_cast_union_operand_pointers() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let first = subgraph.add_node(local(8));
    let second = subgraph.add_node(local(8));
    let cast = subgraph.add_node(PsNodeKind::Cast);
    subgraph.add_operand(cast, first);
    let phi = subgraph.add_node(PsNodeKind::Phi);
    subgraph.add_operand(phi, cast);
    subgraph.add_operand(phi, second);
    chain(&mut subgraph, &[entry, first, second, cast, phi]);

    run(&mut subgraph, &[entry]);
    let pointers = &subgraph.node(phi).points_to;
    assert_eq!(pointers.len(), 2);
    assert!(pointers.contains(&Pointer::new(first, Offset::new(0))));
    assert!(pointers.contains(&Pointer::new(second, Offset::new(0))));
}

#[test]
fn memcpy_copies_entries_and_clears_zero_initialization() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let destination = subgraph.add_node(zeroed(64));
    let source = subgraph.add_node(local(64));
    let x = subgraph.add_node(local(8));
    let y = subgraph.add_node(local(8));
    let store_x = subgraph.add_node(PsNodeKind::Store);
    subgraph.add_operand(store_x, x);
    subgraph.add_operand(store_x, source);
    let source_at_8 = subgraph.add_node(PsNodeKind::Gep {
        offset: Offset::new(8),
    });
    subgraph.add_operand(source_at_8, source);
    let store_y = subgraph.add_node(PsNodeKind::Store);
    subgraph.add_operand(store_y, y);
    subgraph.add_operand(store_y, source_at_8);
    let memcpy = subgraph.add_node(PsNodeKind::Memcpy {
        length: Offset::new(64),
    });
    subgraph.add_operand(memcpy, source);
    subgraph.add_operand(memcpy, destination);
    chain(
        &mut subgraph,
        &[
            entry,
            destination,
            source,
            x,
            y,
            store_x,
            source_at_8,
            store_y,
            memcpy,
        ],
    );

    let results = run(&mut subgraph, &[entry]);
    let dest_object = results.object_of(destination).unwrap();
    assert!(dest_object
        .pointers_at(Offset::new(0))
        .unwrap()
        .contains(&Pointer::new(x, Offset::new(0))));
    assert!(dest_object
        .pointers_at(Offset::new(8))
        .unwrap()
        .contains(&Pointer::new(y, Offset::new(0))));
    // the copy overwrote the whole object
    assert!(!subgraph.node(destination).is_zero_initialized());
}

#[test]
fn memcpy_from_zero_initialized_source_may_copy_null() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let destination = subgraph.add_node(local(16));
    let source = subgraph.add_node(zeroed(16));
    let x = subgraph.add_node(local(8));
    let store_x = subgraph.add_node(PsNodeKind::Store);
    subgraph.add_operand(store_x, x);
    subgraph.add_operand(store_x, source);
    // a partial copy cannot prove the destination zero-initialized
    let memcpy = subgraph.add_node(PsNodeKind::Memcpy {
        length: Offset::new(8),
    });
    subgraph.add_operand(memcpy, source);
    subgraph.add_operand(memcpy, destination);
    chain(&mut subgraph, &[entry, destination, source, x, store_x, memcpy]);

    let results = run(&mut subgraph, &[entry]);
    let dest_object = results.object_of(destination).unwrap();
    assert!(dest_object
        .pointers_at(Offset::new(0))
        .unwrap()
        .contains(&Pointer::new(x, Offset::new(0))));
    assert!(dest_object
        .pointers_at(Offset::UNKNOWN)
        .unwrap()
        .contains(&Pointer::null()));
    assert!(!subgraph.node(destination).is_zero_initialized());
}

#[test]
fn memcpy_covering_the_whole_object_propagates_zero_initialization() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let destination = subgraph.add_node(local(16));
    let source = subgraph.add_node(zeroed(16));
    let memcpy = subgraph.add_node(PsNodeKind::Memcpy {
        length: Offset::new(16),
    });
    subgraph.add_operand(memcpy, source);
    subgraph.add_operand(memcpy, destination);
    chain(&mut subgraph, &[entry, destination, source, memcpy]);

    run(&mut subgraph, &[entry]);
    assert!(subgraph.node(destination).is_zero_initialized());
}

#[derive(Default)]
struct RecordingContext {
    discovered: Vec<(PsNodeId, PsNodeId)>,
}

impl PointerAnalysisContext for RecordingContext {
    fn resolve_objects(
        &self,
        subgraph: &PointerSubgraph,
        node: PsNodeId,
        pointer: &Pointer,
    ) -> Result<Vec<PsNodeId>, Error> {
        FlowInsensitiveContext.resolve_objects(subgraph, node, pointer)
    }

    fn function_pointer_call(
        &mut self,
        _subgraph: &mut PointerSubgraph,
        call: PsNodeId,
        function: PsNodeId,
    ) -> Result<Vec<PsNodeId>, Error> {
        self.discovered.push((call, function));
        Ok(Vec::new())
    }
}

#[test]
fn funcptr_call_discovers_its_callee_once() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let function = subgraph.add_node(PsNodeKind::Function {
        name: "callee".to_string(),
    });
    let pointer_slot = subgraph.add_node(local(8));
    let store = subgraph.add_node(PsNodeKind::Store);
    subgraph.add_operand(store, function);
    subgraph.add_operand(store, pointer_slot);
    let load = subgraph.add_node(PsNodeKind::Load);
    subgraph.add_operand(load, pointer_slot);
    let call = subgraph.add_node(PsNodeKind::CallFuncPtr);
    subgraph.add_operand(call, load);
    chain(
        &mut subgraph,
        &[entry, function, pointer_slot, store, load, call],
    );

    let sender = LogThread::create_disconnected_sender();
    let mut analysis = PointerAnalysis::new(
        &mut subgraph,
        RecordingContext::default(),
        Config::default(),
        sender,
    );
    analysis.run(&[entry]).unwrap();
    let context = analysis.into_context();

    assert_eq!(
        context.discovered,
        vec![(call, function)],
        "the callback fires exactly once per discovered callee"
    );
    assert!(subgraph
        .node(call)
        .points_to
        .contains(&Pointer::new(function, Offset::new(0))));
}

#[test]
fn call_through_null_pointer_is_reported_and_skipped() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let null_value = subgraph.add_node(PsNodeKind::Constant);
    subgraph.add_pointer(null_value, Pointer::null());
    let call = subgraph.add_node(PsNodeKind::CallFuncPtr);
    subgraph.add_operand(call, null_value);
    chain(&mut subgraph, &[entry, null_value, call]);

    let log_thread = LogThread::spawn(LogThread::collect_and_deduplicate);
    let mut analysis = PointerAnalysis::new(
        &mut subgraph,
        FlowInsensitiveContext,
        Config::default(),
        log_thread.get_msg_sender(),
    );
    analysis.run(&[entry]).unwrap();
    let (logs, _warnings) = log_thread.collect();
    assert!(logs
        .iter()
        .any(|log| log.text.contains("invalid pointer")));
}

#[test]
fn call_return_invalidates_pointers_to_locals() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let local_alloc = subgraph.add_node(local(8));
    let returned = subgraph.add_node(PsNodeKind::Return);
    subgraph.add_operand(returned, local_alloc);
    let call_return = subgraph.add_node(PsNodeKind::CallReturn);
    subgraph.add_operand(call_return, returned);
    chain(&mut subgraph, &[entry, local_alloc, returned, call_return]);

    let config = Config {
        invalidate_nodes: true,
        ..Config::default()
    };
    run_with_config(&mut subgraph, &[entry], config);
    let pointers = &subgraph.node(call_return).points_to;
    assert!(pointers.contains(&Pointer::new(local_alloc, Offset::new(0))));
    assert!(pointers.contains(&Pointer::new(INVALIDATED, Offset::new(0))));
}

#[test]
fn invalidate_locals_rederives_its_parent() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let returning = subgraph.add_node(PsNodeKind::Return);
    let landing = subgraph.add_node(PsNodeKind::Noop);
    subgraph.node_mut(landing).parent = Some(entry);
    let invalidate = subgraph.add_node(PsNodeKind::InvalidateLocals);
    subgraph.add_operand(invalidate, returning);
    chain(&mut subgraph, &[entry, returning, landing, invalidate]);

    run(&mut subgraph, &[entry]);
    // the parent comes from the landing point after the return
    assert_eq!(subgraph.node(invalidate).parent, Some(entry));
}

#[test]
fn alloc_nodes_keep_their_self_pointer() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let alloc = subgraph.add_node(local(8));
    chain(&mut subgraph, &[entry, alloc]);
    run(&mut subgraph, &[entry]);
    let pointers = &subgraph.node(alloc).points_to;
    assert_eq!(pointers.len(), 1);
    assert!(pointers.contains(&Pointer::new(alloc, Offset::new(0))));
    assert_eq!(subgraph.node(NULLPTR).kind, PsNodeKind::NullAddr);
}

#[test]
fn rerunning_the_analysis_is_idempotent() {
    let mut subgraph = PointerSubgraph::new();
    let entry = subgraph.add_node(PsNodeKind::Entry);
    let slot = subgraph.add_node(local(8));
    let value = subgraph.add_node(local(8));
    let store = subgraph.add_node(PsNodeKind::Store);
    subgraph.add_operand(store, value);
    subgraph.add_operand(store, slot);
    let load = subgraph.add_node(PsNodeKind::Load);
    subgraph.add_operand(load, slot);
    chain(&mut subgraph, &[entry, slot, value, store, load]);

    run(&mut subgraph, &[entry]);
    let first = subgraph.node(load).points_to.clone();
    run(&mut subgraph, &[entry]);
    assert_eq!(subgraph.node(load).points_to, first);
}
