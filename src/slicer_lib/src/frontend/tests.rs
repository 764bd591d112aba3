use super::*;
use crate::intermediate_representation::builder::{simple_sub, term, var};
use crate::intermediate_representation::Global;
use crate::utils::log::LogThread;

fn alloc(id: &str, size: u64) -> Term<Def> {
    term(
        id,
        Def::Alloc {
            size: Some(size),
            zero_initialized: false,
        },
    )
}

fn store(id: &str, address: Value, value: Value) -> Term<Def> {
    term(id, Def::Store { address, value })
}

fn load(id: &str, address: Value) -> Term<Def> {
    term(id, Def::Load { address })
}

fn call_direct(id: &str, callee: &str, args: Vec<Value>) -> Term<Def> {
    term(
        id,
        Def::Call {
            target: CallTarget::Direct(callee.to_string()),
            args,
        },
    )
}

fn global(id: &str, size: u64) -> Term<Global> {
    term(
        id,
        Global {
            name: id.to_string(),
            size: Some(size),
            zero_initialized: true,
            initializer: None,
        },
    )
}

/// The transitive function-pointer scenario:
/// `setB` writes the global `b`, `setA` calls `setB`,
/// `main` stores `&setA` into `f` and calls through `f`,
/// then asserts on the loaded value of `b`.
fn funcptr_program() -> Program {
    let set_b = simple_sub(
        "setB",
        vec![store("setB_store", var("b"), Value::Int(1))],
    );
    let set_a = simple_sub("setA", vec![call_direct("setA_call", "setB", vec![])]);
    let main = simple_sub(
        "main",
        vec![
            alloc("f", 8),
            store("store_f", var("f"), Value::Function("setA".to_string())),
            load("load_f", var("f")),
            term(
                "call_f",
                Def::Call {
                    target: CallTarget::Indirect(var("load_f")),
                    args: vec![],
                },
            ),
            load("load_b", var("b")),
            term(
                "cmp",
                Def::Compute {
                    operands: vec![var("load_b")],
                },
            ),
            call_direct("call_assert", "assert", vec![var("cmp")]),
        ],
    );
    Program {
        globals: vec![global("b", 8)],
        subs: vec![set_b, set_a, main],
        entry: "main".to_string(),
    }
}

/// Find the pointer subgraph node lowered from the given instruction.
fn ps_of(lowered: &LoweredProgram, id: &str) -> PsNodeId {
    let tid = Tid::new(id);
    lowered
        .subgraph
        .node_ids()
        .find(|node| lowered.subgraph.node(*node).tid.as_ref() == Some(&tid))
        .unwrap()
}

fn sub_names(program: &Program) -> Vec<&str> {
    program
        .subs
        .iter()
        .map(|sub| sub.term.name.as_str())
        .collect()
}

fn def_ids(program: &Program, sub_name: &str) -> Vec<String> {
    program
        .find_sub(sub_name)
        .unwrap()
        .term
        .blocks
        .iter()
        .flat_map(|block| block.term.defs.iter())
        .map(|def| def.tid.to_string())
        .collect()
}

#[test]
fn points_to_analysis_resolves_the_function_pointer() {
    let program = funcptr_program();
    let mut lowered = LoweredProgram::build(&program).unwrap();
    let context = lowered.pta_context();
    let mut pta = PointerAnalysis::new(
        &mut lowered.subgraph,
        context,
        Config::default(),
        LogThread::create_disconnected_sender(),
    );
    let roots = lowered.roots.clone();
    pta.run(&roots).unwrap();
    drop(pta);

    let set_a = lowered.function("setA").unwrap().function_node;
    let loaded = &lowered.subgraph.node(ps_of(&lowered, "load_f")).points_to;
    assert_eq!(loaded.len(), 1);
    assert!(loaded.contains(&Pointer::new(set_a, Offset::new(0))));

    lowered.resolve_indirect_calls();
    let call_f = lowered.criterion_nodes("setA");
    assert_eq!(call_f.len(), 1, "the indirect call now has a resolved callee");
}

#[test]
fn slicing_keeps_the_transitive_function_pointer_chain() {
    let program = funcptr_program();
    let results = slice_program(&program, "assert", Config::default(), &[]).unwrap();

    // all three procedures contribute to the assertion
    let names = sub_names(&results.program);
    assert!(names.contains(&"main"));
    assert!(names.contains(&"setA"));
    assert!(names.contains(&"setB"));

    let main_defs = def_ids(&results.program, "main");
    for kept in ["f", "store_f", "load_f", "call_f", "load_b", "cmp", "call_assert"] {
        assert!(main_defs.contains(&kept.to_string()), "{kept} must survive");
    }
    assert!(def_ids(&results.program, "setB").contains(&"setB_store".to_string()));
    assert_eq!(results.program.globals.len(), 1);

    let (total, removed) = results.statistics;
    assert!(total > 0);
    assert!(removed < total);
}

#[test]
fn unrelated_code_is_sliced_away() {
    let mut program = funcptr_program();
    // an allocation and store that nothing observes
    if let Some(main) = program.subs.iter_mut().find(|sub| sub.term.name == "main") {
        main.term.blocks[0]
            .term
            .defs
            .insert(0, alloc("dead", 16));
        main.term.blocks[0]
            .term
            .defs
            .insert(1, store("dead_store", var("dead"), Value::NullPtr));
    }
    let results = slice_program(&program, "assert", Config::default(), &[]).unwrap();
    let main_defs = def_ids(&results.program, "main");
    assert!(!main_defs.contains(&"dead".to_string()));
    assert!(!main_defs.contains(&"dead_store".to_string()));
}

#[test]
fn ret_criterion_uses_the_exit_node_and_drops_unused_globals() {
    let main = term(
        "main",
        Sub {
            name: "main".to_string(),
            parameters: vec![],
            blocks: vec![term(
                "main_blk",
                Blk {
                    defs: vec![
                        alloc("x", 8),
                        store("init_x", var("x"), Value::NullPtr),
                        load("lx", var("x")),
                    ],
                    jmp: term("main_ret", Jmp::Return(Some(var("lx")))),
                },
            )],
        },
    );
    let program = Program {
        globals: vec![global("unused_global", 8)],
        subs: vec![main],
        entry: "main".to_string(),
    };
    let results = slice_program(&program, "ret", Config::default(), &[]).unwrap();

    let main_defs = def_ids(&results.program, "main");
    for kept in ["x", "init_x", "lx"] {
        assert!(main_defs.contains(&kept.to_string()), "{kept} must survive");
    }
    assert!(results.program.globals.is_empty());
}

#[test]
fn a_missing_criterion_is_an_error() {
    let program = funcptr_program();
    assert!(slice_program(&program, "no_such_function", Config::default(), &[]).is_err());
}

#[test]
fn unused_procedures_are_removed() {
    let used = simple_sub("used", vec![]);
    let helper = simple_sub("helper", vec![]);
    let main = simple_sub("main", vec![call_direct("call_used", "used", vec![])]);
    let program = Program {
        globals: vec![],
        subs: vec![used.clone(), helper.clone(), main.clone()],
        entry: "main".to_string(),
    };
    let results = slice_program(&program, "used", Config::default(), &[]).unwrap();
    let names = sub_names(&results.program);
    assert!(names.contains(&"main"));
    assert!(names.contains(&"used"));
    assert!(!names.contains(&"helper"));
    assert_eq!(results.removed_functions, vec!["helper".to_string()]);

    // an untouched procedure survives without any uses
    let program = Program {
        globals: vec![],
        subs: vec![used, helper, main],
        entry: "main".to_string(),
    };
    let results =
        slice_program(&program, "used", Config::default(), &["helper".to_string()]).unwrap();
    assert!(sub_names(&results.program).contains(&"helper"));
}

#[test]
fn branch_terminators_survive_through_control_dependence() {
    // main: branch on c; the true block writes x; afterwards assert on x
    let main = term(
        "main",
        Sub {
            name: "main".to_string(),
            parameters: vec![],
            blocks: vec![
                term(
                    "head",
                    Blk {
                        defs: vec![
                            alloc("x", 8),
                            alloc("y", 8),
                            term(
                                "c",
                                Def::Compute { operands: vec![] },
                            ),
                        ],
                        jmp: term(
                            "branch",
                            Jmp::CondBranch {
                                condition: var("c"),
                                if_true: Tid::new("write"),
                                if_false: Tid::new("after"),
                            },
                        ),
                    },
                ),
                term(
                    "write",
                    Blk {
                        defs: vec![store("write_x", var("x"), var("y"))],
                        jmp: term("write_jmp", Jmp::Branch(Tid::new("after"))),
                    },
                ),
                term(
                    "after",
                    Blk {
                        defs: vec![
                            load("load_x", var("x")),
                            call_direct("call_assert", "assert", vec![var("load_x")]),
                        ],
                        jmp: term("main_ret", Jmp::Return(None)),
                    },
                ),
            ],
        },
    );
    let program = Program {
        globals: vec![],
        subs: vec![main],
        entry: "main".to_string(),
    };
    let results = slice_program(&program, "assert", Config::default(), &[]).unwrap();
    let main_defs = def_ids(&results.program, "main");
    assert!(main_defs.contains(&"write_x".to_string()));
    // the write is conditional, so the branch condition is part of the slice
    assert!(main_defs.contains(&"c".to_string()));
}

#[test]
fn programs_round_trip_through_json() {
    let program = funcptr_program();
    let json = serde_json::to_string_pretty(&program).unwrap();
    let read_back: Program = serde_json::from_str(&json).unwrap();
    assert_eq!(program, read_back);
}

#[test]
fn building_requires_an_entry_procedure() {
    let program = Program {
        globals: vec![],
        subs: vec![simple_sub("helper", vec![])],
        entry: "main".to_string(),
    };
    assert!(LoweredProgram::build(&program).is_err());
}
