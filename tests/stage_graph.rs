//! Stage-graph soundness over the public construction API.

use std::sync::Arc;

use byteloom::{
    analysis::{TypeAnalysis, UseIndex, ValueFlowAnalysis},
    bytecode::{
        opcode as op, ClassRef, FieldFlags, FieldRef, JavaType, MethodBody, MethodBuilder,
        MethodFlags, PoolEntry,
    },
    stage::{build_stage_graph, Language, NodeRef, StageGraph, StageInfo, TablePolicy},
};

fn staged_field(name: &str) -> (FieldRef, TablePolicy) {
    let field = FieldRef {
        class: ClassRef::new("demo/Lang"),
        name: Arc::from(name),
        descriptor: JavaType::parse("I").unwrap(),
        flags: FieldFlags::STATIC,
    };
    let mut policy = TablePolicy::new();
    policy.stage(
        field.member_id(),
        StageInfo {
            language: Language::new("expr"),
            strict: false,
            static_info: vec![],
        },
    );
    (field, policy)
}

fn build(body: &MethodBody, policy: &TablePolicy) -> (StageGraph, ValueFlowAnalysis) {
    let types = TypeAnalysis::run(body).unwrap();
    let valueflow = ValueFlowAnalysis::run(body, &types).unwrap();
    let graph = build_stage_graph(body, &types, &valueflow, policy).unwrap();
    (graph, valueflow)
}

#[test]
fn surviving_staged_sources_are_entry_reachable() {
    // One staged read per arm of a diamond; both survive and both are
    // reachable from the entry sentinel along control edges.
    let (field_a, _) = staged_field("a");
    let (field_b, _) = staged_field("b");
    let mut policy = TablePolicy::new();
    for field in [&field_a, &field_b] {
        policy.stage(
            field.member_id(),
            StageInfo {
                language: Language::new("expr"),
                strict: false,
                static_info: vec![],
            },
        );
    }

    let mut b = MethodBuilder::new("demo/Host", "f", "(I)I", MethodFlags::STATIC).unwrap();
    let other = b.label();
    let join = b.label();
    let body = b
        .op(op::ILOAD_0)
        .branch(op::IFEQ, other)
        .pool_op(op::GETSTATIC, PoolEntry::Field(field_a))
        .branch(op::GOTO, join)
        .bind(other)
        .pool_op(op::GETSTATIC, PoolEntry::Field(field_b))
        .bind(join)
        .op(op::IRETURN)
        .build()
        .unwrap();

    let (graph, _) = build(&body, &policy);
    let staged: Vec<_> = graph.staged_sources().collect();
    assert_eq!(staged.len(), 2);
    for node in &staged {
        assert!(graph.reaches_from_entry(NodeRef::Source(node.id)));
        // In/out control edges are fully resolved before hand-off.
        assert!(!graph.control_in(NodeRef::Source(node.id)).is_empty());
        assert!(!graph.control_out(NodeRef::Source(node.id)).is_empty());
    }
    assert!(graph.reaches_from_entry(NodeRef::Exit));
}

#[test]
fn unreachable_staged_code_never_enters_the_graph() {
    let (field, policy) = staged_field("dead");
    let mut b = MethodBuilder::new("demo/Host", "f", "()I", MethodFlags::STATIC).unwrap();
    let end = b.label();
    let body = b
        .op(op::ICONST_0)
        .branch(op::GOTO, end)
        // Dead: nothing branches here.
        .pool_op(op::GETSTATIC, PoolEntry::Field(field))
        .op(op::POP)
        .bind(end)
        .op(op::IRETURN)
        .build()
        .unwrap();

    let (graph, _) = build(&body, &policy);
    assert_eq!(graph.staged_sources().count(), 0);
}

#[test]
fn data_edges_match_the_value_flow_result() {
    let (field, policy) = staged_field("staged");
    let body = MethodBuilder::new("demo/Host", "f", "()I", MethodFlags::STATIC)
        .unwrap()
        .pool_op(op::GETSTATIC, PoolEntry::Field(field)) // 0
        .local_op(op::ISTORE, 0) // 3
        .local_op(op::ILOAD, 0) // 5
        .op(op::IRETURN) // 7
        .build()
        .unwrap();

    let (graph, valueflow) = build(&body, &policy);
    let staged = graph.staged_sources().next().unwrap();

    // Every data edge of the graph is backed by the value-flow relation.
    for &use_index in graph.data_out(staged.id) {
        let sources = valueflow.sources_of(use_index).unwrap();
        assert!(sources.contains(&staged.id));
    }
    // The staged value's first consumer is the store.
    assert!(graph
        .data_out(staged.id)
        .contains(&UseIndex { at: 3, operand: 0 }));
}

#[test]
fn exception_handlers_keep_staged_flow_connected() {
    let (field, policy) = staged_field("staged");
    let mut b = MethodBuilder::new("demo/Host", "f", "()I", MethodFlags::STATIC).unwrap();
    let start = b.label();
    let end = b.label();
    let handler = b.label();
    let body = b
        .bind(start)
        .pool_op(op::GETSTATIC, PoolEntry::Field(field)) // 0, protected
        .bind(end)
        .op(op::IRETURN) // 3
        .bind(handler)
        .op(op::POP) // 4
        .op(op::ICONST_0) // 5
        .op(op::IRETURN) // 6
        .handler(start, end, handler, Some("java/lang/Throwable"))
        .build()
        .unwrap();

    let (graph, _) = build(&body, &policy);
    let staged = graph.staged_sources().next().unwrap();
    assert!(graph.reaches_from_entry(NodeRef::Source(staged.id)));
    // Both the normal return and the handler path reach the exit.
    assert!(graph.reaches_from_entry(NodeRef::Exit));
}

#[test]
fn every_reachable_use_has_a_producer() {
    let (field, policy) = staged_field("staged");
    let mut b = MethodBuilder::new("demo/Host", "f", "(I)I", MethodFlags::STATIC).unwrap();
    let other = b.label();
    let join = b.label();
    let body = b
        .op(op::ILOAD_0)
        .branch(op::IFEQ, other)
        .pool_op(op::GETSTATIC, PoolEntry::Field(field))
        .branch(op::GOTO, join)
        .bind(other)
        .op(op::ICONST_0)
        .bind(join)
        .op(op::IRETURN)
        .build()
        .unwrap();

    let (graph, valueflow) = build(&body, &policy);
    for (use_index, sources) in valueflow.all_uses() {
        assert!(!sources.is_empty(), "use {use_index:?} has no producers");
    }
    // The merged return consumes both the staged read and the literal.
    let staged = graph.staged_sources().next().unwrap();
    let ret_use = graph.data_out(staged.id)[0];
    assert!(valueflow.sources_of(ret_use).unwrap().len() >= 2);
}
