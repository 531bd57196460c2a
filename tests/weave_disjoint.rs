//! Randomized weave-plan properties.
//!
//! Bodies are synthesized from random operation sequences with random
//! staged/opaque member annotations. Two properties must hold across all of
//! them: at most one of the two mutually exclusive operand plans exists per
//! (position, stack offset), and a body with nothing staged comes out
//! byte-identical.

use std::sync::Arc;

use proptest::prelude::*;

use byteloom::{
    analysis::{ConstantAnalysis, TypeAnalysis, ValueFlowAnalysis},
    bytecode::{
        opcode as op, ClassRef, FieldFlags, FieldRef, JavaType, MethodBody, MethodBuilder,
        MethodDescriptor, MethodFlags, MethodRef, PoolEntry,
    },
    stage::{build_stage_graph, plan_caches, Cachability, Language, StageInfo, TablePolicy},
    weave::{
        apply_plan, EditKind, RuntimeSurface, SiteEmitter, StagedSiteDesc, WeaveAnalysis,
    },
    Result, WeaveConfig, WeaveOutcome, Weaver,
};

#[derive(Default)]
struct TestEmitter {
    count: usize,
}

impl SiteEmitter for TestEmitter {
    fn emit_invoke_site(&mut self, site: &StagedSiteDesc) -> Result<MethodRef> {
        let method = MethodRef {
            class: ClassRef::new("demo/Generated"),
            name: Arc::from(format!("site${}", self.count)),
            descriptor: site.descriptor.clone(),
        };
        self.count += 1;
        Ok(method)
    }
}

/// One step of a synthesized body; the builder inserts padding literals so
/// every step finds its operands.
#[derive(Debug, Clone)]
enum Seg {
    Lit(i8),
    Read(u8),
    Call(u8),
    Add,
    Neg,
    RoundTrip(u8),
}

/// Random annotation of one member.
#[derive(Debug, Clone)]
struct Ann {
    staged: bool,
    strict: bool,
    cachability: Cachability,
    accept: bool,
}

fn seg_strategy() -> impl Strategy<Value = Seg> {
    prop_oneof![
        (-64i8..64i8).prop_map(Seg::Lit),
        (0u8..3u8).prop_map(Seg::Read),
        (0u8..3u8).prop_map(Seg::Call),
        Just(Seg::Add),
        Just(Seg::Neg),
        (0u8..3u8).prop_map(Seg::RoundTrip),
    ]
}

fn ann_strategy() -> impl Strategy<Value = Ann> {
    (any::<bool>(), any::<bool>(), 0u8..3u8, any::<bool>()).prop_map(
        |(staged, strict, cachability, accept)| Ann {
            staged,
            strict,
            cachability: match cachability {
                0 => Cachability::None,
                1 => Cachability::Permanent,
                _ => Cachability::Trace,
            },
            accept,
        },
    )
}

fn field(id: u8) -> FieldRef {
    FieldRef {
        class: ClassRef::new("demo/Lang"),
        name: Arc::from(format!("field{id}")),
        descriptor: JavaType::parse("I").unwrap(),
        flags: FieldFlags::STATIC,
    }
}

fn method(id: u8) -> MethodRef {
    MethodRef {
        class: ClassRef::new("demo/Lang"),
        name: Arc::from(format!("apply{id}")),
        descriptor: MethodDescriptor::parse("(I)I").unwrap(),
    }
}

fn annotate(policy: &mut TablePolicy, member: byteloom::bytecode::MemberId, ann: &Ann) {
    if !ann.staged {
        return;
    }
    let language = Language::new("expr");
    policy.stage(
        member.clone(),
        StageInfo {
            language: language.clone(),
            strict: ann.strict,
            static_info: vec![],
        },
    );
    policy.cache(member.clone(), ann.cachability);
    if ann.accept {
        policy.accept(member, 0, std::iter::once(language).collect());
    }
}

fn build_policy(fields: &[Ann; 3], methods: &[Ann; 3]) -> TablePolicy {
    let mut policy = TablePolicy::new();
    for (id, ann) in fields.iter().enumerate() {
        annotate(&mut policy, field(id as u8).member_id(), ann);
    }
    for (id, ann) in methods.iter().enumerate() {
        annotate(&mut policy, method(id as u8).member_id(), ann);
    }
    policy
}

/// Assembles a well-formed static `(I)I` body from the segment list.
fn build_body(segments: &[Seg]) -> MethodBody {
    let mut b = MethodBuilder::new("demo/Host", "f", "(I)I", MethodFlags::STATIC)
        .unwrap()
        .max_stack(64);
    let mut depth = 0u32;
    let pad = |b: MethodBuilder, depth: &mut u32, needed: u32| -> MethodBuilder {
        let mut b = b;
        while *depth < needed {
            b = b.op(op::ICONST_1);
            *depth += 1;
        }
        b
    };
    for seg in segments {
        match seg {
            Seg::Lit(v) => {
                b = b.imm(op::BIPUSH, i32::from(*v));
                depth += 1;
            }
            Seg::Read(id) => {
                b = b.pool_op(op::GETSTATIC, PoolEntry::Field(field(*id)));
                depth += 1;
            }
            Seg::Call(id) => {
                b = pad(b, &mut depth, 1);
                b = b.pool_op(op::INVOKESTATIC, PoolEntry::Method(method(*id)));
            }
            Seg::Add => {
                b = pad(b, &mut depth, 2);
                b = b.op(op::IADD);
                depth -= 1;
            }
            Seg::Neg => {
                b = pad(b, &mut depth, 1);
                b = b.op(op::INEG);
            }
            Seg::RoundTrip(id) => {
                b = pad(b, &mut depth, 1);
                let local = 1 + u16::from(*id);
                b = b.local_op(op::ISTORE, local).local_op(op::ILOAD, local);
            }
        }
    }
    b = pad(b, &mut depth, 1);
    b.op(op::IRETURN).build().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// At most one of the adjust/materialize plans exists per (position,
    /// stack offset), across randomized bodies and annotations. A double
    /// request aborts the analysis with an internal error; a surviving plan
    /// shows the conflict structurally as two same-offset inserts at one
    /// position.
    #[test]
    fn weave_plans_stay_disjoint(
        segments in prop::collection::vec(seg_strategy(), 1..24),
        fields in [ann_strategy(), ann_strategy(), ann_strategy()],
        methods in [ann_strategy(), ann_strategy(), ann_strategy()],
    ) {
        let body = build_body(&segments);
        let policy = build_policy(&fields, &methods);

        let types = TypeAnalysis::run(&body).unwrap();
        let valueflow = ValueFlowAnalysis::run(&body, &types).unwrap();
        let consts = ConstantAnalysis::run(&body, &types, |_| false).unwrap();
        let graph = build_stage_graph(&body, &types, &valueflow, &policy).unwrap();
        let runtime = RuntimeSurface::default();
        let caches = plan_caches(&body, &graph, &valueflow, &policy, runtime.carrier_class(), 16);
        let mut emitter = TestEmitter::default();
        let weave = WeaveAnalysis::run(
            &body, &types, &valueflow, &consts, &graph, &caches, &runtime, &mut emitter,
        )
        .unwrap();
        let (plan, pool) = weave.into_parts();

        // Operand edits encode their stack offset as precedence; two edits
        // with one (position, offset) would mean both plans fired.
        let mut seen = std::collections::HashSet::new();
        for edit in plan.ordered() {
            if edit.kind == EditKind::InsertBefore && edit.precedence < 4096 {
                prop_assert!(
                    seen.insert((edit.pos, edit.precedence)),
                    "two operand plans at {} offset {}",
                    edit.pos,
                    edit.precedence
                );
            }
        }

        // The plan must also survive application.
        apply_plan(&body, &plan, pool).unwrap();
    }

    /// With nothing staged the weaver never touches the method.
    #[test]
    fn unstaged_bodies_come_back_unchanged(
        segments in prop::collection::vec(seg_strategy(), 1..24),
    ) {
        let body = build_body(&segments);
        let mut weaver = Weaver::new(
            TablePolicy::new(),
            TestEmitter::default(),
            WeaveConfig::default(),
        );
        prop_assert!(matches!(
            weaver.weave(&body).unwrap(),
            WeaveOutcome::Unchanged
        ));
    }
}
