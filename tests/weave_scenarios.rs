//! End-to-end weaving scenarios through the public pipeline.

use std::sync::Arc;

use byteloom::{
    analysis::{ConstantAnalysis, TypeAnalysis, ValueFlowAnalysis},
    bytecode::{
        opcode as op, ClassRef, FieldFlags, FieldRef, JavaType, MethodBody, MethodBuilder,
        MethodDescriptor, MethodFlags, MethodRef, Operand, PoolEntry,
    },
    stage::{build_stage_graph, plan_caches, Cachability, Language, StageInfo, TablePolicy},
    weave::{RuntimeSurface, SiteEmitter, StagedSiteDesc, WeaveAnalysis, WeaveType},
    Result, WeaveConfig, WeaveOutcome, Weaver,
};

/// Emits deterministic site symbols on a generated helper class.
#[derive(Default)]
struct TestEmitter {
    emitted: Vec<StagedSiteDesc>,
}

impl SiteEmitter for TestEmitter {
    fn emit_invoke_site(&mut self, site: &StagedSiteDesc) -> Result<MethodRef> {
        let method = MethodRef {
            class: ClassRef::new("demo/Generated"),
            name: Arc::from(format!("site${}", self.emitted.len())),
            descriptor: site.descriptor.clone(),
        };
        self.emitted.push(site.clone());
        Ok(method)
    }
}

fn staged_field(strict: bool) -> (FieldRef, TablePolicy) {
    let field = FieldRef {
        class: ClassRef::new("demo/Lang"),
        name: Arc::from("staged"),
        descriptor: JavaType::parse("I").unwrap(),
        flags: FieldFlags::STATIC,
    };
    let mut policy = TablePolicy::new();
    policy.stage(
        field.member_id(),
        StageInfo {
            language: Language::new("expr"),
            strict,
            static_info: vec![],
        },
    );
    (field, policy)
}

fn weave(body: &MethodBody, policy: TablePolicy) -> WeaveOutcome {
    let mut weaver = Weaver::new(policy, TestEmitter::default(), WeaveConfig::default());
    weaver.weave(body).unwrap()
}

#[test]
fn scenario_unstaged_increment_is_untouched() {
    let body = MethodBuilder::new("demo/Calc", "f", "(I)I", MethodFlags::STATIC)
        .unwrap()
        .op(op::ILOAD_0)
        .op(op::ICONST_1)
        .op(op::IADD)
        .op(op::IRETURN)
        .build()
        .unwrap();
    assert!(matches!(
        weave(&body, TablePolicy::new()),
        WeaveOutcome::Unchanged
    ));
}

#[test]
fn scenario_strict_staged_read_rewrites_and_materializes() {
    let (field, policy) = staged_field(true);
    let body = MethodBuilder::new("demo/Host", "g", "()I", MethodFlags::STATIC)
        .unwrap()
        .pool_op(op::GETSTATIC, PoolEntry::Field(field))
        .op(op::IRETURN)
        .build()
        .unwrap();

    let WeaveOutcome::Woven(woven) = weave(&body, policy) else {
        panic!("strict staged read must weave");
    };
    let insns = woven.body.decode().unwrap();
    let mnemonics: Vec<&str> = insns.iter().map(|i| i.mnemonic).collect();
    assert_eq!(mnemonics, vec!["invokestatic", "invokestatic", "ireturn"]);

    // The getstatic became the generated factory call.
    let Operand::Pool(site_idx) = insns[0].operand else {
        panic!("rewrite lost its pool operand");
    };
    let site = woven.body.pool.method_at(site_idx).unwrap();
    assert_eq!(&*site.class.name, "demo/Generated");
    assert_eq!(site.descriptor.to_string(), "()Lbyteloom/rt/Carrier;");

    // Followed by the materialize-to-int entry point.
    let Operand::Pool(mat_idx) = insns[1].operand else {
        panic!("materialize lost its pool operand");
    };
    let materialize = woven.body.pool.method_at(mat_idx).unwrap();
    assert_eq!(&*materialize.name, "materializeInt");
    assert_eq!(
        materialize.descriptor.to_string(),
        "(Lbyteloom/rt/Carrier;)I"
    );
    assert!(woven.holder_fields.is_empty());
}

#[test]
fn scenario_strict_staged_read_resolves_to_not_carrying() {
    let (field, policy) = staged_field(true);
    let body = MethodBuilder::new("demo/Host", "g", "()I", MethodFlags::STATIC)
        .unwrap()
        .pool_op(op::GETSTATIC, PoolEntry::Field(field))
        .op(op::IRETURN)
        .build()
        .unwrap();

    let types = TypeAnalysis::run(&body).unwrap();
    let valueflow = ValueFlowAnalysis::run(&body, &types).unwrap();
    let consts = ConstantAnalysis::run(&body, &types, |_| true).unwrap();
    let graph = build_stage_graph(&body, &types, &valueflow, &policy).unwrap();
    let runtime = RuntimeSurface::default();
    let caches = plan_caches(&body, &graph, &valueflow, &policy, runtime.carrier_class(), 16);
    let mut emitter = TestEmitter::default();
    let weave =
        WeaveAnalysis::run(&body, &types, &valueflow, &consts, &graph, &caches, &runtime, &mut emitter)
            .unwrap();

    // Strict staged reads resolve to a concrete value immediately.
    assert_eq!(weave.stack_out(0, 0), Some(WeaveType::NotCarrying));
}

#[test]
fn scenario_lazy_staged_read_materializes_at_its_use() {
    let (field, policy) = staged_field(false);
    let body = MethodBuilder::new("demo/Host", "g", "()I", MethodFlags::STATIC)
        .unwrap()
        .pool_op(op::GETSTATIC, PoolEntry::Field(field))
        .op(op::IRETURN)
        .build()
        .unwrap();

    let WeaveOutcome::Woven(woven) = weave(&body, policy) else {
        panic!("lazy staged read must weave");
    };
    let insns = woven.body.decode().unwrap();
    // The carrier rides until the return demands an int.
    let mnemonics: Vec<&str> = insns.iter().map(|i| i.mnemonic).collect();
    assert_eq!(mnemonics, vec!["invokestatic", "invokestatic", "ireturn"]);
    let Operand::Pool(mat_idx) = insns[1].operand else {
        panic!("materialize lost its pool operand");
    };
    assert_eq!(
        &*woven.body.pool.method_at(mat_idx).unwrap().name,
        "materializeInt"
    );
}

#[test]
fn scenario_constructor_staged_write_after_super_weaves() {
    let field = FieldRef {
        class: ClassRef::new("demo/Foo"),
        name: Arc::from("staged_field"),
        descriptor: JavaType::parse("I").unwrap(),
        flags: FieldFlags::empty(),
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
    let super_init = PoolEntry::Method(MethodRef {
        class: ClassRef::new("java/lang/Object"),
        name: Arc::from("<init>"),
        descriptor: MethodDescriptor::parse("()V").unwrap(),
    });
    let body = MethodBuilder::new("demo/Foo", "<init>", "()V", MethodFlags::empty())
        .unwrap()
        .op(op::ALOAD_0)
        .pool_op(op::INVOKESPECIAL, super_init)
        .op(op::ALOAD_0)
        .op(op::ICONST_1)
        .pool_op(op::PUTFIELD, PoolEntry::Field(field))
        .op(op::RETURN)
        .build()
        .unwrap();

    let WeaveOutcome::Woven(woven) = weave(&body, policy) else {
        panic!("a write after super() is legal to stage");
    };
    // The putfield became a call into the generated write site.
    let insns = woven.body.decode().unwrap();
    assert!(insns.iter().all(|i| i.opcode != op::PUTFIELD));
    assert!(insns.iter().any(|i| i.opcode == op::INVOKESTATIC));
}

#[test]
fn scenario_constructor_staged_write_before_super_is_refused() {
    let field = FieldRef {
        class: ClassRef::new("demo/Foo"),
        name: Arc::from("staged_field"),
        descriptor: JavaType::parse("I").unwrap(),
        flags: FieldFlags::empty(),
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
    let super_init = PoolEntry::Method(MethodRef {
        class: ClassRef::new("java/lang/Object"),
        name: Arc::from("<init>"),
        descriptor: MethodDescriptor::parse("()V").unwrap(),
    });
    let body = MethodBuilder::new("demo/Foo", "<init>", "()V", MethodFlags::empty())
        .unwrap()
        .op(op::ALOAD_0)
        .op(op::ICONST_1)
        .pool_op(op::PUTFIELD, PoolEntry::Field(field))
        .op(op::ALOAD_0)
        .pool_op(op::INVOKESPECIAL, super_init)
        .op(op::RETURN)
        .build()
        .unwrap();

    // No safe rewrite exists; the method stays byte-identical.
    assert!(matches!(weave(&body, policy), WeaveOutcome::Unchanged));
}

#[test]
fn scenario_permanent_caching_reuses_a_holder_field() {
    let (field, mut policy) = staged_field(true);
    policy.cache(field.member_id(), Cachability::Permanent);
    let body = MethodBuilder::new("demo/Host", "g", "()I", MethodFlags::STATIC)
        .unwrap()
        .pool_op(op::GETSTATIC, PoolEntry::Field(field))
        .op(op::IRETURN)
        .build()
        .unwrap();

    let WeaveOutcome::Woven(woven) = weave(&body, policy) else {
        panic!("cached staged read must weave");
    };
    assert_eq!(woven.holder_fields.len(), 1);
    let holder = &woven.holder_fields[0];
    assert_eq!(&*holder.name, "stage$cache$0");
    assert_eq!(&*holder.class.name, "demo/Host");

    let insns = woven.body.decode().unwrap();
    let opcodes: Vec<u8> = insns.iter().map(|i| i.opcode).collect();
    // The holder fast path: load, null-check, fall into the site call only
    // on a miss, store back, join.
    assert!(opcodes.contains(&op::GETSTATIC));
    assert!(opcodes.contains(&op::IFNONNULL));
    assert!(opcodes.contains(&op::PUTSTATIC));
    // The null-check lands on the join nop, inside the method.
    let ifnonnull = insns.iter().find(|i| i.opcode == op::IFNONNULL).unwrap();
    let Operand::Branch(rel) = ifnonnull.operand else {
        panic!("branch lost its operand");
    };
    let target = (i64::from(ifnonnull.offset) + i64::from(rel)) as u32;
    assert!(insns.iter().any(|i| i.offset == target && i.opcode == op::NOP));
}

#[test]
fn scenario_trace_caching_instruments_entry_and_site() {
    let method = MethodRef {
        class: ClassRef::new("demo/Lang"),
        name: Arc::from("apply"),
        descriptor: MethodDescriptor::parse("(I)I").unwrap(),
    };
    let mut policy = TablePolicy::new();
    policy.stage(
        method.member_id(),
        StageInfo {
            language: Language::new("expr"),
            strict: true,
            static_info: vec![],
        },
    );
    policy.cache(method.member_id(), Cachability::Trace);

    // The staged call's argument merges two arms, so one trace point exists.
    let mut b = MethodBuilder::new("demo/Host", "h", "(I)I", MethodFlags::STATIC).unwrap();
    let other = b.label();
    let join = b.label();
    let body = b
        .op(op::ILOAD_0)
        .branch(op::IFEQ, other)
        .op(op::ICONST_1)
        .branch(op::GOTO, join)
        .bind(other)
        .op(op::ICONST_0)
        .bind(join)
        .pool_op(op::INVOKESTATIC, PoolEntry::Method(method))
        .op(op::IRETURN)
        .build()
        .unwrap();

    let WeaveOutcome::Woven(woven) = weave(&body, policy) else {
        panic!("trace-cached staged call must weave");
    };
    let insns = woven.body.decode().unwrap();
    let names: Vec<String> = insns
        .iter()
        .filter(|i| i.opcode == op::INVOKESTATIC)
        .map(|i| match i.operand {
            Operand::Pool(idx) => woven.body.pool.method_at(idx).unwrap().name.to_string(),
            _ => String::new(),
        })
        .collect();
    // Entry instrumentation, path recording, the site, the cache lookup and
    // the strict materialization are all present.
    assert!(names.contains(&"traceEnter".to_string()));
    assert!(names.contains(&"traceRecord".to_string()));
    assert!(names.contains(&"cachedClosure".to_string()));
    assert!(names.iter().any(|n| n.starts_with("site$")));
    assert!(names.contains(&"materializeInt".to_string()));
    // traceEnter comes first, before any original instruction.
    assert_eq!(insns[1].mnemonic, "invokestatic");
    assert_eq!(insns[0].opcode, op::SIPUSH);
}

#[test]
fn batch_weaving_never_cascades_failures() {
    let (field, policy) = staged_field(true);
    let good = MethodBuilder::new("demo/Host", "g", "()I", MethodFlags::STATIC)
        .unwrap()
        .pool_op(op::GETSTATIC, PoolEntry::Field(field))
        .op(op::IRETURN)
        .build()
        .unwrap();
    let bad = MethodBody {
        class: Arc::from("demo/Bad"),
        name: Arc::from("f"),
        descriptor: MethodDescriptor::parse("()I").unwrap(),
        flags: MethodFlags::STATIC,
        max_stack: 1,
        max_locals: 0,
        code: vec![op::FLOAD, 0x00, op::IRETURN],
        handlers: Vec::new(),
        pool: Arc::new(byteloom::bytecode::ConstPool::new()),
    };

    let mut weaver = Weaver::new(policy, TestEmitter::default(), WeaveConfig::default());
    let outcomes = weaver.weave_all([&bad, &good, &bad]).unwrap();
    assert!(matches!(outcomes[0], WeaveOutcome::Unchanged));
    assert!(matches!(outcomes[1], WeaveOutcome::Woven(_)));
    assert!(matches!(outcomes[2], WeaveOutcome::Unchanged));
}
