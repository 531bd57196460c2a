//! Application of an edit plan to a method body.
//!
//! Splicing happens in one ordered pass over the decoded stream. Per
//! original instruction the edits apply as insert-before, rewrite,
//! insert-after; the exclusive prologue goes before everything. Branches to
//! an original instruction land on the first instruction inserted before it,
//! with one exception: branches to the method entry skip the exclusive
//! prologue, which runs once per invocation.
//!
//! The spliced stream uses the encoder's index convention throughout:
//! original branch and switch payloads are converted from relative byte
//! offsets to stream indices, and edit-local branch indices are rebased onto
//! the final stream. After encoding, the exception table is remapped and
//! `max_stack`/`max_locals` are recomputed to cover the synthetic
//! temporaries and call sequences.

use rustc_hash::FxHashMap;

use crate::{
    bytecode::{assemble, ConstPool, ExceptionHandler, Instruction, MethodBody, Operand},
    weave::plan::{Edit, EditKind, EditPlan},
    Error, Result,
};

/// Applies `plan` to `body`, producing the woven method.
///
/// `pool` is the constant pool extended with the references the plan's
/// instructions use (see
/// [`WeaveAnalysis::pool`](crate::weave::WeaveAnalysis::pool)).
///
/// # Errors
///
/// Returns [`Error::Internal`] for structurally impossible plans (two
/// rewrites at one position, an exclusive insert anchored past the entry)
/// and propagates encoding failures.
pub fn apply_plan(body: &MethodBody, plan: &EditPlan, pool: ConstPool) -> Result<MethodBody> {
    let insns = body.decode()?;
    if insns.is_empty() {
        return Err(Error::Encode("cannot weave an empty method".into()));
    }

    let index_of_offset: FxHashMap<u32, usize> = insns
        .iter()
        .enumerate()
        .map(|(i, insn)| (insn.offset, i))
        .collect();

    // Group the ordered edits by anchor instruction.
    let mut exclusive: Vec<&Edit> = Vec::new();
    let mut before: FxHashMap<usize, Vec<&Edit>> = FxHashMap::default();
    let mut rewrite: FxHashMap<usize, &Edit> = FxHashMap::default();
    let mut after: FxHashMap<usize, Vec<&Edit>> = FxHashMap::default();
    for edit in plan.ordered() {
        let &index = index_of_offset.get(&edit.pos).ok_or_else(|| {
            Error::Internal(format!("edit anchored at non-instruction offset {}", edit.pos))
        })?;
        match edit.kind {
            EditKind::InsertBeforeExclusive => {
                if index != 0 {
                    return Err(Error::Internal(format!(
                        "exclusive insert anchored at {} instead of the entry",
                        edit.pos
                    )));
                }
                exclusive.push(edit);
            }
            EditKind::InsertBefore => before.entry(index).or_default().push(edit),
            EditKind::Rewrite => {
                if rewrite.insert(index, edit).is_some() {
                    return Err(Error::Internal(format!(
                        "two rewrites anchored at {}",
                        edit.pos
                    )));
                }
            }
            EditKind::InsertAfter => after.entry(index).or_default().push(edit),
        }
    }

    // Lay out the new stream arithmetic first so forward branches resolve.
    let code_len = |edits: &[&Edit]| -> usize {
        edits.iter().map(|e| e.code.len()).sum()
    };
    let mut first_index = vec![0usize; insns.len()];
    let mut running = code_len(&exclusive);
    for (i, _) in insns.iter().enumerate() {
        first_index[i] = running;
        running += code_len(before.get(&i).map_or(&[], Vec::as_slice));
        running += rewrite.get(&i).map_or(1, |e| e.code.len());
        running += code_len(after.get(&i).map_or(&[], Vec::as_slice));
    }

    // Maps an original relative branch to its new stream index.
    let to_index = |from: &Instruction, rel: i32| -> Result<i32> {
        let target = (i64::from(from.offset) + i64::from(rel)) as u32;
        let &idx = index_of_offset.get(&target).ok_or_else(|| {
            Error::Encode(format!(
                "branch from {} into the middle of an instruction at {target}",
                from.offset
            ))
        })?;
        Ok(first_index[idx] as i32)
    };

    let mut out: Vec<Instruction> = Vec::with_capacity(running);
    let mut push_edit = |out: &mut Vec<Instruction>, edit: &Edit| {
        let base = out.len() as i32;
        for insn in &edit.code {
            let mut insn = insn.clone();
            // Edit-local branch indices rebase onto the spliced stream.
            if let Operand::Branch(local) = insn.operand {
                insn.operand = Operand::Branch(base + local);
            }
            out.push(insn);
        }
    };

    for edit in &exclusive {
        push_edit(&mut out, edit);
    }
    for (i, insn) in insns.iter().enumerate() {
        debug_assert_eq!(out.len(), first_index[i]);
        for edit in before.get(&i).map_or(&[][..], Vec::as_slice) {
            push_edit(&mut out, edit);
        }
        if let Some(edit) = rewrite.get(&i) {
            push_edit(&mut out, edit);
        } else {
            let mut insn = insn.clone();
            insn.operand = match insn.operand {
                Operand::Branch(rel) => Operand::Branch(to_index(&insns[i], rel)?),
                Operand::TableSwitch {
                    default,
                    low,
                    offsets,
                } => Operand::TableSwitch {
                    default: to_index(&insns[i], default)?,
                    low,
                    offsets: offsets
                        .iter()
                        .map(|&rel| to_index(&insns[i], rel))
                        .collect::<Result<_>>()?,
                },
                Operand::LookupSwitch { default, pairs } => Operand::LookupSwitch {
                    default: to_index(&insns[i], default)?,
                    pairs: pairs
                        .iter()
                        .map(|&(key, rel)| Ok((key, to_index(&insns[i], rel)?)))
                        .collect::<Result<_>>()?,
                },
                other => other,
            };
            out.push(insn);
        }
        for edit in after.get(&i).map_or(&[][..], Vec::as_slice) {
            push_edit(&mut out, edit);
        }
    }

    let (code, new_offsets) = assemble(&out)?;

    // Remap the exception table through the cluster starts.
    let old_end = body.code.len() as u32;
    let map_boundary = |offset: u32| -> Result<u32> {
        if offset == old_end {
            return Ok(code.len() as u32);
        }
        let &idx = index_of_offset.get(&offset).ok_or_else(|| {
            Error::Encode(format!("exception boundary {offset} is not an instruction"))
        })?;
        Ok(new_offsets[first_index[idx]])
    };
    let mut handlers = Vec::with_capacity(body.handlers.len());
    for handler in &body.handlers {
        handlers.push(ExceptionHandler {
            start: map_boundary(handler.start)?,
            end: map_boundary(handler.end)?,
            handler: map_boundary(handler.handler)?,
            catch_type: handler.catch_type.clone(),
        });
    }

    let max_stack = recompute_max_stack(&out, &handlers, &new_offsets, &pool)?;
    Ok(MethodBody {
        class: body.class.clone(),
        name: body.name.clone(),
        descriptor: body.descriptor.clone(),
        flags: body.flags,
        max_stack: max_stack.max(body.max_stack),
        max_locals: body.max_locals + plan.temp_locals(),
        code,
        handlers,
        pool: std::sync::Arc::new(pool),
    })
}

/// Depth walk over the woven stream: propagate the operand stack depth along
/// every edge and take the maximum. Handler entries start at depth one (the
/// pushed exception).
fn recompute_max_stack(
    insns: &[Instruction],
    handlers: &[ExceptionHandler],
    offsets: &[u32],
    pool: &ConstPool,
) -> Result<u16> {
    let index_of_offset: FxHashMap<u32, usize> = offsets
        .iter()
        .enumerate()
        .map(|(i, &off)| (off, i))
        .collect();

    let mut depth_at: Vec<Option<u16>> = vec![None; insns.len()];
    let mut worklist: Vec<(usize, u16)> = vec![(0, 0)];
    for handler in handlers {
        if let Some(&idx) = index_of_offset.get(&handler.handler) {
            worklist.push((idx, 1));
        }
    }

    let mut max = 0u16;
    while let Some((idx, depth)) = worklist.pop() {
        if idx >= insns.len() {
            return Err(Error::Encode("depth walk ran off the stream".into()));
        }
        match depth_at[idx] {
            Some(known) if known >= depth => continue,
            _ => depth_at[idx] = Some(depth),
        }
        let insn = &insns[idx];
        let (pops, pushes) = stack_effect(insn, pool)?;
        if pops > depth {
            return Err(Error::Encode(format!(
                "stack underflow in woven code at index {idx}"
            )));
        }
        let next = depth - pops + pushes;
        max = max.max(depth).max(next);

        // Successors are still in the index convention here.
        match insn.operand {
            Operand::Branch(target) => {
                worklist.push((target as usize, next));
                if insn.flow_kind() == crate::bytecode::FlowKind::ConditionalBranch {
                    worklist.push((idx + 1, next));
                }
            }
            Operand::TableSwitch {
                default,
                ref offsets,
                ..
            } => {
                worklist.push((default as usize, next));
                for &t in offsets {
                    worklist.push((t as usize, next));
                }
            }
            Operand::LookupSwitch { default, ref pairs } => {
                worklist.push((default as usize, next));
                for &(_, t) in pairs {
                    worklist.push((t as usize, next));
                }
            }
            _ => match insn.flow_kind() {
                crate::bytecode::FlowKind::Return | crate::bytecode::FlowKind::Throw => {}
                _ => worklist.push((idx + 1, next)),
            },
        }
    }
    Ok(max)
}

/// Slot-level stack effect of one instruction.
#[allow(clippy::too_many_lines)]
fn stack_effect(insn: &Instruction, pool: &ConstPool) -> Result<(u16, u16)> {
    use crate::bytecode::opcode as op;
    let o = insn.opcode;
    let pool_index = || -> Result<u16> {
        match insn.operand {
            Operand::Pool(idx) => Ok(idx),
            _ => Err(Error::Encode(format!(
                "missing pool operand on {}",
                insn.mnemonic
            ))),
        }
    };
    Ok(match o {
        op::NOP | op::IINC | op::GOTO | op::GOTO_W | op::RETURN => (0, 0),
        op::ACONST_NULL
        | op::ICONST_M1..=op::ICONST_5
        | op::FCONST_0..=op::FCONST_2
        | op::BIPUSH
        | op::SIPUSH
        | op::LDC
        | op::LDC_W => (0, 1),
        op::LCONST_0 | op::LCONST_1 | op::DCONST_0 | op::DCONST_1 | op::LDC2_W => (0, 2),
        op::ILOAD | op::FLOAD | op::ALOAD => (0, 1),
        op::LLOAD | op::DLOAD => (0, 2),
        op::ILOAD_0..=op::ALOAD_3 => {
            let wide = matches!((o - op::ILOAD_0) / 4, 1 | 3);
            (0, if wide { 2 } else { 1 })
        }
        op::IALOAD | op::FALOAD | op::AALOAD | op::BALOAD | op::CALOAD | op::SALOAD => (2, 1),
        op::LALOAD | op::DALOAD => (2, 2),
        op::ISTORE | op::FSTORE | op::ASTORE => (1, 0),
        op::LSTORE | op::DSTORE => (2, 0),
        op::ISTORE_0..=op::ASTORE_3 => {
            let wide = matches!((o - op::ISTORE_0) / 4, 1 | 3);
            (if wide { 2 } else { 1 }, 0)
        }
        op::IASTORE | op::FASTORE | op::AASTORE | op::BASTORE | op::CASTORE | op::SASTORE => {
            (3, 0)
        }
        op::LASTORE | op::DASTORE => (4, 0),
        op::POP => (1, 0),
        op::POP2 => (2, 0),
        op::DUP => (1, 2),
        op::DUP_X1 => (2, 3),
        op::DUP_X2 => (3, 4),
        op::DUP2 => (2, 4),
        op::DUP2_X1 => (3, 5),
        op::DUP2_X2 => (4, 6),
        op::SWAP => (2, 2),
        op::IADD..=op::DREM => {
            let width = [1u16, 2, 1, 2][usize::from((o - op::IADD) % 4)];
            (width * 2, width)
        }
        op::INEG | op::FNEG => (1, 1),
        op::LNEG | op::DNEG => (2, 2),
        op::ISHL | op::ISHR | op::IUSHR => (2, 1),
        op::LSHL | op::LSHR | op::LUSHR => (3, 2),
        op::IAND | op::IOR | op::IXOR => (2, 1),
        op::LAND | op::LOR | op::LXOR => (4, 2),
        op::I2L..=op::I2S => {
            let kinds = [
                (1u16, 2u16), // i2l
                (1, 1),       // i2f
                (1, 2),       // i2d
                (2, 1),       // l2i
                (2, 1),       // l2f
                (2, 2),       // l2d
                (1, 1),       // f2i
                (1, 2),       // f2l
                (1, 2),       // f2d
                (2, 1),       // d2i
                (2, 2),       // d2l
                (2, 1),       // d2f
                (1, 1),       // i2b
                (1, 1),       // i2c
                (1, 1),       // i2s
            ];
            kinds[usize::from(o - op::I2L)]
        }
        op::LCMP => (4, 1),
        op::FCMPL | op::FCMPG => (2, 1),
        op::DCMPL | op::DCMPG => (4, 1),
        op::IFEQ..=op::IFLE | op::IFNULL | op::IFNONNULL => (1, 0),
        op::IF_ICMPEQ..=op::IF_ICMPLE | op::IF_ACMPEQ | op::IF_ACMPNE => (2, 0),
        op::TABLESWITCH | op::LOOKUPSWITCH => (1, 0),
        op::IRETURN | op::FRETURN | op::ARETURN => (1, 0),
        op::LRETURN | op::DRETURN => (2, 0),
        op::ATHROW => (1, 0),
        op::GETSTATIC | op::GETFIELD => {
            let field = pool.field_at(pool_index()?)?;
            let w = field.descriptor.slots();
            (u16::from(o == op::GETFIELD), w)
        }
        op::PUTSTATIC | op::PUTFIELD => {
            let field = pool.field_at(pool_index()?)?;
            let w = field.descriptor.slots();
            (w + u16::from(o == op::PUTFIELD), 0)
        }
        op::INVOKEVIRTUAL | op::INVOKESPECIAL | op::INVOKESTATIC | op::INVOKEINTERFACE => {
            let method = pool.method_at(pool_index()?)?;
            let receiver = u16::from(o != op::INVOKESTATIC);
            let ret = method.descriptor.ret.as_ref().map_or(0, |r| r.slots());
            (method.descriptor.param_slots() + receiver, ret)
        }
        op::INVOKEDYNAMIC => {
            let site = pool.call_site_at(pool_index()?)?;
            let ret = site.descriptor.ret.as_ref().map_or(0, |r| r.slots());
            (site.descriptor.param_slots(), ret)
        }
        op::NEW => (0, 1),
        op::NEWARRAY | op::ANEWARRAY | op::ARRAYLENGTH | op::CHECKCAST | op::INSTANCEOF => (1, 1),
        op::MULTIANEWARRAY => {
            let dims = match insn.operand {
                Operand::MultiArray { dims, .. } => u16::from(dims),
                _ => 0,
            };
            (dims, 1)
        }
        op::MONITORENTER | op::MONITOREXIT => (1, 0),
        other => {
            return Err(Error::Encode(format!(
                "no stack effect for opcode {other:#04x}"
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bytecode::{
            opcode as op, ClassRef, MethodBuilder, MethodDescriptor, MethodFlags, MethodRef,
            PoolEntry,
        },
        weave::plan::{synth, Edit, EditPlan},
    };
    use std::sync::Arc;

    fn helper_call(pool: &mut ConstPool, name: &str, descriptor: &str) -> Instruction {
        let idx = pool.push(PoolEntry::Method(MethodRef {
            class: ClassRef::new("rt/Stage"),
            name: Arc::from(name),
            descriptor: MethodDescriptor::parse(descriptor).unwrap(),
        }));
        synth(op::INVOKESTATIC, Operand::Pool(idx))
    }

    fn branching_body() -> MethodBody {
        let mut b = MethodBuilder::new("t/T", "f", "(I)I", MethodFlags::STATIC).unwrap();
        let other = b.label();
        let join = b.label();
        b.op(op::ILOAD_0) // 0
            .branch(op::IFEQ, other) // 1
            .op(op::ICONST_1) // 4
            .branch(op::GOTO, join) // 5
            .bind(other)
            .op(op::ICONST_0) // 8
            .bind(join)
            .op(op::IRETURN) // 9
            .build()
            .unwrap()
    }

    #[test]
    fn empty_plan_reproduces_the_body() {
        let body = branching_body();
        let plan = EditPlan::default();
        let woven = apply_plan(&body, &plan, (*body.pool).clone()).unwrap();
        assert_eq!(woven.code, body.code);
        assert_eq!(woven.max_locals, body.max_locals);
    }

    #[test]
    fn branch_targets_land_on_inserted_code() {
        let body = branching_body();
        let mut pool = (*body.pool).clone();
        let call = helper_call(&mut pool, "traceRecord", "(I)V");
        let mut plan = EditPlan::default();
        // Insert before the branch target at 8.
        plan.push(Edit {
            pos: 8,
            kind: EditKind::InsertBefore,
            precedence: 0,
            code: vec![synth(op::SIPUSH, Operand::Immediate(7)), call],
        });
        let woven = apply_plan(&body, &plan, pool).unwrap();
        let insns = woven.decode().unwrap();
        // The conditional branch jumps to the sipush, not past it.
        let ifeq = insns.iter().find(|i| i.opcode == op::IFEQ).unwrap();
        let target = (i64::from(ifeq.offset)
            + i64::from(match ifeq.operand {
                Operand::Branch(rel) => rel,
                _ => unreachable!(),
            })) as u32;
        let landed = insns.iter().find(|i| i.offset == target).unwrap();
        assert_eq!(landed.opcode, op::SIPUSH);
    }

    #[test]
    fn exclusive_prologue_is_skipped_by_entry_branches() {
        // A loop back to the entry must not re-run the prologue.
        let mut b = MethodBuilder::new("t/T", "f", "()V", MethodFlags::STATIC).unwrap();
        let top = b.label();
        let done = b.label();
        let body = b
            .bind(top)
            .op(op::ICONST_0) // 0
            .branch(op::IFNE, done) // 1
            .branch(op::GOTO, top) // 4
            .bind(done)
            .op(op::RETURN) // 7
            .build()
            .unwrap();
        let mut pool = (*body.pool).clone();
        let enter = helper_call(&mut pool, "traceEnter", "()V");
        let mut plan = EditPlan::default();
        plan.push(Edit {
            pos: 0,
            kind: EditKind::InsertBeforeExclusive,
            precedence: 0,
            code: vec![enter],
        });
        let woven = apply_plan(&body, &plan, pool).unwrap();
        let insns = woven.decode().unwrap();
        assert_eq!(insns[0].opcode, op::INVOKESTATIC);
        let goto = insns.iter().find(|i| i.opcode == op::GOTO).unwrap();
        let target = (i64::from(goto.offset)
            + i64::from(match goto.operand {
                Operand::Branch(rel) => rel,
                _ => unreachable!(),
            })) as u32;
        // The loop lands on iconst_0, past the prologue.
        assert_eq!(target, insns[1].offset);
    }

    #[test]
    fn handlers_remap_and_stack_grows() {
        let mut b = MethodBuilder::new("t/T", "f", "()I", MethodFlags::STATIC).unwrap();
        let start = b.label();
        let end = b.label();
        let handler = b.label();
        let body = b
            .bind(start)
            .op(op::ICONST_1) // 0
            .bind(end)
            .op(op::IRETURN) // 1
            .bind(handler)
            .op(op::POP) // 2
            .op(op::ICONST_0) // 3
            .op(op::IRETURN) // 4
            .handler(start, end, handler, None)
            .build()
            .unwrap();
        let mut pool = (*body.pool).clone();
        let call = helper_call(&mut pool, "traceRecord", "(I)V");
        let mut plan = EditPlan::default();
        plan.push(Edit {
            pos: 0,
            kind: EditKind::InsertBefore,
            precedence: 0,
            code: vec![synth(op::SIPUSH, Operand::Immediate(1)), call],
        });
        let woven = apply_plan(&body, &plan, pool).unwrap();
        // The protected range moved with the inserted code.
        assert_eq!(woven.handlers[0].start, 0);
        assert!(woven.handlers[0].end > body.handlers[0].end);
        assert!(woven.handlers[0].handler > body.handlers[0].handler);
        assert!(woven.max_stack >= body.max_stack);
    }

    #[test]
    fn two_rewrites_at_one_position_are_rejected() {
        let body = branching_body();
        let mut plan = EditPlan::default();
        for precedence in [1, 2] {
            plan.push(Edit {
                pos: 9,
                kind: EditKind::Rewrite,
                precedence,
                code: vec![synth(op::RETURN, Operand::None)],
            });
        }
        assert!(matches!(
            apply_plan(&body, &plan, (*body.pool).clone()),
            Err(Error::Internal(_))
        ));
    }
}
