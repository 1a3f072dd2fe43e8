//! Stack-slot assignment for workgroup-local memory.
//!
//! A linear scan in program order keeps the list of live allocations sorted
//! by byte offset. Each `alloca` takes the first aligned gap large enough;
//! each `lifetime_stop` retires its allocation so the bytes can be reused.
//! The per-function high-water mark sizes the backing workgroup variable.

use crate::error::{CompileError, ErrorCode};
use crate::{Function, Handle, Operation, Program, Type, Value};

/// Assigns byte offsets to every `alloca` and records the per-function
/// high-water mark.
pub fn assign_stack_slots(program: &mut Program) -> Result<(), CompileError> {
    let Program {
        ref types,
        ref mut functions,
        index_width,
    } = *program;
    for fun in functions {
        let mut order = Vec::new();
        super::preorder(fun, &fun.body.body, &mut order);

        // Live allocations sorted by start offset.
        let mut live: Vec<(Handle<Value>, i64, i64)> = Vec::new();
        let mut high_water = 0i64;
        for handle in order {
            let inst = &fun.insts[handle];
            match inst.op {
                Operation::Alloca { .. } => {
                    let value = inst.results[0];
                    let (size, align) = match types[fun.values[value].ty] {
                        Type::Memref {
                            element,
                            ref shape,
                            ..
                        } => {
                            let count: i64 = shape.iter().product();
                            (
                                count * element.size(index_width),
                                element.alignment(index_width),
                            )
                        }
                        _ => {
                            return Err(CompileError::new(
                                inst.span,
                                ErrorCode::ExpectedMemref,
                            ))
                        }
                    };
                    let offset = first_fit(&live, size, align);
                    let at = live
                        .iter()
                        .position(|&(_, start, _)| start > offset)
                        .unwrap_or(live.len());
                    live.insert(at, (value, offset, offset + size));
                    high_water = high_water.max(offset + size);
                    if let Operation::Alloca { offset: ref mut o } =
                        fun.insts[handle].op
                    {
                        *o = offset;
                    }
                }
                Operation::LifetimeStop => {
                    let value = inst.operands[0];
                    live.retain(|&(v, _, _)| v != value);
                }
                _ => {}
            }
        }
        fun.stack_high_water = high_water;
        if high_water > 0 {
            log::debug!("'{}' uses {} bytes of local memory", fun.name, high_water);
        }
    }
    Ok(())
}

fn align_up(value: i64, align: i64) -> i64 {
    (value + align - 1) / align * align
}

fn first_fit(live: &[(Handle<Value>, i64, i64)], size: i64, align: i64) -> i64 {
    let mut candidate = 0i64;
    for &(_, start, end) in live {
        if candidate + size <= start {
            break;
        }
        candidate = candidate.max(align_up(end, align));
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressSpace, Inst, ScalarKind, Span};

    fn local_memref(program: &mut Program, len: i64) -> Handle<Type> {
        program.intern(Type::Memref {
            element: ScalarKind::F32,
            shape: vec![len],
            stride: vec![1],
            space: AddressSpace::Local,
        })
    }

    fn push_alloca(fun: &mut Function, ty: Handle<Type>) -> (Handle<Inst>, Handle<Value>) {
        let v = fun.make_value(ty, None);
        let mut inst = Inst::new(Operation::Alloca { offset: -1 }, Span::default());
        inst.results = vec![v];
        let h = fun.insts.append(inst);
        fun.body.body.push(h);
        (h, v)
    }

    fn push_stop(fun: &mut Function, v: Handle<Value>) {
        let mut inst = Inst::new(Operation::LifetimeStop, Span::default());
        inst.operands = vec![v];
        let h = fun.insts.append(inst);
        fun.body.body.push(h);
    }

    #[test]
    fn slots_are_packed_and_reused() {
        let mut program = Program::new();
        let ty = local_memref(&mut program, 16); // 64 bytes
        let mut fun = Function::new("k");
        let (a, va) = push_alloca(&mut fun, ty);
        let (b, _vb) = push_alloca(&mut fun, ty);
        push_stop(&mut fun, va);
        let (c, _vc) = push_alloca(&mut fun, ty);
        program.functions.push(fun);

        assign_stack_slots(&mut program).unwrap();
        let fun = &program.functions[0];
        let offset = |h| match fun.insts[h].op {
            Operation::Alloca { offset } => offset,
            _ => unreachable!(),
        };
        assert_eq!(offset(a), 0);
        assert_eq!(offset(b), 64);
        // The first slot was retired, so it is handed out again.
        assert_eq!(offset(c), 0);
        assert_eq!(fun.stack_high_water, 128);
    }

    #[test]
    fn assignment_is_idempotent() {
        let mut program = Program::new();
        let ty = local_memref(&mut program, 8);
        let mut fun = Function::new("k");
        push_alloca(&mut fun, ty);
        push_alloca(&mut fun, ty);
        program.functions.push(fun);

        assign_stack_slots(&mut program).unwrap();
        let first: Vec<_> = program.functions[0]
            .body
            .body
            .iter()
            .map(|&h| program.functions[0].insts[h].op.clone())
            .collect();
        let hw = program.functions[0].stack_high_water;
        assign_stack_slots(&mut program).unwrap();
        let second: Vec<_> = program.functions[0]
            .body
            .body
            .iter()
            .map(|&h| program.functions[0].insts[h].op.clone())
            .collect();
        assert_eq!(first, second);
        assert_eq!(program.functions[0].stack_high_water, hw);
    }
}
