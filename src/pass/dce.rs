//! Dead-code elimination.
//!
//! An instruction is dead iff it has no side effects (no child regions,
//! at least one result) and none of its results has uses. In addition, an
//! `if` whose condition is a constant false and a `for` whose bounds satisfy
//! `from >= to` are dead when their results are unused. Each region is swept
//! bottom-up, then the sweep recurses into the child regions of surviving
//! instructions, mirroring the order in which use counts decay.

use crate::{ConstantValue, FastHashMap, Function, Handle, Inst, Operation, Program, Value};

/// Removes dead instructions from every function.
pub fn eliminate_dead_code(program: &mut Program) {
    for fun in &mut program.functions {
        let defs = super::def_map(fun);
        let mut uses = super::count_uses(fun);
        let mut body = std::mem::take(&mut fun.body.body);
        let removed = sweep(fun, &mut body, &defs, &mut uses);
        fun.body.body = body;
        if removed > 0 {
            log::debug!("removed {} dead instructions in '{}'", removed, fun.name);
        }
    }
}

fn sweep(
    fun: &mut Function,
    body: &mut Vec<Handle<Inst>>,
    defs: &FastHashMap<Handle<Value>, Handle<Inst>>,
    uses: &mut FastHashMap<Handle<Value>, usize>,
) -> usize {
    let mut removed = 0;
    let mut index = body.len();
    while index > 0 {
        index -= 1;
        let handle = body[index];
        if is_dead(fun, handle, defs, uses) {
            release_uses(fun, handle, uses);
            body.remove(index);
            removed += 1;
        } else {
            for ri in 0..fun.insts[handle].regions.len() {
                let mut nested = std::mem::take(&mut fun.insts[handle].regions[ri].body);
                removed += sweep(fun, &mut nested, defs, uses);
                fun.insts[handle].regions[ri].body = nested;
            }
        }
    }
    removed
}

fn is_dead(
    fun: &Function,
    handle: Handle<Inst>,
    defs: &FastHashMap<Handle<Value>, Handle<Inst>>,
    uses: &FastHashMap<Handle<Value>, usize>,
) -> bool {
    let inst = &fun.insts[handle];
    let unused = inst
        .results
        .iter()
        .all(|r| uses.get(r).copied().unwrap_or(0) == 0);
    match inst.op {
        Operation::If => {
            // Dead if the condition is a constant false.
            unused && matches!(constant_of(fun, defs, inst.operands[0]),
                Some(ConstantValue::Bool(false)) | Some(ConstantValue::Int(0)))
        }
        Operation::For { .. } => {
            let from = constant_of(fun, defs, inst.operands[0]);
            let to = constant_of(fun, defs, inst.operands[1]);
            match (from, to) {
                (Some(ConstantValue::Int(from)), Some(ConstantValue::Int(to))) => {
                    unused && from >= to
                }
                _ => false,
            }
        }
        _ => {
            let has_side_effects = !inst.regions.is_empty() || inst.results.is_empty();
            !has_side_effects && unused
        }
    }
}

fn constant_of(
    fun: &Function,
    defs: &FastHashMap<Handle<Value>, Handle<Inst>>,
    value: Handle<Value>,
) -> Option<ConstantValue> {
    match fun.insts[*defs.get(&value)?].op {
        Operation::Constant(v) => Some(v),
        _ => None,
    }
}

/// Decrements the use counts held by an instruction tree about to be removed.
fn release_uses(
    fun: &Function,
    handle: Handle<Inst>,
    uses: &mut FastHashMap<Handle<Value>, usize>,
) {
    let inst = &fun.insts[handle];
    for operand in &inst.operands {
        if let Some(count) = uses.get_mut(operand) {
            *count = count.saturating_sub(1);
        }
    }
    for region in &inst.regions {
        for &nested in &region.body {
            release_uses(fun, nested, uses);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BinaryOp, Inst, ScalarKind, Span};

    #[test]
    fn unused_constant_chain_is_removed() {
        // %c = constant 0 : i32; %d = add %c %c
        let mut program = Program::new();
        let i32_ty = program.scalar(ScalarKind::I32);
        let mut fun = Function::new("k");
        let c = fun.make_value(i32_ty, Some("c"));
        let d = fun.make_value(i32_ty, Some("d"));

        let mut cst = Inst::new(
            Operation::Constant(ConstantValue::Int(0)),
            Span::default(),
        );
        cst.results = vec![c];
        let cst_h = fun.insts.append(cst);

        let mut add = Inst::new(Operation::Binary(BinaryOp::Add), Span::default());
        add.operands = vec![c, c];
        add.results = vec![d];
        let add_h = fun.insts.append(add);

        fun.body.body = vec![cst_h, add_h];
        program.functions.push(fun);

        eliminate_dead_code(&mut program);
        assert!(program.functions[0].body.body.is_empty());
    }

    #[test]
    fn store_is_kept() {
        let mut program = Program::new();
        let i32_ty = program.scalar(ScalarKind::I32);
        let memref_ty = program.intern(crate::Type::Memref {
            element: ScalarKind::I32,
            shape: vec![4],
            stride: vec![1],
            space: crate::AddressSpace::Global,
        });
        let mut fun = Function::new("k");
        let buf = fun.make_value(memref_ty, Some("buf"));
        fun.params.push(buf);
        let c = fun.make_value(i32_ty, None);
        let i = fun.make_value(i32_ty, None);

        let mut cst = Inst::new(
            Operation::Constant(ConstantValue::Int(7)),
            Span::default(),
        );
        cst.results = vec![c];
        let cst_h = fun.insts.append(cst);
        let mut idx = Inst::new(
            Operation::Constant(ConstantValue::Int(0)),
            Span::default(),
        );
        idx.results = vec![i];
        let idx_h = fun.insts.append(idx);
        let mut store = Inst::new(
            Operation::Store(crate::StoreFlag::Regular),
            Span::default(),
        );
        store.operands = vec![c, buf, i];
        let store_h = fun.insts.append(store);

        fun.body.body = vec![cst_h, idx_h, store_h];
        program.functions.push(fun);

        eliminate_dead_code(&mut program);
        assert_eq!(program.functions[0].body.body.len(), 3);
    }

    #[test]
    fn empty_range_for_is_removed() {
        let mut program = Program::new();
        let i32_ty = program.scalar(ScalarKind::I32);
        let mut fun = Function::new("k");
        let from = fun.make_value(i32_ty, None);
        let to = fun.make_value(i32_ty, None);
        let iv = fun.make_value(i32_ty, None);

        let mut c0 = Inst::new(
            Operation::Constant(ConstantValue::Int(5)),
            Span::default(),
        );
        c0.results = vec![from];
        let c0_h = fun.insts.append(c0);
        let mut c1 = Inst::new(
            Operation::Constant(ConstantValue::Int(5)),
            Span::default(),
        );
        c1.results = vec![to];
        let c1_h = fun.insts.append(c1);

        let mut for_inst = Inst::new(Operation::For { has_step: false }, Span::default());
        for_inst.operands = vec![from, to];
        for_inst.regions = vec![crate::Region {
            params: vec![iv],
            body: vec![],
        }];
        let for_h = fun.insts.append(for_inst);

        fun.body.body = vec![c0_h, c1_h, for_h];
        program.functions.push(fun);

        eliminate_dead_code(&mut program);
        // The loop dies, then its bound constants become unused and die too.
        assert!(program.functions[0].body.body.is_empty());
    }

    #[test]
    fn dce_is_idempotent() {
        let mut program = Program::new();
        let i32_ty = program.scalar(ScalarKind::I32);
        let mut fun = Function::new("k");
        let c = fun.make_value(i32_ty, None);
        let mut cst = Inst::new(
            Operation::Constant(ConstantValue::Int(0)),
            Span::default(),
        );
        cst.results = vec![c];
        let cst_h = fun.insts.append(cst);
        fun.body.body = vec![cst_h];
        program.functions.push(fun);

        eliminate_dead_code(&mut program);
        let after_once = program.functions[0].body.body.clone();
        eliminate_dead_code(&mut program);
        assert_eq!(program.functions[0].body.body, after_once);
    }
}
