//! Lifetime-stop insertion.
//!
//! Every `alloca` gets an explicit `lifetime_stop` after its last use in the
//! region it was created in, so the stack-slot pass can reuse its bytes. A
//! use inside a nested region counts as a use by the enclosing instruction.

use crate::{Function, Handle, Inst, Operation, Program, Span, Value};

/// Inserts lifetime stops in every function.
pub fn insert_lifetime_stops(program: &mut Program) {
    for fun in &mut program.functions {
        let mut body = std::mem::take(&mut fun.body.body);
        process_region(fun, &mut body);
        fun.body.body = body;
    }
}

fn process_region(fun: &mut Function, body: &mut Vec<Handle<Inst>>) {
    // Children first, so nested allocas get their stop within their region.
    for i in 0..body.len() {
        let handle = body[i];
        for ri in 0..fun.insts[handle].regions.len() {
            let mut nested = std::mem::take(&mut fun.insts[handle].regions[ri].body);
            process_region(fun, &mut nested);
            fun.insts[handle].regions[ri].body = nested;
        }
    }

    // (alloca value, span, insertion point after the last use)
    let mut stops: Vec<(Handle<Value>, Span, usize)> = Vec::new();
    for (i, &handle) in body.iter().enumerate() {
        let inst = &fun.insts[handle];
        if let Operation::Alloca { .. } = inst.op {
            let value = inst.results[0];
            let mut last = i;
            let mut already_stopped = false;
            for (j, &user) in body.iter().enumerate().skip(i + 1) {
                if uses_value(fun, user, value) {
                    last = j;
                    already_stopped =
                        fun.insts[user].op == Operation::LifetimeStop;
                }
            }
            if !already_stopped {
                stops.push((value, inst.span, last + 1));
            }
        }
    }

    // Insert from the back so earlier insertion points stay valid.
    stops.sort_by_key(|&(_, _, at)| at);
    for &(value, span, at) in stops.iter().rev() {
        let mut stop = Inst::new(Operation::LifetimeStop, span);
        stop.operands = vec![value];
        let handle = fun.insts.append(stop);
        body.insert(at, handle);
    }
}

fn uses_value(fun: &Function, handle: Handle<Inst>, value: Handle<Value>) -> bool {
    let inst = &fun.insts[handle];
    if inst.operands.contains(&value) {
        return true;
    }
    inst.regions
        .iter()
        .flat_map(|r| r.body.iter())
        .any(|&nested| uses_value(fun, nested, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AddressSpace, ConstantValue, Program, ScalarKind, StoreFlag, Type,
    };

    fn local_memref(program: &mut Program) -> crate::Handle<Type> {
        program.intern(Type::Memref {
            element: ScalarKind::F32,
            shape: vec![16],
            stride: vec![1],
            space: AddressSpace::Local,
        })
    }

    fn build(program: &mut Program) -> Function {
        let memref_ty = local_memref(program);
        let f32_ty = program.scalar(ScalarKind::F32);
        let index_ty = program.scalar(ScalarKind::Index);
        let mut fun = Function::new("k");
        let slab = fun.make_value(memref_ty, Some("slab"));
        let zero = fun.make_value(index_ty, None);
        let value = fun.make_value(f32_ty, None);

        let mut alloca = Inst::new(Operation::Alloca { offset: -1 }, Span::default());
        alloca.results = vec![slab];
        let alloca_h = fun.insts.append(alloca);

        let mut c0 = Inst::new(
            Operation::Constant(ConstantValue::Int(0)),
            Span::default(),
        );
        c0.results = vec![zero];
        let c0_h = fun.insts.append(c0);
        let mut cv = Inst::new(
            Operation::Constant(ConstantValue::Float(1.0)),
            Span::default(),
        );
        cv.results = vec![value];
        let cv_h = fun.insts.append(cv);

        let mut store = Inst::new(Operation::Store(StoreFlag::Regular), Span::default());
        store.operands = vec![value, slab, zero];
        let store_h = fun.insts.append(store);

        fun.body.body = vec![alloca_h, c0_h, cv_h, store_h];
        fun
    }

    #[test]
    fn stop_is_inserted_after_last_use() {
        let mut program = Program::new();
        let fun = build(&mut program);
        program.functions.push(fun);
        insert_lifetime_stops(&mut program);

        let fun = &program.functions[0];
        assert_eq!(fun.body.body.len(), 5);
        let last = *fun.body.body.last().unwrap();
        assert_eq!(fun.insts[last].op, Operation::LifetimeStop);
        // It names the alloca result.
        let alloca = fun.body.body[0];
        assert_eq!(fun.insts[last].operands[0], fun.insts[alloca].results[0]);
    }

    #[test]
    fn insertion_is_idempotent() {
        let mut program = Program::new();
        let fun = build(&mut program);
        program.functions.push(fun);
        insert_lifetime_stops(&mut program);
        let once = program.functions[0].body.body.clone();
        insert_lifetime_stops(&mut program);
        assert_eq!(program.functions[0].body.body, once);
    }
}
