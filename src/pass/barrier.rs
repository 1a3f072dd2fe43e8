//! Barrier insertion.
//!
//! Walks each region in program order tracking which alias classes have been
//! written since the last barrier, separately per address space. Before any
//! read that may alias a pending write, a `barrier` with the matching fence
//! set is inserted and the fenced sets are drained. Existing barriers drain
//! their fence sets too, which is what makes the pass idempotent. Barriers
//! are never placed inside `parallel` regions; pending writes from a nested
//! region flow back into the enclosing one instead.

use bit_set::BitSet;

use crate::pass::alias::AliasMap;
use crate::{AddressSpace, FenceFlags, Function, Handle, Inst, Operation, Program, Type, Value};

/// Inserts barriers into every function.
pub fn insert_barriers(program: &mut Program) {
    let Program {
        ref types,
        ref mut functions,
        ..
    } = *program;
    for fun in functions {
        let aliases = super::alias::analyze(fun);
        let mut pending = Pending::default();
        let mut body = std::mem::take(&mut fun.body.body);
        process_region(fun, types, &aliases, &mut body, &mut pending, false);
        fun.body.body = body;
    }
}

/// Alias-class roots written since the last fence, per address space.
#[derive(Clone, Debug, Default)]
struct Pending {
    global: BitSet,
    local: BitSet,
}

impl Pending {
    fn insert(&mut self, space: AddressSpace, root: Handle<Value>) {
        match space {
            AddressSpace::Global => self.global.insert(root.index()),
            AddressSpace::Local => self.local.insert(root.index()),
        };
    }

    fn conflict(&self, space: AddressSpace, root: Handle<Value>) -> bool {
        match space {
            AddressSpace::Global => self.global.contains(root.index()),
            AddressSpace::Local => self.local.contains(root.index()),
        }
    }

    fn drain(&mut self, fences: FenceFlags) {
        if fences.contains(FenceFlags::GLOBAL) {
            self.global.clear();
        }
        if fences.contains(FenceFlags::LOCAL) {
            self.local.clear();
        }
    }

    fn union(&mut self, other: &Pending) {
        self.global.union_with(&other.global);
        self.local.union_with(&other.local);
    }
}

/// A memory access performed directly by one instruction.
fn accesses(inst: &Inst) -> (Option<Handle<Value>>, Option<Handle<Value>>) {
    match inst.op {
        Operation::Load | Operation::CoopLoad { .. } => (Some(inst.operands[0]), None),
        Operation::Store(_) => (None, Some(inst.operands[1])),
        Operation::CoopStore { .. } => (None, Some(inst.operands[1])),
        _ => (None, None),
    }
}

fn space_of(fun: &Function, types: &crate::Arena<Type>, value: Handle<Value>) -> AddressSpace {
    match types[fun.values[value].ty] {
        Type::Memref { space, .. } => space,
        _ => AddressSpace::Global,
    }
}

/// Collects every alias root written anywhere below a list of instructions.
fn collect_writes(
    fun: &Function,
    types: &crate::Arena<Type>,
    aliases: &AliasMap,
    body: &[Handle<Inst>],
    pending: &mut Pending,
) {
    for &handle in body {
        let inst = &fun.insts[handle];
        if let (_, Some(written)) = accesses(inst) {
            pending.insert(space_of(fun, types, written), aliases.root_of(written));
        }
        for region in &inst.regions {
            collect_writes(fun, types, aliases, &region.body, pending);
        }
    }
}

fn process_region(
    fun: &mut Function,
    types: &crate::Arena<Type>,
    aliases: &AliasMap,
    body: &mut Vec<Handle<Inst>>,
    pending: &mut Pending,
    spmd: bool,
) {
    let mut index = 0;
    while index < body.len() {
        let handle = body[index];

        // A loop body observes its own writes on the next trip.
        if let Operation::For { .. } = fun.insts[handle].op {
            collect_writes(fun, types, aliases, &fun.insts[handle].regions[0].body, pending);
        }

        let (read, written) = accesses(&fun.insts[handle]);
        if let Some(read) = read {
            let space = space_of(fun, types, read);
            let root = aliases.root_of(read);
            if !spmd && pending.conflict(space, root) {
                let fences = match space {
                    AddressSpace::Global => FenceFlags::GLOBAL,
                    AddressSpace::Local => FenceFlags::LOCAL,
                };
                let span = fun.insts[handle].span;
                let barrier = fun
                    .insts
                    .append(Inst::new(Operation::Barrier(fences), span));
                body.insert(index, barrier);
                index += 1;
                pending.drain(fences);
                log::trace!("inserted {:?} barrier in '{}'", fences, fun.name);
            }
        }

        match fun.insts[handle].op {
            Operation::Barrier(fences) => pending.drain(fences),
            Operation::Parallel => {
                let mut nested = std::mem::take(&mut fun.insts[handle].regions[0].body);
                let mut inner = pending.clone();
                process_region(fun, types, aliases, &mut nested, &mut inner, true);
                fun.insts[handle].regions[0].body = nested;
                pending.union(&inner);
            }
            Operation::If | Operation::For { .. } => {
                for ri in 0..fun.insts[handle].regions.len() {
                    let mut nested =
                        std::mem::take(&mut fun.insts[handle].regions[ri].body);
                    let mut inner = pending.clone();
                    process_region(fun, types, aliases, &mut nested, &mut inner, spmd);
                    fun.insts[handle].regions[ri].body = nested;
                    pending.union(&inner);
                }
            }
            _ => {}
        }

        if let Some(written) = written {
            pending.insert(space_of(fun, types, written), aliases.root_of(written));
        }
        index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConstantValue, Program, ScalarKind, Span, StoreFlag};

    fn build_store_load(space: AddressSpace) -> Program {
        let mut program = Program::new();
        let memref_ty = program.intern(Type::Memref {
            element: ScalarKind::F32,
            shape: vec![64],
            stride: vec![1],
            space,
        });
        let f32_ty = program.scalar(ScalarKind::F32);
        let index_ty = program.scalar(ScalarKind::Index);
        let mut fun = Function::new("k");
        let buf = fun.make_value(memref_ty, Some("buf"));
        fun.params.push(buf);
        let zero = fun.make_value(index_ty, None);
        let value = fun.make_value(f32_ty, None);
        let loaded = fun.make_value(f32_ty, None);

        let mut c0 = Inst::new(
            Operation::Constant(ConstantValue::Int(0)),
            Span::default(),
        );
        c0.results = vec![zero];
        let c0_h = fun.insts.append(c0);
        let mut cv = Inst::new(
            Operation::Constant(ConstantValue::Float(2.0)),
            Span::default(),
        );
        cv.results = vec![value];
        let cv_h = fun.insts.append(cv);

        let mut store = Inst::new(Operation::Store(StoreFlag::Regular), Span::default());
        store.operands = vec![value, buf, zero];
        let store_h = fun.insts.append(store);

        let mut load = Inst::new(Operation::Load, Span::default());
        load.operands = vec![buf, zero];
        load.results = vec![loaded];
        let load_h = fun.insts.append(load);

        fun.body.body = vec![c0_h, cv_h, store_h, load_h];
        program.functions.push(fun);
        program
    }

    fn barrier_count(program: &Program) -> usize {
        let fun = &program.functions[0];
        fun.body
            .body
            .iter()
            .filter(|&&h| matches!(fun.insts[h].op, Operation::Barrier(_)))
            .count()
    }

    #[test]
    fn local_read_after_write_gets_local_fence() {
        let mut program = build_store_load(AddressSpace::Local);
        insert_barriers(&mut program);
        let fun = &program.functions[0];
        assert_eq!(barrier_count(&program), 1);
        // The barrier sits right before the load.
        let barrier = fun.body.body[3];
        assert_eq!(
            fun.insts[barrier].op,
            Operation::Barrier(FenceFlags::LOCAL)
        );
    }

    #[test]
    fn global_read_after_write_gets_global_fence() {
        let mut program = build_store_load(AddressSpace::Global);
        insert_barriers(&mut program);
        let fun = &program.functions[0];
        let barrier = fun.body.body[3];
        assert_eq!(
            fun.insts[barrier].op,
            Operation::Barrier(FenceFlags::GLOBAL)
        );
    }

    #[test]
    fn insertion_is_idempotent() {
        let mut program = build_store_load(AddressSpace::Local);
        insert_barriers(&mut program);
        let once = program.functions[0].body.body.clone();
        insert_barriers(&mut program);
        assert_eq!(program.functions[0].body.body, once);
    }

    #[test]
    fn unrelated_buffers_need_no_barrier() {
        let mut program = Program::new();
        let memref_ty = program.intern(Type::Memref {
            element: ScalarKind::F32,
            shape: vec![64],
            stride: vec![1],
            space: AddressSpace::Local,
        });
        let f32_ty = program.scalar(ScalarKind::F32);
        let index_ty = program.scalar(ScalarKind::Index);
        let mut fun = Function::new("k");
        let a = fun.make_value(memref_ty, Some("a"));
        let b = fun.make_value(memref_ty, Some("b"));
        fun.params = vec![a, b];
        let zero = fun.make_value(index_ty, None);
        let value = fun.make_value(f32_ty, None);
        let loaded = fun.make_value(f32_ty, None);

        let mut c0 = Inst::new(
            Operation::Constant(ConstantValue::Int(0)),
            Span::default(),
        );
        c0.results = vec![zero];
        let c0_h = fun.insts.append(c0);
        let mut cv = Inst::new(
            Operation::Constant(ConstantValue::Float(2.0)),
            Span::default(),
        );
        cv.results = vec![value];
        let cv_h = fun.insts.append(cv);
        let mut store = Inst::new(Operation::Store(StoreFlag::Regular), Span::default());
        store.operands = vec![value, a, zero];
        let store_h = fun.insts.append(store);
        let mut load = Inst::new(Operation::Load, Span::default());
        load.operands = vec![b, zero];
        load.results = vec![loaded];
        let load_h = fun.insts.append(load);
        fun.body.body = vec![c0_h, cv_h, store_h, load_h];
        program.functions.push(fun);

        insert_barriers(&mut program);
        assert_eq!(barrier_count(&program), 0);
    }
}
