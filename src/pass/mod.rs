//! Analysis and transformation passes over the tensor IR.
//!
//! The pipeline order is fixed: verification, constant folding, dead-code
//! elimination, lifetime-stop insertion, stack-slot assignment,
//! work-group-size selection, barrier insertion. Each transformation pass
//! operates in place and is idempotent when reapplied to its own output.

pub mod alias;
pub mod barrier;
pub mod dce;
pub mod fold;
pub mod lifetime;
pub mod stack;
pub mod verify;
pub mod work_group_size;

use crate::device::DeviceInfo;
use crate::error::Diagnostics;
use crate::{Function, Handle, Inst, Program, Value};

/// Runs the transformation pipeline on a verified program.
pub fn optimize(program: &mut Program, device: &DeviceInfo) -> Result<(), Diagnostics> {
    fold::fold_constants(program);
    dce::eliminate_dead_code(program);
    lifetime::insert_lifetime_stops(program);
    stack::assign_stack_slots(program)?;
    work_group_size::set_work_group_sizes(program, device)?;
    barrier::insert_barriers(program);
    Ok(())
}

/// Maps every value to its defining instruction.
///
/// Function and region parameters have no entry.
pub(crate) fn def_map(fun: &Function) -> crate::FastHashMap<Handle<Value>, Handle<Inst>> {
    let mut map = crate::FastHashMap::default();
    for (handle, inst) in fun.insts.iter() {
        for &result in &inst.results {
            map.insert(result, handle);
        }
    }
    map
}

/// Collects the instructions of a region tree in program (pre-)order.
pub(crate) fn preorder(fun: &Function, body: &[Handle<Inst>], out: &mut Vec<Handle<Inst>>) {
    for &handle in body {
        out.push(handle);
        for region in &fun.insts[handle].regions {
            preorder(fun, &region.body, out);
        }
    }
}

/// Counts value uses over the reachable instruction tree.
pub(crate) fn count_uses(fun: &Function) -> crate::FastHashMap<Handle<Value>, usize> {
    let mut handles = Vec::new();
    preorder(fun, &fun.body.body, &mut handles);
    let mut uses = crate::FastHashMap::default();
    for handle in handles {
        for &operand in &fun.insts[handle].operands {
            *uses.entry(operand).or_insert(0) += 1;
        }
    }
    uses
}
