//! Work-group size selection.
//!
//! Functions may pin their subgroup and work-group size; for the rest, a
//! deterministic heuristic picks them from the device tables. The tiling
//! doubles along the matrix mode with the most uncovered work until either
//! the work-group limit or the register budget is reached. No search, no
//! timing: the same program on the same device always gets the same sizes.

use crate::device::{CoreConfig, DeviceInfo};
use crate::error::{CompileError, ErrorCode};
use crate::{Function, Operation, Program, Type};

/// Shape of one multiply-accumulate reachable in a function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct BlasShape {
    m: i64,
    n: i64,
}

/// Selects subgroup and work-group sizes for every function that has not
/// pinned them.
pub fn set_work_group_sizes(
    program: &mut Program,
    device: &DeviceInfo,
) -> Result<(), CompileError> {
    let Program {
        ref types,
        ref mut functions,
        ..
    } = *program;
    for fun in functions {
        let uses_matrix = uses_coopmatrix(fun, types);
        if fun.subgroup_size == 0 {
            fun.subgroup_size = match (uses_matrix, device.matrix.as_ref()) {
                (true, Some(matrix)) => matrix.subgroup_size,
                _ => *device
                    .subgroup_sizes
                    .last()
                    .ok_or_else(|| {
                        CompileError::new(
                            Default::default(),
                            ErrorCode::UnsupportedSubgroupSize,
                        )
                    })?,
            };
        }
        let core_cfg = device.core_config(fun.subgroup_size)?;
        if fun.work_group_size == [0, 0] {
            fun.work_group_size = suggest_work_group_size(fun, types, &core_cfg);
            log::debug!(
                "'{}': subgroup size {}, work-group size {:?}",
                fun.name,
                fun.subgroup_size,
                fun.work_group_size
            );
        } else if fun.work_group_size[0] % fun.subgroup_size != 0 {
            return Err(CompileError::with_note(
                Default::default(),
                ErrorCode::UnsupportedSubgroupSize,
                "work-group size must be a multiple of the subgroup size",
            ));
        }
    }
    Ok(())
}

fn uses_coopmatrix(fun: &Function, types: &crate::Arena<Type>) -> bool {
    fun.values
        .iter()
        .any(|(_, v)| matches!(types[v.ty], Type::Coopmatrix { .. }))
}

fn collect_shapes(fun: &Function, types: &crate::Arena<Type>) -> Vec<BlasShape> {
    let mut order = Vec::new();
    super::preorder(fun, &fun.body.body, &mut order);
    let mut shapes = Vec::new();
    for handle in order {
        let inst = &fun.insts[handle];
        if let Operation::CoopMulAdd = inst.op {
            if let Type::Coopmatrix { rows, cols, .. } = types[fun.values[inst.results[0]].ty]
            {
                let shape = BlasShape { m: rows, n: cols };
                if !shapes.contains(&shape) {
                    shapes.push(shape);
                }
            }
        }
    }
    shapes
}

fn suggest_work_group_size(
    fun: &Function,
    types: &crate::Arena<Type>,
    core_cfg: &CoreConfig,
) -> [i32; 2] {
    let sgs = core_cfg.subgroup_size;
    let shapes = collect_shapes(fun, types);
    if shapes.is_empty() {
        return [sgs, 1];
    }
    let max_m = shapes.iter().map(|s| s.m).max().unwrap_or(1);
    let max_n = shapes.iter().map(|s| s.n).max().unwrap_or(1);

    // One subgroup per (m-tile, n-tile); cap the tile count by the thread
    // budget the register file supports.
    let max_tiles = (core_cfg.max_work_group_size / sgs).max(1);
    let mut m_tiles = 1i32;
    let mut n_tiles = 1i32;
    loop {
        let m_short = (m_tiles as i64 * sgs as i64) < max_m;
        let n_short = (n_tiles as i64) < max_n;
        let next = if m_short && (!n_short || m_tiles <= n_tiles) {
            (m_tiles * 2, n_tiles)
        } else if n_short {
            (m_tiles, n_tiles * 2)
        } else {
            break;
        };
        if next.0 * next.1 > max_tiles {
            break;
        }
        m_tiles = next.0;
        n_tiles = next.1;
    }
    [m_tiles * sgs, n_tiles]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Inst, MatrixUse, ScalarKind, Span};

    #[test]
    fn plain_kernel_gets_one_subgroup() {
        let mut program = Program::new();
        program.functions.push(Function::new("k"));
        let device = DeviceInfo::pvc();
        set_work_group_sizes(&mut program, &device).unwrap();
        let fun = &program.functions[0];
        assert_eq!(fun.subgroup_size, 32);
        assert_eq!(fun.work_group_size, [32, 1]);
    }

    #[test]
    fn pinned_sizes_are_kept() {
        let mut program = Program::new();
        let mut fun = Function::new("k");
        fun.subgroup_size = 16;
        fun.work_group_size = [32, 4];
        program.functions.push(fun);
        let device = DeviceInfo::pvc();
        set_work_group_sizes(&mut program, &device).unwrap();
        assert_eq!(program.functions[0].work_group_size, [32, 4]);
    }

    #[test]
    fn matrix_kernel_uses_dpas_subgroup_size() {
        let mut program = Program::new();
        let a_ty = program.intern(Type::Coopmatrix {
            component: ScalarKind::BF16,
            rows: 64,
            cols: 16,
            use_: MatrixUse::A,
        });
        let b_ty = program.intern(Type::Coopmatrix {
            component: ScalarKind::BF16,
            rows: 16,
            cols: 32,
            use_: MatrixUse::B,
        });
        let c_ty = program.intern(Type::Coopmatrix {
            component: ScalarKind::F32,
            rows: 64,
            cols: 32,
            use_: MatrixUse::Acc,
        });
        let mut fun = Function::new("k");
        let a = fun.make_value(a_ty, None);
        let b = fun.make_value(b_ty, None);
        let c = fun.make_value(c_ty, None);
        let r = fun.make_value(c_ty, None);
        let mut mul = Inst::new(Operation::CoopMulAdd, Span::default());
        mul.operands = vec![a, b, c];
        mul.results = vec![r];
        let h = fun.insts.append(mul);
        fun.body.body.push(h);
        program.functions.push(fun);

        let device = DeviceInfo::pvc();
        set_work_group_sizes(&mut program, &device).unwrap();
        let fun = &program.functions[0];
        assert_eq!(fun.subgroup_size, 16);
        // Tiles grow towards the 64 x 32 accumulator.
        assert!(fun.work_group_size[0] >= 32);
        assert!(fun.work_group_size[1] >= 2);
        assert!(
            fun.work_group_size[0] * fun.work_group_size[1]
                <= device.max_work_group_size
        );
    }

    #[test]
    fn selection_is_idempotent() {
        let mut program = Program::new();
        program.functions.push(Function::new("k"));
        let device = DeviceInfo::pvc();
        set_work_group_sizes(&mut program, &device).unwrap();
        let once = (
            program.functions[0].subgroup_size,
            program.functions[0].work_group_size,
        );
        set_work_group_sizes(&mut program, &device).unwrap();
        assert_eq!(
            once,
            (
                program.functions[0].subgroup_size,
                program.functions[0].work_group_size
            )
        );
    }
}
