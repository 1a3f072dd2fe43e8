//! Cooperative-matrix lowering.
//!
//! Three policies form a strictly preferential fallback chain: DPAS with 2D
//! block I/O (dpas.rs), subgroup block reads/writes, and the generic
//! per-lane walk implemented here. Each operation picks the most specific
//! policy whose preconditions hold; the verifier never requires any
//! particular policy to apply.
//!
//! A matrix of shape `R x C` with subgroup size `sgs` is distributed as
//! `rows = min(R, sgs)` lane rows, `blocks = R / rows` row blocks and
//! `length = rows * cols * blocks / sgs` scalar components per lane. Lane
//! `l` owns row `l % rows` and the columns congruent to `l / rows` modulo
//! `sgs / rows`.

use spirv::{Op, StorageClass};

use crate::back::spv::{instructions::*, Inst as SpvInst};
use crate::error::{CompileError, ErrorCode, Span};
use crate::{
    BinaryOp, CheckedFlag, Function, Handle, Inst, ReduceOp, ScalarKind, StoreFlag, Type, Value,
};

use super::writer::Writer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct CoopLayout {
    pub rows: i64,
    pub cols: i64,
    pub blocks: i64,
    pub length: i64,
    /// Logical column count of the matrix type.
    pub shape1: i64,
}

impl CoopLayout {
    /// Column step between successive components of one lane.
    pub fn col_inc(&self, sgs: i64) -> i64 {
        sgs / self.rows
    }

    /// Components per lane per row block.
    pub fn per_block(&self) -> i64 {
        self.length / self.blocks
    }
}

/// The distribution of an `R x C` matrix over `sgs` lanes.
pub(super) fn coop_layout(r: i64, c: i64, sgs: i64) -> CoopLayout {
    let rows = r.min(sgs);
    let cols = (1 + (rows * c - 1) / sgs) * sgs / rows;
    let blocks = r / rows;
    CoopLayout {
        rows,
        cols,
        blocks,
        length: rows * cols * blocks / sgs,
        shape1: c,
    }
}

/// Roles of the two memref modes during a matrix transfer.
struct TransferFrame {
    row_pos: Handle<SpvInst>,
    col_pos: Handle<SpvInst>,
    row_stride: Handle<SpvInst>,
    col_stride: Handle<SpvInst>,
    row_shape: Handle<SpvInst>,
    col_shape: Handle<SpvInst>,
}

impl<'a> Writer<'a> {
    pub fn coop_layout_of(&self, fun: &Function, value: Handle<Value>) -> CoopLayout {
        match self.program.types[fun.values[value].ty] {
            Type::Coopmatrix { rows, cols, .. } => {
                coop_layout(rows, cols, self.core_cfg.subgroup_size as i64)
            }
            _ => coop_layout(1, 1, 1),
        }
    }

    // ------------------------------------------------------------------
    // Policy dispatch
    // ------------------------------------------------------------------

    pub fn coop_load(
        &mut self,
        fun: &Function,
        inst: &Inst,
        transpose: bool,
        checked: CheckedFlag,
    ) -> Result<(), CompileError> {
        if self.dpas_transfer_applicable(fun, inst.operands[0], inst.operands[1], transpose, checked)
            && self.dpas_vector_ok(fun, inst.results[0])
        {
            log::trace!("coop_load: block-2D policy");
            return self.dpas_coop_load(fun, inst, transpose);
        }
        if self.block_io_applicable(fun, inst.operands[0], inst.operands[1], transpose, checked) {
            let layout = self.coop_layout_of(fun, inst.results[0]);
            if layout.rows == self.core_cfg.subgroup_size as i64 {
                log::trace!("coop_load: subgroup block read policy");
                return self.block_coop_load(fun, inst);
            }
        }
        self.generic_coop_load(fun, inst, transpose, checked)
    }

    pub fn coop_store(
        &mut self,
        fun: &Function,
        inst: &Inst,
        flag: StoreFlag,
        checked: CheckedFlag,
    ) -> Result<(), CompileError> {
        if flag == StoreFlag::Regular
            && self.dpas_transfer_applicable(fun, inst.operands[1], inst.operands[2], false, checked)
            && self.dpas_vector_ok(fun, inst.operands[0])
        {
            log::trace!("coop_store: block-2D policy");
            return self.dpas_coop_store(fun, inst);
        }
        if flag == StoreFlag::Regular
            && self.block_io_applicable(fun, inst.operands[1], inst.operands[2], false, checked)
        {
            let layout = self.coop_layout_of(fun, inst.operands[0]);
            if layout.rows == self.core_cfg.subgroup_size as i64 {
                log::trace!("coop_store: subgroup block write policy");
                return self.block_coop_store(fun, inst);
            }
        }
        self.generic_coop_store(fun, inst, flag, checked)
    }

    pub fn coop_mul_add(&mut self, fun: &Function, inst: &Inst) -> Result<(), CompileError> {
        if self.dpas_mul_add_applicable(fun, inst) {
            log::trace!("coop_mul_add: DPAS policy");
            return self.dpas_coop_mul_add(fun, inst);
        }
        self.generic_mul_add(fun, inst)
    }

    pub fn coop_prefetch(
        &mut self,
        fun: &Function,
        inst: &Inst,
        cache_level: i32,
        rows: i64,
        cols: i64,
    ) -> Result<(), CompileError> {
        if self.dpas_transfer_applicable(
            fun,
            inst.operands[0],
            inst.operands[1],
            false,
            CheckedFlag::None,
        ) {
            return self.dpas_coop_prefetch(fun, inst, cache_level, rows, cols);
        }
        // Prefetching is only a hint; without block-2D support it is a no-op.
        Ok(())
    }

    // ------------------------------------------------------------------
    // Generic policy: per-lane scalar walk
    // ------------------------------------------------------------------

    fn lane_coords(
        &mut self,
        layout: &CoopLayout,
    ) -> Result<(Handle<SpvInst>, Handle<SpvInst>), CompileError> {
        let lane32 = self.load_builtin(spirv::BuiltIn::SubgroupLocalInvocationId)?;
        let lane = self.make_cast(ScalarKind::Index, ScalarKind::I32, lane32, Span::default())?;
        let index_ty = self.scalar_ty(ScalarKind::Index);
        let rows = self.index_constant(layout.rows);
        let row0 = self.emit(instruction_value(Op::SRem, index_ty, &[lane, rows]));
        let col0 = self.emit(instruction_value(Op::SDiv, index_ty, &[lane, rows]));
        Ok((row0, col0))
    }

    /// Positions, strides and shapes of the transfer, with the matrix row
    /// coordinate mapped onto mode 1 for transposed accesses.
    fn transfer_frame(
        &mut self,
        fun: &Function,
        memref: Handle<Value>,
        pos0: Handle<Value>,
        pos1: Handle<Value>,
        transpose: bool,
        span: Span,
    ) -> Result<TransferFrame, CompileError> {
        let dv = self.dope_of(memref, span)?.clone();
        let p0_kind = self.scalar_kind_of(fun, pos0, span)?;
        let p1_kind = self.scalar_kind_of(fun, pos1, span)?;
        let p0 = self.val(fun, pos0, span)?;
        let p1 = self.val(fun, pos1, span)?;
        let p0 = if p0_kind == ScalarKind::Index {
            p0
        } else {
            self.make_cast(ScalarKind::Index, p0_kind, p0, span)?
        };
        let p1 = if p1_kind == ScalarKind::Index {
            p1
        } else {
            self.make_cast(ScalarKind::Index, p1_kind, p1, span)?
        };
        Ok(if transpose {
            TransferFrame {
                row_pos: p1,
                col_pos: p0,
                row_stride: dv.stride[1],
                col_stride: dv.stride[0],
                row_shape: dv.shape[1],
                col_shape: dv.shape[0],
            }
        } else {
            TransferFrame {
                row_pos: p0,
                col_pos: p1,
                row_stride: dv.stride[0],
                col_stride: dv.stride[1],
                row_shape: dv.shape[0],
                col_shape: dv.shape[1],
            }
        })
    }

    pub(super) fn generic_coop_load(
        &mut self,
        fun: &Function,
        inst: &Inst,
        transpose: bool,
        checked: CheckedFlag,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let result = inst.results[0];
        let layout = self.coop_layout_of(fun, result);
        let sgs = self.core_cfg.subgroup_size as i64;
        let component = self.coop_kind_of(fun, result, span)?;
        let elem_ty = self.scalar_ty(component);
        let index_ty = self.scalar_ty(ScalarKind::Index);
        let spv_pointer_ty = self.spv_ty(fun.values[inst.operands[0]].ty)?;

        let frame = self.transfer_frame(
            fun,
            inst.operands[0],
            inst.operands[1],
            inst.operands[2],
            transpose,
            span,
        )?;
        let (row0, col0) = self.lane_coords(&layout)?;

        let row_base = self.emit(instruction_value(Op::IAdd, index_ty, &[frame.row_pos, row0]));
        let mut row = self.emit(instruction_value(
            Op::IMul,
            index_ty,
            &[row_base, frame.row_stride],
        ));
        let rows_c = self.index_constant(layout.rows);
        let row_inc = self.emit(instruction_value(
            Op::IMul,
            index_ty,
            &[rows_c, frame.row_stride],
        ));
        let col_base = self.emit(instruction_value(Op::IAdd, index_ty, &[frame.col_pos, col0]));
        let col_start = self.emit(instruction_value(
            Op::IMul,
            index_ty,
            &[col_base, frame.col_stride],
        ));
        let cif = layout.col_inc(sgs);
        let cif_c = self.index_constant(cif);
        let col_inc = self.emit(instruction_value(
            Op::IMul,
            index_ty,
            &[cif_c, frame.col_stride],
        ));

        let row_max = self.emit(instruction_value(
            Op::IMul,
            index_ty,
            &[frame.row_shape, frame.row_stride],
        ));
        let col_max = self.emit(instruction_value(
            Op::IMul,
            index_ty,
            &[frame.col_shape, frame.col_stride],
        ));

        let base = self.val(fun, inst.operands[0], span)?;
        let null = self.null_constant(elem_ty);
        let mut components = vec![null; layout.length as usize];

        let per_block = layout.per_block();
        for block in 0..layout.blocks {
            let mut col = col_start;
            for col_no in 0..per_block {
                let offset = self.emit(instruction_value(Op::IAdd, index_ty, &[row, col]));
                let guard = self.transfer_guard(
                    &layout,
                    checked,
                    col_no,
                    cif,
                    col0,
                    row,
                    row_max,
                    col,
                    col_max,
                )?;
                let value = match guard {
                    Some(cond) => self.emit_cond_value(cond, elem_ty, null, |w| {
                        let pointer = w.emit(instruction_in_bounds_ptr_access_chain(
                            spv_pointer_ty,
                            base,
                            offset,
                        ));
                        Ok(w.emit(instruction_load(elem_ty, pointer)))
                    })?,
                    None => {
                        let pointer = self.emit(instruction_in_bounds_ptr_access_chain(
                            spv_pointer_ty,
                            base,
                            offset,
                        ));
                        self.emit(instruction_load(elem_ty, pointer))
                    }
                };
                let component_no = if transpose {
                    (block + col_no * layout.blocks) as usize
                } else {
                    (col_no + block * per_block) as usize
                };
                components[component_no] = value;
                if col_no + 1 < per_block {
                    col = self.emit(instruction_value(Op::IAdd, index_ty, &[col, col_inc]));
                }
            }
            if block + 1 < layout.blocks {
                row = self.emit(instruction_value(Op::IAdd, index_ty, &[row, row_inc]));
            }
        }
        self.multi_declare(result, components);
        Ok(())
    }

    pub(super) fn generic_coop_store(
        &mut self,
        fun: &Function,
        inst: &Inst,
        flag: StoreFlag,
        checked: CheckedFlag,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let value = inst.operands[0];
        let memref = inst.operands[1];
        let layout = self.coop_layout_of(fun, value);
        let sgs = self.core_cfg.subgroup_size as i64;
        let component = self.coop_kind_of(fun, value, span)?;
        let index_ty = self.scalar_ty(ScalarKind::Index);
        let spv_pointer_ty = self.spv_ty(fun.values[memref].ty)?;
        let space = match *self.ty_of_pub(fun, memref) {
            Type::Memref { space, .. } => space,
            _ => return Err(CompileError::new(span, ErrorCode::ExpectedMemref)),
        };

        let frame = self.transfer_frame(
            fun,
            memref,
            inst.operands[2],
            inst.operands[3],
            false,
            span,
        )?;
        let (row0, col0) = self.lane_coords(&layout)?;

        let row_base = self.emit(instruction_value(Op::IAdd, index_ty, &[frame.row_pos, row0]));
        let mut row = self.emit(instruction_value(
            Op::IMul,
            index_ty,
            &[row_base, frame.row_stride],
        ));
        let rows_c = self.index_constant(layout.rows);
        let row_inc = self.emit(instruction_value(
            Op::IMul,
            index_ty,
            &[rows_c, frame.row_stride],
        ));
        let col_base = self.emit(instruction_value(Op::IAdd, index_ty, &[frame.col_pos, col0]));
        let col_start = self.emit(instruction_value(
            Op::IMul,
            index_ty,
            &[col_base, frame.col_stride],
        ));
        let cif = layout.col_inc(sgs);
        let cif_c = self.index_constant(cif);
        let col_inc = self.emit(instruction_value(
            Op::IMul,
            index_ty,
            &[cif_c, frame.col_stride],
        ));
        let row_max = self.emit(instruction_value(
            Op::IMul,
            index_ty,
            &[frame.row_shape, frame.row_stride],
        ));
        let col_max = self.emit(instruction_value(
            Op::IMul,
            index_ty,
            &[frame.col_shape, frame.col_stride],
        ));

        let base = self.val(fun, memref, span)?;
        let components = self.multi_val(value, span)?;

        let per_block = layout.per_block();
        for block in 0..layout.blocks {
            let mut col = col_start;
            for col_no in 0..per_block {
                let offset = self.emit(instruction_value(Op::IAdd, index_ty, &[row, col]));
                let component_no = (col_no + block * per_block) as usize;
                let stored = components[component_no];
                let guard = self.transfer_guard(
                    &layout,
                    checked,
                    col_no,
                    cif,
                    col0,
                    row,
                    row_max,
                    col,
                    col_max,
                )?;
                match guard {
                    Some(cond) => {
                        self.emit_cond(cond, |w| {
                            let pointer = w.emit(instruction_in_bounds_ptr_access_chain(
                                spv_pointer_ty,
                                base,
                                offset,
                            ));
                            w.make_store(flag, component, space, pointer, stored, span)
                        })?;
                    }
                    None => {
                        let pointer = self.emit(instruction_in_bounds_ptr_access_chain(
                            spv_pointer_ty,
                            base,
                            offset,
                        ));
                        self.make_store(flag, component, space, pointer, stored, span)?;
                    }
                }
                if col_no + 1 < per_block {
                    col = self.emit(instruction_value(Op::IAdd, index_ty, &[col, col_inc]));
                }
            }
            if block + 1 < layout.blocks {
                row = self.emit(instruction_value(Op::IAdd, index_ty, &[row, row_inc]));
            }
        }
        Ok(())
    }

    /// Combined mask for layout padding and user-requested bounds checks.
    #[allow(clippy::too_many_arguments)]
    fn transfer_guard(
        &mut self,
        layout: &CoopLayout,
        checked: CheckedFlag,
        col_no: i64,
        cif: i64,
        col0: Handle<SpvInst>,
        row: Handle<SpvInst>,
        row_max: Handle<SpvInst>,
        col: Handle<SpvInst>,
        col_max: Handle<SpvInst>,
    ) -> Result<Option<Handle<SpvInst>>, CompileError> {
        let bool_ty = self.bool_ty();
        let index_ty = self.scalar_ty(ScalarKind::Index);
        let mut cond: Option<Handle<SpvInst>> = None;

        // Padding components fall outside the logical column count for
        // some lanes.
        if (col_no + 1) * cif > layout.shape1 {
            let offset = self.index_constant(col_no * cif);
            let logical = self.emit(instruction_value(Op::IAdd, index_ty, &[col0, offset]));
            let limit = self.index_constant(layout.shape1);
            let ok = self.emit(instruction_value(Op::SLessThan, bool_ty, &[logical, limit]));
            cond = Some(ok);
        }
        if checked.rows() {
            let zero = self.null_constant(index_ty);
            let low = self.emit(instruction_value(Op::SLessThanEqual, bool_ty, &[zero, row]));
            let high = self.emit(instruction_value(Op::SLessThan, bool_ty, &[row, row_max]));
            let ok = self.emit(instruction_value(Op::LogicalAnd, bool_ty, &[low, high]));
            cond = Some(match cond {
                Some(c) => self.emit(instruction_value(Op::LogicalAnd, bool_ty, &[c, ok])),
                None => ok,
            });
        }
        if checked.cols() {
            let zero = self.null_constant(index_ty);
            let low = self.emit(instruction_value(Op::SLessThanEqual, bool_ty, &[zero, col]));
            let high = self.emit(instruction_value(Op::SLessThan, bool_ty, &[col, col_max]));
            let ok = self.emit(instruction_value(Op::LogicalAnd, bool_ty, &[low, high]));
            cond = Some(match cond {
                Some(c) => self.emit(instruction_value(Op::LogicalAnd, bool_ty, &[c, ok])),
                None => ok,
            });
        }
        Ok(cond)
    }

    /// Fetches element `(r, c)` of a distributed matrix; both coordinates
    /// are compile-time constants, so the source lane is uniform.
    fn coop_element_uniform(
        &mut self,
        components: &[Handle<SpvInst>],
        layout: &CoopLayout,
        kind: ScalarKind,
        r: i64,
        c: i64,
    ) -> Handle<SpvInst> {
        let sgs = self.core_cfg.subgroup_size as i64;
        let cif = layout.col_inc(sgs);
        let lane = (r % layout.rows) + (c % cif) * layout.rows;
        let component = (c / cif) + (r / layout.rows) * layout.per_block();
        let elem_ty = self.scalar_ty(kind);
        let scope = self.i32_constant(spirv::Scope::Subgroup as i32);
        let lane_id = self.i32_constant(lane as i32);
        self.emit(instruction_group_broadcast(
            elem_ty,
            scope,
            components[component as usize],
            lane_id,
        ))
    }

    /// `r = a * b + c` with B components gathered by uniform broadcasts.
    ///
    /// When every lane owns a full matrix row (`rows == sgs`), A and C stay
    /// lane-local. Smaller matrices compute every element redundantly on
    /// all lanes and select the slots each lane owns.
    fn generic_mul_add(&mut self, fun: &Function, inst: &Inst) -> Result<(), CompileError> {
        let span = inst.span;
        let sgs = self.core_cfg.subgroup_size as i64;
        let a_kind = self.coop_kind_of(fun, inst.operands[0], span)?;
        let b_kind = self.coop_kind_of(fun, inst.operands[1], span)?;
        let c_kind = self.coop_kind_of(fun, inst.operands[2], span)?;
        let r_kind = self.coop_kind_of(fun, inst.results[0], span)?;
        let al = self.coop_layout_of(fun, inst.operands[0]);
        let bl = self.coop_layout_of(fun, inst.operands[1]);
        let cl = self.coop_layout_of(fun, inst.operands[2]);
        let rl = self.coop_layout_of(fun, inst.results[0]);
        let k_total = al.shape1;

        let a = self.multi_val(inst.operands[0], span)?;
        let b = self.multi_val(inst.operands[1], span)?;
        let c = self.multi_val(inst.operands[2], span)?;

        let mut out = Vec::with_capacity(rl.length as usize);
        if rl.rows == sgs {
            // Lane-local rows: per-lane fused multiply-adds over broadcast
            // B columns.
            for m_block in 0..rl.blocks {
                for n in 0..rl.per_block() {
                    let mut acc = c[(n + m_block * cl.per_block()) as usize];
                    for k in 0..k_total {
                        let a_mk = a[(k + m_block * al.per_block()) as usize];
                        let b_kn = self.coop_element_uniform(&b, &bl, b_kind, k, n);
                        acc = self.make_fma_mixed(c_kind, a_kind, a_mk, b_kind, b_kn, acc, span)?;
                    }
                    let result = self.make_cast(r_kind, c_kind, acc, span)?;
                    out.push(result);
                }
            }
        } else {
            let (row0, col0) = self.lane_coords(&rl)?;
            let bool_ty = self.bool_ty();
            let cif = rl.col_inc(sgs);
            let m_rows = rl.rows * rl.blocks;
            let elem_ty = self.scalar_ty(r_kind);
            let null = self.null_constant(elem_ty);
            out = vec![null; rl.length as usize];
            for m in 0..m_rows {
                for n in 0..rl.shape1 {
                    let mut acc = self.coop_element_uniform(&c, &cl, c_kind, m, n);
                    for k in 0..k_total {
                        let a_mk = self.coop_element_uniform(&a, &al, a_kind, m, k);
                        let b_kn = self.coop_element_uniform(&b, &bl, b_kind, k, n);
                        acc = self.make_fma_mixed(c_kind, a_kind, a_mk, b_kind, b_kn, acc, span)?;
                    }
                    let value = self.make_cast(r_kind, c_kind, acc, span)?;

                    let row_c = self.index_constant(m % rl.rows);
                    let col_c = self.index_constant(n % cif);
                    let row_ok =
                        self.emit(instruction_value(Op::IEqual, bool_ty, &[row0, row_c]));
                    let col_ok =
                        self.emit(instruction_value(Op::IEqual, bool_ty, &[col0, col_c]));
                    let owned =
                        self.emit(instruction_value(Op::LogicalAnd, bool_ty, &[row_ok, col_ok]));
                    let slot = ((n / cif) + (m / rl.rows) * rl.per_block()) as usize;
                    let prev = out[slot];
                    let mut select = SpvInst::new(Op::Select);
                    select.set_type(elem_ty);
                    select.set_result();
                    select.add_ref(owned);
                    select.add_ref(value);
                    select.add_ref(prev);
                    out[slot] = self.emit(select);
                }
            }
        }
        self.multi_declare(inst.results[0], out);
        Ok(())
    }

    pub fn coop_scale(&mut self, fun: &Function, inst: &Inst) -> Result<(), CompileError> {
        let span = inst.span;
        let kind = self.coop_kind_of(fun, inst.operands[1], span)?;
        let layout = self.coop_layout_of(fun, inst.operands[1]);
        let scalar = self.val(fun, inst.operands[0], span)?;
        let components = self.multi_val(inst.operands[1], span)?;
        let mut out = Vec::with_capacity(layout.length as usize);
        for i in 0..layout.length as usize {
            out.push(self.make_binary_op(kind, BinaryOp::Mul, scalar, components[i], span)?);
        }
        self.multi_declare(inst.results[0], out);
        Ok(())
    }

    /// Column reduction; every row total is computed once per subgroup via
    /// uniform broadcasts and then routed to the lanes holding it.
    pub fn coop_reduce(
        &mut self,
        fun: &Function,
        inst: &Inst,
        op: ReduceOp,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let kind = self.coop_kind_of(fun, inst.operands[0], span)?;
        let al = self.coop_layout_of(fun, inst.operands[0]);
        let rl = self.coop_layout_of(fun, inst.results[0]);
        let components = self.multi_val(inst.operands[0], span)?;

        let binary = match op {
            ReduceOp::Add => BinaryOp::Add,
            ReduceOp::Min => BinaryOp::Min,
            ReduceOp::Max => BinaryOp::Max,
        };

        let (row0, _col0) = self.lane_coords(&rl)?;
        let bool_ty = self.bool_ty();
        let elem_ty = self.scalar_ty(kind);
        let null = self.null_constant(elem_ty);
        let mut out = vec![null; rl.length as usize];

        let total_rows = al.rows * al.blocks;
        for m in 0..total_rows {
            let mut acc = self.coop_element_uniform(&components, &al, kind, m, 0);
            for c in 1..al.shape1 {
                let next = self.coop_element_uniform(&components, &al, kind, m, c);
                acc = self.make_binary_op(kind, binary, acc, next, span)?;
            }
            // Every lane group holds a copy of its row's slot.
            let slot = (m / rl.rows) as usize * rl.per_block() as usize;
            let row_c = self.index_constant(m % rl.rows);
            let owned = self.emit(instruction_value(Op::IEqual, bool_ty, &[row0, row_c]));
            for extra in 0..rl.per_block() as usize {
                let prev = out[slot + extra];
                let mut select = SpvInst::new(Op::Select);
                select.set_type(elem_ty);
                select.set_result();
                select.add_ref(owned);
                select.add_ref(acc);
                select.add_ref(prev);
                out[slot + extra] = self.emit(select);
            }
        }
        self.multi_declare(inst.results[0], out);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subgroup block I/O policy
    // ------------------------------------------------------------------

    /// Strict preconditions: global memory, unit inner stride, 4-byte
    /// aligned start, full-subgroup rows, no transpose, no bounds checks.
    fn block_io_applicable(
        &mut self,
        fun: &Function,
        memref: Handle<Value>,
        pos0: Handle<Value>,
        transpose: bool,
        checked: CheckedFlag,
    ) -> bool {
        if transpose || checked != CheckedFlag::None || !self.core_cfg.block_io {
            return false;
        }
        let (element, stride) = match *self.ty_of_pub(fun, memref) {
            Type::Memref {
                element,
                ref stride,
                space: crate::AddressSpace::Global,
                ..
            } => (element, stride.clone()),
            _ => return false,
        };
        if stride.is_empty() || stride[0] != 1 {
            return false;
        }
        let element_size = element.size(self.program.index_width);
        // The lane-0 element must sit on a 4-byte boundary.
        match self.known_int(pos0) {
            Some(p) if (p * element_size) % 4 == 0 => {}
            _ => return false,
        }
        match stride.get(1) {
            Some(&s) if !crate::is_dynamic(s) && (s * element_size) % 4 == 0 => {}
            _ => return false,
        }
        true
    }

    fn block_int_kind(element: ScalarKind, index_width: u8) -> ScalarKind {
        match element.size(index_width) {
            1 => ScalarKind::I8,
            2 => ScalarKind::I16,
            8 => ScalarKind::I64,
            _ => ScalarKind::I32,
        }
    }

    fn block_coop_load(&mut self, fun: &Function, inst: &Inst) -> Result<(), CompileError> {
        let span = inst.span;
        let result = inst.results[0];
        let memref = inst.operands[0];
        let layout = self.coop_layout_of(fun, result);
        let component = self.coop_kind_of(fun, result, span)?;
        let int_kind = Self::block_int_kind(component, self.program.index_width);
        let int_ty = self.scalar_ty(int_kind);
        let elem_ty = self.scalar_ty(component);
        let index_ty = self.scalar_ty(ScalarKind::Index);
        let spv_pointer_ty = self.spv_ty(fun.values[memref].ty)?;
        let int_ptr_ty = self.pointer_ty(
            StorageClass::CrossWorkgroup,
            int_ty,
            component.alignment(self.program.index_width) as u32,
        );

        let frame =
            self.transfer_frame(fun, memref, inst.operands[1], inst.operands[2], false, span)?;
        let base = self.val(fun, memref, span)?;

        let mut components = Vec::with_capacity(layout.length as usize);
        for block in 0..layout.blocks {
            for col_no in 0..layout.per_block() {
                let row_off = self.index_constant(block * layout.rows);
                let row = self.emit(instruction_value(
                    Op::IAdd,
                    index_ty,
                    &[frame.row_pos, row_off],
                ));
                let col_off = self.index_constant(col_no);
                let col = self.emit(instruction_value(
                    Op::IAdd,
                    index_ty,
                    &[frame.col_pos, col_off],
                ));
                let col_lin = self.emit(instruction_value(
                    Op::IMul,
                    index_ty,
                    &[col, frame.col_stride],
                ));
                let offset = self.emit(instruction_value(Op::IAdd, index_ty, &[row, col_lin]));
                let pointer = self.emit(instruction_in_bounds_ptr_access_chain(
                    spv_pointer_ty,
                    base,
                    offset,
                ));
                let pointer = self.emit(instruction_value(Op::Bitcast, int_ptr_ty, &[pointer]));
                let mut read = SpvInst::new(Op::SubgroupBlockReadINTEL);
                read.set_type(int_ty);
                read.set_result();
                read.add_ref(pointer);
                let word = self.emit(read);
                let value = if int_ty == elem_ty {
                    word
                } else {
                    self.emit(instruction_value(Op::Bitcast, elem_ty, &[word]))
                };
                components.push(value);
            }
        }
        self.multi_declare(result, components);
        Ok(())
    }

    fn block_coop_store(&mut self, fun: &Function, inst: &Inst) -> Result<(), CompileError> {
        let span = inst.span;
        let value = inst.operands[0];
        let memref = inst.operands[1];
        let layout = self.coop_layout_of(fun, value);
        let component = self.coop_kind_of(fun, value, span)?;
        let int_kind = Self::block_int_kind(component, self.program.index_width);
        let int_ty = self.scalar_ty(int_kind);
        let elem_ty = self.scalar_ty(component);
        let index_ty = self.scalar_ty(ScalarKind::Index);
        let spv_pointer_ty = self.spv_ty(fun.values[memref].ty)?;
        let int_ptr_ty = self.pointer_ty(
            StorageClass::CrossWorkgroup,
            int_ty,
            component.alignment(self.program.index_width) as u32,
        );

        let frame =
            self.transfer_frame(fun, memref, inst.operands[2], inst.operands[3], false, span)?;
        let base = self.val(fun, memref, span)?;
        let components = self.multi_val(value, span)?;

        for block in 0..layout.blocks {
            for col_no in 0..layout.per_block() {
                let row_off = self.index_constant(block * layout.rows);
                let row = self.emit(instruction_value(
                    Op::IAdd,
                    index_ty,
                    &[frame.row_pos, row_off],
                ));
                let col_off = self.index_constant(col_no);
                let col = self.emit(instruction_value(
                    Op::IAdd,
                    index_ty,
                    &[frame.col_pos, col_off],
                ));
                let col_lin = self.emit(instruction_value(
                    Op::IMul,
                    index_ty,
                    &[col, frame.col_stride],
                ));
                let offset = self.emit(instruction_value(Op::IAdd, index_ty, &[row, col_lin]));
                let pointer = self.emit(instruction_in_bounds_ptr_access_chain(
                    spv_pointer_ty,
                    base,
                    offset,
                ));
                let pointer = self.emit(instruction_value(Op::Bitcast, int_ptr_ty, &[pointer]));
                let component_no = (col_no + block * layout.per_block()) as usize;
                let stored = components[component_no];
                let stored = if int_ty == elem_ty {
                    stored
                } else {
                    self.emit(instruction_value(Op::Bitcast, int_ty, &[stored]))
                };
                let mut write = SpvInst::new(Op::SubgroupBlockWriteINTEL);
                write.add_ref(pointer);
                write.add_ref(stored);
                self.emit(write);
            }
        }
        Ok(())
    }

    pub(super) fn ty_of_pub(&self, fun: &Function, value: Handle<Value>) -> &'a Type {
        &self.program.types[fun.values[value].ty]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_law() {
        // rows * cols * blocks == R * C and length * sgs == R * C.
        for &(r, c, sgs) in &[
            (8i64, 8i64, 16i64),
            (16, 8, 16),
            (8, 16, 16),
            (16, 16, 16),
            (32, 16, 16),
            (64, 32, 16),
            (16, 8, 32),
            (32, 32, 32),
        ] {
            let l = coop_layout(r, c, sgs);
            assert_eq!(l.rows * l.cols * l.blocks, r * c, "shape {}x{}", r, c);
            assert_eq!(l.length * sgs, r * c, "shape {}x{}", r, c);
            assert_eq!(l.blocks * l.rows, r);
        }
    }

    #[test]
    fn layout_pads_narrow_matrices() {
        // A 16x3 matrix at sgs 16 pads its columns to a full lane set.
        let l = coop_layout(16, 3, 16);
        assert_eq!(l.rows, 16);
        assert_eq!(l.cols, 3);
        assert_eq!(l.length, 3);
        assert_eq!(l.shape1, 3);

        let l = coop_layout(8, 3, 16);
        assert_eq!(l.rows, 8);
        assert_eq!(l.cols, 4);
        assert_eq!(l.length, 2);
        assert_eq!(l.col_inc(16), 2);
    }
}
