//! DPAS + 2D-block-I/O cooperative-matrix policy.
//!
//! Loads, stores and prefetches become single-call inline-assembly helpers
//! emitting Xe `raw_sends` block-2D descriptors; `mul_add` emits a sequence
//! of `dpas.<precA>.<precB>.8.8` instructions over a precomputed GRF
//! layout. The assembly declarations are memoized per configuration, so a
//! kernel touching the same tile shape twice shares one `OpAsmINTEL`.

use std::fmt::Write as _;

use spirv::{Op, Word};

use crate::back::spv::block2d::{self, xe, BlockConfig};
use crate::back::spv::{instructions::*, Inst as SpvInst, Section};
use crate::error::{CompileError, ErrorCode};
use crate::{CheckedFlag, Function, Handle, Inst, MatrixUse, ScalarKind, Type, Value};

use super::writer::Writer;

const LOAD_CONSTRAINTS: &str = "=rw,rw.u,rw.u,rw.u,rw.u,rw.u,rw.u";
const STORE_CONSTRAINTS: &str = "rw,rw,rw.u,rw.u,rw.u,rw.u,rw.u";
const PREFETCH_CONSTRAINTS: &str = "rw.u,rw.u,rw.u,rw.u,rw.u,rw.u";
const MUL_ADD_CONSTRAINTS: &str = "=rw,rw,rw,rw";

/// Memoization key of an inline-assembly declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(super) enum AsmKey {
    Load {
        cfg: BlockConfig,
        operand_ty: Handle<SpvInst>,
    },
    Store {
        cfg: BlockConfig,
        operand_ty: Handle<SpvInst>,
    },
    Prefetch {
        cfg: BlockConfig,
        operand_ty: Handle<SpvInst>,
    },
    MulAdd {
        a: ScalarKind,
        b: ScalarKind,
        c: ScalarKind,
        r: ScalarKind,
        m: i64,
        n: i64,
        k: i64,
    },
}

/// SPIR-V vectors only come in a handful of lengths; anything else keeps
/// the multi-value representation and the generic policy.
fn vector_length_ok(length: i64) -> bool {
    matches!(length, 2 | 3 | 4 | 8 | 16)
}

impl<'a> Writer<'a> {
    /// Device, alignment and shape preconditions shared by the block-2D
    /// transfers.
    pub(super) fn dpas_transfer_applicable(
        &self,
        fun: &Function,
        memref: Handle<Value>,
        pos0: Handle<Value>,
        _transpose: bool,
        checked: CheckedFlag,
    ) -> bool {
        let matrix = match self.device.matrix {
            Some(ref matrix) => matrix,
            None => return false,
        };
        if self.core_cfg.subgroup_size != matrix.subgroup_size {
            return false;
        }
        if checked != CheckedFlag::None {
            return false;
        }
        let (element, shape, stride) = match *self.ty_of_pub(fun, memref) {
            Type::Memref {
                element,
                ref shape,
                ref stride,
                space: crate::AddressSpace::Global,
            } => (element, shape.clone(), stride.clone()),
            _ => return false,
        };
        if shape.len() != 2 || stride[0] != 1 {
            return false;
        }
        let element_size = element.size(self.program.index_width);
        match self.known_int(pos0) {
            Some(p) if (p * element_size) % matrix.pos_alignment as i64 == 0 => {}
            _ => return false,
        }
        match stride[1] {
            s if !crate::is_dynamic(s)
                && (s * element_size) % matrix.stride_alignment as i64 == 0 => {}
            _ => return false,
        }
        true
    }

    pub(super) fn dpas_vector_ok(&self, fun: &Function, value: Handle<Value>) -> bool {
        vector_length_ok(self.coop_layout_of(fun, value).length)
    }

    pub(super) fn dpas_mul_add_applicable(&self, fun: &Function, inst: &Inst) -> bool {
        let matrix = match self.device.matrix {
            Some(ref matrix) => matrix,
            None => return false,
        };
        if self.core_cfg.subgroup_size != matrix.subgroup_size {
            return false;
        }
        let kinds: Vec<ScalarKind> = inst
            .operands
            .iter()
            .chain(inst.results.iter())
            .map(|&v| match self.ty_of_pub(fun, v) {
                Type::Coopmatrix { component, .. } => *component,
                _ => ScalarKind::I8,
            })
            .collect();
        let (m, n, k) = match (
            self.ty_of_pub(fun, inst.results[0]),
            self.ty_of_pub(fun, inst.operands[0]),
        ) {
            (
                &Type::Coopmatrix { rows, cols, .. },
                &Type::Coopmatrix { cols: a_cols, .. },
            ) => (rows, cols, a_cols),
            _ => return false,
        };
        let supported = matrix.shapes.iter().any(|shape| {
            shape.a == kinds[0]
                && shape.b == kinds[1]
                && shape.c == kinds[2]
                && shape.result == kinds[3]
                && m % shape.m == 0
                && n % shape.n == 0
                && k % shape.k == 0
        });
        supported
            && inst
                .operands
                .iter()
                .chain(inst.results.iter())
                .all(|&v| self.dpas_vector_ok(fun, v))
    }

    /// Region geometry for a block-2D transfer of one matrix.
    fn dpas_block_config(
        &self,
        component: ScalarKind,
        rows: i64,
        cols: i64,
        use_: MatrixUse,
        transpose: bool,
        cache_level: i32,
    ) -> Option<BlockConfig> {
        let element_size = component.size(self.program.index_width) as i32;
        let vnni = use_ == MatrixUse::B && element_size < 4;
        let max_rows = match use_ {
            MatrixUse::B => (xe::CHANNEL_SIZE / element_size) * xe::SDEPTH,
            _ => xe::EXEC_SIZE,
        };
        let max_cols = match use_ {
            MatrixUse::Acc => 8,
            _ => 32,
        };
        let rows = rows as i32;
        let cols = cols as i32;
        let rows_in_block = rows.min(max_rows);
        let cols_in_block = cols.min(max_cols);
        if rows % rows_in_block != 0 || cols % cols_in_block != 0 {
            return None;
        }
        Some(BlockConfig {
            sty: component,
            element_size,
            array_length: 1,
            rows: rows_in_block,
            cols: cols_in_block,
            row_blocks: rows / rows_in_block,
            col_blocks: cols / cols_in_block,
            transpose,
            vnni,
            cache_level,
        })
    }

    /// i32-typed argument list `(width, height, pitch, pos0, pos1)` for the
    /// fixed descriptor header, all in bytes where the hardware expects
    /// bytes.
    fn dpas_descriptor_args(
        &mut self,
        fun: &Function,
        memref: Handle<Value>,
        pos0: Handle<Value>,
        pos1: Handle<Value>,
        element_size: i64,
        span: crate::Span,
    ) -> Result<[Handle<SpvInst>; 5], CompileError> {
        let dv = self.dope_of(memref, span)?.clone();
        let index_ty = self.scalar_ty(ScalarKind::Index);
        let size_c = self.index_constant(element_size);

        let width_b = self.emit(instruction_value(Op::IMul, index_ty, &[dv.shape[0], size_c]));
        let width = self.make_cast(ScalarKind::I32, ScalarKind::Index, width_b, span)?;
        let height = {
            let h = dv.shape[1];
            self.make_cast(ScalarKind::I32, ScalarKind::Index, h, span)?
        };
        let pitch_b = self.emit(instruction_value(Op::IMul, index_ty, &[dv.stride[1], size_c]));
        let pitch = self.make_cast(ScalarKind::I32, ScalarKind::Index, pitch_b, span)?;

        let p0_kind = self.scalar_kind_of(fun, pos0, span)?;
        let p0 = self.val(fun, pos0, span)?;
        let p0 = self.make_cast(ScalarKind::Index, p0_kind, p0, span)?;
        let p0_b = self.emit(instruction_value(Op::IMul, index_ty, &[p0, size_c]));
        let p0 = self.make_cast(ScalarKind::I32, ScalarKind::Index, p0_b, span)?;

        let p1_kind = self.scalar_kind_of(fun, pos1, span)?;
        let p1 = self.val(fun, pos1, span)?;
        let p1 = self.make_cast(ScalarKind::I32, p1_kind, p1, span)?;

        Ok([width, height, pitch, p0, p1])
    }

    fn coop_vector_ty(
        &mut self,
        component: ScalarKind,
        length: i64,
    ) -> Handle<SpvInst> {
        let elem_ty = self.scalar_ty(component);
        self.vector_ty(elem_ty, length as u32)
    }

    pub(super) fn dpas_coop_load(
        &mut self,
        fun: &Function,
        inst: &Inst,
        transpose: bool,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let result = inst.results[0];
        let (component, rows, cols, use_) = match *self.ty_of_pub(fun, result) {
            Type::Coopmatrix {
                component,
                rows,
                cols,
                use_,
            } => (component, rows, cols, use_),
            _ => return Err(CompileError::new(span, ErrorCode::ExpectedCoopmatrix)),
        };
        let cfg = match self.dpas_block_config(component, rows, cols, use_, transpose, -1) {
            Some(cfg) => cfg,
            None => return self.coop_load_generic_fallback(fun, inst, transpose),
        };
        let layout = self.coop_layout_of(fun, result);
        let operand_ty = self.spv_ty(fun.values[inst.operands[0]].ty)?;
        let vec_ty = self.coop_vector_ty(component, layout.length);
        let elem_ty = self.scalar_ty(component);

        let asm = self.asm_declaration(AsmKey::Load { cfg, operand_ty }, |w, key| {
            let cfg = match key {
                AsmKey::Load { cfg, .. } => cfg,
                _ => unreachable!(),
            };
            let code = block2d::load_block2d_native(&cfg, &mut w.tmp);
            let i32_ty = w.scalar_ty(ScalarKind::I32);
            let fun_ty = w.asm_function_ty(
                vec_ty,
                &[operand_ty, i32_ty, i32_ty, i32_ty, i32_ty, i32_ty],
            );
            let target = w.asm_target();
            (
                instruction_asm(vec_ty, fun_ty, target, &code, LOAD_CONSTRAINTS),
                false,
            )
        });

        let base = self.val(fun, inst.operands[0], span)?;
        let element_size = component.size(self.program.index_width);
        let args = self.dpas_descriptor_args(
            fun,
            inst.operands[0],
            inst.operands[1],
            inst.operands[2],
            element_size,
            span,
        )?;
        let call = self.emit(instruction_asm_call(
            vec_ty,
            asm,
            &[base, args[0], args[1], args[2], args[3], args[4]],
        ));

        let mut components = Vec::with_capacity(layout.length as usize);
        for i in 0..layout.length as usize {
            components.push(self.emit(instruction_composite_extract(
                elem_ty,
                call,
                &[i as Word],
            )));
        }
        self.multi_declare(result, components);
        Ok(())
    }

    fn coop_load_generic_fallback(
        &mut self,
        fun: &Function,
        inst: &Inst,
        transpose: bool,
    ) -> Result<(), CompileError> {
        // Geometry the block unit cannot cover; take the scalar walk.
        self.generic_coop_load(fun, inst, transpose, CheckedFlag::None)
    }

    pub(super) fn dpas_coop_store(
        &mut self,
        fun: &Function,
        inst: &Inst,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let value = inst.operands[0];
        let (component, rows, cols) = match *self.ty_of_pub(fun, value) {
            Type::Coopmatrix {
                component,
                rows,
                cols,
                ..
            } => (component, rows, cols),
            _ => return Err(CompileError::new(span, ErrorCode::ExpectedCoopmatrix)),
        };
        let cfg = match self.dpas_block_config(component, rows, cols, MatrixUse::Acc, false, -1)
        {
            Some(cfg) => cfg,
            None => {
                return self.generic_coop_store(
                    fun,
                    inst,
                    crate::StoreFlag::Regular,
                    CheckedFlag::None,
                )
            }
        };
        let layout = self.coop_layout_of(fun, value);
        let operand_ty = self.spv_ty(fun.values[inst.operands[1]].ty)?;
        let vec_ty = self.coop_vector_ty(component, layout.length);
        let void_ty = self.void_ty();

        let asm = self.asm_declaration(AsmKey::Store { cfg, operand_ty }, |w, key| {
            let cfg = match key {
                AsmKey::Store { cfg, .. } => cfg,
                _ => unreachable!(),
            };
            let code = block2d::store_block2d_native(&cfg, &mut w.tmp);
            let i32_ty = w.scalar_ty(ScalarKind::I32);
            let fun_ty = w.asm_function_ty(
                void_ty,
                &[vec_ty, operand_ty, i32_ty, i32_ty, i32_ty, i32_ty, i32_ty],
            );
            let target = w.asm_target();
            (
                instruction_asm(void_ty, fun_ty, target, &code, STORE_CONSTRAINTS),
                true,
            )
        });

        let components = self.multi_val(value, span)?;
        let packed = self.emit(instruction_composite_construct(vec_ty, &components));
        let base = self.val(fun, inst.operands[1], span)?;
        let element_size = component.size(self.program.index_width);
        let args = self.dpas_descriptor_args(
            fun,
            inst.operands[1],
            inst.operands[2],
            inst.operands[3],
            element_size,
            span,
        )?;
        self.emit(instruction_asm_call(
            void_ty,
            asm,
            &[packed, base, args[0], args[1], args[2], args[3], args[4]],
        ));
        Ok(())
    }

    pub(super) fn dpas_coop_prefetch(
        &mut self,
        fun: &Function,
        inst: &Inst,
        cache_level: i32,
        rows: i64,
        cols: i64,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let element = match *self.ty_of_pub(fun, inst.operands[0]) {
            Type::Memref { element, .. } => element,
            _ => return Err(CompileError::new(span, ErrorCode::ExpectedMemref)),
        };
        let cfg = match self.dpas_block_config(
            element,
            rows,
            cols,
            MatrixUse::Acc,
            false,
            cache_level,
        ) {
            Some(cfg) => cfg,
            None => return Ok(()),
        };
        let operand_ty = self.spv_ty(fun.values[inst.operands[0]].ty)?;
        let void_ty = self.void_ty();

        let asm = self.asm_declaration(AsmKey::Prefetch { cfg, operand_ty }, |w, key| {
            let cfg = match key {
                AsmKey::Prefetch { cfg, .. } => cfg,
                _ => unreachable!(),
            };
            let code = block2d::prefetch_block2d_native(&cfg, &mut w.tmp);
            let i32_ty = w.scalar_ty(ScalarKind::I32);
            let fun_ty = w.asm_function_ty(
                void_ty,
                &[operand_ty, i32_ty, i32_ty, i32_ty, i32_ty, i32_ty],
            );
            let target = w.asm_target();
            (
                instruction_asm(void_ty, fun_ty, target, &code, PREFETCH_CONSTRAINTS),
                false,
            )
        });

        let base = self.val(fun, inst.operands[0], span)?;
        let element_size = element.size(self.program.index_width);
        let args = self.dpas_descriptor_args(
            fun,
            inst.operands[0],
            inst.operands[1],
            inst.operands[2],
            element_size,
            span,
        )?;
        self.emit(instruction_asm_call(
            void_ty,
            asm,
            &[base, args[0], args[1], args[2], args[3], args[4]],
        ));
        Ok(())
    }

    pub(super) fn dpas_coop_mul_add(
        &mut self,
        fun: &Function,
        inst: &Inst,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let a_kind = self.coop_kind_of(fun, inst.operands[0], span)?;
        let b_kind = self.coop_kind_of(fun, inst.operands[1], span)?;
        let c_kind = self.coop_kind_of(fun, inst.operands[2], span)?;
        let r_kind = self.coop_kind_of(fun, inst.results[0], span)?;
        let (m, n, k) = match (
            self.ty_of_pub(fun, inst.results[0]),
            self.ty_of_pub(fun, inst.operands[0]),
        ) {
            (
                &Type::Coopmatrix { rows, cols, .. },
                &Type::Coopmatrix { cols: a_cols, .. },
            ) => (rows, cols, a_cols),
            _ => return Err(CompileError::new(span, ErrorCode::ExpectedCoopmatrix)),
        };

        let al = self.coop_layout_of(fun, inst.operands[0]);
        let bl = self.coop_layout_of(fun, inst.operands[1]);
        let cl = self.coop_layout_of(fun, inst.operands[2]);
        let rl = self.coop_layout_of(fun, inst.results[0]);
        let vec_a = self.coop_vector_ty(a_kind, al.length);
        let vec_b = self.coop_vector_ty(b_kind, bl.length);
        let vec_c = self.coop_vector_ty(c_kind, cl.length);
        let vec_r = self.coop_vector_ty(r_kind, rl.length);
        let elem_r = self.scalar_ty(r_kind);

        let index_width = self.program.index_width;
        let key = AsmKey::MulAdd {
            a: a_kind,
            b: b_kind,
            c: c_kind,
            r: r_kind,
            m,
            n,
            k,
        };
        let asm = self.asm_declaration(key, |w, _key| {
            let code = mul_add_code(a_kind, b_kind, c_kind, r_kind, m, n, k, index_width, &mut w.tmp);
            let fun_ty = w.asm_function_ty(vec_r, &[vec_a, vec_b, vec_c]);
            let target = w.asm_target();
            (
                instruction_asm(vec_r, fun_ty, target, &code, MUL_ADD_CONSTRAINTS),
                false,
            )
        });

        let a = self.multi_val(inst.operands[0], span)?;
        let b = self.multi_val(inst.operands[1], span)?;
        let c = self.multi_val(inst.operands[2], span)?;
        let a = self.emit(instruction_composite_construct(vec_a, &a));
        let b = self.emit(instruction_composite_construct(vec_b, &b));
        let c = self.emit(instruction_composite_construct(vec_c, &c));
        let call = self.emit(instruction_asm_call(vec_r, asm, &[a, b, c]));

        let mut components = Vec::with_capacity(rl.length as usize);
        for i in 0..rl.length as usize {
            components.push(self.emit(instruction_composite_extract(
                elem_r,
                call,
                &[i as Word],
            )));
        }
        self.multi_declare(inst.results[0], components);
        Ok(())
    }

    /// Looks up or creates an assembly declaration; `build` returns the
    /// instruction and whether it has side effects.
    fn asm_declaration(
        &mut self,
        key: AsmKey,
        build: impl FnOnce(&mut Self, AsmKey) -> (SpvInst, bool),
    ) -> Handle<SpvInst> {
        if let Some(&asm) = self.lookup_asm.get(&key) {
            return asm;
        }
        let (inst, side_effects) = build(self, key);
        let asm = self.module.add(Section::TypeConstVar, inst);
        if side_effects {
            self.module.add(
                Section::Decoration,
                instruction_decorate(asm, spirv::Decoration::SideEffectsINTEL, &[]),
            );
        }
        self.lookup_asm.insert(key, asm);
        asm
    }
}

/// The DPAS instruction sequence over the GRF block layout
/// `A[m,k,bk,bm]`, `B[k,n,bn,bk]`, `C[m,n,bn,bm]`.
#[allow(clippy::too_many_arguments)]
fn mul_add_code(
    a_kind: ScalarKind,
    b_kind: ScalarKind,
    c_kind: ScalarKind,
    r_kind: ScalarKind,
    m_total: i64,
    n_total: i64,
    k_total: i64,
    index_width: u8,
    tmp: &mut block2d::TempCounter,
) -> String {
    let a_size = a_kind.size(index_width) as i64;
    let b_size = b_kind.size(index_width) as i64;
    let c_size = c_kind.size(index_width) as i64;
    let r_size = r_kind.size(index_width) as i64;
    let ops_per_chan = xe::CHANNEL_SIZE as i64 / a_size;
    let k_dpas = ops_per_chan * xe::SDEPTH as i64;

    let mut oasm = String::from("{\n");
    let temp = if r_kind != c_kind && k_total / k_dpas > 1 {
        let temp = tmp.make("temp");
        let _ = write!(
            oasm,
            ".decl {} v_type=G type={} num_elts={} align=wordx32\n",
            temp,
            block2d::visa_type(c_kind),
            m_total * n_total,
        );
        temp
    } else {
        String::from("$0")
    };
    let mat_a = tmp.make("matrix_A");
    let mat_b = tmp.make("matrix_B");
    let _ = write!(
        oasm,
        ".decl {} v_type=G type=d num_elts={} align=wordx32 alias=<$1,0>\n",
        mat_a,
        m_total * k_total / ops_per_chan,
    );
    let _ = write!(
        oasm,
        ".decl {} v_type=G type=d num_elts={} align=wordx32 alias=<$2,0>\n",
        mat_b,
        k_total * n_total / ops_per_chan,
    );

    let precision_src1 = block2d::dpas_precision(a_kind);
    let precision_src2 = block2d::dpas_precision(b_kind);
    let exec = xe::EXEC_SIZE as i64;
    let rcount = xe::RCOUNT as i64;

    let mut k = 0;
    while k < k_total {
        let src0 = if k > 0 { temp.as_str() } else { "$3" };
        let last = k + k_dpas >= k_total;
        let dst = if last { "$0" } else { temp.as_str() };
        let rsize = if last { r_size } else { c_size };
        let mut m = 0;
        while m < m_total {
            let mut n = 0;
            while n < n_total {
                let aoffset = (k * exec + m * k_total) * a_size;
                let brow = (k * n_total + n * k_dpas) * b_size / xe::GRF_SIZE as i64;
                let coffset = (m * n_total + n * exec) * c_size;
                let roffset = (m * n_total + n * exec) * rsize;
                let _ = write!(
                    oasm,
                    "dpas.{p1}.{p2}.{sdepth}.{rcount} (M1,{exec}) {dst}.{roffset} {src0}.{coffset} {mat_a}.{aoffset} {mat_b}({brow},0)\n",
                    p1 = precision_src1,
                    p2 = precision_src2,
                    sdepth = xe::SDEPTH,
                    rcount = xe::RCOUNT,
                    exec = exec,
                    dst = dst,
                    roffset = roffset,
                    src0 = src0,
                    coffset = coffset,
                    mat_a = mat_a,
                    aoffset = aoffset,
                    mat_b = mat_b,
                    brow = brow,
                );
                n += rcount;
            }
            m += exec;
        }
        k += k_dpas;
    }
    oasm.push_str("}\n");
    oasm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_add_code_single_tile() {
        let mut tmp = block2d::TempCounter::new();
        let code = mul_add_code(
            ScalarKind::BF16,
            ScalarKind::BF16,
            ScalarKind::F32,
            ScalarKind::F32,
            8,
            8,
            16,
            8,
            &mut tmp,
        );
        // One K step, one M step, one N step: a single DPAS.
        assert_eq!(code.matches("dpas.bf.bf.8.8").count(), 1);
        // First and only step reads the accumulator argument and writes
        // the result argument.
        assert!(code.contains("$0.0 $3.0"));
        assert!(code.contains("alias=<$1,0>"));
    }

    #[test]
    fn mul_add_code_tiles_k() {
        let mut tmp = block2d::TempCounter::new();
        let code = mul_add_code(
            ScalarKind::F16,
            ScalarKind::F16,
            ScalarKind::F32,
            ScalarKind::F32,
            16,
            16,
            32,
            8,
            &mut tmp,
        );
        // K = 32 needs two systolic passes of two N tiles each.
        assert_eq!(code.matches("dpas.hf.hf.8.8").count(), 4);
    }

    #[test]
    fn vector_lengths() {
        assert!(vector_length_ok(8));
        assert!(vector_length_ok(4));
        assert!(!vector_length_ok(5));
        assert!(!vector_length_ok(32));
    }
}
