//! The instruction converter: walks verified IR and emits SPIR-V.

use spirv::{Op, StorageClass, Word};

use crate::back::spv::{instructions::*, Inst as SpvInst, Module, Section};
use crate::device::{CoreConfig, DeviceInfo};
use crate::error::{CompileError, ErrorCode, Span};
use crate::{
    AddressSpace, BinaryOp, CompareOp, ConstantValue, FastHashMap, FastHashSet, Function,
    GroupOp, Handle, Inst, KernelMetadata, Operation, Program, Region, ScalarKind, StoreFlag,
    Type, UnaryOp, Value,
};

/// OpenCL.std extended instruction numbers used by the lowering.
pub(super) mod opencl {
    pub const FABS: u32 = 23;
    pub const FMA: u32 = 26;
    pub const FMAX: u32 = 27;
    pub const FMIN: u32 = 28;
    pub const SQRT: u32 = 61;
    pub const S_ABS: u32 = 141;
    pub const S_MAX: u32 = 156;
    pub const S_MIN: u32 = 158;
}

/// Runtime shape/stride/offset metadata of a memref or group value.
///
/// Static entries hold interned constants; dynamic entries hold the SPIR-V
/// parameter or computed value supplying them at kernel launch.
#[derive(Clone, Debug)]
pub(super) struct DopeVector {
    /// SPIR-V type of one dynamic shape/stride entry.
    pub entry_ty: Handle<SpvInst>,
    pub static_shape: Vec<i64>,
    pub static_stride: Vec<i64>,
    pub shape: Vec<Handle<SpvInst>>,
    pub stride: Vec<Handle<SpvInst>>,
    pub offset_ty: Option<Handle<SpvInst>>,
    pub static_offset: i64,
    pub offset: Option<Handle<SpvInst>>,
}

impl DopeVector {
    pub fn dim(&self) -> usize {
        self.static_shape.len()
    }

    pub fn num_dynamic(&self) -> usize {
        self.static_shape
            .iter()
            .chain(&self.static_stride)
            .filter(|&&v| crate::is_dynamic(v))
            .count()
    }
}

pub(super) struct Writer<'a> {
    pub program: &'a Program,
    pub device: &'a DeviceInfo,
    pub module: Module,

    // Uniquifier state (see unique.rs).
    pub lookup_scalar: FastHashMap<ScalarKind, Handle<SpvInst>>,
    pub lookup_void: Option<Handle<SpvInst>>,
    pub lookup_bool: Option<Handle<SpvInst>>,
    pub lookup_vector: FastHashMap<(Handle<SpvInst>, u32), Handle<SpvInst>>,
    pub lookup_pointer: FastHashMap<(StorageClass, Handle<SpvInst>, u32), Handle<SpvInst>>,
    pub lookup_array: FastHashMap<(Handle<SpvInst>, Handle<SpvInst>), Handle<SpvInst>>,
    pub lookup_function_type: FastHashMap<Vec<Handle<SpvInst>>, Handle<SpvInst>>,
    pub lookup_constant: FastHashMap<(ScalarKind, u64), Handle<SpvInst>>,
    pub lookup_composite: FastHashMap<(Handle<SpvInst>, u64, u64), Handle<SpvInst>>,
    pub lookup_null: FastHashMap<Handle<SpvInst>, Handle<SpvInst>>,
    pub lookup_builtin: FastHashMap<spirv::BuiltIn, Handle<SpvInst>>,
    pub bool_true: Option<Handle<SpvInst>>,
    pub bool_false: Option<Handle<SpvInst>>,
    pub opencl_ext: Option<Handle<SpvInst>>,
    pub asm_target: Option<Handle<SpvInst>>,
    pub capabilities: FastHashSet<spirv::Capability>,
    pub extensions: FastHashSet<&'static str>,
    pub lookup_asm: FastHashMap<super::dpas::AsmKey, Handle<SpvInst>>,
    pub tmp: super::block2d::TempCounter,

    // Per-function state.
    pub core_cfg: CoreConfig,
    pub vals: FastHashMap<Handle<Value>, Handle<SpvInst>>,
    pub multi_vals: FastHashMap<Handle<Value>, Vec<Handle<SpvInst>>>,
    pub dope: FastHashMap<Handle<Value>, DopeVector>,
    pub known_ints: FastHashMap<Handle<Value>, i64>,
    pub yielded: Vec<Vec<Option<Handle<SpvInst>>>>,
    pub builtins_used: Vec<Handle<SpvInst>>,
    pub stack_var: Option<Handle<SpvInst>>,
}

impl<'a> Writer<'a> {
    pub fn new(program: &'a Program, device: &'a DeviceInfo) -> Self {
        Writer {
            program,
            device,
            module: Module::new(),
            lookup_scalar: Default::default(),
            lookup_void: None,
            lookup_bool: None,
            lookup_vector: Default::default(),
            lookup_pointer: Default::default(),
            lookup_array: Default::default(),
            lookup_function_type: Default::default(),
            lookup_constant: Default::default(),
            lookup_composite: Default::default(),
            lookup_null: Default::default(),
            lookup_builtin: Default::default(),
            bool_true: None,
            bool_false: None,
            opencl_ext: None,
            asm_target: None,
            capabilities: Default::default(),
            extensions: Default::default(),
            lookup_asm: Default::default(),
            tmp: super::block2d::TempCounter::new(),
            core_cfg: CoreConfig {
                subgroup_size: 0,
                max_work_group_size: 0,
                register_space: 0,
                block_io: false,
            },
            vals: Default::default(),
            multi_vals: Default::default(),
            dope: Default::default(),
            known_ints: Default::default(),
            yielded: Vec::new(),
            builtins_used: Vec::new(),
            stack_var: None,
        }
    }

    pub fn finish(self) -> Module {
        self.module
    }

    /// Appends an instruction to the function section.
    pub fn emit(&mut self, inst: SpvInst) -> Handle<SpvInst> {
        self.module.add(Section::Function, inst)
    }

    pub fn emit_to(&mut self, section: Section, inst: SpvInst) -> Handle<SpvInst> {
        self.module.add(section, inst)
    }

    fn ty_of(&self, fun: &Function, value: Handle<Value>) -> &'a Type {
        &self.program.types[fun.values[value].ty]
    }

    pub fn val(
        &self,
        _fun: &Function,
        value: Handle<Value>,
        span: Span,
    ) -> Result<Handle<SpvInst>, CompileError> {
        self.vals
            .get(&value)
            .copied()
            .ok_or_else(|| CompileError::new(span, ErrorCode::SpirvUndefinedValue))
    }

    pub fn declare(&mut self, value: Handle<Value>, inst: Handle<SpvInst>) {
        self.vals.insert(value, inst);
    }

    pub fn multi_val(
        &self,
        value: Handle<Value>,
        span: Span,
    ) -> Result<Vec<Handle<SpvInst>>, CompileError> {
        self.multi_vals
            .get(&value)
            .cloned()
            .ok_or_else(|| CompileError::new(span, ErrorCode::SpirvUndefinedValue))
    }

    pub fn multi_declare(&mut self, value: Handle<Value>, insts: Vec<Handle<SpvInst>>) {
        self.multi_vals.insert(value, insts);
    }

    pub fn dope_of(&self, value: Handle<Value>, span: Span) -> Result<&DopeVector, CompileError> {
        self.dope
            .get(&value)
            .ok_or_else(|| CompileError::new(span, ErrorCode::SpirvMissingDopeVector))
    }

    /// The last label appended to the function section, i.e. the block
    /// currently receiving instructions.
    pub fn get_last_label(&self) -> Option<Handle<SpvInst>> {
        self.module
            .section(Section::Function)
            .iter()
            .rev()
            .copied()
            .find(|&h| self.module.get(h).op == Op::Label)
    }

    pub fn scalar_kind_of(
        &self,
        fun: &Function,
        value: Handle<Value>,
        span: Span,
    ) -> Result<ScalarKind, CompileError> {
        match *self.ty_of(fun, value) {
            Type::Scalar(kind) => Ok(kind),
            _ => Err(CompileError::new(span, ErrorCode::ExpectedScalar)),
        }
    }

    pub fn coop_kind_of(
        &self,
        fun: &Function,
        value: Handle<Value>,
        span: Span,
    ) -> Result<ScalarKind, CompileError> {
        match *self.ty_of(fun, value) {
            Type::Coopmatrix { component, .. } => Ok(component),
            _ => Err(CompileError::new(span, ErrorCode::ExpectedCoopmatrix)),
        }
    }

    /// Compile-time integer knowledge, used by lowering policy checks.
    pub fn known_int(&self, value: Handle<Value>) -> Option<i64> {
        self.known_ints.get(&value).copied()
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    pub fn write(&mut self) -> Result<FastHashMap<String, KernelMetadata>, CompileError> {
        self.capability(spirv::Capability::Addresses);
        self.capability(spirv::Capability::Kernel);
        self.capability(spirv::Capability::SubgroupDispatch);
        self.emit_to(
            Section::MemoryModel,
            instruction_memory_model(spirv::AddressingModel::Physical64, spirv::MemoryModel::OpenCL),
        );

        let mut metadata = FastHashMap::default();
        let program = self.program;
        for fun in &program.functions {
            self.core_cfg = self.device.core_config(fun.subgroup_size)?;
            self.vals.clear();
            self.multi_vals.clear();
            self.dope.clear();
            self.known_ints.clear();
            self.yielded.clear();
            self.builtins_used.clear();
            self.stack_var = None;

            self.collect_known_ints(fun, &fun.body);
            self.write_function(fun)?;

            metadata.insert(
                fun.name.clone(),
                KernelMetadata {
                    subgroup_size: fun.subgroup_size,
                    work_group_size: fun.work_group_size,
                },
            );
        }
        Ok(metadata)
    }

    fn collect_known_ints(&mut self, fun: &Function, region: &Region) {
        for &handle in &region.body {
            let inst = &fun.insts[handle];
            if let Operation::Constant(ConstantValue::Int(v)) = inst.op {
                self.known_ints.insert(inst.results[0], v);
            }
            for nested in &inst.regions {
                self.collect_known_ints(fun, nested);
            }
        }
    }

    fn write_function(&mut self, fun: &Function) -> Result<(), CompileError> {
        let program = self.program;

        // Function type: one SPIR-V parameter per IR parameter plus one per
        // dynamic dope entry.
        let mut param_tys = Vec::with_capacity(fun.params.len());
        for &param in &fun.params {
            let ty = fun.values[param].ty;
            param_tys.push(self.spv_ty(ty)?);
            if let Some(dv) = self.make_dope_vector(ty)? {
                for _ in 0..dv.num_dynamic() {
                    param_tys.push(dv.entry_ty);
                }
                if crate::is_dynamic(dv.static_offset) {
                    if let Some(offset_ty) = dv.offset_ty {
                        param_tys.push(offset_ty);
                    }
                }
                self.dope.insert(param, dv);
            }
        }
        let fun_ty = self.function_ty(&param_tys)?;

        let void_ty = self.void_ty();
        let fun_inst = self.emit(instruction_function(
            void_ty,
            spirv::FunctionControl::NONE,
            fun_ty,
        ));

        for &param in &fun.params {
            let ty = fun.values[param].ty;
            let spv_param_ty = self.spv_ty(ty)?;
            let inst = self.emit(instruction_function_parameter(spv_param_ty));
            self.declare(param, inst);
            if let Some(mut dv) = self.dope.remove(&param) {
                for i in 0..dv.dim() {
                    let entry = self.dope_param(dv.entry_ty, dv.static_shape[i])?;
                    dv.shape.push(entry);
                }
                for i in 0..dv.dim() {
                    let entry = self.dope_param(dv.entry_ty, dv.static_stride[i])?;
                    dv.stride.push(entry);
                }
                if let Some(offset_ty) = dv.offset_ty {
                    dv.offset = Some(self.dope_param(offset_ty, dv.static_offset)?);
                }
                self.dope.insert(param, dv);
            }
        }

        self.emit(instruction_label());

        if fun.stack_high_water > 0 {
            self.stack_var = Some(self.make_stack_var(fun.stack_high_water)?);
        }

        let body = &fun.body;
        self.write_region(fun, body)?;

        self.emit(instruction_return());
        self.emit(instruction_function_end());

        let interface = std::mem::take(&mut self.builtins_used);
        self.emit_to(
            Section::EntryPoint,
            instruction_entry_point(spirv::ExecutionModel::Kernel, fun_inst, &fun.name, &interface),
        );
        self.emit_to(
            Section::ExecutionMode,
            instruction_execution_mode(
                fun_inst,
                spirv::ExecutionMode::LocalSize,
                &[
                    fun.work_group_size[0] as Word,
                    fun.work_group_size[1] as Word,
                    1,
                ],
            ),
        );
        self.emit_to(
            Section::ExecutionMode,
            instruction_execution_mode(
                fun_inst,
                spirv::ExecutionMode::SubgroupSize,
                &[fun.subgroup_size as Word],
            ),
        );
        Ok(())
    }

    /// A dynamic dope entry becomes a kernel parameter; a static one is a
    /// constant.
    fn dope_param(
        &mut self,
        entry_ty: Handle<SpvInst>,
        value: i64,
    ) -> Result<Handle<SpvInst>, CompileError> {
        if crate::is_dynamic(value) {
            Ok(self.emit(instruction_function_parameter(entry_ty)))
        } else {
            Ok(self.index_constant(value))
        }
    }

    fn make_stack_var(&mut self, size: i64) -> Result<Handle<SpvInst>, CompileError> {
        let i8_ty = self.scalar_ty(ScalarKind::I8);
        let len = self.index_constant(size);
        let array_ty = match self.lookup_array.get(&(i8_ty, len)) {
            Some(&ty) => ty,
            None => {
                let ty = self.emit_to(Section::TypeConstVar, instruction_type_array(i8_ty, len));
                self.lookup_array.insert((i8_ty, len), ty);
                ty
            }
        };
        let ptr_ty = self.pointer_ty(StorageClass::Workgroup, array_ty, 8);
        let var = self.emit_to(
            Section::TypeConstVar,
            instruction_variable(ptr_ty, StorageClass::Workgroup),
        );
        Ok(var)
    }

    pub fn write_region(&mut self, fun: &Function, region: &Region) -> Result<(), CompileError> {
        for &handle in &region.body {
            self.write_inst(fun, handle)?;
        }
        Ok(())
    }

    pub fn write_region_with_yield(
        &mut self,
        fun: &Function,
        region: &Region,
        num_results: usize,
    ) -> Result<Vec<Handle<SpvInst>>, CompileError> {
        self.yielded.push(vec![None; num_results]);
        self.write_region(fun, region)?;
        let top = self.yielded.pop().unwrap_or_default();
        let mut out = Vec::with_capacity(num_results);
        for slot in top {
            match slot {
                Some(inst) => out.push(inst),
                None => {
                    return Err(CompileError::new(
                        Span::default(),
                        ErrorCode::YieldMismatch,
                    ))
                }
            }
        }
        Ok(out)
    }

    /// Number of SPIR-V values the given IR values lower to; cooperative
    /// matrices expand to one id per component.
    pub fn num_yielded_vals(
        &self,
        fun: &Function,
        values: &[Handle<Value>],
    ) -> usize {
        values
            .iter()
            .map(|&v| match *self.ty_of(fun, v) {
                Type::Coopmatrix { .. } => self.coop_layout_of(fun, v).length as usize,
                _ => 1,
            })
            .sum()
    }

    // ------------------------------------------------------------------
    // Instruction dispatch
    // ------------------------------------------------------------------

    fn write_inst(&mut self, fun: &Function, handle: Handle<Inst>) -> Result<(), CompileError> {
        let inst = &fun.insts[handle];
        let span = inst.span;
        match inst.op {
            Operation::Binary(op) => self.lower_binary(fun, inst, op),
            Operation::Unary(op) => self.lower_unary(fun, inst, op),
            Operation::Cast => self.lower_cast(fun, inst),
            Operation::Compare(op) => self.lower_compare(fun, inst, op),
            Operation::Constant(value) => self.lower_constant(fun, inst, value),
            Operation::Alloca { offset } => self.lower_alloca(fun, inst, offset),
            Operation::Load => self.lower_load(fun, inst),
            Operation::Store(flag) => self.lower_store(fun, inst, flag),
            Operation::Size { dim } => {
                let dv = self.dope_of(inst.operands[0], span)?;
                let entry = dv.shape[dim as usize];
                self.declare(inst.results[0], entry);
                Ok(())
            }
            Operation::Subview {
                ref static_offsets,
                ref static_sizes,
            } => self.lower_subview(fun, inst, static_offsets, static_sizes),
            Operation::Expand {
                mode,
                ref static_factors,
            } => self.lower_expand(fun, inst, mode, static_factors),
            Operation::Fuse { from, to } => self.lower_fuse(fun, inst, from, to),
            Operation::For { has_step } => self.lower_for(fun, inst, has_step),
            Operation::If => self.lower_if(fun, inst),
            Operation::Parallel => self.write_region(fun, &inst.regions[0]),
            Operation::Yield => self.lower_yield(fun, inst),
            Operation::Barrier(fences) => self.lower_barrier(fences),
            Operation::LifetimeStop => Ok(()),
            Operation::GroupId => {
                self.lower_builtin_component(fun, inst, spirv::BuiltIn::GlobalInvocationId)
            }
            Operation::GroupSize => {
                self.lower_builtin_component(fun, inst, spirv::BuiltIn::GlobalSize)
            }
            Operation::NumSubgroups => {
                self.lower_builtin_scalar(fun, inst, spirv::BuiltIn::NumSubgroups)
            }
            Operation::SubgroupId => {
                self.lower_builtin_scalar(fun, inst, spirv::BuiltIn::SubgroupId)
            }
            Operation::SubgroupLocalId => {
                self.lower_builtin_scalar(fun, inst, spirv::BuiltIn::SubgroupLocalInvocationId)
            }
            Operation::SubgroupSize => {
                self.lower_builtin_scalar(fun, inst, spirv::BuiltIn::SubgroupSize)
            }
            Operation::WorkGroup(op) => self.lower_work_group(fun, inst, op),
            Operation::CoopLoad { transpose, checked } => {
                self.coop_load(fun, inst, transpose, checked)
            }
            Operation::CoopStore { flag, checked } => self.coop_store(fun, inst, flag, checked),
            Operation::CoopMulAdd => self.coop_mul_add(fun, inst),
            Operation::CoopScale => self.coop_scale(fun, inst),
            Operation::CoopPrefetch {
                cache_level,
                rows,
                cols,
            } => self.coop_prefetch(fun, inst, cache_level, rows, cols),
            Operation::CoopReduce(op) => self.coop_reduce(fun, inst, op),
        }
    }

    // ------------------------------------------------------------------
    // Scalar arithmetic
    // ------------------------------------------------------------------

    fn lower_binary(
        &mut self,
        fun: &Function,
        inst: &Inst,
        op: BinaryOp,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        match *self.ty_of(fun, inst.results[0]) {
            Type::Bool => {
                let a = self.val(fun, inst.operands[0], span)?;
                let b = self.val(fun, inst.operands[1], span)?;
                let r = self.make_bool_binary(op, a, b, span)?;
                self.declare(inst.results[0], r);
                Ok(())
            }
            Type::Scalar(kind) => {
                let a = self.val(fun, inst.operands[0], span)?;
                let b = self.val(fun, inst.operands[1], span)?;
                let r = self.make_binary_op(kind, op, a, b, span)?;
                self.declare(inst.results[0], r);
                Ok(())
            }
            Type::Coopmatrix { component, .. } => {
                let layout = self.coop_layout_of(fun, inst.results[0]);
                let a = self.multi_val(inst.operands[0], span)?;
                let b = self.multi_val(inst.operands[1], span)?;
                let mut out = Vec::with_capacity(layout.length as usize);
                for i in 0..layout.length as usize {
                    out.push(self.make_binary_op(component, op, a[i], b[i], span)?);
                }
                self.multi_declare(inst.results[0], out);
                Ok(())
            }
            _ => Err(CompileError::new(span, ErrorCode::ExpectedCoopmatrixOrScalar)),
        }
    }

    fn lower_unary(
        &mut self,
        fun: &Function,
        inst: &Inst,
        op: UnaryOp,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        match *self.ty_of(fun, inst.operands[0]) {
            Type::Bool => {
                let a = self.val(fun, inst.operands[0], span)?;
                let bool_ty = self.bool_ty();
                let r = match op {
                    UnaryOp::Not => self.emit(instruction_value(Op::LogicalNot, bool_ty, &[a])),
                    _ => return Err(CompileError::new(span, ErrorCode::BooleanUnsupported)),
                };
                self.declare(inst.results[0], r);
                Ok(())
            }
            Type::Scalar(kind) => {
                let a = self.val(fun, inst.operands[0], span)?;
                let r = self.make_unary_op(kind, op, a, span)?;
                self.declare(inst.results[0], r);
                Ok(())
            }
            Type::Coopmatrix { component, .. } => {
                let layout = self.coop_layout_of(fun, inst.operands[0]);
                let a = self.multi_val(inst.operands[0], span)?;
                let mut out = Vec::with_capacity(layout.length as usize);
                for i in 0..layout.length as usize {
                    out.push(self.make_unary_op(component, op, a[i], span)?);
                }
                self.multi_declare(inst.results[0], out);
                Ok(())
            }
            _ => Err(CompileError::new(span, ErrorCode::ExpectedCoopmatrixOrScalar)),
        }
    }

    fn lower_cast(&mut self, fun: &Function, inst: &Inst) -> Result<(), CompileError> {
        let span = inst.span;
        match *self.ty_of(fun, inst.results[0]) {
            Type::Scalar(to) => {
                let from = self.scalar_kind_of(fun, inst.operands[0], span)?;
                let a = self.val(fun, inst.operands[0], span)?;
                let r = self.make_cast(to, from, a, span)?;
                self.declare(inst.results[0], r);
                Ok(())
            }
            Type::Coopmatrix { component, .. } => {
                let from = self.coop_kind_of(fun, inst.operands[0], span)?;
                let layout = self.coop_layout_of(fun, inst.results[0]);
                let a = self.multi_val(inst.operands[0], span)?;
                let mut out = Vec::with_capacity(layout.length as usize);
                for i in 0..layout.length as usize {
                    out.push(self.make_cast(component, from, a[i], span)?);
                }
                self.multi_declare(inst.results[0], out);
                Ok(())
            }
            _ => Err(CompileError::new(span, ErrorCode::ExpectedCoopmatrixOrScalar)),
        }
    }

    fn lower_compare(
        &mut self,
        fun: &Function,
        inst: &Inst,
        op: CompareOp,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let kind = self.scalar_kind_of(fun, inst.operands[0], span)?;
        let a = self.val(fun, inst.operands[0], span)?;
        let b = self.val(fun, inst.operands[1], span)?;
        let r = self.make_compare(kind, op, a, b, span)?;
        self.declare(inst.results[0], r);
        Ok(())
    }

    fn lower_constant(
        &mut self,
        fun: &Function,
        inst: &Inst,
        value: ConstantValue,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        match *self.ty_of(fun, inst.results[0]) {
            Type::Bool => {
                let b = match value {
                    ConstantValue::Bool(b) => b,
                    _ => return Err(CompileError::new(span, ErrorCode::InternalCompilerError)),
                };
                let c = self.bool_constant(b);
                self.declare(inst.results[0], c);
                Ok(())
            }
            Type::Scalar(kind) => {
                let c = self
                    .make_constant(kind, value)
                    .ok_or_else(|| CompileError::new(span, ErrorCode::InternalCompilerError))?;
                self.declare(inst.results[0], c);
                Ok(())
            }
            Type::Coopmatrix { component, .. } => {
                let layout = self.coop_layout_of(fun, inst.results[0]);
                let c = self
                    .make_constant(component, value)
                    .ok_or_else(|| CompileError::new(span, ErrorCode::InternalCompilerError))?;
                self.multi_declare(inst.results[0], vec![c; layout.length as usize]);
                Ok(())
            }
            _ => Err(CompileError::new(span, ErrorCode::ExpectedCoopmatrixOrScalar)),
        }
    }

    pub fn make_bool_binary(
        &mut self,
        op: BinaryOp,
        a: Handle<SpvInst>,
        b: Handle<SpvInst>,
        span: Span,
    ) -> Result<Handle<SpvInst>, CompileError> {
        let bool_ty = self.bool_ty();
        let spv_op = match op {
            BinaryOp::And => Op::LogicalAnd,
            BinaryOp::Or => Op::LogicalOr,
            BinaryOp::Xor => Op::LogicalNotEqual,
            _ => return Err(CompileError::new(span, ErrorCode::BooleanUnsupported)),
        };
        Ok(self.emit(instruction_value(spv_op, bool_ty, &[a, b])))
    }

    pub fn make_binary_op(
        &mut self,
        kind: ScalarKind,
        op: BinaryOp,
        a: Handle<SpvInst>,
        b: Handle<SpvInst>,
        span: Span,
    ) -> Result<Handle<SpvInst>, CompileError> {
        if kind == ScalarKind::BF16 {
            // bf16 arithmetic round-trips through f32.
            let a32 = self.bf16_to_f32(a);
            let b32 = self.bf16_to_f32(b);
            let r32 = self.make_binary_op(ScalarKind::F32, op, a32, b32, span)?;
            return Ok(self.f32_to_bf16(r32));
        }
        let ty = self.scalar_ty(kind);
        if kind.is_integer() {
            let spv_op = match op {
                BinaryOp::Add => Op::IAdd,
                BinaryOp::Sub => Op::ISub,
                BinaryOp::Mul => Op::IMul,
                BinaryOp::Div => Op::SDiv,
                BinaryOp::Rem => Op::SRem,
                BinaryOp::Shl => Op::ShiftLeftLogical,
                BinaryOp::Shr => Op::ShiftRightArithmetic,
                BinaryOp::And => Op::BitwiseAnd,
                BinaryOp::Or => Op::BitwiseOr,
                BinaryOp::Xor => Op::BitwiseXor,
                BinaryOp::Min => return self.ext_inst(ty, opencl::S_MIN, &[a, b]),
                BinaryOp::Max => return self.ext_inst(ty, opencl::S_MAX, &[a, b]),
            };
            Ok(self.emit(instruction_value(spv_op, ty, &[a, b])))
        } else if kind.is_float() {
            let spv_op = match op {
                BinaryOp::Add => Op::FAdd,
                BinaryOp::Sub => Op::FSub,
                BinaryOp::Mul => Op::FMul,
                BinaryOp::Div => Op::FDiv,
                BinaryOp::Rem => Op::FRem,
                BinaryOp::Min => return self.ext_inst(ty, opencl::FMIN, &[a, b]),
                BinaryOp::Max => return self.ext_inst(ty, opencl::FMAX, &[a, b]),
                _ => return Err(CompileError::new(span, ErrorCode::FpUnsupported)),
            };
            Ok(self.emit(instruction_value(spv_op, ty, &[a, b])))
        } else {
            match op {
                BinaryOp::Add => Ok(self.emit(instruction_value(Op::FAdd, ty, &[a, b]))),
                BinaryOp::Sub => Ok(self.emit(instruction_value(Op::FSub, ty, &[a, b]))),
                BinaryOp::Mul => Ok(self.make_complex_mul(kind, a, b, false)),
                BinaryOp::Div => Ok(self.make_complex_div(kind, a, b)),
                _ => Err(CompileError::new(span, ErrorCode::ComplexUnsupported)),
            }
        }
    }

    /// Promotes both operands to the result kind before combining them.
    pub fn make_binary_op_mixed(
        &mut self,
        result_kind: ScalarKind,
        op: BinaryOp,
        a_kind: ScalarKind,
        a: Handle<SpvInst>,
        b_kind: ScalarKind,
        b: Handle<SpvInst>,
        span: Span,
    ) -> Result<Handle<SpvInst>, CompileError> {
        let a = self.make_cast(result_kind, a_kind, a, span)?;
        let b = self.make_cast(result_kind, b_kind, b, span)?;
        self.make_binary_op(result_kind, op, a, b, span)
    }

    /// Fused a * b + c with promotion towards the accumulator kind.
    pub fn make_fma_mixed(
        &mut self,
        result_kind: ScalarKind,
        a_kind: ScalarKind,
        a: Handle<SpvInst>,
        b_kind: ScalarKind,
        b: Handle<SpvInst>,
        c: Handle<SpvInst>,
        span: Span,
    ) -> Result<Handle<SpvInst>, CompileError> {
        let a = self.make_cast(result_kind, a_kind, a, span)?;
        let b = self.make_cast(result_kind, b_kind, b, span)?;
        if result_kind.is_float() && result_kind != ScalarKind::BF16 {
            let ty = self.scalar_ty(result_kind);
            return self.ext_inst(ty, opencl::FMA, &[a, b, c]);
        }
        let ab = self.make_binary_op(result_kind, BinaryOp::Mul, a, b, span)?;
        self.make_binary_op(result_kind, BinaryOp::Add, ab, c, span)
    }

    pub fn make_unary_op(
        &mut self,
        kind: ScalarKind,
        op: UnaryOp,
        a: Handle<SpvInst>,
        span: Span,
    ) -> Result<Handle<SpvInst>, CompileError> {
        if kind == ScalarKind::BF16 {
            let a32 = self.bf16_to_f32(a);
            let r32 = self.make_unary_op(ScalarKind::F32, op, a32, span)?;
            return Ok(self.f32_to_bf16(r32));
        }
        let ty = self.scalar_ty(kind);
        if kind.is_integer() {
            match op {
                UnaryOp::Abs => self.ext_inst(ty, opencl::S_ABS, &[a]),
                UnaryOp::Neg => Ok(self.emit(instruction_value(Op::SNegate, ty, &[a]))),
                UnaryOp::Not => Ok(self.emit(instruction_value(Op::Not, ty, &[a]))),
                _ => Err(CompileError::new(span, ErrorCode::ComplexUnsupported)),
            }
        } else if kind.is_float() {
            match op {
                UnaryOp::Abs => self.ext_inst(ty, opencl::FABS, &[a]),
                UnaryOp::Neg => Ok(self.emit(instruction_value(Op::FNegate, ty, &[a]))),
                _ => Err(CompileError::new(span, ErrorCode::FpUnsupported)),
            }
        } else {
            let float_ty = self.scalar_ty(kind.element_kind());
            match op {
                UnaryOp::Abs => {
                    // |a| = sqrt(re^2 + im^2), fused over the two lanes.
                    let a2 = self.emit(instruction_value(Op::FMul, ty, &[a, a]));
                    let re = self.emit(instruction_composite_extract(float_ty, a2, &[0]));
                    let im = self.emit(instruction_composite_extract(float_ty, a2, &[1]));
                    let sum = self.emit(instruction_value(Op::FAdd, float_ty, &[re, im]));
                    self.ext_inst(float_ty, opencl::SQRT, &[sum])
                }
                UnaryOp::Neg => Ok(self.emit(instruction_value(Op::FNegate, ty, &[a]))),
                UnaryOp::Conj => {
                    let im = self.emit(instruction_composite_extract(float_ty, a, &[1]));
                    let neg = self.emit(instruction_value(Op::FNegate, float_ty, &[im]));
                    Ok(self.emit(instruction_composite_insert(ty, neg, a, &[1])))
                }
                UnaryOp::Im => Ok(self.emit(instruction_composite_extract(float_ty, a, &[1]))),
                UnaryOp::Re => Ok(self.emit(instruction_composite_extract(float_ty, a, &[0]))),
                UnaryOp::Not => Err(CompileError::new(span, ErrorCode::ComplexUnsupported)),
            }
        }
    }

    /// (a.re b.re - a.im b.im, a.re b.im + a.im b.re); the conjugate variant
    /// negates b.im.
    pub fn make_complex_mul(
        &mut self,
        kind: ScalarKind,
        a: Handle<SpvInst>,
        b: Handle<SpvInst>,
        conj_b: bool,
    ) -> Handle<SpvInst> {
        let ty = self.scalar_ty(kind);
        let float_ty = self.scalar_ty(kind.element_kind());
        let a_re = self.emit(instruction_composite_extract(float_ty, a, &[0]));
        let a_im = self.emit(instruction_composite_extract(float_ty, a, &[1]));
        let b_re = self.emit(instruction_composite_extract(float_ty, b, &[0]));
        let mut b_im = self.emit(instruction_composite_extract(float_ty, b, &[1]));
        if conj_b {
            b_im = self.emit(instruction_value(Op::FNegate, float_ty, &[b_im]));
        }
        let rr = self.emit(instruction_value(Op::FMul, float_ty, &[a_re, b_re]));
        let ii = self.emit(instruction_value(Op::FMul, float_ty, &[a_im, b_im]));
        let re = self.emit(instruction_value(Op::FSub, float_ty, &[rr, ii]));
        let ri = self.emit(instruction_value(Op::FMul, float_ty, &[a_re, b_im]));
        let ir = self.emit(instruction_value(Op::FMul, float_ty, &[a_im, b_re]));
        let im = self.emit(instruction_value(Op::FAdd, float_ty, &[ri, ir]));
        let null = self.null_constant(ty);
        let tmp = self.emit(instruction_composite_insert(ty, re, null, &[0]));
        self.emit(instruction_composite_insert(ty, im, tmp, &[1]))
    }

    /// a / b = a * conj(b) / |b|^2.
    fn make_complex_div(
        &mut self,
        kind: ScalarKind,
        a: Handle<SpvInst>,
        b: Handle<SpvInst>,
    ) -> Handle<SpvInst> {
        let ty = self.scalar_ty(kind);
        let float_ty = self.scalar_ty(kind.element_kind());
        let num = self.make_complex_mul(kind, a, b, true);
        let b2 = self.emit(instruction_value(Op::FMul, ty, &[b, b]));
        let b2_re = self.emit(instruction_composite_extract(float_ty, b2, &[0]));
        let b2_im = self.emit(instruction_composite_extract(float_ty, b2, &[1]));
        let denom = self.emit(instruction_value(Op::FAdd, float_ty, &[b2_re, b2_im]));
        let null = self.null_constant(ty);
        let tmp = self.emit(instruction_composite_insert(ty, denom, null, &[0]));
        let denom2 = self.emit(instruction_composite_insert(ty, denom, tmp, &[1]));
        self.emit(instruction_value(Op::FDiv, ty, &[num, denom2]))
    }

    pub fn make_compare(
        &mut self,
        kind: ScalarKind,
        op: CompareOp,
        a: Handle<SpvInst>,
        b: Handle<SpvInst>,
        span: Span,
    ) -> Result<Handle<SpvInst>, CompileError> {
        if kind == ScalarKind::BF16 {
            let a32 = self.bf16_to_f32(a);
            let b32 = self.bf16_to_f32(b);
            return self.make_compare(ScalarKind::F32, op, a32, b32, span);
        }
        let bool_ty = self.bool_ty();
        if kind.is_integer() {
            let spv_op = match op {
                CompareOp::Eq => Op::IEqual,
                CompareOp::Ne => Op::INotEqual,
                CompareOp::Lt => Op::SLessThan,
                CompareOp::Le => Op::SLessThanEqual,
                CompareOp::Gt => Op::SGreaterThan,
                CompareOp::Ge => Op::SGreaterThanEqual,
            };
            Ok(self.emit(instruction_value(spv_op, bool_ty, &[a, b])))
        } else if kind.is_float() {
            let spv_op = match op {
                CompareOp::Eq => Op::FOrdEqual,
                CompareOp::Ne => Op::FUnordNotEqual,
                CompareOp::Lt => Op::FOrdLessThan,
                CompareOp::Le => Op::FOrdLessThanEqual,
                CompareOp::Gt => Op::FOrdGreaterThan,
                CompareOp::Ge => Op::FOrdGreaterThanEqual,
            };
            Ok(self.emit(instruction_value(spv_op, bool_ty, &[a, b])))
        } else {
            let bool2_ty = self.bool2_ty();
            match op {
                CompareOp::Eq => {
                    let lanes = self.emit(instruction_value(Op::FOrdEqual, bool2_ty, &[a, b]));
                    Ok(self.emit(instruction_value(Op::All, bool_ty, &[lanes])))
                }
                CompareOp::Ne => {
                    let lanes =
                        self.emit(instruction_value(Op::FUnordNotEqual, bool2_ty, &[a, b]));
                    Ok(self.emit(instruction_value(Op::All, bool_ty, &[lanes])))
                }
                _ => Err(CompileError::new(span, ErrorCode::ComplexUnsupported)),
            }
        }
    }

    pub fn make_cast(
        &mut self,
        to: ScalarKind,
        from: ScalarKind,
        a: Handle<SpvInst>,
        span: Span,
    ) -> Result<Handle<SpvInst>, CompileError> {
        // `index` and its width-equivalent integer share one SPIR-V type,
        // so converting between them is a plain copy.
        let same = to == from
            || (to.is_integer() && from.is_integer() && self.canonical(to) == self.canonical(from));
        if same {
            let ty = self.scalar_ty(to);
            return Ok(self.emit(instruction_value(Op::CopyObject, ty, &[a])));
        }
        // bf16 has no native arithmetic type; detour through f32.
        if from == ScalarKind::BF16 {
            let a32 = self.bf16_to_f32(a);
            if to == ScalarKind::F32 {
                return Ok(a32);
            }
            return self.make_cast(to, ScalarKind::F32, a32, span);
        }
        if to == ScalarKind::BF16 {
            let a32 = if from == ScalarKind::F32 {
                a
            } else {
                self.make_cast(ScalarKind::F32, from, a, span)?
            };
            return Ok(self.f32_to_bf16(a32));
        }
        let spv_to_ty = self.scalar_ty(to);
        if from.is_integer() {
            if to.is_integer() {
                Ok(self.emit(instruction_value(Op::SConvert, spv_to_ty, &[a])))
            } else if to.is_float() {
                Ok(self.emit(instruction_value(Op::ConvertSToF, spv_to_ty, &[a])))
            } else {
                let float_ty = self.scalar_ty(to.element_kind());
                let re = self.emit(instruction_value(Op::ConvertSToF, float_ty, &[a]));
                let null = self.null_constant(spv_to_ty);
                Ok(self.emit(instruction_composite_insert(spv_to_ty, re, null, &[0])))
            }
        } else if from.is_float() {
            if to.is_integer() {
                Ok(self.emit(instruction_value(Op::ConvertFToS, spv_to_ty, &[a])))
            } else if to.is_float() {
                Ok(self.emit(instruction_value(Op::FConvert, spv_to_ty, &[a])))
            } else {
                let float_ty = self.scalar_ty(to.element_kind());
                let re = if from == to.element_kind() {
                    a
                } else {
                    self.emit(instruction_value(Op::FConvert, float_ty, &[a]))
                };
                let null = self.null_constant(spv_to_ty);
                Ok(self.emit(instruction_composite_insert(spv_to_ty, re, null, &[0])))
            }
        } else if to.is_complex() {
            Ok(self.emit(instruction_value(Op::FConvert, spv_to_ty, &[a])))
        } else {
            Err(CompileError::new(span, ErrorCode::ForbiddenCast))
        }
    }

    pub fn bf16_to_f32(&mut self, a: Handle<SpvInst>) -> Handle<SpvInst> {
        let f32_ty = self.scalar_ty(ScalarKind::F32);
        self.emit(instruction_value(Op::ConvertBF16ToFINTEL, f32_ty, &[a]))
    }

    pub fn f32_to_bf16(&mut self, a: Handle<SpvInst>) -> Handle<SpvInst> {
        let bf16_ty = self.scalar_ty(ScalarKind::BF16);
        self.emit(instruction_value(Op::ConvertFToBF16INTEL, bf16_ty, &[a]))
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    /// Dope vector skeleton for a memref- or group-typed value.
    pub fn make_dope_vector(
        &mut self,
        ty: Handle<Type>,
    ) -> Result<Option<DopeVector>, CompileError> {
        let index_ty = self.scalar_ty(ScalarKind::Index);
        match self.program.types[ty] {
            Type::Memref {
                ref shape,
                ref stride,
                ..
            } => Ok(Some(DopeVector {
                entry_ty: index_ty,
                static_shape: shape.clone(),
                static_stride: stride.clone(),
                shape: Vec::new(),
                stride: Vec::new(),
                offset_ty: None,
                static_offset: 0,
                offset: None,
            })),
            Type::Group { element, offset } => match self.program.types[element] {
                Type::Memref {
                    ref shape,
                    ref stride,
                    ..
                } => {
                    let static_shape = shape.clone();
                    let static_stride = stride.clone();
                    let entry_ty = self.pointer_ty(StorageClass::CrossWorkgroup, index_ty, 8);
                    Ok(Some(DopeVector {
                        entry_ty,
                        static_shape,
                        static_stride,
                        shape: Vec::new(),
                        stride: Vec::new(),
                        offset_ty: Some(index_ty),
                        static_offset: offset,
                        offset: None,
                    }))
                }
                _ => Err(CompileError::new(
                    Span::default(),
                    ErrorCode::ExpectedMemref,
                )),
            },
            _ => Ok(None),
        }
    }

    /// Fills a local dope vector whose entries are all known handles.
    fn make_local_dope(
        &mut self,
        value: Handle<Value>,
        entry_ty: Handle<SpvInst>,
        static_shape: Vec<i64>,
        static_stride: Vec<i64>,
        shape: Vec<Handle<SpvInst>>,
        stride: Vec<Handle<SpvInst>>,
    ) {
        self.dope.insert(
            value,
            DopeVector {
                entry_ty,
                static_shape,
                static_stride,
                shape,
                stride,
                offset_ty: None,
                static_offset: 0,
                offset: None,
            },
        );
    }

    /// Accumulates `sum_i indices[i] * stride[i]` as an index-typed value.
    fn memref_offset(
        &mut self,
        fun: &Function,
        dv_strides: &[Handle<SpvInst>],
        indices: &[Handle<Value>],
        span: Span,
    ) -> Result<Handle<SpvInst>, CompileError> {
        let index_ty = self.scalar_ty(ScalarKind::Index);
        let mut offset = self.null_constant(index_ty);
        for (i, &index) in indices.iter().enumerate() {
            let index_val = self.val(fun, index, span)?;
            let tmp = self.emit(instruction_value(
                Op::IMul,
                index_ty,
                &[index_val, dv_strides[i]],
            ));
            offset = self.emit(instruction_value(Op::IAdd, index_ty, &[offset, tmp]));
        }
        Ok(offset)
    }

    fn lower_load(&mut self, fun: &Function, inst: &Inst) -> Result<(), CompileError> {
        let span = inst.span;
        let operand = inst.operands[0];
        let index_ty = self.scalar_ty(ScalarKind::Index);
        let spv_pointer_ty = self.spv_ty(fun.values[operand].ty)?;
        let spv_result_ty = self.spv_ty(fun.values[inst.results[0]].ty)?;

        match *self.ty_of(fun, operand) {
            Type::Group { .. } => {
                let dv = self.dope_of(operand, span)?.clone();
                let group_offset = dv
                    .offset
                    .ok_or_else(|| CompileError::new(span, ErrorCode::SpirvMissingDopeVector))?;
                let index_val = self.val(fun, inst.operands[1], span)?;
                let offset = self.emit(instruction_value(
                    Op::IAdd,
                    index_ty,
                    &[group_offset, index_val],
                ));
                let base = self.val(fun, operand, span)?;
                let pointer = self.emit(instruction_in_bounds_ptr_access_chain(
                    spv_pointer_ty,
                    base,
                    offset,
                ));
                let loaded = self.emit(instruction_load(spv_result_ty, pointer));
                self.declare(inst.results[0], loaded);

                // The resulting memref's dynamic dope entries are loaded
                // from the group's shape/stride arrays at the same index.
                let ptr_index_ty = self.pointer_ty(StorageClass::CrossWorkgroup, index_ty, 8);
                let mut shape = Vec::with_capacity(dv.dim());
                let mut stride = Vec::with_capacity(dv.dim());
                for i in 0..dv.dim() {
                    shape.push(self.load_group_dope_entry(
                        dv.static_shape[i],
                        dv.shape[i],
                        offset,
                        ptr_index_ty,
                        index_ty,
                    ));
                }
                for i in 0..dv.dim() {
                    stride.push(self.load_group_dope_entry(
                        dv.static_stride[i],
                        dv.stride[i],
                        offset,
                        ptr_index_ty,
                        index_ty,
                    ));
                }
                self.make_local_dope(
                    inst.results[0],
                    index_ty,
                    dv.static_shape.clone(),
                    dv.static_stride.clone(),
                    shape,
                    stride,
                );
                Ok(())
            }
            Type::Memref { ref shape, .. } => {
                let pointer = if shape.is_empty() {
                    self.val(fun, operand, span)?
                } else {
                    let dv = self.dope_of(operand, span)?.clone();
                    let offset =
                        self.memref_offset(fun, &dv.stride, &inst.operands[1..], span)?;
                    let base = self.val(fun, operand, span)?;
                    self.emit(instruction_in_bounds_ptr_access_chain(
                        spv_pointer_ty,
                        base,
                        offset,
                    ))
                };
                let loaded = self.emit(instruction_load(spv_result_ty, pointer));
                self.declare(inst.results[0], loaded);
                Ok(())
            }
            _ => Err(CompileError::new(span, ErrorCode::ExpectedMemrefOrGroup)),
        }
    }

    fn load_group_dope_entry(
        &mut self,
        static_value: i64,
        entry: Handle<SpvInst>,
        offset: Handle<SpvInst>,
        ptr_index_ty: Handle<SpvInst>,
        index_ty: Handle<SpvInst>,
    ) -> Handle<SpvInst> {
        if crate::is_dynamic(static_value) {
            let pointer =
                self.emit(instruction_in_bounds_ptr_access_chain(ptr_index_ty, entry, offset));
            self.emit(instruction_load(index_ty, pointer))
        } else {
            entry
        }
    }

    fn lower_store(
        &mut self,
        fun: &Function,
        inst: &Inst,
        flag: StoreFlag,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let operand = inst.operands[1];
        match *self.ty_of(fun, operand) {
            Type::Memref {
                element,
                ref shape,
                space,
                ..
            } => {
                let spv_pointer_ty = self.spv_ty(fun.values[operand].ty)?;
                let pointer = if shape.is_empty() {
                    self.val(fun, operand, span)?
                } else {
                    let dv = self.dope_of(operand, span)?.clone();
                    let offset =
                        self.memref_offset(fun, &dv.stride, &inst.operands[2..], span)?;
                    let base = self.val(fun, operand, span)?;
                    self.emit(instruction_in_bounds_ptr_access_chain(
                        spv_pointer_ty,
                        base,
                        offset,
                    ))
                };
                let value = self.val(fun, inst.operands[0], span)?;
                self.make_store(flag, element, space, pointer, value, span)
            }
            _ => Err(CompileError::new(span, ErrorCode::ExpectedMemref)),
        }
    }

    pub fn make_store(
        &mut self,
        flag: StoreFlag,
        kind: ScalarKind,
        space: AddressSpace,
        pointer: Handle<SpvInst>,
        value: Handle<SpvInst>,
        span: Span,
    ) -> Result<(), CompileError> {
        match flag {
            StoreFlag::Regular => {
                self.emit(instruction_store(pointer, value));
                Ok(())
            }
            StoreFlag::Atomic => {
                let (scope, semantics) = self.atomic_constants();
                if kind.is_complex() {
                    let parts = self.split_re_im(kind, space, pointer, value);
                    for (ptr, val) in parts.iter() {
                        self.emit(instruction_atomic_store(*ptr, scope, semantics, *val));
                    }
                } else {
                    self.emit(instruction_atomic_store(pointer, scope, semantics, value));
                }
                Ok(())
            }
            StoreFlag::AtomicAdd => {
                let (scope, semantics) = self.atomic_constants();
                if kind.is_integer() {
                    let ty = self.scalar_ty(kind);
                    self.emit(instruction_atomic(
                        Op::AtomicIAdd,
                        ty,
                        pointer,
                        scope,
                        semantics,
                        value,
                    ));
                } else if kind.is_complex() {
                    let float_ty = self.scalar_ty(kind.element_kind());
                    let parts = self.split_re_im(kind, space, pointer, value);
                    for (ptr, val) in parts.iter() {
                        self.emit(instruction_atomic(
                            Op::AtomicFAddEXT,
                            float_ty,
                            *ptr,
                            scope,
                            semantics,
                            *val,
                        ));
                    }
                } else if kind == ScalarKind::BF16 {
                    return Err(CompileError::new(
                        span,
                        ErrorCode::SpirvUnsupportedAtomicDataType,
                    ));
                } else {
                    let ty = self.scalar_ty(kind);
                    self.emit(instruction_atomic(
                        Op::AtomicFAddEXT,
                        ty,
                        pointer,
                        scope,
                        semantics,
                        value,
                    ));
                }
                Ok(())
            }
            StoreFlag::AtomicMin | StoreFlag::AtomicMax => {
                let is_min = flag == StoreFlag::AtomicMin;
                let (scope, semantics) = self.atomic_constants();
                if kind.is_integer() {
                    let ty = self.scalar_ty(kind);
                    let op = if is_min { Op::AtomicSMin } else { Op::AtomicSMax };
                    self.emit(instruction_atomic(op, ty, pointer, scope, semantics, value));
                    Ok(())
                } else if kind == ScalarKind::F16
                    || kind == ScalarKind::F32
                    || kind == ScalarKind::F64
                {
                    let ty = self.scalar_ty(kind);
                    let op = if is_min {
                        Op::AtomicFMinEXT
                    } else {
                        Op::AtomicFMaxEXT
                    };
                    self.emit(instruction_atomic(op, ty, pointer, scope, semantics, value));
                    Ok(())
                } else {
                    Err(CompileError::new(
                        span,
                        ErrorCode::SpirvUnsupportedAtomicDataType,
                    ))
                }
            }
        }
    }

    fn atomic_constants(&mut self) -> (Handle<SpvInst>, Handle<SpvInst>) {
        let scope = self.i32_constant(spirv::Scope::Workgroup as i32);
        let semantics = self.i32_constant(spirv::MemorySemantics::NONE.bits() as i32);
        (scope, semantics)
    }

    /// Pointers and values for the real and imaginary lane of a complex
    /// location.
    fn split_re_im(
        &mut self,
        kind: ScalarKind,
        space: AddressSpace,
        pointer: Handle<SpvInst>,
        value: Handle<SpvInst>,
    ) -> [(Handle<SpvInst>, Handle<SpvInst>); 2] {
        let element = kind.element_kind();
        let float_ty = self.scalar_ty(element);
        let storage_class = super::unique::storage_class(space);
        let align = element.alignment(self.program.index_width) as u32;
        let ptr_ty = self.pointer_ty(storage_class, float_ty, align);
        let c0 = self.i32_constant(0);
        let c1 = self.i32_constant(1);
        let re_ptr = self.emit(instruction_in_bounds_access_chain(ptr_ty, pointer, &[c0]));
        let im_ptr = self.emit(instruction_in_bounds_access_chain(ptr_ty, pointer, &[c1]));
        let re_val = self.emit(instruction_composite_extract(float_ty, value, &[0]));
        let im_val = self.emit(instruction_composite_extract(float_ty, value, &[1]));
        [(re_ptr, re_val), (im_ptr, im_val)]
    }

    fn lower_alloca(
        &mut self,
        fun: &Function,
        inst: &Inst,
        offset: i64,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let result = inst.results[0];
        let (shape, stride) = match *self.ty_of(fun, result) {
            Type::Memref {
                ref shape,
                ref stride,
                ..
            } => (shape.clone(), stride.clone()),
            _ => return Err(CompileError::new(span, ErrorCode::ExpectedMemref)),
        };
        if offset < 0 {
            return Err(CompileError::with_note(
                span,
                ErrorCode::InternalCompilerError,
                "alloca without a stack slot",
            ));
        }
        let stack_var = self.stack_var.ok_or_else(|| {
            CompileError::with_note(span, ErrorCode::InternalCompilerError, "missing stack")
        })?;

        let i8_ty = self.scalar_ty(ScalarKind::I8);
        let byte_ptr_ty = self.pointer_ty(StorageClass::Workgroup, i8_ty, 1);
        let offset_const = self.index_constant(offset);
        let byte_ptr = self.emit(instruction_in_bounds_access_chain(
            byte_ptr_ty,
            stack_var,
            &[offset_const],
        ));
        let memref_ptr_ty = self.spv_ty(fun.values[result].ty)?;
        let pointer = self.emit(instruction_value(Op::Bitcast, memref_ptr_ty, &[byte_ptr]));
        self.declare(result, pointer);

        let index_ty = self.scalar_ty(ScalarKind::Index);
        let mut shape_entries = Vec::with_capacity(shape.len());
        let mut stride_entries = Vec::with_capacity(stride.len());
        for &s in &shape {
            shape_entries.push(self.index_constant(s));
        }
        for &s in &stride {
            stride_entries.push(self.index_constant(s));
        }
        self.make_local_dope(result, index_ty, shape, stride, shape_entries, stride_entries);
        Ok(())
    }

    fn lower_subview(
        &mut self,
        fun: &Function,
        inst: &Inst,
        static_offsets: &[i64],
        static_sizes: &[i64],
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let operand = inst.operands[0];
        let dv = self.dope_of(operand, span)?.clone();
        let index_ty = self.scalar_ty(ScalarKind::Index);

        // Dynamic offsets first, then dynamic sizes.
        let mut next_operand = 1;
        let mut offsets = Vec::with_capacity(static_offsets.len());
        for &off in static_offsets {
            if crate::is_dynamic(off) {
                offsets.push(self.val(fun, inst.operands[next_operand], span)?);
                next_operand += 1;
            } else {
                offsets.push(self.index_constant(off));
            }
        }
        let mut sizes = Vec::with_capacity(static_sizes.len());
        for &size in static_sizes {
            if crate::is_dynamic(size) {
                sizes.push(Some(self.val(fun, inst.operands[next_operand], span)?));
                next_operand += 1;
            } else {
                sizes.push(None);
            }
        }

        let mut offset = self.null_constant(index_ty);
        for i in 0..static_offsets.len() {
            if static_offsets[i] == 0 {
                continue;
            }
            let tmp = self.emit(instruction_value(
                Op::IMul,
                index_ty,
                &[offsets[i], dv.stride[i]],
            ));
            offset = self.emit(instruction_value(Op::IAdd, index_ty, &[offset, tmp]));
        }

        let result = inst.results[0];
        let spv_result_ty = self.spv_ty(fun.values[result].ty)?;
        let base = self.val(fun, operand, span)?;
        let pointer =
            self.emit(instruction_in_bounds_ptr_access_chain(spv_result_ty, base, offset));
        self.declare(result, pointer);

        // Retained modes keep the parent stride; sizes become the shape.
        let (rshape, rstride) = match *self.ty_of(fun, result) {
            Type::Memref {
                ref shape,
                ref stride,
                ..
            } => (shape.clone(), stride.clone()),
            _ => return Err(CompileError::new(span, ErrorCode::ExpectedMemref)),
        };
        let mut shape_entries = Vec::new();
        let mut stride_entries = Vec::new();
        let mut j = 0;
        for (i, &size) in static_sizes.iter().enumerate() {
            if size == 0 {
                continue;
            }
            let shape_entry = match sizes[i] {
                Some(dynamic) => dynamic,
                None => self.index_constant(size),
            };
            shape_entries.push(shape_entry);
            if crate::is_dynamic(rstride[j]) {
                stride_entries.push(dv.stride[i]);
            } else {
                stride_entries.push(self.index_constant(rstride[j]));
            }
            j += 1;
        }
        self.make_local_dope(result, index_ty, rshape, rstride, shape_entries, stride_entries);
        Ok(())
    }

    fn lower_expand(
        &mut self,
        fun: &Function,
        inst: &Inst,
        mode: u32,
        static_factors: &[i64],
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let operand = inst.operands[0];
        let dv = self.dope_of(operand, span)?.clone();
        let index_ty = self.scalar_ty(ScalarKind::Index);
        let mode = mode as usize;

        let mut factors = Vec::with_capacity(static_factors.len());
        let mut next_operand = 1;
        for &factor in static_factors {
            if crate::is_dynamic(factor) {
                factors.push(self.val(fun, inst.operands[next_operand], span)?);
                next_operand += 1;
            } else {
                factors.push(self.index_constant(factor));
            }
        }

        let base = self.val(fun, operand, span)?;
        let result = inst.results[0];
        self.declare(result, base);

        let (rshape, rstride) = match *self.ty_of(fun, result) {
            Type::Memref {
                ref shape,
                ref stride,
                ..
            } => (shape.clone(), stride.clone()),
            _ => return Err(CompileError::new(span, ErrorCode::ExpectedMemref)),
        };

        let mut shape_entries = Vec::with_capacity(rshape.len());
        let mut stride_entries = Vec::with_capacity(rshape.len());
        for i in 0..mode {
            shape_entries.push(dv.shape[i]);
            stride_entries.push(dv.stride[i]);
        }
        let mut running = dv.stride[mode];
        for (k, &factor) in factors.iter().enumerate() {
            shape_entries.push(factor);
            stride_entries.push(running);
            if k + 1 < factors.len() {
                running = self.emit(instruction_value(Op::IMul, index_ty, &[running, factor]));
            }
        }
        for i in mode + 1..dv.dim() {
            shape_entries.push(dv.shape[i]);
            stride_entries.push(dv.stride[i]);
        }
        self.make_local_dope(result, index_ty, rshape, rstride, shape_entries, stride_entries);
        Ok(())
    }

    fn lower_fuse(
        &mut self,
        fun: &Function,
        inst: &Inst,
        from: u32,
        to: u32,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let operand = inst.operands[0];
        let dv = self.dope_of(operand, span)?.clone();
        let index_ty = self.scalar_ty(ScalarKind::Index);
        let (from, to) = (from as usize, to as usize);

        let base = self.val(fun, operand, span)?;
        let result = inst.results[0];
        self.declare(result, base);

        let (rshape, rstride) = match *self.ty_of(fun, result) {
            Type::Memref {
                ref shape,
                ref stride,
                ..
            } => (shape.clone(), stride.clone()),
            _ => return Err(CompileError::new(span, ErrorCode::ExpectedMemref)),
        };

        let mut shape_entries = Vec::with_capacity(rshape.len());
        let mut stride_entries = Vec::with_capacity(rshape.len());
        for i in 0..from {
            shape_entries.push(dv.shape[i]);
            stride_entries.push(dv.stride[i]);
        }
        let mut fused = dv.shape[from];
        for i in from + 1..=to {
            fused = self.emit(instruction_value(Op::IMul, index_ty, &[fused, dv.shape[i]]));
        }
        shape_entries.push(fused);
        stride_entries.push(dv.stride[from]);
        for i in to + 1..dv.dim() {
            shape_entries.push(dv.shape[i]);
            stride_entries.push(dv.stride[i]);
        }
        self.make_local_dope(result, index_ty, rshape, rstride, shape_entries, stride_entries);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    fn lower_if(&mut self, fun: &Function, inst: &Inst) -> Result<(), CompileError> {
        let span = inst.span;
        let num_results = self.num_yielded_vals(fun, &inst.results);

        let then_label = self.module.reserve(instruction_label());
        let otherwise_label = self.module.reserve(instruction_label());
        let merge_label = self.module.reserve(instruction_label());

        let condition = self.val(fun, inst.operands[0], span)?;
        self.emit(instruction_selection_merge(merge_label));
        self.emit(instruction_branch_conditional(
            condition,
            then_label,
            otherwise_label,
        ));

        self.module.append(Section::Function, then_label);
        let yielded_then = self.write_region_with_yield(fun, &inst.regions[0], num_results)?;
        self.emit(instruction_branch(merge_label));
        let then_last = self
            .get_last_label()
            .ok_or_else(|| CompileError::new(span, ErrorCode::InternalCompilerError))?;

        self.module.append(Section::Function, otherwise_label);
        let yielded_otherwise = match inst.regions.get(1) {
            Some(region) => self.write_region_with_yield(fun, region, num_results)?,
            None => Vec::new(),
        };
        self.emit(instruction_branch(merge_label));
        let otherwise_last = self
            .get_last_label()
            .ok_or_else(|| CompileError::new(span, ErrorCode::InternalCompilerError))?;

        self.module.append(Section::Function, merge_label);

        if num_results > 0 && yielded_otherwise.len() != num_results {
            return Err(CompileError::new(span, ErrorCode::YieldMismatch));
        }
        let mut val_no = 0;
        for &result in &inst.results {
            let ty = self.spv_ty(fun.values[result].ty)?;
            match *self.ty_of(fun, result) {
                Type::Coopmatrix { .. } => {
                    let length = self.coop_layout_of(fun, result).length as usize;
                    let mut phis = Vec::with_capacity(length);
                    for _ in 0..length {
                        let mut phi = SpvInst::new(Op::Phi);
                        phi.set_type(ty);
                        phi.set_result();
                        phi.add_ref(yielded_then[val_no]);
                        phi.add_ref(then_last);
                        phi.add_ref(yielded_otherwise[val_no]);
                        phi.add_ref(otherwise_last);
                        phis.push(self.emit(phi));
                        val_no += 1;
                    }
                    self.multi_declare(result, phis);
                }
                _ => {
                    let mut phi = SpvInst::new(Op::Phi);
                    phi.set_type(ty);
                    phi.set_result();
                    phi.add_ref(yielded_then[val_no]);
                    phi.add_ref(then_last);
                    phi.add_ref(yielded_otherwise[val_no]);
                    phi.add_ref(otherwise_last);
                    let phi = self.emit(phi);
                    val_no += 1;
                    self.declare(result, phi);
                }
            }
        }
        Ok(())
    }

    fn lower_for(&mut self, fun: &Function, inst: &Inst, has_step: bool) -> Result<(), CompileError> {
        let span = inst.span;
        let num_results = self.num_yielded_vals(fun, &inst.results);
        let fixed = 2 + has_step as usize;
        let region = &inst.regions[0];
        let loop_var = region.params[0];
        let iter_args = &region.params[1..];
        let iter_inits = &inst.operands[fixed..];

        let header_label = self.module.reserve(instruction_label());
        let body_label = self.module.reserve(instruction_label());
        let continue_label = self.module.reserve(instruction_label());
        let merge_label = self.module.reserve(instruction_label());

        self.emit(instruction_loop_merge(merge_label, continue_label));
        self.emit(instruction_branch(header_label));

        // Header block: entry test.
        let bool_ty = self.bool_ty();
        let loop_kind = self.scalar_kind_of(fun, loop_var, span)?;
        let spv_loop_var_ty = self.scalar_ty(loop_kind);
        self.module.append(Section::Function, header_label);
        let from = self.val(fun, inst.operands[0], span)?;
        let to = self.val(fun, inst.operands[1], span)?;
        let condition = self.emit(instruction_value(Op::SLessThan, bool_ty, &[from, to]));
        self.emit(instruction_branch_conditional(condition, body_label, merge_label));

        // Body block: phis for the loop variable and iter-args; their
        // continue-edge values are patched once known.
        self.module.append(Section::Function, body_label);
        let mut loop_var_phi = SpvInst::new(Op::Phi);
        loop_var_phi.set_type(spv_loop_var_ty);
        loop_var_phi.set_result();
        loop_var_phi.add_ref(from);
        loop_var_phi.add_ref(header_label);
        loop_var_phi.add_pending();
        loop_var_phi.add_ref(continue_label);
        let loop_var_phi = self.emit(loop_var_phi);
        self.declare(loop_var, loop_var_phi);

        let mut iter_phis = Vec::with_capacity(num_results);
        for (i, &arg) in iter_args.iter().enumerate() {
            let ty = self.spv_ty(fun.values[arg].ty)?;
            match *self.ty_of(fun, arg) {
                Type::Coopmatrix { .. } => {
                    let inits = self.multi_val(iter_inits[i], span)?;
                    let mut phis = Vec::with_capacity(inits.len());
                    for &init in &inits {
                        let mut phi = SpvInst::new(Op::Phi);
                        phi.set_type(ty);
                        phi.set_result();
                        phi.add_ref(init);
                        phi.add_ref(header_label);
                        phi.add_pending();
                        phi.add_ref(continue_label);
                        let phi = self.emit(phi);
                        phis.push(phi);
                        iter_phis.push(phi);
                    }
                    self.multi_declare(arg, phis);
                }
                _ => {
                    let init = self.val(fun, iter_inits[i], span)?;
                    let mut phi = SpvInst::new(Op::Phi);
                    phi.set_type(ty);
                    phi.set_result();
                    phi.add_ref(init);
                    phi.add_ref(header_label);
                    phi.add_pending();
                    phi.add_ref(continue_label);
                    let phi = self.emit(phi);
                    iter_phis.push(phi);
                    self.declare(arg, phi);
                }
            }
        }

        let yielded = self.write_region_with_yield(fun, region, num_results)?;
        for (phi, &value) in iter_phis.iter().zip(&yielded) {
            self.module.patch_pending(*phi, value);
        }
        self.emit(instruction_branch(continue_label));

        // Continue block: increment and re-test.
        self.module.append(Section::Function, continue_label);
        let step = if has_step {
            self.val(fun, inst.operands[2], span)?
        } else {
            self.make_constant(loop_kind, ConstantValue::Int(1))
                .ok_or_else(|| CompileError::new(span, ErrorCode::InternalCompilerError))?
        };
        let update = self.emit(instruction_value(
            Op::IAdd,
            spv_loop_var_ty,
            &[loop_var_phi, step],
        ));
        self.module.patch_pending(loop_var_phi, update);
        let condition2 = self.emit(instruction_value(Op::SLessThan, bool_ty, &[update, to]));
        self.emit(instruction_branch_conditional(condition2, body_label, merge_label));

        // Merge block: join the entry values with the final iter values.
        self.module.append(Section::Function, merge_label);
        let mut val_no = 0;
        for (i, &result) in inst.results.iter().enumerate() {
            let ty = self.spv_ty(fun.values[result].ty)?;
            match *self.ty_of(fun, result) {
                Type::Coopmatrix { .. } => {
                    let inits = self.multi_val(iter_inits[i], span)?;
                    let mut phis = Vec::with_capacity(inits.len());
                    for &init in &inits {
                        let mut phi = SpvInst::new(Op::Phi);
                        phi.set_type(ty);
                        phi.set_result();
                        phi.add_ref(init);
                        phi.add_ref(header_label);
                        phi.add_ref(yielded[val_no]);
                        phi.add_ref(continue_label);
                        val_no += 1;
                        phis.push(self.emit(phi));
                    }
                    self.multi_declare(result, phis);
                }
                _ => {
                    let init = self.val(fun, iter_inits[i], span)?;
                    let mut phi = SpvInst::new(Op::Phi);
                    phi.set_type(ty);
                    phi.set_result();
                    phi.add_ref(init);
                    phi.add_ref(header_label);
                    phi.add_ref(yielded[val_no]);
                    phi.add_ref(continue_label);
                    val_no += 1;
                    let phi = self.emit(phi);
                    self.declare(result, phi);
                }
            }
        }
        Ok(())
    }

    fn lower_yield(&mut self, fun: &Function, inst: &Inst) -> Result<(), CompileError> {
        let span = inst.span;
        if self.yielded.is_empty() {
            return Err(CompileError::new(span, ErrorCode::UnexpectedYield));
        }
        let mut flat = Vec::new();
        for &operand in &inst.operands {
            match *self.ty_of(fun, operand) {
                Type::Coopmatrix { .. } => flat.extend(self.multi_val(operand, span)?),
                _ => flat.push(self.val(fun, operand, span)?),
            }
        }
        let top = match self.yielded.last_mut() {
            Some(top) => top,
            None => return Err(CompileError::new(span, ErrorCode::UnexpectedYield)),
        };
        if top.len() != flat.len() {
            return Err(CompileError::new(span, ErrorCode::YieldMismatch));
        }
        for (slot, value) in top.iter_mut().zip(flat) {
            *slot = Some(value);
        }
        Ok(())
    }

    fn lower_barrier(&mut self, fences: crate::FenceFlags) -> Result<(), CompileError> {
        let mut semantics = 0u32;
        if fences.contains(crate::FenceFlags::GLOBAL) {
            semantics |= spirv::MemorySemantics::CROSS_WORKGROUP_MEMORY.bits()
                | spirv::MemorySemantics::SEQUENTIALLY_CONSISTENT.bits();
        }
        if fences.contains(crate::FenceFlags::LOCAL) {
            semantics |= spirv::MemorySemantics::WORKGROUP_MEMORY.bits()
                | spirv::MemorySemantics::SEQUENTIALLY_CONSISTENT.bits();
        }
        let scope = self.i32_constant(spirv::Scope::Workgroup as i32);
        let semantics = self.i32_constant(semantics as i32);
        self.emit(instruction_control_barrier(scope, scope, semantics));
        Ok(())
    }

    fn lower_builtin_component(
        &mut self,
        fun: &Function,
        inst: &Inst,
        builtin: spirv::BuiltIn,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let loaded = self.load_builtin(builtin)?;
        let index_ty = self.scalar_ty(ScalarKind::Index);
        // The z axis carries the group dimension of the dispatch.
        let component = self.emit(instruction_composite_extract(index_ty, loaded, &[2]));
        let kind = self.scalar_kind_of(fun, inst.results[0], span)?;
        let component = if kind == ScalarKind::Index {
            component
        } else {
            self.make_cast(kind, ScalarKind::Index, component, span)?
        };
        self.declare(inst.results[0], component);
        Ok(())
    }

    /// Subgroup queries load as 32-bit integers and convert to the result
    /// scalar where needed.
    fn lower_builtin_scalar(
        &mut self,
        fun: &Function,
        inst: &Inst,
        builtin: spirv::BuiltIn,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let loaded = self.load_builtin(builtin)?;
        let kind = self.scalar_kind_of(fun, inst.results[0], span)?;
        let value = if kind == ScalarKind::I32 {
            loaded
        } else {
            self.make_cast(kind, ScalarKind::I32, loaded, span)?
        };
        self.declare(inst.results[0], value);
        Ok(())
    }

    fn lower_work_group(
        &mut self,
        fun: &Function,
        inst: &Inst,
        op: GroupOp,
    ) -> Result<(), CompileError> {
        let span = inst.span;
        let kind = self.scalar_kind_of(fun, inst.operands[0], span)?;
        let operand = self.val(fun, inst.operands[0], span)?;
        let scope = self.i32_constant(spirv::Scope::Workgroup as i32);

        if kind == ScalarKind::BF16 {
            let operand = self.bf16_to_f32(operand);
            let f32_ty = self.scalar_ty(ScalarKind::F32);
            let spv_op = match op {
                GroupOp::ReduceAdd => Op::GroupFAdd,
                GroupOp::ReduceMin => Op::GroupFMin,
                GroupOp::ReduceMax => Op::GroupFMax,
            };
            let reduced = self.emit(instruction_group_operation(
                spv_op,
                f32_ty,
                scope,
                spirv::GroupOperation::Reduce,
                operand,
            ));
            let demoted = self.f32_to_bf16(reduced);
            self.declare(inst.results[0], demoted);
            return Ok(());
        }

        let ty = self.spv_ty(fun.values[inst.results[0]].ty)?;
        let spv_op = if kind.is_integer() {
            match op {
                GroupOp::ReduceAdd => Op::GroupIAdd,
                GroupOp::ReduceMin => Op::GroupSMin,
                GroupOp::ReduceMax => Op::GroupSMax,
            }
        } else if kind.is_complex() {
            match op {
                GroupOp::ReduceAdd => Op::GroupFAdd,
                _ => return Err(CompileError::new(span, ErrorCode::ComplexUnsupported)),
            }
        } else {
            match op {
                GroupOp::ReduceAdd => Op::GroupFAdd,
                GroupOp::ReduceMin => Op::GroupFMin,
                GroupOp::ReduceMax => Op::GroupFMax,
            }
        };
        let reduced = self.emit(instruction_group_operation(
            spv_op,
            ty,
            scope,
            spirv::GroupOperation::Reduce,
            operand,
        ));
        self.declare(inst.results[0], reduced);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Structured single-armed conditionals (bounds-checked accesses)
    // ------------------------------------------------------------------

    /// `cond ? then() : otherwise`, joined by a phi at the merge block.
    pub fn emit_cond_value(
        &mut self,
        condition: Handle<SpvInst>,
        result_ty: Handle<SpvInst>,
        otherwise: Handle<SpvInst>,
        then: impl FnOnce(&mut Self) -> Result<Handle<SpvInst>, CompileError>,
    ) -> Result<Handle<SpvInst>, CompileError> {
        let then_label = self.module.reserve(instruction_label());
        let merge_label = self.module.reserve(instruction_label());
        let pre_label = self
            .get_last_label()
            .ok_or_else(|| {
                CompileError::new(Span::default(), ErrorCode::InternalCompilerError)
            })?;
        self.emit(instruction_selection_merge(merge_label));
        self.emit(instruction_branch_conditional(condition, then_label, merge_label));
        self.module.append(Section::Function, then_label);
        let value = then(self)?;
        self.emit(instruction_branch(merge_label));
        let then_last = self
            .get_last_label()
            .ok_or_else(|| {
                CompileError::new(Span::default(), ErrorCode::InternalCompilerError)
            })?;
        self.module.append(Section::Function, merge_label);
        let mut phi = SpvInst::new(Op::Phi);
        phi.set_type(result_ty);
        phi.set_result();
        phi.add_ref(value);
        phi.add_ref(then_last);
        phi.add_ref(otherwise);
        phi.add_ref(pre_label);
        Ok(self.emit(phi))
    }

    /// Runs `then()` only when the condition holds.
    pub fn emit_cond(
        &mut self,
        condition: Handle<SpvInst>,
        then: impl FnOnce(&mut Self) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        let then_label = self.module.reserve(instruction_label());
        let merge_label = self.module.reserve(instruction_label());
        self.emit(instruction_selection_merge(merge_label));
        self.emit(instruction_branch_conditional(condition, then_label, merge_label));
        self.module.append(Section::Function, then_label);
        then(self)?;
        self.emit(instruction_branch(merge_label));
        self.module.append(Section::Function, merge_label);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::spv::{assemble, capex, Operand};
    use crate::{AddressSpace, CheckedFlag, MatrixUse, Region};

    fn lower(program: &Program, device: &DeviceInfo) -> (Module, FastHashMap<String, KernelMetadata>) {
        let mut writer = Writer::new(program, device);
        let metadata = writer.write().expect("lowering failed");
        (writer.finish(), metadata)
    }

    fn function_ops(module: &Module) -> Vec<Op> {
        module
            .section(Section::Function)
            .iter()
            .map(|&h| module.get(h).op)
            .collect()
    }

    fn count_op(module: &Module, section: Section, op: Op) -> usize {
        module
            .section(section)
            .iter()
            .filter(|&&h| module.get(h).op == op)
            .count()
    }

    fn has_capability(module: &Module, cap: spirv::Capability) -> bool {
        module.section(Section::Capability).iter().any(|&h| {
            module.get(h).operands.first() == Some(&Operand::Literal(cap as Word))
        })
    }

    fn has_extension(module: &Module, name: &str) -> bool {
        module.section(Section::Extension).iter().any(|&h| {
            module.get(h).operands.first() == Some(&Operand::String(name.to_string()))
        })
    }

    fn empty_kernel() -> Program {
        let mut program = Program::new();
        let mut fun = Function::new("k");
        fun.subgroup_size = 16;
        fun.work_group_size = [16, 1];
        program.functions.push(fun);
        program
    }

    #[test]
    fn empty_kernel_module_shape() {
        let program = empty_kernel();
        let device = DeviceInfo::pvc();
        let (mut module, metadata) = lower(&program, &device);

        assert_eq!(
            function_ops(&module),
            vec![Op::Function, Op::Label, Op::Return, Op::FunctionEnd]
        );
        assert_eq!(
            metadata["k"],
            KernelMetadata {
                subgroup_size: 16,
                work_group_size: [16, 1],
            }
        );

        // Entry point names "k"; execution modes carry LocalSize 16 1 1 and
        // SubgroupSize 16.
        let entry = module.section(Section::EntryPoint)[0];
        assert!(module
            .get(entry)
            .operands
            .contains(&Operand::String("k".to_string())));
        let modes: Vec<Vec<Operand>> = module
            .section(Section::ExecutionMode)
            .iter()
            .map(|&h| module.get(h).operands.clone())
            .collect();
        assert_eq!(modes.len(), 2);
        assert_eq!(
            &modes[0][1..],
            &[
                Operand::Literal(spirv::ExecutionMode::LocalSize as Word),
                Operand::Literal(16),
                Operand::Literal(1),
                Operand::Literal(1),
            ][..]
        );
        assert_eq!(
            &modes[1][1..],
            &[
                Operand::Literal(spirv::ExecutionMode::SubgroupSize as Word),
                Operand::Literal(16),
            ][..]
        );

        let ids = assemble::assign_ids(&mut module).unwrap();
        capex::infer(&mut module).unwrap();
        let bytes = assemble::assemble(&module, &ids);
        let words: Vec<u32> = bytes
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(words[0], spirv::MAGIC_NUMBER);
        assert!(words[3] >= 5);
        assert!(has_capability(&module, spirv::Capability::Kernel));
        assert!(has_capability(&module, spirv::Capability::Addresses));
    }

    fn push_const(fun: &mut Function, ty: Handle<crate::Type>, v: ConstantValue) -> Handle<Value> {
        let value = fun.make_value(ty, None);
        let mut inst = Inst::new(Operation::Constant(v), Span::default());
        inst.results = vec![value];
        let h = fun.insts.append(inst);
        fun.body.body.push(h);
        value
    }

    #[test]
    fn if_with_yield_produces_single_phi() {
        let mut program = Program::new();
        let i32_ty = program.scalar(ScalarKind::I32);
        let bool_ty = program.bool_ty();
        let mut fun = Function::new("k");
        fun.subgroup_size = 16;
        fun.work_group_size = [16, 1];

        let cond = push_const(&mut fun, bool_ty, ConstantValue::Bool(true));
        let a = push_const(&mut fun, i32_ty, ConstantValue::Int(1));
        let b = push_const(&mut fun, i32_ty, ConstantValue::Int(2));

        let make_yield = |fun: &mut Function, v: Handle<Value>| {
            let mut y = Inst::new(Operation::Yield, Span::default());
            y.operands = vec![v];
            fun.insts.append(y)
        };
        let yield_a = make_yield(&mut fun, a);
        let yield_b = make_yield(&mut fun, b);

        let r = fun.make_value(i32_ty, Some("r"));
        let mut if_inst = Inst::new(Operation::If, Span::default());
        if_inst.operands = vec![cond];
        if_inst.results = vec![r];
        if_inst.regions = vec![
            Region {
                params: vec![],
                body: vec![yield_a],
            },
            Region {
                params: vec![],
                body: vec![yield_b],
            },
        ];
        let if_h = fun.insts.append(if_inst);
        fun.body.body.push(if_h);
        program.functions.push(fun);

        let device = DeviceInfo::pvc();
        let (mut module, _) = lower(&program, &device);
        assert_eq!(count_op(&module, Section::Function, Op::SelectionMerge), 1);
        assert_eq!(count_op(&module, Section::Function, Op::BranchConditional), 1);
        assert_eq!(count_op(&module, Section::Function, Op::Branch), 2);
        assert_eq!(count_op(&module, Section::Function, Op::Phi), 1);
        // then, else and merge labels plus the entry label.
        assert_eq!(count_op(&module, Section::Function, Op::Label), 4);
        assert!(assemble::assign_ids(&mut module).is_ok());
    }

    #[test]
    fn for_loop_with_iter_arg() {
        let mut program = Program::new();
        let i32_ty = program.scalar(ScalarKind::I32);
        let mut fun = Function::new("k");
        fun.subgroup_size = 16;
        fun.work_group_size = [16, 1];

        let from = push_const(&mut fun, i32_ty, ConstantValue::Int(0));
        let to = push_const(&mut fun, i32_ty, ConstantValue::Int(10));
        let init = push_const(&mut fun, i32_ty, ConstantValue::Int(0));

        let i = fun.make_value(i32_ty, Some("i"));
        let acc = fun.make_value(i32_ty, Some("acc"));
        let n = fun.make_value(i32_ty, Some("n"));
        let s = fun.make_value(i32_ty, Some("s"));

        let mut add = Inst::new(Operation::Binary(BinaryOp::Add), Span::default());
        add.operands = vec![acc, i];
        add.results = vec![n];
        let add_h = fun.insts.append(add);
        let mut y = Inst::new(Operation::Yield, Span::default());
        y.operands = vec![n];
        let y_h = fun.insts.append(y);

        let mut for_inst = Inst::new(Operation::For { has_step: false }, Span::default());
        for_inst.operands = vec![from, to, init];
        for_inst.results = vec![s];
        for_inst.regions = vec![Region {
            params: vec![i, acc],
            body: vec![add_h, y_h],
        }];
        let for_h = fun.insts.append(for_inst);
        fun.body.body.push(for_h);
        program.functions.push(fun);

        let device = DeviceInfo::pvc();
        let (mut module, _) = lower(&program, &device);
        assert_eq!(count_op(&module, Section::Function, Op::LoopMerge), 1);
        assert_eq!(count_op(&module, Section::Function, Op::BranchConditional), 2);
        // Loop variable and iter-arg phis in the body, one result phi at
        // the merge.
        assert_eq!(count_op(&module, Section::Function, Op::Phi), 3);
        // Body add plus the induction increment.
        assert_eq!(count_op(&module, Section::Function, Op::IAdd), 2);
        // entry, header, body, continue, merge.
        assert_eq!(count_op(&module, Section::Function, Op::Label), 5);
        // All pending phi edges were patched.
        assert!(assemble::assign_ids(&mut module).is_ok());
    }

    #[test]
    fn atomic_float_add_store() {
        let mut program = Program::new();
        let memref_ty = program.intern(Type::Memref {
            element: ScalarKind::F32,
            shape: vec![16],
            stride: vec![1],
            space: AddressSpace::Global,
        });
        let f32_ty = program.scalar(ScalarKind::F32);
        let index_ty = program.scalar(ScalarKind::Index);
        let mut fun = Function::new("k");
        fun.subgroup_size = 16;
        fun.work_group_size = [16, 1];
        let buf = fun.make_value(memref_ty, Some("p"));
        fun.params.push(buf);
        let idx = push_const(&mut fun, index_ty, ConstantValue::Int(0));
        let v = push_const(&mut fun, f32_ty, ConstantValue::Float(1.5));
        let mut store = Inst::new(Operation::Store(StoreFlag::AtomicAdd), Span::default());
        store.operands = vec![v, buf, idx];
        let store_h = fun.insts.append(store);
        fun.body.body.push(store_h);
        program.functions.push(fun);

        let device = DeviceInfo::pvc();
        let (mut module, _) = lower(&program, &device);
        capex::infer(&mut module).unwrap();
        assert_eq!(count_op(&module, Section::Function, Op::AtomicFAddEXT), 1);
        assert!(has_capability(&module, spirv::Capability::AtomicFloat32AddEXT));
        assert!(has_extension(&module, "SPV_EXT_shader_atomic_float_add"));
    }

    fn coop_ty(
        program: &mut Program,
        component: ScalarKind,
        rows: i64,
        cols: i64,
        use_: MatrixUse,
    ) -> Handle<Type> {
        program.intern(Type::Coopmatrix {
            component,
            rows,
            cols,
            use_,
        })
    }

    #[test]
    fn dpas_gemm_tile_uses_inline_assembly() {
        let mut program = Program::new();
        let a_mem = program.intern(Type::Memref {
            element: ScalarKind::BF16,
            shape: vec![8, 16],
            stride: vec![1, 8],
            space: AddressSpace::Global,
        });
        let b_mem = program.intern(Type::Memref {
            element: ScalarKind::BF16,
            shape: vec![16, 8],
            stride: vec![1, 16],
            space: AddressSpace::Global,
        });
        let c_mem = program.intern(Type::Memref {
            element: ScalarKind::F32,
            shape: vec![8, 8],
            stride: vec![1, 8],
            space: AddressSpace::Global,
        });
        let a_ty = coop_ty(&mut program, ScalarKind::BF16, 8, 16, MatrixUse::A);
        let b_ty = coop_ty(&mut program, ScalarKind::BF16, 16, 8, MatrixUse::B);
        let c_ty = coop_ty(&mut program, ScalarKind::F32, 8, 8, MatrixUse::Acc);
        let index_ty = program.scalar(ScalarKind::Index);

        let mut fun = Function::new("gemm");
        fun.subgroup_size = 16;
        fun.work_group_size = [16, 1];
        let pa = fun.make_value(a_mem, Some("A"));
        let pb = fun.make_value(b_mem, Some("B"));
        let pc = fun.make_value(c_mem, Some("C"));
        fun.params = vec![pa, pb, pc];
        let zero = push_const(&mut fun, index_ty, ConstantValue::Int(0));

        let mut load = |fun: &mut Function, mem, ty| {
            let r = fun.make_value(ty, None);
            let mut inst = Inst::new(
                Operation::CoopLoad {
                    transpose: false,
                    checked: CheckedFlag::None,
                },
                Span::default(),
            );
            inst.operands = vec![mem, zero, zero];
            inst.results = vec![r];
            let h = fun.insts.append(inst);
            fun.body.body.push(h);
            r
        };
        let a = load(&mut fun, pa, a_ty);
        let b = load(&mut fun, pb, b_ty);
        let c = load(&mut fun, pc, c_ty);

        let r = fun.make_value(c_ty, None);
        let mut mul = Inst::new(Operation::CoopMulAdd, Span::default());
        mul.operands = vec![a, b, c];
        mul.results = vec![r];
        let mul_h = fun.insts.append(mul);
        fun.body.body.push(mul_h);

        let mut store = Inst::new(
            Operation::CoopStore {
                flag: StoreFlag::Regular,
                checked: CheckedFlag::None,
            },
            Span::default(),
        );
        store.operands = vec![r, pc, zero, zero];
        let store_h = fun.insts.append(store);
        fun.body.body.push(store_h);
        program.functions.push(fun);

        let device = DeviceInfo::pvc();
        let (mut module, _) = lower(&program, &device);
        capex::infer(&mut module).unwrap();

        // One asm declaration per load operand, one for the DPAS multiply
        // and one for the store; one call each.
        assert_eq!(count_op(&module, Section::TypeConstVar, Op::AsmINTEL), 5);
        assert_eq!(count_op(&module, Section::Function, Op::AsmCallINTEL), 5);
        assert!(has_capability(&module, spirv::Capability::AsmINTEL));
        assert!(has_extension(&module, "SPV_INTEL_inline_assembly"));
        // The DPAS path never touches the KHR cooperative matrix ops.
        assert_eq!(
            count_op(&module, Section::Function, Op::CooperativeMatrixLoadKHR),
            0
        );
        assert!(assemble::assign_ids(&mut module).is_ok());
    }

    #[test]
    fn bf16_arithmetic_promotes_through_f32() {
        let mut program = Program::new();
        let bf16_ty = program.scalar(ScalarKind::BF16);
        let mut fun = Function::new("k");
        fun.subgroup_size = 16;
        fun.work_group_size = [16, 1];
        let a = push_const(&mut fun, bf16_ty, ConstantValue::Float(1.0));
        let r = fun.make_value(bf16_ty, None);
        let mut add = Inst::new(Operation::Binary(BinaryOp::Add), Span::default());
        add.operands = vec![a, a];
        add.results = vec![r];
        let h = fun.insts.append(add);
        fun.body.body.push(h);
        program.functions.push(fun);

        let device = DeviceInfo::pvc();
        let (module, _) = lower(&program, &device);
        // bf16 -> f32 for both operands, one f32 add, f32 -> bf16 once.
        assert_eq!(
            count_op(&module, Section::Function, Op::ConvertBF16ToFINTEL),
            2
        );
        assert_eq!(count_op(&module, Section::Function, Op::FAdd), 1);
        assert_eq!(
            count_op(&module, Section::Function, Op::ConvertFToBF16INTEL),
            1
        );
    }

    #[test]
    fn constants_round_trip_bit_for_bit() {
        let program = Program::new();
        let device = DeviceInfo::pvc();
        let mut writer = Writer::new(&program, &device);

        let c32 = writer
            .make_constant(ScalarKind::I32, ConstantValue::Int(-7))
            .unwrap();
        assert_eq!(
            writer.module.get(c32).operands,
            vec![Operand::Literal(-7i32 as u32)]
        );

        let f64c = writer
            .make_constant(ScalarKind::F64, ConstantValue::Float(0.1))
            .unwrap();
        assert_eq!(
            writer.module.get(f64c).operands,
            vec![Operand::Wide(0.1f64.to_bits())]
        );

        let c = writer
            .make_constant(ScalarKind::C32, ConstantValue::Complex([1.5, -2.5]))
            .unwrap();
        let operands = writer.module.get(c).operands.clone();
        assert_eq!(operands.len(), 2);
        // The two lanes reference f32 constants carrying the exact bits.
        for (operand, expect) in operands.iter().zip(&[1.5f32, -2.5f32]) {
            match *operand {
                Operand::Ref(lane) => assert_eq!(
                    writer.module.get(lane).operands,
                    vec![Operand::Literal(expect.to_bits())]
                ),
                _ => panic!("expected lane reference"),
            }
        }

        // Constants are interned: the same literal returns the same handle.
        let again = writer
            .make_constant(ScalarKind::I32, ConstantValue::Int(-7))
            .unwrap();
        assert_eq!(c32, again);
    }

    #[test]
    fn end_to_end_compile_empty_kernel() {
        let mut program = empty_kernel();
        let device = DeviceInfo::pvc();
        let binary = crate::compile(&mut program, &device).unwrap();
        assert!(binary.data.len() >= 5 * 4);
        assert_eq!(binary.metadata["k"].subgroup_size, 16);
    }

    #[test]
    fn end_to_end_constant_fold_and_dce() {
        // %c = constant 0 : i32; %d = add %c %c -- the body lowers empty.
        let mut program = Program::new();
        let i32_ty = program.scalar(ScalarKind::I32);
        let mut fun = Function::new("k");
        fun.subgroup_size = 16;
        fun.work_group_size = [16, 1];
        let c = push_const(&mut fun, i32_ty, ConstantValue::Int(0));
        let d = fun.make_value(i32_ty, None);
        let mut add = Inst::new(Operation::Binary(BinaryOp::Add), Span::default());
        add.operands = vec![c, c];
        add.results = vec![d];
        let add_h = fun.insts.append(add);
        fun.body.body.push(add_h);
        program.functions.push(fun);

        let device = DeviceInfo::pvc();
        assert!(crate::compile(&mut program, &device).is_ok());
        assert!(program.functions[0].body.body.is_empty());
    }
}
