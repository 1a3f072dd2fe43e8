//! Memoized creation of SPIR-V types, constants, built-in variables,
//! imported instruction sets, capabilities and extensions.
//!
//! Every lookup either returns the existing instruction or creates one in
//! the right section, guaranteeing a single definition per structural key.

use spirv::{BuiltIn, StorageClass, Word};

use crate::back::spv::{helpers, instructions::*, Inst as SpvInst, Section};
use crate::error::CompileError;
use crate::{AddressSpace, ConstantValue, Handle, ScalarKind};

use super::writer::Writer;

pub(super) fn storage_class(space: AddressSpace) -> StorageClass {
    match space {
        AddressSpace::Global => StorageClass::CrossWorkgroup,
        AddressSpace::Local => StorageClass::Workgroup,
    }
}

impl<'a> Writer<'a> {
    pub fn capability(&mut self, capability: spirv::Capability) {
        if self.capabilities.insert(capability) {
            self.module
                .add(Section::Capability, instruction_capability(capability));
        }
    }

    pub fn extension(&mut self, name: &'static str) {
        if self.extensions.insert(name) {
            self.module
                .add(Section::Extension, instruction_extension(name));
        }
    }

    pub fn void_ty(&mut self) -> Handle<SpvInst> {
        match self.lookup_void {
            Some(ty) => ty,
            None => {
                let ty = self.module.add(Section::TypeConstVar, instruction_type_void());
                self.lookup_void = Some(ty);
                ty
            }
        }
    }

    pub fn bool_ty(&mut self) -> Handle<SpvInst> {
        match self.lookup_bool {
            Some(ty) => ty,
            None => {
                let ty = self.module.add(Section::TypeConstVar, instruction_type_bool());
                self.lookup_bool = Some(ty);
                ty
            }
        }
    }

    pub fn bool2_ty(&mut self) -> Handle<SpvInst> {
        let bool_ty = self.bool_ty();
        self.vector_ty(bool_ty, 2)
    }

    pub fn index3_ty(&mut self) -> Handle<SpvInst> {
        let index_ty = self.scalar_ty(ScalarKind::Index);
        self.vector_ty(index_ty, 3)
    }

    /// The canonical key a scalar kind is interned under: `index` resolves
    /// to its configured width and `bf16` to its 16-bit storage integer.
    pub(super) fn canonical(&self, kind: ScalarKind) -> ScalarKind {
        match kind {
            ScalarKind::Index => {
                if self.program.index_width == 8 {
                    ScalarKind::I64
                } else {
                    ScalarKind::I32
                }
            }
            ScalarKind::BF16 => ScalarKind::I16,
            other => other,
        }
    }

    pub fn scalar_ty(&mut self, kind: ScalarKind) -> Handle<SpvInst> {
        let kind = self.canonical(kind);
        if let Some(&ty) = self.lookup_scalar.get(&kind) {
            return ty;
        }
        let ty = match kind {
            ScalarKind::I8 => {
                self.capability(spirv::Capability::Int8);
                self.module.add(
                    Section::TypeConstVar,
                    instruction_type_int(8, Signedness::Unsigned),
                )
            }
            ScalarKind::I16 => {
                self.capability(spirv::Capability::Int16);
                self.module.add(
                    Section::TypeConstVar,
                    instruction_type_int(16, Signedness::Unsigned),
                )
            }
            ScalarKind::I32 => self.module.add(
                Section::TypeConstVar,
                instruction_type_int(32, Signedness::Unsigned),
            ),
            ScalarKind::I64 => {
                self.capability(spirv::Capability::Int64);
                self.module.add(
                    Section::TypeConstVar,
                    instruction_type_int(64, Signedness::Unsigned),
                )
            }
            ScalarKind::F16 => {
                self.capability(spirv::Capability::Float16);
                self.module
                    .add(Section::TypeConstVar, instruction_type_float(16))
            }
            ScalarKind::F32 => self
                .module
                .add(Section::TypeConstVar, instruction_type_float(32)),
            ScalarKind::F64 => {
                self.capability(spirv::Capability::Float64);
                self.module
                    .add(Section::TypeConstVar, instruction_type_float(64))
            }
            ScalarKind::C32 => {
                let float_ty = self.scalar_ty(ScalarKind::F32);
                return self.vector_ty_under(ScalarKind::C32, float_ty, 2);
            }
            ScalarKind::C64 => {
                let float_ty = self.scalar_ty(ScalarKind::F64);
                return self.vector_ty_under(ScalarKind::C64, float_ty, 2);
            }
            ScalarKind::Index | ScalarKind::BF16 => unreachable!("canonicalized"),
        };
        self.lookup_scalar.insert(kind, ty);
        ty
    }

    fn vector_ty_under(
        &mut self,
        kind: ScalarKind,
        component: Handle<SpvInst>,
        count: u32,
    ) -> Handle<SpvInst> {
        let ty = self.vector_ty(component, count);
        self.lookup_scalar.insert(kind, ty);
        ty
    }

    pub fn vector_ty(&mut self, component: Handle<SpvInst>, count: u32) -> Handle<SpvInst> {
        if let Some(&ty) = self.lookup_vector.get(&(component, count)) {
            return ty;
        }
        let ty = self.module.add(
            Section::TypeConstVar,
            instruction_type_vector(component, count),
        );
        self.lookup_vector.insert((component, count), ty);
        ty
    }

    pub fn pointer_ty(
        &mut self,
        class: StorageClass,
        pointee: Handle<SpvInst>,
        alignment: u32,
    ) -> Handle<SpvInst> {
        if let Some(&ty) = self.lookup_pointer.get(&(class, pointee, alignment)) {
            return ty;
        }
        let ty = self
            .module
            .add(Section::TypeConstVar, instruction_type_pointer(class, pointee));
        self.module.add(
            Section::Decoration,
            instruction_decorate(ty, spirv::Decoration::Alignment, &[alignment]),
        );
        self.lookup_pointer.insert((class, pointee, alignment), ty);
        ty
    }

    /// Void-returning function type over the given parameters.
    pub fn function_ty(
        &mut self,
        params: &[Handle<SpvInst>],
    ) -> Result<Handle<SpvInst>, CompileError> {
        if let Some(&ty) = self.lookup_function_type.get(params) {
            return Ok(ty);
        }
        let void_ty = self.void_ty();
        let ty = self.module.add(
            Section::TypeConstVar,
            instruction_type_function(void_ty, params),
        );
        self.lookup_function_type.insert(params.to_vec(), ty);
        Ok(ty)
    }

    /// Function type with an explicit return type, used by inline-assembly
    /// declarations.
    pub fn asm_function_ty(
        &mut self,
        return_ty: Handle<SpvInst>,
        params: &[Handle<SpvInst>],
    ) -> Handle<SpvInst> {
        let mut key = Vec::with_capacity(params.len() + 2);
        key.push(return_ty);
        key.extend_from_slice(params);
        if let Some(&ty) = self.lookup_function_type.get(&key) {
            return ty;
        }
        let ty = self.module.add(
            Section::TypeConstVar,
            instruction_type_function(return_ty, params),
        );
        self.lookup_function_type.insert(key, ty);
        ty
    }

    /// SPIR-V type of an IR type.
    pub fn spv_ty(&mut self, ty: Handle<crate::Type>) -> Result<Handle<SpvInst>, CompileError> {
        let index_width = self.program.index_width;
        match self.program.types[ty] {
            crate::Type::Void => Ok(self.void_ty()),
            crate::Type::Bool => Ok(self.bool_ty()),
            crate::Type::Scalar(kind) => Ok(self.scalar_ty(kind)),
            crate::Type::Memref { element, space, .. } => {
                let class = storage_class(space);
                let element_ty = self.scalar_ty(element);
                let align = element.alignment(index_width) as u32;
                Ok(self.pointer_ty(class, element_ty, align))
            }
            crate::Type::Group { element, .. } => {
                let pointee = self.spv_ty(element)?;
                Ok(self.pointer_ty(StorageClass::CrossWorkgroup, pointee, 8))
            }
            crate::Type::Coopmatrix { component, .. } => Ok(self.scalar_ty(component)),
        }
    }

    // ------------------------------------------------------------------
    // Constants
    // ------------------------------------------------------------------

    pub fn bool_constant(&mut self, value: bool) -> Handle<SpvInst> {
        let bool_ty = self.bool_ty();
        if value {
            match self.bool_true {
                Some(c) => c,
                None => {
                    let c = self
                        .module
                        .add(Section::TypeConstVar, instruction_constant_true(bool_ty));
                    self.bool_true = Some(c);
                    c
                }
            }
        } else {
            match self.bool_false {
                Some(c) => c,
                None => {
                    let c = self
                        .module
                        .add(Section::TypeConstVar, instruction_constant_false(bool_ty));
                    self.bool_false = Some(c);
                    c
                }
            }
        }
    }

    /// Interns a scalar constant by its bit pattern.
    fn constant_bits(&mut self, kind: ScalarKind, bits: u64) -> Handle<SpvInst> {
        let canonical = self.canonical(kind);
        if let Some(&c) = self.lookup_constant.get(&(canonical, bits)) {
            return c;
        }
        let ty = self.scalar_ty(canonical);
        let wide = canonical.size(self.program.index_width) == 8;
        let inst = if wide {
            instruction_constant_64bit(ty, bits)
        } else {
            instruction_constant_32bit(ty, bits as Word)
        };
        let c = self.module.add(Section::TypeConstVar, inst);
        self.lookup_constant.insert((canonical, bits), c);
        c
    }

    pub fn i32_constant(&mut self, value: i32) -> Handle<SpvInst> {
        self.constant_bits(ScalarKind::I32, value as u32 as u64)
    }

    pub fn index_constant(&mut self, value: i64) -> Handle<SpvInst> {
        if self.program.index_width == 8 {
            self.constant_bits(ScalarKind::Index, value as u64)
        } else {
            self.constant_bits(ScalarKind::Index, value as i32 as u32 as u64)
        }
    }

    /// Typed constant for a literal, or `None` when the literal does not
    /// fit the scalar kind.
    pub fn make_constant(
        &mut self,
        kind: ScalarKind,
        value: ConstantValue,
    ) -> Option<Handle<SpvInst>> {
        match value {
            ConstantValue::Bool(_) => None,
            ConstantValue::Int(i) => {
                let bits = match kind {
                    ScalarKind::I8 => i as i8 as u8 as u64,
                    ScalarKind::I16 => i as i16 as u16 as u64,
                    ScalarKind::I32 => i as i32 as u32 as u64,
                    ScalarKind::I64 => i as u64,
                    ScalarKind::Index => {
                        return Some(self.index_constant(i));
                    }
                    _ => return None,
                };
                Some(self.constant_bits(kind, bits))
            }
            ConstantValue::Float(f) => {
                let bits = match kind {
                    ScalarKind::F16 => helpers::f16_bits(f) as u64,
                    ScalarKind::BF16 => helpers::bf16_bits(f) as u64,
                    ScalarKind::F32 => (f as f32).to_bits() as u64,
                    ScalarKind::F64 => f.to_bits(),
                    _ => return None,
                };
                Some(self.constant_bits(kind, bits))
            }
            ConstantValue::Complex([re, im]) => {
                let element = match kind {
                    ScalarKind::C32 => ScalarKind::F32,
                    ScalarKind::C64 => ScalarKind::F64,
                    _ => return None,
                };
                let (re_bits, im_bits) = if element == ScalarKind::F32 {
                    ((re as f32).to_bits() as u64, (im as f32).to_bits() as u64)
                } else {
                    (re.to_bits(), im.to_bits())
                };
                let ty = self.scalar_ty(kind);
                if let Some(&c) = self.lookup_composite.get(&(ty, re_bits, im_bits)) {
                    return Some(c);
                }
                let re_c = self.constant_bits(element, re_bits);
                let im_c = self.constant_bits(element, im_bits);
                let c = self.module.add(
                    Section::TypeConstVar,
                    instruction_constant_composite(ty, &[re_c, im_c]),
                );
                self.lookup_composite.insert((ty, re_bits, im_bits), c);
                Some(c)
            }
        }
    }

    pub fn null_constant(&mut self, ty: Handle<SpvInst>) -> Handle<SpvInst> {
        if let Some(&c) = self.lookup_null.get(&ty) {
            return c;
        }
        let c = self
            .module
            .add(Section::TypeConstVar, instruction_constant_null(ty));
        self.lookup_null.insert(ty, c);
        c
    }

    // ------------------------------------------------------------------
    // Imports and built-ins
    // ------------------------------------------------------------------

    pub fn opencl_ext(&mut self) -> Handle<SpvInst> {
        match self.opencl_ext {
            Some(set) => set,
            None => {
                let set = self.module.add(
                    Section::ExtInstImport,
                    instruction_ext_inst_import("OpenCL.std"),
                );
                self.opencl_ext = Some(set);
                set
            }
        }
    }

    pub fn ext_inst(
        &mut self,
        result_ty: Handle<SpvInst>,
        entry_point: u32,
        arguments: &[Handle<SpvInst>],
    ) -> Result<Handle<SpvInst>, CompileError> {
        let set = self.opencl_ext();
        Ok(self.emit(instruction_ext_inst(result_ty, set, entry_point, arguments)))
    }

    pub fn asm_target(&mut self) -> Handle<SpvInst> {
        match self.asm_target {
            Some(target) => target,
            None => {
                let target = self.module.add(
                    Section::TypeConstVar,
                    instruction_asm_target("spirv64-unknown-unknown"),
                );
                self.asm_target = Some(target);
                target
            }
        }
    }

    pub fn builtin_pointee_ty(&mut self, builtin: BuiltIn) -> Handle<SpvInst> {
        match builtin {
            BuiltIn::SubgroupSize
            | BuiltIn::SubgroupMaxSize
            | BuiltIn::NumSubgroups
            | BuiltIn::SubgroupId
            | BuiltIn::SubgroupLocalInvocationId => self.scalar_ty(ScalarKind::I32),
            _ => self.index3_ty(),
        }
    }

    pub fn builtin_alignment(&self, builtin: BuiltIn) -> u32 {
        let index_width = self.program.index_width as u32;
        match builtin {
            BuiltIn::SubgroupSize
            | BuiltIn::SubgroupMaxSize
            | BuiltIn::NumSubgroups
            | BuiltIn::SubgroupId
            | BuiltIn::SubgroupLocalInvocationId => 4,
            // Three-component vectors align like four-component ones.
            _ => index_width * 4,
        }
    }

    pub fn builtin_var(&mut self, builtin: BuiltIn) -> Handle<SpvInst> {
        if let Some(&var) = self.lookup_builtin.get(&builtin) {
            return var;
        }
        let pointee = self.builtin_pointee_ty(builtin);
        let alignment = self.builtin_alignment(builtin);
        let pointer_ty = self.pointer_ty(StorageClass::Input, pointee, alignment);
        let var = self.module.add(
            Section::TypeConstVar,
            instruction_variable(pointer_ty, StorageClass::Input),
        );
        self.module.add(
            Section::Decoration,
            instruction_decorate(var, spirv::Decoration::Constant, &[]),
        );
        self.module.add(
            Section::Decoration,
            instruction_decorate(var, spirv::Decoration::BuiltIn, &[builtin as Word]),
        );
        self.lookup_builtin.insert(builtin, var);
        var
    }

    /// Loads a built-in variable with its natural pointee type.
    pub fn load_builtin(&mut self, builtin: BuiltIn) -> Result<Handle<SpvInst>, CompileError> {
        let var = self.builtin_var(builtin);
        if !self.builtins_used.contains(&var) {
            self.builtins_used.push(var);
        }
        let pointee = self.builtin_pointee_ty(builtin);
        let alignment = self.builtin_alignment(builtin);
        Ok(self.emit(instruction_load_aligned(pointee, var, alignment)))
    }
}
