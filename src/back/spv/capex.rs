//! Capability and extension inference.
//!
//! One post-order scan over the emitted module. Each instruction declares
//! its statically required capabilities; data-dependent rules inspect the
//! referenced type instructions (an atomic float add on f32 needs
//! `AtomicFloat32AddEXT`, a 64-bit atomic integer needs `Int64Atomics`).
//! Everything found is appended to the capability and extension sections
//! with the already-present entries acting as the dedup set.

use spirv::{Capability, Op};

use crate::back::spv::{instructions::*, Inst, Module, Operand, Section, SECTION_ORDER};
use crate::error::{CompileError, ErrorCode, Span};
use crate::{FastHashSet, Handle};

fn int_width(module: &Module, ty: Option<Handle<Inst>>) -> Option<u32> {
    let inst = module.get(ty?);
    if inst.op != Op::TypeInt {
        return None;
    }
    match inst.operands.first() {
        Some(&Operand::Literal(width)) => Some(width),
        _ => None,
    }
}

fn float_width(module: &Module, ty: Option<Handle<Inst>>) -> Option<u32> {
    let inst = module.get(ty?);
    if inst.op != Op::TypeFloat {
        return None;
    }
    match inst.operands.first() {
        Some(&Operand::Literal(width)) => Some(width),
        _ => None,
    }
}

/// The result type of the instruction an operand references.
fn operand_result_type(module: &Module, operand: Option<&Operand>) -> Option<Handle<Inst>> {
    match operand {
        Some(&Operand::Ref(target)) => module.get(target).result_type,
        _ => None,
    }
}

pub(super) fn infer(module: &mut Module) -> Result<(), CompileError> {
    let mut caps = Vec::new();
    let mut exts = Vec::new();

    for &section in SECTION_ORDER.iter() {
        for &handle in module.section(section) {
            scan(module, handle, &mut caps, &mut exts)?;
        }
    }

    let mut seen_caps: FastHashSet<u32> = module
        .section(Section::Capability)
        .iter()
        .filter_map(|&h| match module.get(h).operands.first() {
            Some(&Operand::Literal(cap)) => Some(cap),
            _ => None,
        })
        .collect();
    let mut seen_exts: FastHashSet<String> = module
        .section(Section::Extension)
        .iter()
        .filter_map(|&h| match module.get(h).operands.first() {
            Some(&Operand::String(ref name)) => Some(name.clone()),
            _ => None,
        })
        .collect();

    for cap in caps {
        if seen_caps.insert(cap as u32) {
            module.add(Section::Capability, instruction_capability(cap));
        }
    }
    for ext in exts {
        if seen_exts.insert(ext.to_string()) {
            module.add(Section::Extension, instruction_extension(ext));
        }
    }
    Ok(())
}

fn scan(
    module: &Module,
    handle: Handle<Inst>,
    caps: &mut Vec<Capability>,
    exts: &mut Vec<&'static str>,
) -> Result<(), CompileError> {
    let inst = module.get(handle);
    match inst.op {
        Op::AtomicStore => {
            let value_ty = operand_result_type(module, inst.operands.get(3));
            if int_width(module, value_ty) == Some(64) {
                caps.push(Capability::Int64Atomics);
            }
        }
        Op::AtomicIAdd | Op::AtomicSMin | Op::AtomicSMax => {
            if int_width(module, inst.result_type) == Some(64) {
                caps.push(Capability::Int64Atomics);
            }
        }
        Op::AtomicFAddEXT => match float_width(module, inst.result_type) {
            Some(16) => {
                caps.push(Capability::AtomicFloat16AddEXT);
                exts.push("SPV_EXT_shader_atomic_float16_add");
            }
            Some(32) => {
                caps.push(Capability::AtomicFloat32AddEXT);
                exts.push("SPV_EXT_shader_atomic_float_add");
            }
            Some(64) => {
                caps.push(Capability::AtomicFloat64AddEXT);
                exts.push("SPV_EXT_shader_atomic_float_add");
            }
            _ => {
                return Err(CompileError::new(
                    Span::default(),
                    ErrorCode::InternalCompilerError,
                ))
            }
        },
        Op::AtomicFMinEXT | Op::AtomicFMaxEXT => {
            match float_width(module, inst.result_type) {
                Some(16) => {
                    caps.push(Capability::AtomicFloat16MinMaxEXT);
                    exts.push("SPV_EXT_shader_atomic_float16_min_max");
                }
                Some(32) => {
                    caps.push(Capability::AtomicFloat32MinMaxEXT);
                    exts.push("SPV_EXT_shader_atomic_float_min_max");
                }
                Some(64) => {
                    caps.push(Capability::AtomicFloat64MinMaxEXT);
                    exts.push("SPV_EXT_shader_atomic_float_min_max");
                }
                _ => {
                    return Err(CompileError::new(
                        Span::default(),
                        ErrorCode::InternalCompilerError,
                    ))
                }
            }
        }
        Op::AsmTargetINTEL | Op::AsmINTEL | Op::AsmCallINTEL => {
            caps.push(Capability::AsmINTEL);
            exts.push("SPV_INTEL_inline_assembly");
        }
        Op::ConvertBF16ToFINTEL | Op::ConvertFToBF16INTEL => {
            caps.push(Capability::BFloat16ConversionINTEL);
            exts.push("SPV_INTEL_bfloat16_conversion");
        }
        Op::SubgroupBlockReadINTEL | Op::SubgroupBlockWriteINTEL => {
            caps.push(Capability::SubgroupBufferBlockIOINTEL);
            exts.push("SPV_INTEL_subgroups");
        }
        Op::GroupIAdd
        | Op::GroupFAdd
        | Op::GroupSMin
        | Op::GroupSMax
        | Op::GroupFMin
        | Op::GroupFMax
        | Op::GroupBroadcast => {
            caps.push(Capability::Groups);
        }
        Op::InBoundsPtrAccessChain | Op::PtrAccessChain => {
            caps.push(Capability::Addresses);
        }
        Op::TypeFloat => match inst.operands.first() {
            Some(&Operand::Literal(16)) => caps.push(Capability::Float16),
            Some(&Operand::Literal(64)) => caps.push(Capability::Float64),
            _ => {}
        },
        Op::TypeInt => match inst.operands.first() {
            Some(&Operand::Literal(8)) => caps.push(Capability::Int8),
            Some(&Operand::Literal(16)) => caps.push(Capability::Int16),
            Some(&Operand::Literal(64)) => caps.push(Capability::Int64),
            _ => {}
        },
        Op::TypeVector => {
            if let Some(&Operand::Literal(count)) = inst.operands.get(1) {
                if count > 4 {
                    caps.push(Capability::Vector16);
                }
            }
        }
        Op::EntryPoint => {
            if let Some(&Operand::Literal(model)) = inst.operands.first() {
                if model == spirv::ExecutionModel::Kernel as u32 {
                    caps.push(Capability::Kernel);
                }
            }
        }
        Op::ExecutionMode => {
            if let Some(&Operand::Literal(mode)) = inst.operands.get(1) {
                if mode == spirv::ExecutionMode::SubgroupSize as u32 {
                    caps.push(Capability::SubgroupDispatch);
                }
            }
        }
        Op::MemoryModel => {
            if let Some(&Operand::Literal(model)) = inst.operands.first() {
                if model == spirv::AddressingModel::Physical64 as u32 {
                    caps.push(Capability::Addresses);
                }
            }
            if let Some(&Operand::Literal(model)) = inst.operands.get(1) {
                if model == spirv::MemoryModel::OpenCL as u32 {
                    caps.push(Capability::Kernel);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::spv::instructions::*;

    #[test]
    fn infers_atomic_float_add() {
        let mut module = Module::new();
        let f32_ty = module.add(Section::TypeConstVar, instruction_type_float(32));
        let i32_ty = module.add(
            Section::TypeConstVar,
            instruction_type_int(32, Signedness::Unsigned),
        );
        let ptr_ty = module.add(
            Section::TypeConstVar,
            instruction_type_pointer(spirv::StorageClass::CrossWorkgroup, f32_ty),
        );
        let pointer = module.add(Section::Function, instruction_variable(ptr_ty, spirv::StorageClass::CrossWorkgroup));
        let scope = module.add(Section::TypeConstVar, instruction_constant_32bit(i32_ty, 2));
        let value = module.add(Section::TypeConstVar, instruction_constant_32bit(i32_ty, 0));
        module.add(
            Section::Function,
            instruction_atomic(Op::AtomicFAddEXT, f32_ty, pointer, scope, scope, value),
        );

        infer(&mut module).unwrap();
        let caps: Vec<u32> = module
            .section(Section::Capability)
            .iter()
            .filter_map(|&h| match module.get(h).operands.first() {
                Some(&Operand::Literal(cap)) => Some(cap),
                _ => None,
            })
            .collect();
        assert!(caps.contains(&(Capability::AtomicFloat32AddEXT as u32)));
        let exts: Vec<String> = module
            .section(Section::Extension)
            .iter()
            .filter_map(|&h| match module.get(h).operands.first() {
                Some(&Operand::String(ref s)) => Some(s.clone()),
                _ => None,
            })
            .collect();
        assert!(exts.contains(&"SPV_EXT_shader_atomic_float_add".to_string()));
    }

    #[test]
    fn inference_is_idempotent() {
        let mut module = Module::new();
        module.add(Section::TypeConstVar, instruction_type_int(64, Signedness::Unsigned));
        infer(&mut module).unwrap();
        let after_once = module.section(Section::Capability).len();
        infer(&mut module).unwrap();
        assert_eq!(module.section(Section::Capability).len(), after_once);
        assert_eq!(after_once, 1);
    }
}
