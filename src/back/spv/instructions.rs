use crate::back::spv::{helpers, Inst};
use crate::Handle;
use spirv::{Op, Word};

pub(super) enum Signedness {
    Unsigned = 0,
}

//
// Annotation Instructions
//

pub(super) fn instruction_decorate(
    target: Handle<Inst>,
    decoration: spirv::Decoration,
    operands: &[Word],
) -> Inst {
    let mut instruction = Inst::new(Op::Decorate);
    instruction.add_ref(target);
    instruction.add_operand(decoration as u32);

    for operand in operands {
        instruction.add_operand(*operand)
    }

    instruction
}

//
// Extension Instructions
//

pub(super) fn instruction_capability(capability: spirv::Capability) -> Inst {
    let mut instruction = Inst::new(Op::Capability);
    instruction.add_operand(capability as u32);
    instruction
}

pub(super) fn instruction_extension(name: &str) -> Inst {
    let mut instruction = Inst::new(Op::Extension);
    instruction.add_string(name);
    instruction
}

pub(super) fn instruction_ext_inst_import(name: &str) -> Inst {
    let mut instruction = Inst::new(Op::ExtInstImport);
    instruction.set_result();
    instruction.add_string(name);
    instruction
}

pub(super) fn instruction_ext_inst(
    result_type: Handle<Inst>,
    set: Handle<Inst>,
    entry_point: u32,
    arguments: &[Handle<Inst>],
) -> Inst {
    let mut instruction = Inst::new(Op::ExtInst);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction.add_ref(set);
    instruction.add_operand(entry_point);
    for argument in arguments {
        instruction.add_ref(*argument);
    }
    instruction
}

//
// Mode-Setting Instructions
//

pub(super) fn instruction_memory_model(
    addressing_model: spirv::AddressingModel,
    memory_model: spirv::MemoryModel,
) -> Inst {
    let mut instruction = Inst::new(Op::MemoryModel);
    instruction.add_operand(addressing_model as u32);
    instruction.add_operand(memory_model as u32);
    instruction
}

pub(super) fn instruction_entry_point(
    execution_model: spirv::ExecutionModel,
    entry_point: Handle<Inst>,
    name: &str,
    interface: &[Handle<Inst>],
) -> Inst {
    let mut instruction = Inst::new(Op::EntryPoint);
    instruction.add_operand(execution_model as u32);
    instruction.add_ref(entry_point);
    instruction.add_string(name);

    for var in interface {
        instruction.add_ref(*var);
    }

    instruction
}

pub(super) fn instruction_execution_mode(
    entry_point: Handle<Inst>,
    execution_mode: spirv::ExecutionMode,
    operands: &[Word],
) -> Inst {
    let mut instruction = Inst::new(Op::ExecutionMode);
    instruction.add_ref(entry_point);
    instruction.add_operand(execution_mode as u32);
    for operand in operands {
        instruction.add_operand(*operand);
    }
    instruction
}

//
// Type-Declaration Instructions
//

pub(super) fn instruction_type_void() -> Inst {
    let mut instruction = Inst::new(Op::TypeVoid);
    instruction.set_result();
    instruction
}

pub(super) fn instruction_type_bool() -> Inst {
    let mut instruction = Inst::new(Op::TypeBool);
    instruction.set_result();
    instruction
}

pub(super) fn instruction_type_int(width: Word, signedness: Signedness) -> Inst {
    let mut instruction = Inst::new(Op::TypeInt);
    instruction.set_result();
    instruction.add_operand(width);
    instruction.add_operand(signedness as u32);
    instruction
}

pub(super) fn instruction_type_float(width: Word) -> Inst {
    let mut instruction = Inst::new(Op::TypeFloat);
    instruction.set_result();
    instruction.add_operand(width);
    instruction
}

pub(super) fn instruction_type_vector(
    component_type: Handle<Inst>,
    component_count: Word,
) -> Inst {
    let mut instruction = Inst::new(Op::TypeVector);
    instruction.set_result();
    instruction.add_ref(component_type);
    instruction.add_operand(component_count);
    instruction
}

pub(super) fn instruction_type_array(element_type: Handle<Inst>, length: Handle<Inst>) -> Inst {
    let mut instruction = Inst::new(Op::TypeArray);
    instruction.set_result();
    instruction.add_ref(element_type);
    instruction.add_ref(length);
    instruction
}

pub(super) fn instruction_type_pointer(
    storage_class: spirv::StorageClass,
    pointee: Handle<Inst>,
) -> Inst {
    let mut instruction = Inst::new(Op::TypePointer);
    instruction.set_result();
    instruction.add_operand(storage_class as u32);
    instruction.add_ref(pointee);
    instruction
}

pub(super) fn instruction_type_function(
    return_type: Handle<Inst>,
    parameter_types: &[Handle<Inst>],
) -> Inst {
    let mut instruction = Inst::new(Op::TypeFunction);
    instruction.set_result();
    instruction.add_ref(return_type);

    for parameter_type in parameter_types {
        instruction.add_ref(*parameter_type);
    }

    instruction
}

//
// Constant-Creation Instructions
//

pub(super) fn instruction_constant_true(result_type: Handle<Inst>) -> Inst {
    let mut instruction = Inst::new(Op::ConstantTrue);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction
}

pub(super) fn instruction_constant_false(result_type: Handle<Inst>) -> Inst {
    let mut instruction = Inst::new(Op::ConstantFalse);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction
}

pub(super) fn instruction_constant_32bit(result_type: Handle<Inst>, value: Word) -> Inst {
    let mut instruction = Inst::new(Op::Constant);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction.add_operand(value);
    instruction
}

pub(super) fn instruction_constant_64bit(result_type: Handle<Inst>, value: u64) -> Inst {
    let mut instruction = Inst::new(Op::Constant);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction.add_wide(value);
    instruction
}

pub(super) fn instruction_constant_composite(
    result_type: Handle<Inst>,
    constituents: &[Handle<Inst>],
) -> Inst {
    let mut instruction = Inst::new(Op::ConstantComposite);
    instruction.set_type(result_type);
    instruction.set_result();

    for constituent in constituents {
        instruction.add_ref(*constituent);
    }

    instruction
}

pub(super) fn instruction_constant_null(result_type: Handle<Inst>) -> Inst {
    let mut instruction = Inst::new(Op::ConstantNull);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction
}

//
// Memory Instructions
//

pub(super) fn instruction_variable(
    result_type: Handle<Inst>,
    storage_class: spirv::StorageClass,
) -> Inst {
    let mut instruction = Inst::new(Op::Variable);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction.add_operand(storage_class as u32);
    instruction
}

pub(super) fn instruction_load(result_type: Handle<Inst>, pointer: Handle<Inst>) -> Inst {
    let mut instruction = Inst::new(Op::Load);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction.add_ref(pointer);
    instruction
}

pub(super) fn instruction_load_aligned(
    result_type: Handle<Inst>,
    pointer: Handle<Inst>,
    alignment: Word,
) -> Inst {
    let mut instruction = instruction_load(result_type, pointer);
    instruction.add_operand(spirv::MemoryAccess::ALIGNED.bits());
    instruction.add_operand(alignment);
    instruction
}

pub(super) fn instruction_store(pointer: Handle<Inst>, object: Handle<Inst>) -> Inst {
    let mut instruction = Inst::new(Op::Store);
    instruction.add_ref(pointer);
    instruction.add_ref(object);
    instruction
}

pub(super) fn instruction_in_bounds_access_chain(
    result_type: Handle<Inst>,
    base: Handle<Inst>,
    indices: &[Handle<Inst>],
) -> Inst {
    let mut instruction = Inst::new(Op::InBoundsAccessChain);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction.add_ref(base);
    for index in indices {
        instruction.add_ref(*index);
    }
    instruction
}

pub(super) fn instruction_in_bounds_ptr_access_chain(
    result_type: Handle<Inst>,
    base: Handle<Inst>,
    element: Handle<Inst>,
) -> Inst {
    let mut instruction = Inst::new(Op::InBoundsPtrAccessChain);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction.add_ref(base);
    instruction.add_ref(element);
    instruction
}

//
// Function Instructions
//

pub(super) fn instruction_function(
    return_type: Handle<Inst>,
    function_control: spirv::FunctionControl,
    function_type: Handle<Inst>,
) -> Inst {
    let mut instruction = Inst::new(Op::Function);
    instruction.set_type(return_type);
    instruction.set_result();
    instruction.add_operand(function_control.bits());
    instruction.add_ref(function_type);
    instruction
}

pub(super) fn instruction_function_parameter(result_type: Handle<Inst>) -> Inst {
    let mut instruction = Inst::new(Op::FunctionParameter);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction
}

pub(super) fn instruction_function_end() -> Inst {
    Inst::new(Op::FunctionEnd)
}

//
// Composite Instructions
//

pub(super) fn instruction_composite_extract(
    result_type: Handle<Inst>,
    composite: Handle<Inst>,
    indices: &[Word],
) -> Inst {
    let mut instruction = Inst::new(Op::CompositeExtract);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction.add_ref(composite);
    for index in indices {
        instruction.add_operand(*index);
    }
    instruction
}

pub(super) fn instruction_composite_insert(
    result_type: Handle<Inst>,
    object: Handle<Inst>,
    composite: Handle<Inst>,
    indices: &[Word],
) -> Inst {
    let mut instruction = Inst::new(Op::CompositeInsert);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction.add_ref(object);
    instruction.add_ref(composite);
    for index in indices {
        instruction.add_operand(*index);
    }
    instruction
}

pub(super) fn instruction_composite_construct(
    result_type: Handle<Inst>,
    constituents: &[Handle<Inst>],
) -> Inst {
    let mut instruction = Inst::new(Op::CompositeConstruct);
    instruction.set_type(result_type);
    instruction.set_result();
    for constituent in constituents {
        instruction.add_ref(*constituent);
    }
    instruction
}

//
// Arithmetic, Conversion, Relational Instructions
//

/// Unary and binary value instructions share one shape: type, result, then
/// operand references.
pub(super) fn instruction_value(
    op: Op,
    result_type: Handle<Inst>,
    operands: &[Handle<Inst>],
) -> Inst {
    let mut instruction = Inst::new(op);
    instruction.set_type(result_type);
    instruction.set_result();
    for operand in operands {
        instruction.add_ref(*operand);
    }
    instruction
}

//
// Control-Flow Instructions
//

pub(super) fn instruction_label() -> Inst {
    let mut instruction = Inst::new(Op::Label);
    instruction.set_result();
    instruction
}

pub(super) fn instruction_selection_merge(merge: Handle<Inst>) -> Inst {
    let mut instruction = Inst::new(Op::SelectionMerge);
    instruction.add_ref(merge);
    instruction.add_operand(spirv::SelectionControl::NONE.bits());
    instruction
}

pub(super) fn instruction_loop_merge(merge: Handle<Inst>, continuing: Handle<Inst>) -> Inst {
    let mut instruction = Inst::new(Op::LoopMerge);
    instruction.add_ref(merge);
    instruction.add_ref(continuing);
    instruction.add_operand(spirv::LoopControl::NONE.bits());
    instruction
}

pub(super) fn instruction_branch(target: Handle<Inst>) -> Inst {
    let mut instruction = Inst::new(Op::Branch);
    instruction.add_ref(target);
    instruction
}

pub(super) fn instruction_branch_conditional(
    condition: Handle<Inst>,
    true_label: Handle<Inst>,
    false_label: Handle<Inst>,
) -> Inst {
    let mut instruction = Inst::new(Op::BranchConditional);
    instruction.add_ref(condition);
    instruction.add_ref(true_label);
    instruction.add_ref(false_label);
    instruction
}

pub(super) fn instruction_return() -> Inst {
    Inst::new(Op::Return)
}

//
// Atomic Instructions
//

pub(super) fn instruction_atomic_store(
    pointer: Handle<Inst>,
    scope: Handle<Inst>,
    semantics: Handle<Inst>,
    value: Handle<Inst>,
) -> Inst {
    let mut instruction = Inst::new(Op::AtomicStore);
    instruction.add_ref(pointer);
    instruction.add_ref(scope);
    instruction.add_ref(semantics);
    instruction.add_ref(value);
    instruction
}

pub(super) fn instruction_atomic(
    op: Op,
    result_type: Handle<Inst>,
    pointer: Handle<Inst>,
    scope: Handle<Inst>,
    semantics: Handle<Inst>,
    value: Handle<Inst>,
) -> Inst {
    let mut instruction = Inst::new(op);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction.add_ref(pointer);
    instruction.add_ref(scope);
    instruction.add_ref(semantics);
    instruction.add_ref(value);
    instruction
}

pub(super) fn instruction_control_barrier(
    execution: Handle<Inst>,
    memory: Handle<Inst>,
    semantics: Handle<Inst>,
) -> Inst {
    let mut instruction = Inst::new(Op::ControlBarrier);
    instruction.add_ref(execution);
    instruction.add_ref(memory);
    instruction.add_ref(semantics);
    instruction
}

//
// Group Instructions
//

pub(super) fn instruction_group_broadcast(
    result_type: Handle<Inst>,
    scope: Handle<Inst>,
    value: Handle<Inst>,
    local_id: Handle<Inst>,
) -> Inst {
    let mut instruction = Inst::new(Op::GroupBroadcast);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction.add_ref(scope);
    instruction.add_ref(value);
    instruction.add_ref(local_id);
    instruction
}

pub(super) fn instruction_group_operation(
    op: Op,
    result_type: Handle<Inst>,
    scope: Handle<Inst>,
    group_operation: spirv::GroupOperation,
    operand: Handle<Inst>,
) -> Inst {
    let mut instruction = Inst::new(op);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction.add_ref(scope);
    instruction.add_operand(group_operation as u32);
    instruction.add_ref(operand);
    instruction
}

//
// Inline Assembly Instructions
//

pub(super) fn instruction_asm_target(target: &str) -> Inst {
    let mut instruction = Inst::new(Op::AsmTargetINTEL);
    instruction.set_result();
    instruction.add_string(target);
    instruction
}

pub(super) fn instruction_asm(
    result_type: Handle<Inst>,
    asm_type: Handle<Inst>,
    target: Handle<Inst>,
    code: &str,
    constraints: &str,
) -> Inst {
    let mut instruction = Inst::new(Op::AsmINTEL);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction.add_ref(asm_type);
    instruction.add_ref(target);
    instruction.add_string(code);
    instruction.add_string(constraints);
    instruction
}

pub(super) fn instruction_asm_call(
    result_type: Handle<Inst>,
    asm: Handle<Inst>,
    arguments: &[Handle<Inst>],
) -> Inst {
    let mut instruction = Inst::new(Op::AsmCallINTEL);
    instruction.set_type(result_type);
    instruction.set_result();
    instruction.add_ref(asm);
    for argument in arguments {
        instruction.add_ref(*argument);
    }
    instruction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::spv::{Module, Section};

    struct SpecRequirements {
        op: Op,
        wc: u32,
        type_id: bool,
        result_id: bool,
        operands: bool,
    }

    fn validate_spec_requirements(requirements: SpecRequirements, instruction: &Inst) {
        assert_eq!(requirements.op, instruction.op);
        assert_eq!(requirements.wc, instruction.word_count());
        assert_eq!(requirements.type_id, instruction.result_type.is_some());
        assert_eq!(requirements.result_id, instruction.has_result);
        assert_eq!(requirements.operands, !instruction.operands.is_empty());
    }

    fn dummy_ref() -> (Module, Handle<Inst>) {
        let mut module = Module::new();
        let handle = module.add(Section::TypeConstVar, instruction_type_void());
        (module, handle)
    }

    #[test]
    fn test_instruction_capability() {
        let instruction = instruction_capability(spirv::Capability::Kernel);
        validate_spec_requirements(
            SpecRequirements {
                op: Op::Capability,
                wc: 2,
                type_id: false,
                result_id: false,
                operands: true,
            },
            &instruction,
        );
    }

    #[test]
    fn test_instruction_extension() {
        let instruction = instruction_extension("SPV_INTEL_inline_assembly");
        validate_spec_requirements(
            SpecRequirements {
                op: Op::Extension,
                wc: 1 + 7,
                type_id: false,
                result_id: false,
                operands: true,
            },
            &instruction,
        );
    }

    #[test]
    fn test_instruction_ext_inst_import() {
        let instruction = instruction_ext_inst_import("OpenCL.std");
        validate_spec_requirements(
            SpecRequirements {
                op: Op::ExtInstImport,
                wc: 2 + 3,
                type_id: false,
                result_id: true,
                operands: true,
            },
            &instruction,
        );
    }

    #[test]
    fn test_instruction_memory_model() {
        let instruction = instruction_memory_model(
            spirv::AddressingModel::Physical64,
            spirv::MemoryModel::OpenCL,
        );
        validate_spec_requirements(
            SpecRequirements {
                op: Op::MemoryModel,
                wc: 3,
                type_id: false,
                result_id: false,
                operands: true,
            },
            &instruction,
        );
    }

    #[test]
    fn test_instruction_entry_point() {
        let (_module, fun) = dummy_ref();
        let instruction =
            instruction_entry_point(spirv::ExecutionModel::Kernel, fun, "main", &[]);
        validate_spec_requirements(
            SpecRequirements {
                op: Op::EntryPoint,
                wc: 3 + 2,
                type_id: false,
                result_id: false,
                operands: true,
            },
            &instruction,
        );
    }

    #[test]
    fn test_instruction_execution_mode() {
        let (_module, fun) = dummy_ref();
        let instruction =
            instruction_execution_mode(fun, spirv::ExecutionMode::LocalSize, &[16, 1, 1]);
        validate_spec_requirements(
            SpecRequirements {
                op: Op::ExecutionMode,
                wc: 6,
                type_id: false,
                result_id: false,
                operands: true,
            },
            &instruction,
        );
    }

    #[test]
    fn test_instruction_type_int() {
        let instruction = instruction_type_int(32, Signedness::Unsigned);
        validate_spec_requirements(
            SpecRequirements {
                op: Op::TypeInt,
                wc: 4,
                type_id: false,
                result_id: true,
                operands: true,
            },
            &instruction,
        );
    }

    #[test]
    fn test_instruction_type_float() {
        let instruction = instruction_type_float(32);
        validate_spec_requirements(
            SpecRequirements {
                op: Op::TypeFloat,
                wc: 3,
                type_id: false,
                result_id: true,
                operands: true,
            },
            &instruction,
        );
    }

    #[test]
    fn test_instruction_type_pointer() {
        let (_module, pointee) = dummy_ref();
        let instruction =
            instruction_type_pointer(spirv::StorageClass::CrossWorkgroup, pointee);
        validate_spec_requirements(
            SpecRequirements {
                op: Op::TypePointer,
                wc: 4,
                type_id: false,
                result_id: true,
                operands: true,
            },
            &instruction,
        );
    }

    #[test]
    fn test_instruction_constant_64bit() {
        let (_module, ty) = dummy_ref();
        let instruction = instruction_constant_64bit(ty, 0x0123_4567_89ab_cdef);
        validate_spec_requirements(
            SpecRequirements {
                op: Op::Constant,
                wc: 5,
                type_id: true,
                result_id: true,
                operands: true,
            },
            &instruction,
        );
    }

    #[test]
    fn test_instruction_asm() {
        let (mut module, ty) = dummy_ref();
        let target = module.add(Section::TypeConstVar, instruction_asm_target("test"));
        let instruction = instruction_asm(ty, ty, target, "{\n}\n", "=rw,rw");
        validate_spec_requirements(
            SpecRequirements {
                op: Op::AsmINTEL,
                wc: 3 + 1 + 1 + 2 + 2,
                type_id: true,
                result_id: true,
                operands: true,
            },
            &instruction,
        );
    }

    #[test]
    fn test_instruction_label_and_branch() {
        let (mut module, _) = dummy_ref();
        let label = module.reserve(instruction_label());
        let branch = instruction_branch(label);
        validate_spec_requirements(
            SpecRequirements {
                op: Op::Branch,
                wc: 2,
                type_id: false,
                result_id: false,
                operands: true,
            },
            &branch,
        );
        validate_spec_requirements(
            SpecRequirements {
                op: Op::Label,
                wc: 2,
                type_id: false,
                result_id: true,
                operands: false,
            },
            module.get(label),
        );
    }
}
