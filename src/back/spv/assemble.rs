//! Id assignment and binary emission.
//!
//! Two linear passes over the module. The first hands out monotonically
//! increasing result ids in section order; an operand naming an instruction
//! that has no id yet is only tolerated for `OpFunction`, `OpVariable`,
//! `OpLabel` and `OpTypePointer` targets, and for the operands of `OpPhi`,
//! which are declared eagerly. The second pass serializes every instruction
//! as `(word count << 16) | opcode` followed by type id, result id and
//! operand words.

use spirv::{Op, Word};

use crate::back::spv::{helpers, Inst, Module, Operand, SECTION_ORDER};
use crate::error::{CompileError, ErrorCode, Span};
use crate::Handle;

/// Result ids per instruction; zero means "no id assigned".
#[derive(Debug)]
pub(super) struct IdMap {
    ids: Vec<Word>,
    next: Word,
}

impl IdMap {
    fn new(len: usize) -> Self {
        IdMap {
            ids: vec![0; len],
            next: 1,
        }
    }

    pub(super) fn get(&self, inst: Handle<Inst>) -> Word {
        self.ids[inst.index()]
    }

    fn declare(&mut self, inst: Handle<Inst>) {
        if self.ids[inst.index()] == 0 {
            self.ids[inst.index()] = self.next;
            self.next += 1;
        }
    }

    fn bound(&self) -> Word {
        self.next
    }
}

fn forward_reference_allowed(op: Op) -> bool {
    // AsmINTEL joins the classic set so the decoration section may name
    // inline-assembly declarations from the later type/const/var section.
    matches!(
        op,
        Op::Function | Op::Variable | Op::Label | Op::TypePointer | Op::AsmINTEL
    )
}

/// Assigns ids to every result-producing instruction and records the bound.
pub(super) fn assign_ids(module: &mut Module) -> Result<IdMap, CompileError> {
    let mut ids = IdMap::new(module.handle_count());
    for &section in SECTION_ORDER.iter() {
        for &handle in module.section(section) {
            let inst = module.get(handle);
            if let Some(ty) = inst.result_type {
                reference(module, &mut ids, ty)?;
            }
            if inst.has_result {
                ids.declare(handle);
            }
            let eager = inst.op == Op::Phi;
            for operand in &inst.operands {
                match *operand {
                    Operand::Ref(target) => {
                        if eager {
                            // Forward references are allowed in phi
                            // instructions.
                            ids.declare(target);
                        } else {
                            reference(module, &mut ids, target)?;
                        }
                    }
                    Operand::Pending => {
                        return Err(CompileError::with_note(
                            Span::default(),
                            ErrorCode::InternalCompilerError,
                            "unresolved pending operand",
                        ));
                    }
                    _ => {}
                }
            }
        }
    }
    module.bound = ids.bound();
    Ok(ids)
}

fn reference(module: &Module, ids: &mut IdMap, target: Handle<Inst>) -> Result<(), CompileError> {
    if ids.get(target) == 0 {
        if forward_reference_allowed(module.get(target).op) {
            ids.declare(target);
        } else {
            return Err(CompileError::with_note(
                Span::default(),
                ErrorCode::SpirvForbiddenForwardDeclaration,
                format!("{:?}", module.get(target).op),
            ));
        }
    }
    Ok(())
}

/// Serializes the module into a little-endian byte stream.
pub(super) fn assemble(module: &Module, ids: &IdMap) -> Vec<u8> {
    let mut words: Vec<Word> = Vec::with_capacity(5 + 5 * module.handle_count());

    // Header.
    words.push(spirv::MAGIC_NUMBER);
    words.push(((module.version.0 as Word) << 16) | ((module.version.1 as Word) << 8));
    words.push(0); // generator
    words.push(module.bound);
    words.push(0); // schema

    for &section in SECTION_ORDER.iter() {
        for &handle in module.section(section) {
            emit(module.get(handle), ids.get(handle), ids, &mut words);
        }
    }

    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

fn emit(inst: &Inst, self_id: Word, ids: &IdMap, words: &mut Vec<Word>) {
    let head = words.len();
    words.push(0);
    if let Some(ty) = inst.result_type {
        words.push(ids.get(ty));
    }
    if inst.has_result {
        words.push(self_id);
    }
    for operand in &inst.operands {
        match *operand {
            Operand::Ref(target) => words.push(ids.get(target)),
            Operand::Literal(value) => words.push(value),
            Operand::Wide(value) => {
                words.push(value as Word);
                words.push((value >> 32) as Word);
            }
            Operand::String(ref value) => words.extend(helpers::string_to_words(value)),
            Operand::Pending => words.push(0),
        }
    }
    let word_count = (words.len() - head) as Word;
    words[head] = (word_count << 16) | inst.op as Word;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::spv::{instructions::*, Section};

    #[test]
    fn ids_are_dense_and_bound_is_one_past_max() {
        let mut module = Module::new();
        let void = module.add(Section::TypeConstVar, instruction_type_void());
        let fun_ty = module.add(
            Section::TypeConstVar,
            instruction_type_function(void, &[]),
        );
        let fun = module.add(
            Section::Function,
            instruction_function(void, spirv::FunctionControl::NONE, fun_ty),
        );
        module.add(Section::Function, instruction_label());
        module.add(Section::Function, instruction_return());
        module.add(Section::Function, instruction_function_end());

        let ids = assign_ids(&mut module).unwrap();
        assert_eq!(ids.get(void), 1);
        assert_eq!(ids.get(fun_ty), 2);
        assert_eq!(ids.get(fun), 3);
        assert_eq!(module.bound, 5);
    }

    #[test]
    fn label_forward_reference_is_allowed() {
        let mut module = Module::new();
        let label = module.reserve(instruction_label());
        module.add(Section::Function, instruction_branch(label));
        module.append(Section::Function, label);
        assert!(assign_ids(&mut module).is_ok());
    }

    #[test]
    fn plain_forward_reference_is_rejected() {
        let mut module = Module::new();
        let void = module.reserve(instruction_type_void());
        // A function type naming a not-yet-declared void type is fine in
        // the arena, but placing the use before the declaration is not.
        module.add(Section::TypeConstVar, instruction_type_function(void, &[]));
        module.append(Section::TypeConstVar, void);
        let err = assign_ids(&mut module).unwrap_err();
        assert_eq!(err.code, ErrorCode::SpirvForbiddenForwardDeclaration);
    }

    #[test]
    fn phi_forward_reference_is_allowed() {
        let mut module = Module::new();
        let int_ty = module.add(
            Section::TypeConstVar,
            instruction_type_int(32, Signedness::Unsigned),
        );
        let label = module.add(Section::Function, instruction_label());
        let late = module.reserve(instruction_constant_32bit(int_ty, 7));
        let mut phi = Inst::new(Op::Phi);
        phi.set_type(int_ty);
        phi.set_result();
        phi.add_ref(late);
        phi.add_ref(label);
        module.add(Section::Function, phi);
        module.append(Section::TypeConstVar, late);
        // The constant is declared by the phi even though its own section
        // entry comes later in arena order.
        assert!(assign_ids(&mut module).is_ok());
    }

    #[test]
    fn word_counts_match_emitted_words() {
        let mut module = Module::new();
        let void = module.add(Section::TypeConstVar, instruction_type_void());
        let fun_ty = module.add(
            Section::TypeConstVar,
            instruction_type_function(void, &[]),
        );
        let fun = module.add(
            Section::Function,
            instruction_function(void, spirv::FunctionControl::NONE, fun_ty),
        );
        module.add(
            Section::EntryPoint,
            instruction_entry_point(spirv::ExecutionModel::Kernel, fun, "k", &[]),
        );
        module.add(Section::Function, instruction_label());
        module.add(Section::Function, instruction_return());
        module.add(Section::Function, instruction_function_end());

        let ids = assign_ids(&mut module).unwrap();
        let bytes = assemble(&module, &ids);
        assert_eq!(bytes.len() % 4, 0);
        let words: Vec<u32> = bytes
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(words[0], spirv::MAGIC_NUMBER);
        assert_eq!(words[1], (1 << 16) | (2 << 8));
        assert_eq!(words[3], module.bound);

        // Walk the instruction stream: every head's high half must cover
        // exactly the words until the next head.
        let mut at = 5;
        while at < words.len() {
            let wc = (words[at] >> 16) as usize;
            assert!(wc > 0);
            assert!(at + wc <= words.len());
            at += wc;
        }
        assert_eq!(at, words.len());
    }
}
