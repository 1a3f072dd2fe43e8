//! Alias analysis.
//!
//! Memref values alias when they view the same allocation: `subview`,
//! `expand` and `fuse` results alias their source, and a memref loaded from
//! a group aliases the group. The result is an equivalence class per root
//! value, queried by the barrier-insertion pass.

use crate::{FastHashMap, Function, Handle, Operation, Value};

/// Maps every derived memref value to the root value it may alias.
#[derive(Debug, Default)]
pub struct AliasMap {
    root: FastHashMap<Handle<Value>, Handle<Value>>,
}

impl AliasMap {
    /// Resolves a value to the root of its alias class.
    pub fn root_of(&self, value: Handle<Value>) -> Handle<Value> {
        let mut current = value;
        while let Some(&parent) = self.root.get(&current) {
            current = parent;
        }
        current
    }

    /// Whether two values may address the same memory.
    pub fn may_alias(&self, a: Handle<Value>, b: Handle<Value>) -> bool {
        self.root_of(a) == self.root_of(b)
    }
}

/// Computes alias classes for one function.
pub fn analyze(fun: &Function) -> AliasMap {
    let mut order = Vec::new();
    super::preorder(fun, &fun.body.body, &mut order);

    let mut map = AliasMap::default();
    for handle in order {
        let inst = &fun.insts[handle];
        match inst.op {
            Operation::Subview { .. } | Operation::Expand { .. } | Operation::Fuse { .. } => {
                let root = map.root_of(inst.operands[0]);
                map.root.insert(inst.results[0], root);
            }
            // A memref loaded out of a group aliases the whole group.
            Operation::Load if inst.operands.len() == 2 && !inst.results.is_empty() => {
                let root = map.root_of(inst.operands[0]);
                map.root.insert(inst.results[0], root);
            }
            _ => {}
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressSpace, Function, Inst, Program, ScalarKind, Span, Type};

    #[test]
    fn subview_aliases_source() {
        let mut program = Program::new();
        let big = program.intern(Type::Memref {
            element: ScalarKind::F32,
            shape: vec![8, 8],
            stride: vec![1, 8],
            space: AddressSpace::Global,
        });
        let small = program.intern(Type::Memref {
            element: ScalarKind::F32,
            shape: vec![4, 4],
            stride: vec![1, 8],
            space: AddressSpace::Global,
        });
        let mut fun = Function::new("k");
        let a = fun.make_value(big, Some("a"));
        let b = fun.make_value(big, Some("b"));
        fun.params = vec![a, b];
        let v = fun.make_value(small, Some("v"));

        let mut subview = Inst::new(
            Operation::Subview {
                static_offsets: vec![0, 0],
                static_sizes: vec![4, 4],
            },
            Span::default(),
        );
        subview.operands = vec![a];
        subview.results = vec![v];
        let h = fun.insts.append(subview);
        fun.body.body = vec![h];

        let map = analyze(&fun);
        assert!(map.may_alias(v, a));
        assert!(!map.may_alias(v, b));
    }
}
