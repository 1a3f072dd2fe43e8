//! Constant folding.
//!
//! Rewrites integer, boolean and comparison instructions whose operands are
//! all literals into `constant` instructions in place. The result value
//! handle is untouched, so uses do not need rewriting. Folded conditions are
//! what enables the dead-`if`/dead-`for` rules of the DCE pass.

use crate::{
    BinaryOp, CompareOp, ConstantValue, FastHashMap, Handle, Operation, Program, ScalarKind,
    Type, UnaryOp, Value,
};

/// Folds constants in every function of the program.
pub fn fold_constants(program: &mut Program) {
    let Program {
        ref types,
        ref mut functions,
        ..
    } = *program;
    for fun in functions {
        let mut order = Vec::new();
        super::preorder(fun, &fun.body.body, &mut order);

        let mut known: FastHashMap<Handle<Value>, ConstantValue> = FastHashMap::default();
        let mut folded = 0usize;
        for handle in order {
            let replacement = {
                let inst = &fun.insts[handle];
                match inst.op {
                    Operation::Constant(value) => {
                        known.insert(inst.results[0], value);
                        None
                    }
                    Operation::Binary(op) => fold_binary(
                        op,
                        known.get(&inst.operands[0]).copied(),
                        known.get(&inst.operands[1]).copied(),
                    ),
                    Operation::Unary(op) => {
                        fold_unary(op, known.get(&inst.operands[0]).copied())
                    }
                    Operation::Compare(op) => fold_compare(
                        op,
                        known.get(&inst.operands[0]).copied(),
                        known.get(&inst.operands[1]).copied(),
                    ),
                    Operation::Cast => fold_cast(
                        known.get(&inst.operands[0]).copied(),
                        &types[fun.values[inst.results[0]].ty],
                    ),
                    _ => None,
                }
            };
            if let Some(value) = replacement {
                let inst = &mut fun.insts[handle];
                inst.op = Operation::Constant(value);
                inst.operands.clear();
                known.insert(inst.results[0], value);
                folded += 1;
            }
        }
        if folded > 0 {
            log::debug!("folded {} instructions in '{}'", folded, fun.name);
        }
    }
}

fn fold_binary(
    op: BinaryOp,
    a: Option<ConstantValue>,
    b: Option<ConstantValue>,
) -> Option<ConstantValue> {
    match (a?, b?) {
        (ConstantValue::Int(a), ConstantValue::Int(b)) => {
            let v = match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::Div if b != 0 => a.wrapping_div(b),
                BinaryOp::Rem if b != 0 => a.wrapping_rem(b),
                BinaryOp::Shl if (0..64).contains(&b) => a.wrapping_shl(b as u32),
                BinaryOp::Shr if (0..64).contains(&b) => a.wrapping_shr(b as u32),
                BinaryOp::And => a & b,
                BinaryOp::Or => a | b,
                BinaryOp::Xor => a ^ b,
                BinaryOp::Min => a.min(b),
                BinaryOp::Max => a.max(b),
                _ => return None,
            };
            Some(ConstantValue::Int(v))
        }
        (ConstantValue::Bool(a), ConstantValue::Bool(b)) => {
            let v = match op {
                BinaryOp::And => a && b,
                BinaryOp::Or => a || b,
                BinaryOp::Xor => a != b,
                _ => return None,
            };
            Some(ConstantValue::Bool(v))
        }
        _ => None,
    }
}

fn fold_unary(op: UnaryOp, a: Option<ConstantValue>) -> Option<ConstantValue> {
    match a? {
        ConstantValue::Int(a) => {
            let v = match op {
                UnaryOp::Neg => a.wrapping_neg(),
                UnaryOp::Not => !a,
                UnaryOp::Abs => a.wrapping_abs(),
                _ => return None,
            };
            Some(ConstantValue::Int(v))
        }
        ConstantValue::Bool(a) => match op {
            UnaryOp::Not => Some(ConstantValue::Bool(!a)),
            _ => None,
        },
        _ => None,
    }
}

fn fold_compare(
    op: CompareOp,
    a: Option<ConstantValue>,
    b: Option<ConstantValue>,
) -> Option<ConstantValue> {
    match (a?, b?) {
        (ConstantValue::Int(a), ConstantValue::Int(b)) => {
            let v = match op {
                CompareOp::Eq => a == b,
                CompareOp::Ne => a != b,
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Gt => a > b,
                CompareOp::Ge => a >= b,
            };
            Some(ConstantValue::Bool(v))
        }
        _ => None,
    }
}

fn fold_cast(a: Option<ConstantValue>, to: &Type) -> Option<ConstantValue> {
    let kind = match *to {
        Type::Scalar(kind) => kind,
        _ => return None,
    };
    match a? {
        ConstantValue::Int(v) if kind.is_integer() => {
            let v = match kind {
                ScalarKind::I8 => v as i8 as i64,
                ScalarKind::I16 => v as i16 as i64,
                ScalarKind::I32 => v as i32 as i64,
                _ => v,
            };
            Some(ConstantValue::Int(v))
        }
        ConstantValue::Int(v) if kind.is_float() => Some(ConstantValue::Float(v as f64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Function, Inst, Span};

    fn make_binary(
        fun: &mut Function,
        op: BinaryOp,
        a: Handle<Value>,
        b: Handle<Value>,
        r: Handle<Value>,
    ) -> Handle<crate::Inst> {
        let mut inst = Inst::new(Operation::Binary(op), Span::default());
        inst.operands = vec![a, b];
        inst.results = vec![r];
        let h = fun.insts.append(inst);
        fun.body.body.push(h);
        h
    }

    fn make_const(fun: &mut Function, value: i64, r: Handle<Value>) -> Handle<crate::Inst> {
        let mut inst = Inst::new(
            Operation::Constant(ConstantValue::Int(value)),
            Span::default(),
        );
        inst.results = vec![r];
        let h = fun.insts.append(inst);
        fun.body.body.push(h);
        h
    }

    #[test]
    fn folds_chain() {
        let mut program = Program::new();
        let i32_ty = program.scalar(ScalarKind::I32);
        let mut fun = Function::new("k");
        let a = fun.make_value(i32_ty, None);
        let b = fun.make_value(i32_ty, None);
        let s = fun.make_value(i32_ty, None);
        let p = fun.make_value(i32_ty, None);
        make_const(&mut fun, 3, a);
        make_const(&mut fun, 4, b);
        let sum = make_binary(&mut fun, BinaryOp::Add, a, b, s);
        let prod = make_binary(&mut fun, BinaryOp::Mul, s, s, p);
        program.functions.push(fun);

        fold_constants(&mut program);
        let fun = &program.functions[0];
        assert_eq!(
            fun.insts[sum].op,
            Operation::Constant(ConstantValue::Int(7))
        );
        assert_eq!(
            fun.insts[prod].op,
            Operation::Constant(ConstantValue::Int(49))
        );
        assert!(fun.insts[prod].operands.is_empty());
    }

    #[test]
    fn fold_is_idempotent() {
        let mut program = Program::new();
        let i32_ty = program.scalar(ScalarKind::I32);
        let mut fun = Function::new("k");
        let a = fun.make_value(i32_ty, None);
        let r = fun.make_value(i32_ty, None);
        make_const(&mut fun, 5, a);
        let h = make_binary(&mut fun, BinaryOp::Add, a, a, r);
        program.functions.push(fun);

        fold_constants(&mut program);
        let once = program.functions[0].insts[h].op.clone();
        fold_constants(&mut program);
        assert_eq!(program.functions[0].insts[h].op, once);
    }

    #[test]
    fn division_by_zero_is_not_folded() {
        let mut program = Program::new();
        let i32_ty = program.scalar(ScalarKind::I32);
        let mut fun = Function::new("k");
        let a = fun.make_value(i32_ty, None);
        let z = fun.make_value(i32_ty, None);
        let r = fun.make_value(i32_ty, None);
        make_const(&mut fun, 1, a);
        make_const(&mut fun, 0, z);
        let h = make_binary(&mut fun, BinaryOp::Div, a, z, r);
        program.functions.push(fun);

        fold_constants(&mut program);
        assert_eq!(
            program.functions[0].insts[h].op,
            Operation::Binary(BinaryOp::Div)
        );
    }
}
