//! Structural and semantic IR verification.
//!
//! Unlike the other passes, the verifier does not stop at the first problem:
//! it collects every diagnostic for the whole program before failing, so a
//! client gets to see all of its mistakes at once.

use crate::error::{CompileError, Diagnostics, ErrorCode, Span};
use crate::{
    is_dynamic, AddressSpace, BinaryOp, CompareOp, ConstantValue, FastHashSet, Function, Handle,
    Inst, MatrixUse, Operation, Program, Region, ScalarKind, Type, UnaryOp, Value,
};

/// Verifies a whole program.
pub fn verify(program: &Program) -> Result<(), Diagnostics> {
    let mut diags = Diagnostics::default();
    for fun in &program.functions {
        let mut checker = Checker {
            program,
            fun,
            diags: &mut diags,
            defined: FastHashSet::default(),
        };
        checker.check_function();
    }
    if diags.is_empty() {
        Ok(())
    } else {
        Err(diags)
    }
}

/// Context a region is checked in.
#[derive(Clone, Copy)]
struct RegionCtx<'a> {
    /// Result types the region has to yield, if any.
    yields: Option<&'a [Handle<Value>]>,
    /// Whether the region is nested inside a `parallel`.
    spmd: bool,
}

struct Checker<'a> {
    program: &'a Program,
    fun: &'a Function,
    diags: &'a mut Diagnostics,
    defined: FastHashSet<Handle<Value>>,
}

impl<'a> Checker<'a> {
    fn error(&mut self, span: Span, code: ErrorCode) {
        self.diags.push(CompileError::new(span, code));
    }

    fn error_note(&mut self, span: Span, code: ErrorCode, note: &str) {
        self.diags.push(CompileError::with_note(span, code, note));
    }

    fn ty(&self, value: Handle<Value>) -> &'a Type {
        &self.program.types[self.fun.values[value].ty]
    }

    fn check_function(&mut self) {
        for &param in &self.fun.params {
            self.defined.insert(param);
        }
        let ctx = RegionCtx {
            yields: None,
            spmd: false,
        };
        self.check_region(&self.fun.body, ctx);
    }

    fn check_region(&mut self, region: &Region, ctx: RegionCtx) {
        for &param in &region.params {
            self.defined.insert(param);
        }
        for (i, &handle) in region.body.iter().enumerate() {
            let inst = &self.fun.insts[handle];
            for &operand in &inst.operands {
                if !self.defined.contains(&operand) {
                    self.error_note(
                        inst.span,
                        ErrorCode::SpirvUndefinedValue,
                        "operand is not dominated by a definition",
                    );
                }
            }
            let is_last = i + 1 == region.body.len();
            self.check_inst(handle, inst, ctx, is_last);
            for &result in &inst.results {
                self.defined.insert(result);
            }
        }
        // Regions with results must end in a yield.
        if let Some(expected) = ctx.yields {
            if !expected.is_empty() {
                let terminated = region
                    .body
                    .last()
                    .map(|&h| self.fun.insts[h].op == Operation::Yield)
                    .unwrap_or(false);
                if !terminated {
                    let span = region
                        .body
                        .last()
                        .map(|&h| self.fun.insts[h].span)
                        .unwrap_or_default();
                    self.error(span, ErrorCode::YieldMismatch);
                }
            }
        }
    }

    fn expect_scalar(&mut self, span: Span, value: Handle<Value>) -> Option<ScalarKind> {
        match *self.ty(value) {
            Type::Scalar(kind) => Some(kind),
            _ => {
                self.error(span, ErrorCode::ExpectedScalar);
                None
            }
        }
    }

    fn expect_int(&mut self, span: Span, value: Handle<Value>) -> Option<ScalarKind> {
        match self.expect_scalar(span, value) {
            Some(kind) if kind.is_integer() => Some(kind),
            Some(_) => {
                self.error(span, ErrorCode::ExpectedScalar);
                None
            }
            None => None,
        }
    }

    fn expect_bool(&mut self, span: Span, value: Handle<Value>) {
        if *self.ty(value) != Type::Bool {
            self.error_note(span, ErrorCode::ExpectedScalar, "expected a boolean");
        }
    }

    fn expect_memref(
        &mut self,
        span: Span,
        value: Handle<Value>,
    ) -> Option<(ScalarKind, &'a [i64], &'a [i64], AddressSpace)> {
        match *self.ty(value) {
            Type::Memref {
                element,
                ref shape,
                ref stride,
                space,
            } => Some((element, shape, stride, space)),
            _ => {
                self.error(span, ErrorCode::ExpectedMemref);
                None
            }
        }
    }

    fn expect_coopmatrix(
        &mut self,
        span: Span,
        value: Handle<Value>,
    ) -> Option<(ScalarKind, i64, i64, MatrixUse)> {
        match *self.ty(value) {
            Type::Coopmatrix {
                component,
                rows,
                cols,
                use_,
            } => Some((component, rows, cols, use_)),
            _ => {
                self.error(span, ErrorCode::ExpectedCoopmatrix);
                None
            }
        }
    }

    fn expect_arity(&mut self, inst: &Inst, operands: usize, results: usize) -> bool {
        if inst.operands.len() != operands || inst.results.len() != results {
            self.error_note(
                inst.span,
                ErrorCode::InternalCompilerError,
                "operand or result arity mismatch",
            );
            false
        } else {
            true
        }
    }

    fn check_inst(&mut self, handle: Handle<Inst>, inst: &Inst, ctx: RegionCtx, is_last: bool) {
        let span = inst.span;
        match inst.op {
            Operation::Binary(op) => {
                if !self.expect_arity(inst, 2, 1) {
                    return;
                }
                let rty = self.ty(inst.results[0]).clone();
                for &operand in &inst.operands {
                    if *self.ty(operand) != rty {
                        self.error(span, ErrorCode::ExpectedCoopmatrixOrScalar);
                        return;
                    }
                }
                let kind = match rty {
                    Type::Bool => {
                        if !matches!(op, BinaryOp::And | BinaryOp::Or | BinaryOp::Xor) {
                            self.error(span, ErrorCode::BooleanUnsupported);
                        }
                        return;
                    }
                    Type::Scalar(kind) => kind,
                    Type::Coopmatrix { component, .. } => component,
                    _ => {
                        self.error(span, ErrorCode::ExpectedCoopmatrixOrScalar);
                        return;
                    }
                };
                let int_only = matches!(
                    op,
                    BinaryOp::Shl | BinaryOp::Shr | BinaryOp::And | BinaryOp::Or | BinaryOp::Xor
                );
                if int_only && !kind.is_integer() {
                    self.error(span, ErrorCode::FpUnsupported);
                }
                if kind.is_complex()
                    && matches!(op, BinaryOp::Rem | BinaryOp::Min | BinaryOp::Max)
                {
                    self.error(span, ErrorCode::ComplexUnsupported);
                }
            }
            Operation::Unary(op) => {
                if !self.expect_arity(inst, 1, 1) {
                    return;
                }
                let aty = self.ty(inst.operands[0]).clone();
                let kind = match aty {
                    Type::Bool => {
                        if op != UnaryOp::Not {
                            self.error(span, ErrorCode::BooleanUnsupported);
                        }
                        return;
                    }
                    Type::Scalar(kind) => kind,
                    Type::Coopmatrix { component, .. } => component,
                    _ => {
                        self.error(span, ErrorCode::ExpectedCoopmatrixOrScalar);
                        return;
                    }
                };
                match op {
                    UnaryOp::Not if !kind.is_integer() => {
                        self.error(span, ErrorCode::FpUnsupported)
                    }
                    UnaryOp::Conj | UnaryOp::Im | UnaryOp::Re if !kind.is_complex() => {
                        self.error(span, ErrorCode::ComplexUnsupported)
                    }
                    _ => {}
                }
            }
            Operation::Cast => {
                if !self.expect_arity(inst, 1, 1) {
                    return;
                }
                let from = match *self.ty(inst.operands[0]) {
                    Type::Scalar(kind) => kind,
                    Type::Coopmatrix { component, .. } => component,
                    _ => {
                        self.error(span, ErrorCode::ExpectedCoopmatrixOrScalar);
                        return;
                    }
                };
                let to = match *self.ty(inst.results[0]) {
                    Type::Scalar(kind) => kind,
                    Type::Coopmatrix { component, .. } => component,
                    _ => {
                        self.error(span, ErrorCode::ExpectedCoopmatrixOrScalar);
                        return;
                    }
                };
                // Complex may only be cast to complex.
                if from.is_complex() && !to.is_complex() {
                    self.error(span, ErrorCode::ForbiddenCast);
                }
            }
            Operation::Compare(op) => {
                if !self.expect_arity(inst, 2, 1) {
                    return;
                }
                let a = self.expect_scalar(span, inst.operands[0]);
                let b = self.expect_scalar(span, inst.operands[1]);
                if let (Some(a), Some(b)) = (a, b) {
                    if a != b {
                        self.error(span, ErrorCode::ExpectedScalar);
                    }
                    if a.is_complex() && !matches!(op, CompareOp::Eq | CompareOp::Ne) {
                        self.error(span, ErrorCode::ComplexUnsupported);
                    }
                }
                self.expect_bool(span, inst.results[0]);
            }
            Operation::Constant(value) => {
                if !self.expect_arity(inst, 0, 1) {
                    return;
                }
                let kind = match *self.ty(inst.results[0]) {
                    Type::Bool => {
                        if !matches!(value, ConstantValue::Bool(_)) {
                            self.error(span, ErrorCode::ExpectedScalar);
                        }
                        return;
                    }
                    Type::Scalar(kind) => kind,
                    Type::Coopmatrix { component, .. } => component,
                    _ => {
                        self.error(span, ErrorCode::ExpectedCoopmatrixOrScalar);
                        return;
                    }
                };
                let compatible = match value {
                    ConstantValue::Bool(_) => false,
                    ConstantValue::Int(_) => kind.is_integer(),
                    ConstantValue::Float(_) => kind.is_float(),
                    ConstantValue::Complex(_) => kind.is_complex(),
                };
                if !compatible {
                    self.error(span, ErrorCode::ExpectedScalar);
                }
            }
            Operation::Alloca { .. } => {
                if !self.expect_arity(inst, 0, 1) {
                    return;
                }
                if let Some((_, shape, stride, space)) =
                    self.expect_memref(span, inst.results[0])
                {
                    if space != AddressSpace::Local {
                        self.error_note(
                            span,
                            ErrorCode::ExpectedMemref,
                            "alloca result must live in local memory",
                        );
                    }
                    if shape.iter().chain(stride).any(|&v| is_dynamic(v)) {
                        self.error_note(
                            span,
                            ErrorCode::ExpectedMemref,
                            "alloca requires a fully static shape and stride",
                        );
                    }
                }
            }
            Operation::Load => {
                if inst.results.len() != 1 || inst.operands.is_empty() {
                    self.error(span, ErrorCode::InternalCompilerError);
                    return;
                }
                match *self.ty(inst.operands[0]) {
                    Type::Memref { element, ref shape, .. } => {
                        if inst.operands.len() != 1 + shape.len() {
                            self.error(span, ErrorCode::InvalidNumberOfIndices);
                        }
                        if *self.ty(inst.results[0]) != Type::Scalar(element) {
                            self.error(span, ErrorCode::ExpectedScalar);
                        }
                    }
                    Type::Group { element, .. } => {
                        if inst.operands.len() != 2 {
                            self.error(span, ErrorCode::InvalidNumberOfIndices);
                        }
                        if self.fun.values[inst.results[0]].ty != element {
                            self.error(span, ErrorCode::ExpectedMemref);
                        }
                    }
                    _ => self.error(span, ErrorCode::ExpectedMemrefOrGroup),
                }
                for &index in &inst.operands[1..] {
                    self.expect_int(span, index);
                }
            }
            Operation::Store(_) => {
                if inst.operands.len() < 2 || !inst.results.is_empty() {
                    self.error(span, ErrorCode::InternalCompilerError);
                    return;
                }
                if let Some((element, shape, _, _)) = self.expect_memref(span, inst.operands[1]) {
                    if inst.operands.len() != 2 + shape.len() {
                        self.error(span, ErrorCode::InvalidNumberOfIndices);
                    }
                    if *self.ty(inst.operands[0]) != Type::Scalar(element) {
                        self.error(span, ErrorCode::ExpectedScalar);
                    }
                }
                for &index in &inst.operands[2..] {
                    self.expect_int(span, index);
                }
            }
            Operation::Size { dim } => {
                if !self.expect_arity(inst, 1, 1) {
                    return;
                }
                if let Some((_, shape, _, _)) = self.expect_memref(span, inst.operands[0]) {
                    if dim as usize >= shape.len() {
                        self.error(span, ErrorCode::InvalidNumberOfIndices);
                    }
                }
                if *self.ty(inst.results[0]) != Type::Scalar(ScalarKind::Index) {
                    self.error(span, ErrorCode::ExpectedScalar);
                }
            }
            Operation::Subview {
                ref static_offsets,
                ref static_sizes,
            } => {
                if inst.results.len() != 1 {
                    self.error(span, ErrorCode::InternalCompilerError);
                    return;
                }
                if let Some((element, shape, _, space)) =
                    self.expect_memref(span, inst.operands[0])
                {
                    if static_offsets.len() != shape.len() || static_sizes.len() != shape.len() {
                        self.error(span, ErrorCode::InvalidNumberOfIndices);
                        return;
                    }
                    let dynamic = static_offsets
                        .iter()
                        .chain(static_sizes)
                        .filter(|&&v| is_dynamic(v))
                        .count();
                    if inst.operands.len() != 1 + dynamic {
                        self.error(span, ErrorCode::InvalidNumberOfIndices);
                    }
                    let rank = static_sizes.iter().filter(|&&s| s != 0).count();
                    match *self.ty(inst.results[0]) {
                        Type::Memref {
                            element: relem,
                            shape: ref rshape,
                            space: rspace,
                            ..
                        } => {
                            if relem != element || rspace != space || rshape.len() != rank {
                                self.error(span, ErrorCode::IncompatibleShapes);
                            }
                        }
                        _ => self.error(span, ErrorCode::ExpectedMemref),
                    }
                }
                for &operand in &inst.operands[1..] {
                    self.expect_int(span, operand);
                }
            }
            Operation::Expand {
                mode,
                ref static_factors,
            } => {
                if inst.results.len() != 1 {
                    self.error(span, ErrorCode::InternalCompilerError);
                    return;
                }
                if let Some((_, shape, _, _)) = self.expect_memref(span, inst.operands[0]) {
                    if mode as usize >= shape.len() || static_factors.len() < 2 {
                        self.error(span, ErrorCode::InvalidNumberOfIndices);
                        return;
                    }
                    let dynamic = static_factors.iter().filter(|&&v| is_dynamic(v)).count();
                    if inst.operands.len() != 1 + dynamic {
                        self.error(span, ErrorCode::InvalidNumberOfIndices);
                    }
                    let static_extent = shape[mode as usize];
                    let factor_product: i64 = static_factors
                        .iter()
                        .map(|&f| if is_dynamic(f) { 1 } else { f })
                        .product();
                    if !is_dynamic(static_extent)
                        && dynamic == 0
                        && factor_product != static_extent
                    {
                        self.error(span, ErrorCode::IncompatibleShapes);
                    }
                    let rank = shape.len() - 1 + static_factors.len();
                    if self.ty(inst.results[0]).rank() != rank {
                        self.error(span, ErrorCode::IncompatibleShapes);
                    }
                }
            }
            Operation::Fuse { from, to } => {
                if !self.expect_arity(inst, 1, 1) {
                    return;
                }
                if let Some((_, shape, stride, _)) = self.expect_memref(span, inst.operands[0]) {
                    if from >= to || to as usize >= shape.len() {
                        self.error(span, ErrorCode::InvalidNumberOfIndices);
                        return;
                    }
                    // Fused modes must be contiguous when statically known.
                    for i in from as usize..to as usize {
                        if !is_dynamic(stride[i])
                            && !is_dynamic(shape[i])
                            && !is_dynamic(stride[i + 1])
                            && stride[i + 1] != stride[i] * shape[i]
                        {
                            self.error(span, ErrorCode::IncompatibleShapes);
                        }
                    }
                    let rank = shape.len() - (to - from) as usize;
                    if self.ty(inst.results[0]).rank() != rank {
                        self.error(span, ErrorCode::IncompatibleShapes);
                    }
                }
            }
            Operation::For { has_step } => {
                let fixed = 2 + has_step as usize;
                if inst.regions.len() != 1 {
                    self.error(span, ErrorCode::InternalCompilerError);
                    return;
                }
                let region = &inst.regions[0];
                let iter_count = inst.operands.len().saturating_sub(fixed);
                if region.params.len() != 1 + iter_count
                    || inst.results.len() != iter_count
                {
                    self.error(span, ErrorCode::YieldMismatch);
                    return;
                }
                let loop_kind = self.expect_int(span, region.params[0]);
                for &bound in &inst.operands[..fixed] {
                    if self.expect_int(span, bound) != loop_kind {
                        self.error(span, ErrorCode::ExpectedScalar);
                    }
                }
                for i in 0..iter_count {
                    let init_ty = self.fun.values[inst.operands[fixed + i]].ty;
                    let arg_ty = self.fun.values[region.params[1 + i]].ty;
                    let result_ty = self.fun.values[inst.results[i]].ty;
                    if init_ty != arg_ty || init_ty != result_ty {
                        self.error(span, ErrorCode::YieldMismatch);
                    }
                }
                self.check_region(
                    region,
                    RegionCtx {
                        yields: Some(&inst.results),
                        spmd: ctx.spmd,
                    },
                );
            }
            Operation::If => {
                if inst.operands.len() != 1
                    || inst.regions.is_empty()
                    || inst.regions.len() > 2
                {
                    self.error(span, ErrorCode::InternalCompilerError);
                    return;
                }
                self.expect_bool(span, inst.operands[0]);
                if inst.regions.len() == 1 && !inst.results.is_empty() {
                    self.error(span, ErrorCode::YieldMismatch);
                }
                for region in &inst.regions {
                    if !region.params.is_empty() {
                        self.error(span, ErrorCode::InternalCompilerError);
                    }
                    self.check_region(
                        region,
                        RegionCtx {
                            yields: Some(&inst.results),
                            spmd: ctx.spmd,
                        },
                    );
                }
            }
            Operation::Parallel => {
                if inst.regions.len() != 1
                    || !inst.operands.is_empty()
                    || !inst.results.is_empty()
                {
                    self.error(span, ErrorCode::InternalCompilerError);
                    return;
                }
                if ctx.spmd {
                    self.error(span, ErrorCode::CollectiveCalledFromSpmd);
                }
                self.check_region(
                    &inst.regions[0],
                    RegionCtx {
                        yields: None,
                        spmd: true,
                    },
                );
            }
            Operation::Yield => {
                let expected = match ctx.yields {
                    Some(expected) => expected,
                    None => {
                        self.error(span, ErrorCode::UnexpectedYield);
                        return;
                    }
                };
                if !is_last {
                    self.error(span, ErrorCode::UnexpectedYield);
                }
                if inst.operands.len() != expected.len() {
                    self.error(span, ErrorCode::YieldMismatch);
                    return;
                }
                for (&operand, &result) in inst.operands.iter().zip(expected) {
                    if self.fun.values[operand].ty != self.fun.values[result].ty {
                        self.error(span, ErrorCode::YieldMismatch);
                    }
                }
            }
            Operation::Barrier(fences) => {
                if ctx.spmd && !fences.is_empty() {
                    self.error(span, ErrorCode::CollectiveCalledFromSpmd);
                }
            }
            Operation::LifetimeStop => {
                if !self.expect_arity(inst, 1, 0) {
                    return;
                }
                self.expect_memref(span, inst.operands[0]);
            }
            Operation::GroupId
            | Operation::GroupSize
            | Operation::NumSubgroups
            | Operation::SubgroupId
            | Operation::SubgroupLocalId
            | Operation::SubgroupSize => {
                if !self.expect_arity(inst, 0, 1) {
                    return;
                }
                self.expect_scalar(span, inst.results[0]);
            }
            Operation::WorkGroup(_) => {
                if !self.expect_arity(inst, 1, 1) {
                    return;
                }
                if ctx.spmd {
                    self.error(span, ErrorCode::CollectiveCalledFromSpmd);
                }
                let a = self.expect_scalar(span, inst.operands[0]);
                let r = self.expect_scalar(span, inst.results[0]);
                if a.is_some() && a != r {
                    self.error(span, ErrorCode::ExpectedScalar);
                }
            }
            Operation::CoopLoad { .. } => {
                if !self.expect_arity(inst, 3, 1) {
                    return;
                }
                if let Some((element, shape, _, _)) = self.expect_memref(span, inst.operands[0]) {
                    if shape.len() != 2 {
                        self.error(span, ErrorCode::InvalidNumberOfIndices);
                    }
                    if let Some((component, _, _, _)) =
                        self.expect_coopmatrix(span, inst.results[0])
                    {
                        if component != element {
                            self.error(span, ErrorCode::IncompatibleShapes);
                        }
                    }
                }
                self.expect_int(span, inst.operands[1]);
                self.expect_int(span, inst.operands[2]);
            }
            Operation::CoopStore { .. } => {
                if !self.expect_arity(inst, 4, 0) {
                    return;
                }
                let val = self.expect_coopmatrix(span, inst.operands[0]);
                if let Some((element, shape, _, _)) = self.expect_memref(span, inst.operands[1]) {
                    if shape.len() != 2 {
                        self.error(span, ErrorCode::InvalidNumberOfIndices);
                    }
                    if let Some((component, _, _, _)) = val {
                        if component != element {
                            self.error(span, ErrorCode::IncompatibleShapes);
                        }
                    }
                }
                self.expect_int(span, inst.operands[2]);
                self.expect_int(span, inst.operands[3]);
            }
            Operation::CoopMulAdd => {
                if !self.expect_arity(inst, 3, 1) {
                    return;
                }
                let a = self.expect_coopmatrix(span, inst.operands[0]);
                let b = self.expect_coopmatrix(span, inst.operands[1]);
                let c = self.expect_coopmatrix(span, inst.operands[2]);
                let r = self.expect_coopmatrix(span, inst.results[0]);
                if let (Some(a), Some(b), Some(c), Some(r)) = (a, b, c, r) {
                    if a.3 != MatrixUse::A || b.3 != MatrixUse::B {
                        self.error(span, ErrorCode::IncompatibleShapes);
                    }
                    // A is M x K, B is K x N, C and R are M x N.
                    if a.2 != b.1 || c.1 != a.1 || c.2 != b.2 || r.1 != c.1 || r.2 != c.2 {
                        self.error(span, ErrorCode::IncompatibleShapes);
                    }
                    // Mixed precision promotes towards the accumulator.
                    if a.0.is_complex() != c.0.is_complex()
                        || (a.0.is_integer() && !c.0.is_integer())
                    {
                        self.error(span, ErrorCode::ForbiddenPromotion);
                    }
                }
            }
            Operation::CoopScale => {
                if !self.expect_arity(inst, 2, 1) {
                    return;
                }
                let a = self.expect_scalar(span, inst.operands[0]);
                let b = self.expect_coopmatrix(span, inst.operands[1]);
                if let (Some(a), Some(b)) = (a, b) {
                    if a != b.0 {
                        self.error(span, ErrorCode::ExpectedScalar);
                    }
                }
            }
            Operation::CoopPrefetch { .. } => {
                if !self.expect_arity(inst, 3, 0) {
                    return;
                }
                self.expect_memref(span, inst.operands[0]);
                self.expect_int(span, inst.operands[1]);
                self.expect_int(span, inst.operands[2]);
            }
            Operation::CoopReduce(_) => {
                if !self.expect_arity(inst, 1, 1) {
                    return;
                }
                let a = self.expect_coopmatrix(span, inst.operands[0]);
                let r = self.expect_coopmatrix(span, inst.results[0]);
                if let (Some(a), Some(r)) = (a, r) {
                    if r.1 != a.1 || r.2 != 1 {
                        self.error(span, ErrorCode::IncompatibleShapes);
                    }
                }
            }
        }
        let _ = handle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Inst, Operation, Program, ScalarKind, Span};

    fn empty_kernel() -> Program {
        let mut program = Program::new();
        let mut fun = Function::new("k");
        fun.subgroup_size = 16;
        fun.work_group_size = [16, 1];
        program.functions.push(fun);
        program
    }

    #[test]
    fn empty_kernel_verifies() {
        let program = empty_kernel();
        assert!(verify(&program).is_ok());
    }

    #[test]
    fn use_before_def_is_reported() {
        let mut program = Program::new();
        let i32_ty = program.scalar(ScalarKind::I32);
        let mut fun = Function::new("k");
        let ghost = fun.make_value(i32_ty, None);
        let r = fun.make_value(i32_ty, None);
        let mut add = Inst::new(Operation::Binary(BinaryOp::Add), Span::new(1, 1));
        add.operands = vec![ghost, ghost];
        add.results = vec![r];
        let h = fun.insts.append(add);
        fun.body.body.push(h);
        program.functions.push(fun);

        let err = verify(&program).unwrap_err();
        assert!(err
            .0
            .iter()
            .any(|d| d.code == ErrorCode::SpirvUndefinedValue));
    }

    #[test]
    fn unexpected_yield_is_reported() {
        let mut program = Program::new();
        let mut fun = Function::new("k");
        let h = fun
            .insts
            .append(Inst::new(Operation::Yield, Span::new(2, 3)));
        fun.body.body.push(h);
        program.functions.push(fun);

        let err = verify(&program).unwrap_err();
        assert_eq!(err.0[0].code, ErrorCode::UnexpectedYield);
        assert_eq!(err.0[0].span, Span::new(2, 3));
    }

    #[test]
    fn yield_type_mismatch_is_reported() {
        let mut program = Program::new();
        let i32_ty = program.scalar(ScalarKind::I32);
        let f32_ty = program.scalar(ScalarKind::F32);
        let bool_ty = program.bool_ty();
        let mut fun = Function::new("k");

        let cond = fun.make_value(bool_ty, Some("cond"));
        let mut cond_inst = Inst::new(
            Operation::Constant(crate::ConstantValue::Bool(true)),
            Span::default(),
        );
        cond_inst.results = vec![cond];
        let cond_h = fun.insts.append(cond_inst);

        let yielded = fun.make_value(f32_ty, None);
        let mut cst = Inst::new(
            Operation::Constant(crate::ConstantValue::Float(1.0)),
            Span::default(),
        );
        cst.results = vec![yielded];
        let cst_h = fun.insts.append(cst);

        let mut yield_inst = Inst::new(Operation::Yield, Span::default());
        yield_inst.operands = vec![yielded];
        let yield_h = fun.insts.append(yield_inst);

        let result = fun.make_value(i32_ty, None);
        let mut if_inst = Inst::new(Operation::If, Span::default());
        if_inst.operands = vec![cond];
        if_inst.results = vec![result];
        if_inst.regions = vec![
            Region {
                params: vec![],
                body: vec![cst_h, yield_h],
            },
            Region::default(),
        ];
        let if_h = fun.insts.append(if_inst);
        fun.body.body = vec![cond_h, if_h];
        program.functions.push(fun);

        let err = verify(&program).unwrap_err();
        assert!(err.0.iter().any(|d| d.code == ErrorCode::YieldMismatch));
    }

    #[test]
    fn barrier_inside_parallel_is_rejected() {
        let mut program = Program::new();
        let mut fun = Function::new("k");
        let barrier = fun.insts.append(Inst::new(
            Operation::Barrier(crate::FenceFlags::LOCAL),
            Span::default(),
        ));
        let mut parallel = Inst::new(Operation::Parallel, Span::default());
        parallel.regions = vec![Region {
            params: vec![],
            body: vec![barrier],
        }];
        let parallel_h = fun.insts.append(parallel);
        fun.body.body = vec![parallel_h];
        program.functions.push(fun);

        let err = verify(&program).unwrap_err();
        assert!(err
            .0
            .iter()
            .any(|d| d.code == ErrorCode::CollectiveCalledFromSpmd));
    }
}
