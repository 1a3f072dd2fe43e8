//! Error codes and diagnostics.
//!
//! Every failure mode that can reach a user carries a stable, stringly-named
//! code ([`ErrorCode`]) plus the source location of the offending IR. The
//! verifier reports every problem it finds in one bundle; all other passes
//! and the backend stop at the first error.

use std::fmt;
use thiserror::Error;

/// Location of an IR entity in the source the client compiled from.
///
/// Purely informational; a default (zero) span means "unknown".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

impl Span {
    pub fn new(line: u32, column: u32) -> Self {
        Span { line, column }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{}:{}", self.line, self.column)
    }
}

/// Stable error identifiers.
///
/// The `Display` form of each variant is the user-visible code and must not
/// change between releases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum ErrorCode {
    #[error("ir_expected_memref")]
    ExpectedMemref,
    #[error("ir_expected_scalar")]
    ExpectedScalar,
    #[error("ir_expected_coopmatrix")]
    ExpectedCoopmatrix,
    #[error("ir_expected_coopmatrix_or_scalar")]
    ExpectedCoopmatrixOrScalar,
    #[error("ir_expected_memref_or_group")]
    ExpectedMemrefOrGroup,
    #[error("ir_expected_vector_or_matrix")]
    ExpectedVectorOrMatrix,
    #[error("ir_invalid_number_of_indices")]
    InvalidNumberOfIndices,
    #[error("ir_incompatible_shapes")]
    IncompatibleShapes,
    #[error("ir_collective_called_from_spmd")]
    CollectiveCalledFromSpmd,
    #[error("ir_unexpected_yield")]
    UnexpectedYield,
    #[error("ir_yield_mismatch")]
    YieldMismatch,
    #[error("ir_boolean_unsupported")]
    BooleanUnsupported,
    #[error("ir_fp_unsupported")]
    FpUnsupported,
    #[error("ir_complex_unsupported")]
    ComplexUnsupported,
    #[error("ir_forbidden_cast")]
    ForbiddenCast,
    #[error("ir_forbidden_promotion")]
    ForbiddenPromotion,
    #[error("unsupported_subgroup_size")]
    UnsupportedSubgroupSize,
    #[error("spirv_undefined_value")]
    SpirvUndefinedValue,
    #[error("spirv_missing_dope_vector")]
    SpirvMissingDopeVector,
    #[error("spirv_forbidden_forward_declaration")]
    SpirvForbiddenForwardDeclaration,
    #[error("spirv_unsupported_atomic_data_type")]
    SpirvUnsupportedAtomicDataType,
    #[error("internal_compiler_error")]
    InternalCompilerError,
    #[error("not_implemented")]
    NotImplemented,
    #[error("file_io_error")]
    FileIoError,
    #[error("bad_alloc")]
    BadAlloc,
}

/// A single diagnostic: where, what, and an optional free-text note.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileError {
    pub span: Span,
    pub code: ErrorCode,
    pub note: Option<String>,
}

impl CompileError {
    pub fn new(span: Span, code: ErrorCode) -> Self {
        CompileError {
            span,
            code,
            note: None,
        }
    }

    pub fn with_note(span: Span, code: ErrorCode, note: impl Into<String>) -> Self {
        CompileError {
            span,
            code,
            note: Some(note.into()),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{}: {}", self.span, self.code)?;
        if let Some(ref note) = self.note {
            write!(formatter, " ({})", note)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Everything the compiler found wrong with one program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Diagnostics(pub Vec<CompileError>);

impl std::error::Error for Diagnostics {}

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, error: CompileError) {
        self.0.push(error);
    }
}

impl From<CompileError> for Diagnostics {
    fn from(error: CompileError) -> Self {
        Diagnostics(vec![error])
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i != 0 {
                writeln!(formatter)?;
            }
            write!(formatter, "{}", error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_codes() {
        assert_eq!(ErrorCode::ExpectedMemref.to_string(), "ir_expected_memref");
        assert_eq!(
            ErrorCode::SpirvForbiddenForwardDeclaration.to_string(),
            "spirv_forbidden_forward_declaration"
        );
        assert_eq!(
            ErrorCode::UnsupportedSubgroupSize.to_string(),
            "unsupported_subgroup_size"
        );
    }

    #[test]
    fn display_with_note() {
        let error = CompileError::with_note(
            Span::new(3, 7),
            ErrorCode::InternalCompilerError,
            "missing phi operand",
        );
        assert_eq!(
            error.to_string(),
            "3:7: internal_compiler_error (missing phi operand)"
        );
    }
}
