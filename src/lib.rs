//! Tensor IR to SPIR-V just-in-time compiler.
//!
//! The central structure of the crate is [`Program`]: a list of kernel
//! [`Function`]s over a shared, interned type table. A client constructs a
//! program in memory, then calls [`compile`] with a [`DeviceInfo`] describing
//! the target accelerator. The result is a [`Binary`]: a self-contained
//! SPIR-V module plus per-kernel launch metadata.
//!
//! To improve performance and reduce memory usage, most structures are stored
//! in an [`Arena`], and can be retrieved using the corresponding [`Handle`].
#![allow(clippy::new_without_default)]

mod arena;
pub mod back;
pub mod device;
pub mod error;
pub mod pass;

pub use crate::arena::{Arena, Handle};
pub use crate::device::DeviceInfo;
pub use crate::error::{CompileError, Diagnostics, ErrorCode, Span};

use std::{
    collections::{HashMap, HashSet},
    hash::BuildHasherDefault,
};

/// Hash map that is faster but not resilient to DoS attacks.
pub type FastHashMap<K, T> = HashMap<K, T, BuildHasherDefault<fxhash::FxHasher>>;
/// Hash set that is faster but not resilient to DoS attacks.
pub type FastHashSet<K> = HashSet<K, BuildHasherDefault<fxhash::FxHasher>>;

/// Number of bytes.
pub type Bytes = u8;

/// Sentinel for a shape, stride or offset entry whose value is only known at
/// kernel launch time.
pub const DYNAMIC: i64 = i64::MIN;

/// Checks whether a shape/stride entry is the dynamic sentinel.
pub fn is_dynamic(value: i64) -> bool {
    value == DYNAMIC
}

/// Primitive type for a scalar.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Hash, Eq)]
pub enum ScalarKind {
    /// Signed 8-bit integer.
    I8,
    /// Signed 16-bit integer.
    I16,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
    /// Pointer-sized signed integer; its width is a property of the program.
    Index,
    /// IEEE 754 half precision float.
    F16,
    /// bfloat16; stored as a 16-bit integer, computed on as f32.
    BF16,
    /// IEEE 754 single precision float.
    F32,
    /// IEEE 754 double precision float.
    F64,
    /// Complex number over two f32 lanes.
    C32,
    /// Complex number over two f64 lanes.
    C64,
}

impl ScalarKind {
    /// Size of the scalar in bytes.
    pub fn size(self, index_width: Bytes) -> i64 {
        match self {
            Self::I8 => 1,
            Self::I16 | Self::F16 | Self::BF16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 | Self::C32 => 8,
            Self::Index => index_width as i64,
            Self::C64 => 16,
        }
    }

    /// Required alignment of the scalar in bytes.
    ///
    /// Complex scalars are aligned like a two-component vector of their
    /// element type.
    pub fn alignment(self, index_width: Bytes) -> i64 {
        self.size(index_width)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::Index
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::F32 | Self::F64)
    }

    pub fn is_complex(self) -> bool {
        matches!(self, Self::C32 | Self::C64)
    }

    /// The component kind of a complex scalar, identity otherwise.
    pub fn element_kind(self) -> ScalarKind {
        match self {
            Self::C32 => Self::F32,
            Self::C64 => Self::F64,
            other => other,
        }
    }
}

/// Class of memory a memref points into.
#[derive(Clone, Copy, Debug, PartialEq, Hash, Eq)]
pub enum AddressSpace {
    /// Device global memory.
    Global,
    /// Workgroup-local (shared) memory.
    Local,
}

/// Role of a cooperative matrix in a multiply-accumulate.
#[derive(Clone, Copy, Debug, PartialEq, Hash, Eq)]
pub enum MatrixUse {
    A,
    B,
    Acc,
}

/// A data type declared in the program.
///
/// Types are interned in [`Program::types`]; two types are equal iff their
/// handles are equal.
#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    Void,
    Bool,
    Scalar(ScalarKind),
    /// A strided multi-dimensional array view of global or local memory.
    ///
    /// `shape` and `stride` have equal length (the rank); entries may be
    /// [`DYNAMIC`].
    Memref {
        element: ScalarKind,
        shape: Vec<i64>,
        stride: Vec<i64>,
        space: AddressSpace,
    },
    /// An array of memrefs sharing one static type, indexed at runtime.
    Group { element: Handle<Type>, offset: i64 },
    /// A matrix distributed over the lanes of a subgroup.
    Coopmatrix {
        component: ScalarKind,
        rows: i64,
        cols: i64,
        use_: MatrixUse,
    },
}

impl Type {
    pub fn rank(&self) -> usize {
        match *self {
            Type::Memref { ref shape, .. } => shape.len(),
            _ => 0,
        }
    }
}

/// A single SSA value: the result of an instruction, a function parameter,
/// or a region parameter (loop variable / iter-arg).
#[derive(Clone, Debug)]
pub struct Value {
    /// Name of the value, if any. Used for diagnostics only.
    pub name: Option<String>,
    pub ty: Handle<Type>,
}

/// Binary arithmetic on scalars and cooperative matrices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    And,
    Or,
    Xor,
    Min,
    Max,
}

/// Unary arithmetic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Neg,
    Abs,
    /// Complex conjugate.
    Conj,
    /// Imaginary part.
    Im,
    /// Real part.
    Re,
}

/// Comparison conditions; float comparisons use the ordered variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// How a `store` interacts with concurrent accesses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreFlag {
    Regular,
    Atomic,
    AtomicAdd,
    AtomicMin,
    AtomicMax,
}

/// Which matrix dimensions of a cooperative load/store are bounds-checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CheckedFlag {
    None,
    Rows,
    Cols,
    Both,
}

impl CheckedFlag {
    pub fn rows(self) -> bool {
        matches!(self, Self::Rows | Self::Both)
    }
    pub fn cols(self) -> bool {
        matches!(self, Self::Cols | Self::Both)
    }
}

/// Work-group collective operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GroupOp {
    ReduceAdd,
    ReduceMin,
    ReduceMax,
}

/// Column reductions over a cooperative matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Add,
    Min,
    Max,
}

bitflags::bitflags! {
    /// Address spaces ordered by a `barrier`.
    pub struct FenceFlags: u32 {
        const GLOBAL = 0x1;
        const LOCAL = 0x2;
    }
}

/// Literal payload of a `constant` instruction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConstantValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Real and imaginary part.
    Complex([f64; 2]),
}

/// The closed set of IR operations.
///
/// Operands, results and child regions live on the owning [`Inst`]; the
/// variants only carry immediate attributes. The expected operand/result
/// shape of every variant is documented in the verifier.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// Binary arithmetic: `a, b -> r`.
    Binary(BinaryOp),
    /// Unary arithmetic: `a -> r`.
    Unary(UnaryOp),
    /// Scalar or component-wise conversion to the result type: `a -> r`.
    Cast,
    /// Comparison: `a, b -> bool`.
    Compare(CompareOp),
    /// Literal: `-> r`.
    Constant(ConstantValue),
    /// Reserve a workgroup-local memref. The byte offset into the
    /// function's local-memory stack is assigned by the stack pass.
    Alloca { offset: i64 },
    /// `memref, indices.. -> scalar` or `group, index -> memref`.
    Load,
    /// `value, memref, indices..`.
    Store(StoreFlag),
    /// Shape query: `memref -> index`.
    Size { dim: u32 },
    /// Strided sub-view of a memref. Static entries come from the
    /// attribute vectors; [`DYNAMIC`] entries consume one operand each
    /// (offsets first, then sizes). A static size of zero drops the mode.
    Subview {
        static_offsets: Vec<i64>,
        static_sizes: Vec<i64>,
    },
    /// Split one mode into several; [`DYNAMIC`] factors consume operands.
    Expand { mode: u32, static_factors: Vec<i64> },
    /// Fuse the contiguous modes `from..=to` into one.
    Fuse { from: u32, to: u32 },
    /// Counted loop: operands `from, to, [step,] iter_inits..`; one body
    /// region whose parameters are the loop variable and the iter-args.
    For { has_step: bool },
    /// Conditional: operand `cond`; one or two regions; yields results.
    If,
    /// Marks a region executed by all subgroups cooperatively.
    Parallel,
    /// Terminator of `if`/`for` regions, forwarding its operands.
    Yield,
    /// Work-group barrier over the given fence set.
    Barrier(FenceFlags),
    /// End of life of an `alloca` result; enables stack-slot reuse.
    LifetimeStop,
    GroupId,
    GroupSize,
    NumSubgroups,
    SubgroupId,
    SubgroupLocalId,
    SubgroupSize,
    /// Work-group collective over a scalar: `a -> r`.
    WorkGroup(GroupOp),
    /// `memref, pos0, pos1 -> coopmatrix`.
    CoopLoad {
        transpose: bool,
        checked: CheckedFlag,
    },
    /// `value, memref, pos0, pos1`.
    CoopStore {
        flag: StoreFlag,
        checked: CheckedFlag,
    },
    /// `a, b, c -> r` with `r = a * b + c`.
    CoopMulAdd,
    /// `scalar, matrix -> matrix`.
    CoopScale,
    /// Hint that a 2D block will be loaded soon: `memref, pos0, pos1`.
    CoopPrefetch {
        cache_level: i32,
        rows: i64,
        cols: i64,
    },
    /// Column reduction: `matrix -> matrix` with a single column.
    CoopReduce(ReduceOp),
}

/// An ordered list of instructions plus the values the enclosing
/// instruction binds inside it (loop variable, iter-args).
#[derive(Clone, Debug, Default)]
pub struct Region {
    pub params: Vec<Handle<Value>>,
    pub body: Vec<Handle<Inst>>,
}

/// One instruction: an operation applied to operand values, producing
/// result values, possibly owning nested regions.
#[derive(Clone, Debug)]
pub struct Inst {
    pub op: Operation,
    pub operands: Vec<Handle<Value>>,
    pub results: Vec<Handle<Value>>,
    pub regions: Vec<Region>,
    pub span: Span,
}

impl Inst {
    pub fn new(op: Operation, span: Span) -> Self {
        Inst {
            op,
            operands: Vec::new(),
            results: Vec::new(),
            regions: Vec::new(),
            span,
        }
    }
}

/// A kernel function.
#[derive(Debug, Default)]
pub struct Function {
    /// Exported name of the kernel.
    pub name: String,
    /// Function parameters, in order.
    pub params: Vec<Handle<Value>>,
    /// All values referenced from this function's body.
    pub values: Arena<Value>,
    /// All instructions of this function, including nested ones.
    pub insts: Arena<Inst>,
    /// The body region.
    pub body: Region,
    /// Required subgroup size; 0 lets the work-group-size pass choose.
    pub subgroup_size: i32,
    /// 2D work-group size; `[0, 0]` lets the work-group-size pass choose.
    pub work_group_size: [i32; 2],
    /// High-water mark of the local-memory stack in bytes; set by the
    /// stack-slot pass.
    pub stack_high_water: i64,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Function {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Creates a value of the given type.
    pub fn make_value(&mut self, ty: Handle<Type>, name: Option<&str>) -> Handle<Value> {
        self.values.append(Value {
            name: name.map(str::to_string),
            ty,
        })
    }
}

/// A whole compilation unit.
#[derive(Debug)]
pub struct Program {
    /// Interned types shared by all functions.
    pub types: Arena<Type>,
    pub functions: Vec<Function>,
    /// Byte width of the `index` scalar (4 or 8).
    pub index_width: Bytes,
}

impl Program {
    pub fn new() -> Self {
        Program {
            types: Arena::new(),
            functions: Vec::new(),
            index_width: 8,
        }
    }

    /// Interns a type, returning the canonical handle.
    pub fn intern(&mut self, ty: Type) -> Handle<Type> {
        self.types.fetch_or_append(ty)
    }

    pub fn scalar(&mut self, kind: ScalarKind) -> Handle<Type> {
        self.intern(Type::Scalar(kind))
    }

    pub fn bool_ty(&mut self) -> Handle<Type> {
        self.intern(Type::Bool)
    }
}

/// Launch parameters of one compiled kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelMetadata {
    pub subgroup_size: i32,
    pub work_group_size: [i32; 2],
}

/// A compiled SPIR-V module plus everything a loader needs to launch its
/// kernels.
#[derive(Debug)]
pub struct Binary {
    /// Little-endian SPIR-V word stream.
    pub data: Vec<u8>,
    /// Kernel name to launch parameters.
    pub metadata: FastHashMap<String, KernelMetadata>,
    /// Device core features the module was compiled against.
    pub core_features: device::CoreFeatureFlags,
}

/// Compiles a program for the given device.
///
/// Runs verification, the optimization pipeline and SPIR-V lowering. Either
/// a [`Binary`] is produced or a bundle of diagnostics; partial output is
/// never returned.
pub fn compile(program: &mut Program, device: &DeviceInfo) -> Result<Binary, Diagnostics> {
    pass::verify::verify(program)?;
    pass::optimize(program, device)?;
    back::spv::write_program(program, device).map_err(Diagnostics::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_interning() {
        let mut program = Program::new();
        let a = program.scalar(ScalarKind::F32);
        let b = program.scalar(ScalarKind::F32);
        let c = program.scalar(ScalarKind::I32);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let m1 = program.intern(Type::Memref {
            element: ScalarKind::F32,
            shape: vec![16, DYNAMIC],
            stride: vec![1, 16],
            space: AddressSpace::Global,
        });
        let m2 = program.intern(Type::Memref {
            element: ScalarKind::F32,
            shape: vec![16, DYNAMIC],
            stride: vec![1, 16],
            space: AddressSpace::Global,
        });
        assert_eq!(m1, m2);
    }

    #[test]
    fn scalar_sizes() {
        assert_eq!(ScalarKind::BF16.size(8), 2);
        assert_eq!(ScalarKind::Index.size(4), 4);
        assert_eq!(ScalarKind::Index.size(8), 8);
        assert_eq!(ScalarKind::C64.size(8), 16);
        assert_eq!(ScalarKind::C32.element_kind(), ScalarKind::F32);
    }
}
