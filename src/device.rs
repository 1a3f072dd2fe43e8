//! Target device description.
//!
//! The lowering consumes a tabulated [`DeviceInfo`]: which subgroup sizes the
//! device can dispatch, how much register file and shared local memory one
//! work-group may use, and which matrix shapes the systolic array executes
//! natively. Nothing here is probed at runtime; entries for known devices are
//! provided as constructors.

use crate::error::{CompileError, ErrorCode, Span};
use crate::ScalarKind;

bitflags::bitflags! {
    /// Optional device modes a binary may have been compiled against.
    pub struct CoreFeatureFlags: u32 {
        /// The large register file mode (fewer threads, twice the GRF).
        const LARGE_REGISTER_FILE = 0x1;
    }
}

impl Default for CoreFeatureFlags {
    fn default() -> Self {
        CoreFeatureFlags::empty()
    }
}

/// Resolved per-subgroup-size resource limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreConfig {
    pub subgroup_size: i32,
    /// Maximum number of work-items in one work-group.
    pub max_work_group_size: i32,
    /// Register file bytes available to one subgroup.
    pub register_space: i32,
    /// Whether subgroup block reads/writes are profitable on this device.
    pub block_io: bool,
}

/// One natively supported multiply-accumulate shape.
///
/// The tuple `(a, b, c, result, m, n, k)` mirrors the operand types and the
/// `M x N += M x K * K x N` shape of the systolic instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MatrixShape {
    pub a: ScalarKind,
    pub b: ScalarKind,
    pub c: ScalarKind,
    pub result: ScalarKind,
    pub m: i64,
    pub n: i64,
    pub k: i64,
}

/// Description of the systolic matrix extension, when present.
#[derive(Clone, Debug)]
pub struct MatrixInfo {
    /// Subgroup size the matrix pipeline requires.
    pub subgroup_size: i32,
    /// Minimum base address alignment in bytes for 2D block I/O.
    pub base_address_alignment: i32,
    /// Alignment of the starting column position in bytes.
    pub pos_alignment: i32,
    /// Alignment of the outer stride in bytes.
    pub stride_alignment: i32,
    /// Supported `(A, B, C, R, M, N, K)` tuples.
    pub shapes: Vec<MatrixShape>,
}

/// Tabulated description of one accelerator device.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    /// Subgroup sizes the device can dispatch, ascending.
    pub subgroup_sizes: Vec<i32>,
    /// Size of one register in bytes.
    pub register_size: i32,
    /// Registers available per hardware thread.
    pub num_registers_per_thread: i32,
    /// Shared local memory per work-group in bytes.
    pub local_memory_size: i32,
    /// Maximum number of work-items in one work-group.
    pub max_work_group_size: i32,
    pub core_features: CoreFeatureFlags,
    /// Matrix extension table; `None` when the device has no systolic array.
    pub matrix: Option<MatrixInfo>,
}

impl DeviceInfo {
    /// Ponte Vecchio (Xe HPC).
    pub fn pvc() -> Self {
        let shapes = [ScalarKind::BF16, ScalarKind::F16, ScalarKind::I8]
            .iter()
            .flat_map(|&ab| {
                let (c, k) = match ab {
                    ScalarKind::I8 => (ScalarKind::I32, 32),
                    _ => (ScalarKind::F32, 16),
                };
                (0..4).map(move |i| MatrixShape {
                    a: ab,
                    b: ab,
                    c,
                    result: c,
                    m: 8 << (i % 2),
                    n: if i < 2 { 8 } else { 16 },
                    k,
                })
            })
            .collect();
        DeviceInfo {
            subgroup_sizes: vec![16, 32],
            register_size: 64,
            num_registers_per_thread: 128,
            local_memory_size: 128 * 1024,
            max_work_group_size: 1024,
            core_features: CoreFeatureFlags::empty(),
            matrix: Some(MatrixInfo {
                subgroup_size: 16,
                base_address_alignment: 64,
                pos_alignment: 4,
                stride_alignment: 8,
                shapes,
            }),
        }
    }

    /// Tiger Lake (Xe LP); no systolic array.
    pub fn tgl() -> Self {
        DeviceInfo {
            subgroup_sizes: vec![8, 16, 32],
            register_size: 32,
            num_registers_per_thread: 128,
            local_memory_size: 64 * 1024,
            max_work_group_size: 512,
            core_features: CoreFeatureFlags::empty(),
            matrix: None,
        }
    }

    /// Resolves the resource limits for one subgroup size.
    ///
    /// Fails with `unsupported_subgroup_size` when the device cannot
    /// dispatch the requested size.
    pub fn core_config(&self, subgroup_size: i32) -> Result<CoreConfig, CompileError> {
        if !self.subgroup_sizes.contains(&subgroup_size) {
            return Err(CompileError::with_note(
                Span::default(),
                ErrorCode::UnsupportedSubgroupSize,
                format!("subgroup size {}", subgroup_size),
            ));
        }
        let mut register_space = self.register_size * self.num_registers_per_thread;
        if self
            .core_features
            .contains(CoreFeatureFlags::LARGE_REGISTER_FILE)
        {
            register_space *= 2;
        }
        Ok(CoreConfig {
            subgroup_size,
            max_work_group_size: self.max_work_group_size,
            register_space,
            block_io: true,
        })
    }

    /// Looks up a native matrix shape; `None` means the generic lowering
    /// has to be used.
    pub fn matrix_shape(&self, shape: &MatrixShape) -> Option<&MatrixShape> {
        self.matrix.as_ref()?.shapes.iter().find(|s| *s == shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pvc_supports_dpas_bf16() {
        let info = DeviceInfo::pvc();
        let shape = MatrixShape {
            a: ScalarKind::BF16,
            b: ScalarKind::BF16,
            c: ScalarKind::F32,
            result: ScalarKind::F32,
            m: 8,
            n: 8,
            k: 16,
        };
        assert!(info.matrix_shape(&shape).is_some());
        assert_eq!(info.matrix.as_ref().unwrap().subgroup_size, 16);
    }

    #[test]
    fn unsupported_subgroup_size() {
        let info = DeviceInfo::pvc();
        assert!(info.core_config(16).is_ok());
        let err = info.core_config(7).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedSubgroupSize);
    }

    #[test]
    fn large_grf_doubles_register_space() {
        let mut info = DeviceInfo::pvc();
        let base = info.core_config(16).unwrap().register_space;
        info.core_features |= CoreFeatureFlags::LARGE_REGISTER_FILE;
        assert_eq!(info.core_config(16).unwrap().register_space, base * 2);
    }
}
