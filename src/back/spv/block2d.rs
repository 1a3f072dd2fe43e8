//! vISA text builders for Xe 2D block loads, stores and prefetches.
//!
//! The descriptor payload is a fixed 8-DWord header: base pointer low/high,
//! width-1, height-1, pitch-1, pos0, pos1, and a block-size field encoding
//! `((array_len-1) << 16) | ((cols-1) << 8) | (rows-1)`. Load and store walk
//! `(row_block, col_block)` lexicographically, advancing pos1 by `cols` and
//! pos0 by `rows` between iterations.

use std::fmt::Write;

use crate::ScalarKind;

pub(super) mod xe {
    pub const GRF_SIZE: i32 = 64;
    pub const EXEC_SIZE: i32 = 16;
    pub const CHANNEL_SIZE: i32 = 4;
    pub const SDEPTH: i32 = 8;
    pub const RCOUNT: i32 = 8;
}

/// Mints fresh virtual register names.
#[derive(Debug, Default)]
pub(super) struct TempCounter {
    counter: u64,
}

impl TempCounter {
    pub fn new() -> Self {
        TempCounter { counter: 0 }
    }

    pub fn make(&mut self, prefix: &str) -> String {
        let name = format!("{}{}", prefix, self.counter);
        self.counter += 1;
        name
    }
}

/// Geometry of one 2D block transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(super) struct BlockConfig {
    pub sty: ScalarKind,
    pub element_size: i32,
    pub array_length: i32,
    pub rows: i32,
    pub cols: i32,
    pub row_blocks: i32,
    pub col_blocks: i32,
    pub transpose: bool,
    pub vnni: bool,
    pub cache_level: i32,
}

impl BlockConfig {
    pub fn block_size_in_bytes(&self) -> i32 {
        self.element_size * self.array_length * self.rows * self.cols
    }

    pub fn block_size_in_num_grf(&self) -> i32 {
        self.block_size_in_bytes() / xe::GRF_SIZE
    }

    /// Register byte offset of the `(row_block, col_block)` block.
    pub fn byte_offset(&self, col_block: i32, row_block: i32) -> i32 {
        let mut offset = row_block;
        offset = col_block + offset * self.col_blocks;
        offset * self.block_size_in_bytes()
    }

    pub fn total_length(&self) -> i32 {
        self.array_length * self.rows * self.cols * self.row_blocks * self.col_blocks
    }
}

pub(super) fn visa_type(sty: ScalarKind) -> &'static str {
    match sty {
        ScalarKind::I8 => "b",
        ScalarKind::I16 => "w",
        ScalarKind::I32 => "d",
        ScalarKind::I64 | ScalarKind::Index => "q",
        ScalarKind::F16 => "hf",
        ScalarKind::BF16 => "bf",
        ScalarKind::F32 => "f",
        ScalarKind::F64 => "df",
        ScalarKind::C32 | ScalarKind::C64 => "f",
    }
}

/// DPAS source precision mnemonic.
pub(super) fn dpas_precision(sty: ScalarKind) -> &'static str {
    match sty {
        ScalarKind::F16 => "hf",
        ScalarKind::BF16 => "bf",
        _ => "s8",
    }
}

struct Block2dHelper<'a> {
    cfg: &'a BlockConfig,
    temp: String,
    tempq: String,
}

impl<'a> Block2dHelper<'a> {
    fn new(cfg: &'a BlockConfig, tmp: &mut TempCounter) -> Self {
        Block2dHelper {
            cfg,
            temp: tmp.make("temp"),
            tempq: tmp.make("tempq"),
        }
    }

    /// Builds the 8-DWord descriptor header from the asm arguments
    /// `$1..$6` (base pointer, width, height, pitch, pos0, pos1).
    fn header(&self, oasm: &mut String) {
        let cfg = self.cfg;
        let block_size: u32 = (((cfg.array_length - 1) as u32) << 16)
            | (((cfg.cols - 1) as u32) << 8)
            | (cfg.rows - 1) as u32;
        let _ = write!(
            oasm,
            ".decl {temp} v_type=G type=ud num_elts=8 align=wordx32\n\
             .decl {tempq} v_type=G type=uq num_elts=4 align=wordx32 alias=<{temp},0>\n\
             mov (M1,1) {tempq}(0,0)<1> $1(0,0)<0;1,0>\n\
             add (M1,1) {temp}(0,2)<1> $2(0,0)<0;1,0> -1:d\n\
             add (M1,1) {temp}(0,3)<1> $3(0,0)<0;1,0> -1:d\n\
             add (M1,1) {temp}(0,4)<1> $4(0,0)<0;1,0> -1:d\n\
             mov (M1,1) {temp}(0,5)<1> $5(0,0)<0;1,0>\n\
             mov (M1,1) {temp}(0,6)<1> $6(0,0)<0;1,0>\n\
             mov (M1,1) {temp}(0,7)<1> 0x{block_size:x}:ud\n",
            temp = self.temp,
            tempq = self.tempq,
            block_size = block_size,
        );
    }

    fn walk(&self, oasm: &mut String, mut io: impl FnMut(&mut String, i32, i32)) {
        let cfg = self.cfg;
        for m in 0..cfg.row_blocks {
            for n in 0..cfg.col_blocks {
                io(oasm, m, n);
                if n + 1 < cfg.col_blocks {
                    let _ = write!(
                        oasm,
                        "add (M1,1) {temp}(0,6)<1> {temp}(0,6)<0;1,0> {cols}:ud\n",
                        temp = self.temp,
                        cols = cfg.cols,
                    );
                }
            }
            if m + 1 < cfg.row_blocks {
                let _ = write!(
                    oasm,
                    "add (M1,1) {temp}(0,6)<1> {temp}(0,6)<0;1,0> {back}:ud\n\
                     add (M1,1) {temp}(0,5)<1> {temp}(0,5)<0;1,0> {rows}:ud\n",
                    temp = self.temp,
                    back = -(cfg.col_blocks - 1) * cfg.cols,
                    rows = cfg.rows,
                );
            }
        }
    }
}

pub(super) fn load_block2d_native(cfg: &BlockConfig, tmp: &mut TempCounter) -> String {
    let num_dst = cfg.block_size_in_num_grf().max(1).min(31) as u32;
    let desc = {
        let data_size: u32 = if cfg.element_size == 4 { 2 } else { 1 };
        let mut d: u32 = 3;
        if cfg.vnni {
            d |= 1 << 7;
        }
        if cfg.transpose {
            d |= 1 << 15;
        }
        d |= data_size << 9;
        d |= num_dst << 20;
        d |= 1 << 25;
        d
    };

    let mut oasm = String::from("{\n");
    let helper = Block2dHelper::new(cfg, tmp);
    helper.header(&mut oasm);
    helper.walk(&mut oasm, |oasm, m, n| {
        let _ = write!(
            oasm,
            "raw_sends.15.1.0.{num_dst} (M1, 1) 0x0:ud 0x{desc:x}:ud {temp}.0 %null.0 $0.{offset}\n",
            num_dst = num_dst,
            desc = desc,
            temp = helper.temp,
            offset = cfg.byte_offset(n, m),
        );
    });
    oasm.push_str("}\n");
    oasm
}

pub(super) fn store_block2d_native(cfg: &BlockConfig, tmp: &mut TempCounter) -> String {
    let num_src1 = cfg.block_size_in_num_grf().max(1).min(31) as u32;
    let desc = {
        let data_size: u32 = if cfg.element_size == 4 { 2 } else { 1 };
        let mut d: u32 = 7;
        d |= data_size << 9;
        d |= 1 << 25;
        d
    };

    let mut oasm = String::from("{\n");
    let helper = Block2dHelper::new(cfg, tmp);
    helper.header(&mut oasm);
    helper.walk(&mut oasm, |oasm, m, n| {
        let _ = write!(
            oasm,
            "raw_sends.15.1.{num_src1}.0 (M1, 1) 0x0:ud 0x{desc:x}:ud {temp}.0 $0.{offset} %null.0\n",
            num_src1 = num_src1,
            desc = desc,
            temp = helper.temp,
            offset = cfg.byte_offset(n, m),
        );
    });
    oasm.push_str("}\n");
    oasm
}

pub(super) fn prefetch_block2d_native(cfg: &BlockConfig, tmp: &mut TempCounter) -> String {
    // Prefetches carry no destination payload; the cache level selects the
    // L1/L3 control bits of the descriptor.
    let desc = {
        let data_size: u32 = if cfg.element_size == 4 { 2 } else { 1 };
        let mut d: u32 = 3;
        d |= data_size << 9;
        d |= 1 << 25;
        let cache: u32 = match cfg.cache_level {
            0 => 5,
            _ => 2,
        };
        d |= cache << 17;
        d
    };

    let mut oasm = String::from("{\n");
    let helper = Block2dHelper::new(cfg, tmp);
    helper.header(&mut oasm);
    helper.walk(&mut oasm, |oasm, _m, _n| {
        let _ = write!(
            oasm,
            "raw_sends.15.1.0.0 (M1, 1) 0x0:ud 0x{desc:x}:ud {temp}.0 %null.0 %null.0\n",
            desc = desc,
            temp = helper.temp,
        );
    });
    oasm.push_str("}\n");
    oasm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BlockConfig {
        BlockConfig {
            sty: ScalarKind::BF16,
            element_size: 2,
            array_length: 1,
            rows: 8,
            cols: 16,
            row_blocks: 1,
            col_blocks: 2,
            transpose: false,
            vnni: false,
            cache_level: -1,
        }
    }

    #[test]
    fn temp_counter_mints_fresh_names() {
        let mut tmp = TempCounter::new();
        assert_eq!(tmp.make("temp"), "temp0");
        assert_eq!(tmp.make("temp"), "temp1");
        assert_eq!(tmp.make("matrix_A"), "matrix_A2");
    }

    #[test]
    fn header_encodes_block_size_field() {
        let cfg = config();
        let mut tmp = TempCounter::new();
        let code = load_block2d_native(&cfg, &mut tmp);
        // ((1-1)<<16) | ((16-1)<<8) | (8-1) = 0xf07
        assert!(code.contains("0xf07:ud"));
        assert!(code.starts_with("{\n.decl temp0"));
        assert!(code.ends_with("}\n"));
    }

    #[test]
    fn load_walks_column_blocks() {
        let cfg = config();
        let mut tmp = TempCounter::new();
        let code = load_block2d_native(&cfg, &mut tmp);
        assert_eq!(code.matches("raw_sends").count(), 2);
        // The second block starts at the register offset of one block.
        let expected = format!("$0.{}", cfg.block_size_in_bytes());
        assert!(code.contains(&expected));
        // pos0 advances by cols between column blocks.
        assert!(code.contains("add (M1,1) temp0(0,6)<1> temp0(0,6)<0;1,0> 16:ud"));
    }

    #[test]
    fn store_swaps_payload_operands() {
        let cfg = config();
        let mut tmp = TempCounter::new();
        let code = store_block2d_native(&cfg, &mut tmp);
        assert!(code.contains("$0.0 %null.0\n"));
        // 8 x 16 bf16 is four GRFs of payload per block.
        assert_eq!(code.matches("raw_sends.15.1.4.0").count(), 2);
    }

    #[test]
    fn prefetch_has_no_payload() {
        let cfg = config();
        let mut tmp = TempCounter::new();
        let code = prefetch_block2d_native(&cfg, &mut tmp);
        assert!(code.contains("%null.0 %null.0"));
    }
}
