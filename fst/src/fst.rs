//! Reader for GTKWave's FST container.
//!
//! Opening a file reads the small metadata blocks (header, geometry,
//! hierarchy and blackouts) and records where each value change block is,
//! without decoding it. Wave data is only decoded in `read_value_changes`,
//! and only for the vars selected in the process mask.

use crate::{
    values::{frame_size, push_frame_value, read_wave_value},
    varint::{decode_svarint, decode_varint, varint_length, VarintReader},
};
use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io::{self, BufRead, BufReader, Cursor, Read, Seek, SeekFrom},
    ops::{ControlFlow, Range},
    path::Path,
};

use log::{debug, info};

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use derive_more::{From, Into};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use flate2::bufread::{GzDecoder, ZlibDecoder};
use typed_index_collections::TiVec;

#[derive(From, Into, Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockId(pub usize);

#[derive(From, Into, Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct VarId(pub usize);

#[allow(non_camel_case_types)]
#[derive(FromPrimitive, Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) enum BlockType {
    FST_BL_HDR = 0,
    FST_BL_VCDATA = 1,
    FST_BL_BLACKOUT = 2,
    FST_BL_GEOM = 3,
    FST_BL_HIER = 4,
    FST_BL_VCDATA_DYN_ALIAS = 5,
    FST_BL_HIER_LZ4 = 6,
    FST_BL_HIER_LZ4DUO = 7,
    FST_BL_VCDATA_DYN_ALIAS2 = 8,
    FST_BL_ZWRAPPER = 254,
    FST_BL_SKIP = 255,
}

/// The variable types that can appear in the hierarchy. The tag byte of a
/// var entry is one of these.
#[allow(non_camel_case_types)]
#[derive(FromPrimitive, Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum VarType {
    FST_VT_VCD_EVENT = 0,
    FST_VT_VCD_INTEGER = 1,
    FST_VT_VCD_PARAMETER = 2,
    FST_VT_VCD_REAL = 3,
    FST_VT_VCD_REAL_PARAMETER = 4,
    FST_VT_VCD_REG = 5,
    FST_VT_VCD_SUPPLY0 = 6,
    FST_VT_VCD_SUPPLY1 = 7,
    FST_VT_VCD_TIME = 8,
    FST_VT_VCD_TRI = 9,
    FST_VT_VCD_TRIAND = 10,
    FST_VT_VCD_TRIOR = 11,
    FST_VT_VCD_TRIREG = 12,
    FST_VT_VCD_TRI0 = 13,
    FST_VT_VCD_TRI1 = 14,
    FST_VT_VCD_WAND = 15,
    FST_VT_VCD_WIRE = 16,
    FST_VT_VCD_WOR = 17,
    FST_VT_VCD_PORT = 18,
    FST_VT_VCD_SPARRAY = 19,
    FST_VT_VCD_REALTIME = 20,
    FST_VT_GEN_STRING = 21,
    FST_VT_SV_BIT = 22,
    FST_VT_SV_LOGIC = 23,
    FST_VT_SV_INT = 24,
    FST_VT_SV_SHORTINT = 25,
    FST_VT_SV_LONGINT = 26,
    FST_VT_SV_BYTE = 27,
    FST_VT_SV_ENUM = 28,
    FST_VT_SV_SHORTREAL = 29,
}

impl VarType {
    /// The VCD `$var` keyword for this type.
    pub fn keyword(self) -> &'static str {
        match self {
            VarType::FST_VT_VCD_EVENT => "event",
            VarType::FST_VT_VCD_INTEGER => "integer",
            VarType::FST_VT_VCD_PARAMETER => "parameter",
            VarType::FST_VT_VCD_REAL => "real",
            VarType::FST_VT_VCD_REAL_PARAMETER => "real_parameter",
            VarType::FST_VT_VCD_REG => "reg",
            VarType::FST_VT_VCD_SUPPLY0 => "supply0",
            VarType::FST_VT_VCD_SUPPLY1 => "supply1",
            VarType::FST_VT_VCD_TIME => "time",
            VarType::FST_VT_VCD_TRI => "tri",
            VarType::FST_VT_VCD_TRIAND => "triand",
            VarType::FST_VT_VCD_TRIOR => "trior",
            VarType::FST_VT_VCD_TRIREG => "trireg",
            VarType::FST_VT_VCD_TRI0 => "tri0",
            VarType::FST_VT_VCD_TRI1 => "tri1",
            VarType::FST_VT_VCD_WAND => "wand",
            VarType::FST_VT_VCD_WIRE => "wire",
            VarType::FST_VT_VCD_WOR => "wor",
            VarType::FST_VT_VCD_PORT => "port",
            VarType::FST_VT_VCD_SPARRAY => "sparray",
            VarType::FST_VT_VCD_REALTIME => "realtime",
            VarType::FST_VT_GEN_STRING => "string",
            VarType::FST_VT_SV_BIT => "bit",
            VarType::FST_VT_SV_LOGIC => "logic",
            VarType::FST_VT_SV_INT => "int",
            VarType::FST_VT_SV_SHORTINT => "shortint",
            VarType::FST_VT_SV_LONGINT => "longint",
            VarType::FST_VT_SV_BYTE => "byte",
            VarType::FST_VT_SV_ENUM => "enum",
            VarType::FST_VT_SV_SHORTREAL => "shortreal",
        }
    }
}

pub(crate) static REAL_ENDIANNESS_LITTLE: u64 = 0x4005BF0A8B145769;
pub(crate) static REAL_ENDIANNESS_BIG: u64 = 0x6957148B0ABF0540;

pub(crate) const FST_ST_GEN_ATTRBEGIN: u8 = 252;
pub(crate) const FST_ST_GEN_ATTREND: u8 = 253;
pub(crate) const FST_ST_VCD_SCOPE: u8 = 254;
pub(crate) const FST_ST_VCD_UPSCOPE: u8 = 255;

/// Length of the header block contents.
pub(crate) const HEADER_LENGTH: u64 = 321;

const MAX_NAME_LENGTH: u64 = 64 * 1024;

/// Byte order of real values, detected from the `e` stored in the header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RealEndianness {
    Little,
    Big,
}

impl RealEndianness {
    /// The header test value as read by a little endian `u64` read.
    pub(crate) fn from_test_value(value: u64) -> Option<Self> {
        if value == REAL_ENDIANNESS_LITTLE {
            Some(RealEndianness::Little)
        } else if value == REAL_ENDIANNESS_BIG {
            Some(RealEndianness::Big)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct Header {
    pub start_time: u64,
    pub end_time: u64,
    pub real_endianness: RealEndianness,
    pub writer_memory_use: u64,
    pub num_scopes: u64,
    pub num_hierarchy_vars: u64,
    pub num_vars: u64,
    pub num_vc_blocks: u64,
    /// Power of ten of one time unit, e.g. -9 for 1ns.
    pub timescale: i8,
    pub writer: [u8; 128],
    pub date: [u8; 26],
    pub reserved: [u8; 93],
    pub filetype: u8,
    pub timezero: i64,
}

fn array_to_string<const T: usize>(x: &[u8; T]) -> String {
    String::from_utf8_lossy(&x[0..x.iter().position(|b| *b == 0).unwrap_or(x.len())])
        .trim_end()
        .to_string()
}

impl Header {
    pub fn writer_string(&self) -> String {
        array_to_string(&self.writer)
    }
    pub fn date_string(&self) -> String {
        array_to_string(&self.date)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlackoutType {
    DumpOn,
    DumpOff,
}

/// How the position table of a value change block is encoded. Each value
/// change block type uses a different one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockEncoding {
    /// `FST_BL_VCDATA`: offsets and zero runs, no aliases.
    Plain,
    /// `FST_BL_VCDATA_DYN_ALIAS`: adds aliases to earlier vars.
    DynamicAlias,
    /// `FST_BL_VCDATA_DYN_ALIAS2`: signed varints, aliases can repeat.
    DynamicAlias2,
}

/// Where a value change block is, so it can be decoded later.
#[derive(Clone, Debug)]
pub struct ValueChangeBlockInfo {
    pub encoding: BlockEncoding,
    /// Offset in the file of `vc_start_time`, just after the block length.
    pub data_offset: u64,
    /// Length of the block excluding the type and length fields.
    pub length: u64,
    pub start_time: u64,
    pub end_time: u64,
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum VarLength {
    Bits(u32),
    Real,
}

#[derive(Clone, Debug, Default)]
pub struct VarLengths {
    /// Geometry block is fully read into memory. There are two sentinel values.
    /// VAR_LENGTH_REAL for reals and VAR_LENGTH_LONG for when it was too
    /// big to fit. In that case it is in `lengths_long`.
    pub lengths: TiVec<VarId, u8>,

    /// Var lengths for vars that have the value VAR_LENGTH_LONG.
    pub lengths_long: HashMap<VarId, u32>,
}

const VAR_LENGTH_REAL: u8 = 0xFE;
const VAR_LENGTH_LONG: u8 = 0xFF;

impl VarLengths {
    pub fn length(&self, varid: VarId) -> VarLength {
        match self.lengths[varid] {
            VAR_LENGTH_REAL => VarLength::Real,
            VAR_LENGTH_LONG => VarLength::Bits(self.lengths_long[&varid]),
            x => VarLength::Bits(x as u32),
        }
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    fn push(&mut self, length: VarLength) {
        match length {
            VarLength::Real => {
                self.lengths.push(VAR_LENGTH_REAL);
            }
            VarLength::Bits(bits) if bits >= VAR_LENGTH_REAL as u32 => {
                self.lengths_long.insert(VarId(self.lengths.len()), bits);
                self.lengths.push(VAR_LENGTH_LONG);
            }
            VarLength::Bits(bits) => {
                self.lengths.push(bits as u8);
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct HierarchyVar {
    pub var_type: u8,
    pub direction: u8,
    pub name: String,
    /// Names of the enclosing scopes and the var joined with `.`.
    pub path: String,
    pub length: u64,
    pub id: VarId,
    pub is_alias: bool,
}

impl HierarchyVar {
    pub fn var_type(&self) -> Option<VarType> {
        VarType::from_u8(self.var_type)
    }
}

/// The design hierarchy flattened to its vars, in declaration order.
#[derive(Debug, Default, Clone)]
pub struct Hierarchy {
    pub vars: Vec<HierarchyVar>,
    pub num_scopes: usize,
    pub num_attributes: usize,
}

pub(crate) trait ReadArray {
    fn read_array<const T: usize>(&mut self) -> std::io::Result<[u8; T]>;

    fn read_vec(&mut self, length: u64) -> std::io::Result<Vec<u8>>;

    fn read_tinyvec<const N: usize>(
        &mut self,
        length: usize,
    ) -> std::io::Result<tinyvec::TinyVec<[u8; N]>>;
}

impl<R> ReadArray for R
where
    R: Read,
{
    fn read_array<const T: usize>(&mut self) -> std::io::Result<[u8; T]> {
        let mut buf = [0; T];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Lengths come from the file so the buffer grows as data arrives
    /// instead of being allocated up front.
    fn read_vec(&mut self, length: u64) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.take(length).read_to_end(&mut buf)?;
        if buf.len() as u64 != length {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        Ok(buf)
    }

    fn read_tinyvec<const N: usize>(
        &mut self,
        length: usize,
    ) -> std::io::Result<tinyvec::TinyVec<[u8; N]>> {
        if length > N {
            return Ok(tinyvec::TinyVec::Heap(self.read_vec(length as u64)?));
        }
        let mut buf = tinyvec::TinyVec::<[u8; N]>::new();
        buf.resize(length, 0);
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

trait ReadString {
    fn read_null_terminated_string(&mut self, max_size: u64) -> std::io::Result<String>;
}

impl<R> ReadString for R
where
    R: BufRead,
{
    fn read_null_terminated_string(&mut self, max_size: u64) -> std::io::Result<String> {
        let mut buf = Vec::new();
        self.take(max_size).read_until(0, &mut buf)?;
        if buf.last() == Some(&0) {
            buf.pop();
        } else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unterminated string",
            ));
        }
        Ok(String::from_utf8_lossy(&buf).to_string())
    }
}

/// A value decoded from a block, waiting to be sorted by time.
struct PendingChange {
    time_index: u64,
    var: VarId,
    /// Range of the value in the block's value arena.
    value: Range<usize>,
}

/// Decoded position table entry for one var.
#[derive(Clone, Debug)]
enum PositionSlot {
    Empty,
    /// 1-based offset from the pack type byte.
    Offset(u64),
    Alias(VarId),
}

#[derive(Debug)]
pub struct FstReader<R> {
    /// Header block fully read into memory.
    pub header: Header,

    /// Hierarchy block is fully read into memory.
    pub hierarchy: Hierarchy,

    /// Length of each variable in bits.
    pub var_lengths: VarLengths,

    /// Location and time span of each Value Change block, in file order.
    pub blocks: TiVec<BlockId, ValueChangeBlockInfo>,

    /// Blackout block is fully read into memory. This is optional.
    pub blackouts: Vec<(BlackoutType, u64)>,

    /// Vars whose changes `read_value_changes` reports.
    process_mask: TiVec<VarId, bool>,

    /// The file reader; used when actually reading the waves.
    reader: R,
}

impl FstReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
        Self::new(BufReader::new(f))
    }
}

impl<R: BufRead + Seek> FstReader<R> {
    /// Read the metadata blocks and index the Value Change blocks.
    pub fn new(mut reader: R) -> Result<Self> {
        let mut expected_block_types: HashSet<BlockType> = Default::default();
        expected_block_types.insert(BlockType::FST_BL_HDR);

        let mut header = None;
        let mut blocks: TiVec<BlockId, ValueChangeBlockInfo> = TiVec::new();
        let mut hierarchy = None;
        let mut blackouts = None;
        let mut var_lengths = None;

        loop {
            let block_type = match reader.read_u8() {
                Ok(block_type) => block_type,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e).context("Reading block type"),
            };
            let block_type = match BlockType::from_u8(block_type) {
                Some(b) => b,
                None => {
                    bail!("Unknown block type {}", block_type);
                }
            };

            if !expected_block_types.contains(&block_type) {
                bail!(
                    "Unexpected block type {:?}; expected one of {:?}",
                    &block_type,
                    &expected_block_types
                );
            }

            let block_length_position = reader.stream_position()?;

            let block_length_including_length = reader.read_u64::<BigEndian>()?;
            let block_length = block_length_including_length
                .checked_sub(8)
                .context("Invalid block length (must be >= 8).")?;
            let block_end = block_length_position
                .checked_add(block_length_including_length)
                .context("Invalid block length (past the end of the file).")?;

            match block_type {
                BlockType::FST_BL_HDR => {
                    if block_length != HEADER_LENGTH {
                        bail!("Invalid header block length {block_length} (should be {HEADER_LENGTH})");
                    }

                    let h = Self::read_header(&mut reader)?;
                    info!(
                        "FST written by {:?}: {} to {}, {} vars, {} blocks",
                        h.writer_string(),
                        h.start_time,
                        h.end_time,
                        h.num_vars,
                        h.num_vc_blocks
                    );
                    header = Some(h);

                    expected_block_types.remove(&BlockType::FST_BL_HDR);
                    expected_block_types.insert(BlockType::FST_BL_VCDATA);
                    expected_block_types.insert(BlockType::FST_BL_BLACKOUT);
                    expected_block_types.insert(BlockType::FST_BL_GEOM);
                    expected_block_types.insert(BlockType::FST_BL_HIER);
                    expected_block_types.insert(BlockType::FST_BL_VCDATA_DYN_ALIAS);
                    expected_block_types.insert(BlockType::FST_BL_HIER_LZ4);
                    expected_block_types.insert(BlockType::FST_BL_HIER_LZ4DUO);
                    expected_block_types.insert(BlockType::FST_BL_VCDATA_DYN_ALIAS2);
                    expected_block_types.insert(BlockType::FST_BL_ZWRAPPER);
                    expected_block_types.insert(BlockType::FST_BL_SKIP);
                }
                BlockType::FST_BL_VCDATA
                | BlockType::FST_BL_VCDATA_DYN_ALIAS
                | BlockType::FST_BL_VCDATA_DYN_ALIAS2 => {
                    let encoding = match block_type {
                        BlockType::FST_BL_VCDATA => BlockEncoding::Plain,
                        BlockType::FST_BL_VCDATA_DYN_ALIAS => BlockEncoding::DynamicAlias,
                        _ => BlockEncoding::DynamicAlias2,
                    };
                    let info =
                        Self::read_value_change_block_info(&mut reader, encoding, block_length)?;
                    debug!(
                        "Value Change block {} ({:?}): {} to {}",
                        blocks.len(),
                        encoding,
                        info.start_time,
                        info.end_time
                    );
                    blocks.push(info);
                }
                BlockType::FST_BL_BLACKOUT => {
                    blackouts = Some(Self::read_blackout_block(&mut reader)?);
                    // There should only be one blackout block.
                    expected_block_types.remove(&BlockType::FST_BL_BLACKOUT);
                }
                BlockType::FST_BL_GEOM => {
                    var_lengths = Some(Self::read_geometry_block(&mut reader, block_length)?);
                    // There should only be one geometry block.
                    expected_block_types.remove(&BlockType::FST_BL_GEOM);
                }
                BlockType::FST_BL_HIER
                | BlockType::FST_BL_HIER_LZ4
                | BlockType::FST_BL_HIER_LZ4DUO => {
                    hierarchy = Some(
                        Self::read_hierarchy(&mut reader, block_type, block_length)
                            .context("Reading hierarchy")?,
                    );

                    expected_block_types.remove(&BlockType::FST_BL_HIER);
                    expected_block_types.remove(&BlockType::FST_BL_HIER_LZ4);
                    expected_block_types.remove(&BlockType::FST_BL_HIER_LZ4DUO);
                }
                BlockType::FST_BL_ZWRAPPER => {
                    bail!("This file is a GZip wrapped FST file (FST_BL_ZWRAPPER) which is not supported. Decompress it first.");
                }
                BlockType::FST_BL_SKIP => {
                    bail!("File contains a 'skip' block indicating it has not been finished writing. Reading partially complete files is not supported.");
                }
            }

            // Verify we are at the end of the block.
            let pos = reader.stream_position()?;
            if pos != block_end {
                bail!(
                    "Error after reading block {:?} Expected to be at position {} + {} = {}, but actually at {}.",
                    block_type,
                    block_length_position,
                    block_length_including_length,
                    block_end,
                    pos,
                );
            }
        }

        let header = match header {
            Some(h) => h,
            None => {
                bail!("Empty file");
            }
        };

        let hierarchy = match hierarchy {
            Some(h) => h,
            None => {
                bail!("Missing hierarchy block");
            }
        };

        let var_lengths = match var_lengths {
            Some(v) => v,
            None => {
                bail!("Missing geometry block");
            }
        };

        if (var_lengths.len() as u64) < header.num_vars {
            bail!(
                "Geometry block has {} vars but the header says there are {}",
                var_lengths.len(),
                header.num_vars
            );
        }

        if let Some(var) = hierarchy.vars.iter().find(|v| v.id.0 >= var_lengths.len()) {
            bail!(
                "Var {:?} refers to handle {} but there are only {} handles",
                var.path,
                var.id.0 + 1,
                var_lengths.len()
            );
        }

        if blocks.len() as u64 != header.num_vc_blocks {
            debug!(
                "Header says there are {} Value Change blocks but found {}",
                header.num_vc_blocks,
                blocks.len()
            );
        }

        let process_mask = vec![false; var_lengths.len()].into();

        Ok(Self {
            header,
            hierarchy,
            var_lengths,
            blocks,
            blackouts: blackouts.unwrap_or_default(),
            process_mask,
            reader,
        })
    }

    pub fn num_vars(&self) -> usize {
        self.var_lengths.len()
    }

    /// Deselect all vars.
    pub fn clear_process_mask_all(&mut self) {
        self.process_mask.iter_mut().for_each(|m| *m = false);
    }

    /// Select all vars.
    pub fn set_process_mask_all(&mut self) {
        self.process_mask.iter_mut().for_each(|m| *m = true);
    }

    /// Select a var so that its changes are reported.
    pub fn set_process_mask(&mut self, varid: VarId) -> Result<()> {
        let mask = self
            .process_mask
            .get_mut(varid)
            .with_context(|| format!("Invalid var ID {}", varid.0))?;
        *mask = true;
        Ok(())
    }

    pub fn is_masked(&self, varid: VarId) -> bool {
        self.process_mask.get(varid).copied().unwrap_or(false)
    }

    /// Report the changes of the masked vars with times in
    /// `start_time..=end_time`, in non-decreasing time order. The initial
    /// values stored in the first block are reported at its start time.
    ///
    /// Blocks that end before `start_time` are not decoded and reading stops
    /// at the first block that starts after `end_time`, or when `callback`
    /// returns `ControlFlow::Break`.
    pub fn read_value_changes(
        &mut self,
        start_time: u64,
        end_time: u64,
        mut callback: impl FnMut(u64, VarId, &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        let masked: Vec<VarId> = self
            .process_mask
            .iter_enumerated()
            .filter(|(_, &masked)| masked)
            .map(|(varid, _)| varid)
            .collect();

        if masked.is_empty() {
            return Ok(());
        }

        for (block_id, info) in self.blocks.clone().iter_enumerated() {
            if info.start_time > end_time {
                debug!("Block {} starts after {end_time}; stopping", block_id.0);
                break;
            }
            if info.end_time < start_time {
                debug!("Block {} ends before {start_time}; skipping", block_id.0);
                continue;
            }

            let flow = self
                .read_block_changes(block_id, info, &masked, start_time, end_time, &mut callback)
                .with_context(|| format!("Reading Value Change block {}", block_id.0))?;

            if flow.is_break() {
                break;
            }
        }
        Ok(())
    }

    fn read_block_changes(
        &mut self,
        block_id: BlockId,
        info: &ValueChangeBlockInfo,
        masked: &[VarId],
        start_time: u64,
        end_time: u64,
        callback: &mut impl FnMut(u64, VarId, &[u8]) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>> {
        let reader = &mut self.reader;
        let endianness = self.header.real_endianness;
        let block_end = info.data_offset + info.length;

        // Skip vc_start_time, vc_end_time and vc_memory_required.
        reader.seek(SeekFrom::Start(info.data_offset + 24))?;

        let frame_uncompressed_length = reader.read_varint()?;
        let frame_compressed_length = reader.read_varint()?;
        let frame_count = reader.read_varint()?;
        let frame_offset = reader.stream_position()?;

        let mut values = Vec::new();

        if block_id.0 == 0 && (start_time..=end_time).contains(&info.start_time) {
            let frame =
                Self::read_section(reader, frame_compressed_length, frame_uncompressed_length)
                    .context("Reading frame")?;

            let mut offset = 0;
            for v in 0..frame_count.min(self.var_lengths.len() as u64) as usize {
                let varid = VarId(v);
                let length = self.var_lengths.length(varid);
                let size = frame_size(length);
                let raw = frame
                    .get(offset..offset + size)
                    .context("Frame is shorter than the var lengths")?;
                offset += size;

                if !self.process_mask[varid] || length == VarLength::Bits(0) {
                    continue;
                }

                values.clear();
                push_frame_value(raw, length, endianness, &mut values)?;
                if callback(info.start_time, varid, &values).is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            }
        }

        let waves_offset = frame_offset
            .checked_add(frame_compressed_length)
            .context("Invalid frame length")?;
        reader.seek(SeekFrom::Start(waves_offset))?;

        let waves_count = reader.read_varint()?;
        let waves_packtype = reader.read_u8()?;
        let waves_data_offset = reader.stream_position()?;

        // There's no waves length so now we have to read back from the end of the block.
        reader.seek(SeekFrom::Start(
            block_end
                .checked_sub(24)
                .context("Value Change time_uncompressed_length offset")?,
        ))?;

        let time_uncompressed_length = reader.read_u64::<BigEndian>()?;
        let time_compressed_length = reader.read_u64::<BigEndian>()?;
        let time_count = reader.read_u64::<BigEndian>()?;

        let position_length_offset = block_end
            .checked_sub(time_compressed_length)
            .and_then(|x| x.checked_sub(32))
            .context("Value Change position_length_offset")?;
        let time_data_offset = position_length_offset + 8;

        reader.seek(SeekFrom::Start(position_length_offset))?;
        let position_length = reader.read_u64::<BigEndian>()?;

        let position_data_offset = position_length_offset
            .checked_sub(position_length)
            .context("Value Change position_data_offset")?;

        let waves_data_length = position_data_offset
            .checked_sub(waves_data_offset)
            .context("Invalid Value Change block")?;

        if waves_count > self.var_lengths.len() as u64 {
            bail!(
                "Block has waves for {waves_count} vars but there are only {}",
                self.var_lengths.len()
            );
        }

        reader.seek(SeekFrom::Start(position_data_offset))?;
        let position_table = reader.read_vec(position_length)?;
        let wave_slices = decode_position_table(
            info.encoding,
            &position_table,
            waves_count as usize,
            waves_data_length,
        )
        .context("Decoding position table")?;

        reader.seek(SeekFrom::Start(time_data_offset))?;
        let times = Self::read_change_times(
            reader,
            time_compressed_length,
            time_uncompressed_length,
            time_count,
        )?;

        let mut changes = Vec::new();
        values.clear();

        for &varid in masked {
            let Some(slice) = wave_slices.get(varid) else {
                continue;
            };
            let length = self.var_lengths.length(varid);
            if slice.is_empty() || length == VarLength::Bits(0) {
                continue;
            }

            reader.seek(SeekFrom::Start(waves_data_offset + slice.start))?;
            let data = Self::read_wave_data(reader, slice.end - slice.start, waves_packtype)
                .with_context(|| format!("Reading wave data of var {}", varid.0))?;

            let mut cursor = Cursor::new(&data[..]);
            let mut time_index = 0;
            while (cursor.position() as usize) < data.len() {
                let value_start = values.len();
                let delta = read_wave_value(&mut cursor, length, endianness, &mut values)?;
                time_index = u64::checked_add(time_index, delta).context("Time index overflow")?;
                changes.push(PendingChange {
                    time_index,
                    var: varid,
                    value: value_start..values.len(),
                });
            }
        }

        debug!(
            "Block {}: {} changes for {} masked vars",
            block_id.0,
            changes.len(),
            masked.len()
        );

        // Stable, so changes at the same time stay in var order.
        changes.sort_by_key(|change| change.time_index);

        for change in changes {
            let time = *times.get(change.time_index as usize).with_context(|| {
                format!(
                    "Time index {} is out of range ({} times)",
                    change.time_index,
                    times.len()
                )
            })?;
            if time < start_time {
                continue;
            }
            if time > end_time {
                break;
            }
            if callback(time, change.var, &values[change.value]).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    fn read_header(reader: &mut impl BufRead) -> Result<Header> {
        let start_time = reader.read_u64::<BigEndian>()?;
        let end_time = reader.read_u64::<BigEndian>()?;
        if start_time > end_time {
            bail!("Header start time {start_time} is after the end time {end_time}");
        }
        // This is really the f64 `e`, but comparing bit patterns is easier.
        let real_endianness = reader.read_u64::<LittleEndian>()?;
        // One byte is not much of a magic number so we use `e` too.
        let real_endianness = match RealEndianness::from_test_value(real_endianness) {
            Some(e) => e,
            None => bail!("Not an FST file: {:x?}", real_endianness),
        };
        Ok(Header {
            start_time,
            end_time,
            real_endianness,
            writer_memory_use: reader.read_u64::<BigEndian>()?,
            num_scopes: reader.read_u64::<BigEndian>()?,
            num_hierarchy_vars: reader.read_u64::<BigEndian>()?,
            num_vars: reader.read_u64::<BigEndian>()?,
            num_vc_blocks: reader.read_u64::<BigEndian>()?,
            timescale: reader.read_i8()?,
            writer: reader.read_array()?,
            date: reader.read_array()?,
            reserved: reader.read_array()?,
            filetype: reader.read_u8()?,
            timezero: reader.read_i64::<BigEndian>()?,
        })
    }

    fn read_hierarchy(
        reader: &mut (impl BufRead + Seek),
        block_type: BlockType,
        block_length: u64,
    ) -> Result<Hierarchy> {
        let start_pos = reader.stream_position()?;
        let uncompressed_length = reader.read_u64::<BigEndian>()?;
        let compressed_length = block_length
            .checked_sub(8)
            .context("Invalid block length")?;

        let data = match block_type {
            BlockType::FST_BL_HIER => {
                let mut data = Vec::new();
                GzDecoder::new(reader.by_ref().take(compressed_length))
                    .read_to_end(&mut data)
                    .context("GZip decompression")?;
                // The decoder may stop before the end of the block.
                data
            }
            BlockType::FST_BL_HIER_LZ4 => {
                // lz4_flex only streams its frame format, and this is the
                // block format, so read it all into memory.
                let compressed = reader.read_vec(compressed_length)?;
                decompress_lz4(&compressed, uncompressed_length)?
            }
            BlockType::FST_BL_HIER_LZ4DUO => {
                let compressed_once_length = reader.read_varint()?;
                let compressed = reader.read_vec(
                    compressed_length
                        .checked_sub(varint_length(compressed_once_length) as u64)
                        .context("Invalid block length")?,
                )?;
                let compressed_once = decompress_lz4(&compressed, compressed_once_length)?;
                decompress_lz4(&compressed_once, uncompressed_length)?
            }
            _ => {
                bail!("Internal logic error (invalid block type for hierarchy)");
            }
        };

        if data.len() as u64 != uncompressed_length {
            bail!(
                "Hierarchy is {} bytes but should be {uncompressed_length}",
                data.len()
            );
        }

        // Restore the position at the end of the block, otherwise the block
        // reader complains.
        reader.seek(SeekFrom::Start(start_pos + block_length))?;

        parse_hierarchy(&data)
    }

    fn read_value_change_block_info(
        reader: &mut (impl BufRead + Seek),
        encoding: BlockEncoding,
        block_length: u64,
    ) -> Result<ValueChangeBlockInfo> {
        // Times and lengths at the start and end, plus the smallest frame,
        // waves and position table.
        if block_length < 61 {
            bail!("Value Change block is too short ({block_length} bytes)");
        }
        let data_offset = reader.stream_position()?;
        let start_time = reader.read_u64::<BigEndian>()?;
        let end_time = reader.read_u64::<BigEndian>()?;

        reader.seek(SeekFrom::Start(data_offset + block_length))?;

        Ok(ValueChangeBlockInfo {
            encoding,
            data_offset,
            length: block_length,
            start_time,
            end_time,
        })
    }

    fn read_geometry_block(
        reader: &mut (impl BufRead + Seek),
        block_length: u64,
    ) -> Result<VarLengths> {
        let uncompressed_length = reader.read_u64::<BigEndian>()?;
        let count = reader.read_u64::<BigEndian>()?;

        let compressed_length = block_length
            .checked_sub(16)
            .context("Invalid geometry block length")?;

        let data = Self::read_section(reader, compressed_length, uncompressed_length)
            .context("Reading geometry")?;
        let mut cursor = Cursor::new(&data[..]);

        let mut var_lengths = VarLengths::default();

        for _ in 0..count {
            let length = cursor.read_varint()?;
            var_lengths.push(match length {
                // Reals are always 8 bytes.
                0 => VarLength::Real,
                0xFFFFFFFF => VarLength::Bits(0),
                x => VarLength::Bits(
                    x.try_into()
                        .context("Variable has an insane number of bits")?,
                ),
            });
        }

        info!("Read lengths of {count} vars");

        Ok(var_lengths)
    }

    fn read_blackout_block(reader: &mut (impl BufRead + Seek)) -> Result<Vec<(BlackoutType, u64)>> {
        let count = reader.read_varint()?;

        let mut blackouts = Vec::new();

        let mut time: u64 = 0;

        for _ in 0..count {
            let activity = if reader.read_u8()? == 0 {
                BlackoutType::DumpOff
            } else {
                BlackoutType::DumpOn
            };
            time = time.wrapping_add(reader.read_varint()?);
            blackouts.push((activity, time));
        }

        Ok(blackouts)
    }

    /// Read a section that is ZLib compressed unless its compressed and
    /// uncompressed lengths are equal.
    fn read_section(
        reader: &mut impl BufRead,
        compressed_length: u64,
        uncompressed_length: u64,
    ) -> Result<Vec<u8>> {
        if compressed_length == uncompressed_length {
            return Ok(reader.read_vec(compressed_length)?);
        }
        let mut data = Vec::new();
        ZlibDecoder::new(reader.take(compressed_length))
            .read_to_end(&mut data)
            .context("ZLib decompression")?;
        if data.len() as u64 != uncompressed_length {
            bail!(
                "Decompressed {} bytes but expected {uncompressed_length}",
                data.len()
            );
        }
        Ok(data)
    }

    fn read_change_times(
        reader: &mut impl BufRead,
        compressed_length: u64,
        uncompressed_length: u64,
        count: u64,
    ) -> Result<Vec<u64>> {
        let data = Self::read_section(reader, compressed_length, uncompressed_length)
            .context("Reading time table")?;
        let mut cursor = Cursor::new(&data[..]);

        let mut times = Vec::new();
        let mut time: u64 = 0;

        for n in 0..count {
            time = time.wrapping_add(
                cursor
                    .read_varint()
                    .with_context(|| format!("Reading time table value {n}"))?,
            );
            times.push(time);
        }
        Ok(times)
    }

    fn read_wave_data(reader: &mut impl BufRead, slice_length: u64, packtype: u8) -> Result<Vec<u8>> {
        // The uncompressed length, or 0 if the data isn't compressed.
        let uncompressed_length_or_zero = reader.read_varint()?;

        let compressed_length = slice_length
            .checked_sub(varint_length(uncompressed_length_or_zero) as u64)
            .context("Wave data is shorter than its header")?;

        let compressed_data = reader.read_vec(compressed_length)?;

        Ok(match (uncompressed_length_or_zero, packtype) {
            (0, _) => compressed_data,
            (uncompressed_length, b'F') => {
                check_expansion(compressed_length, uncompressed_length)?;
                let mut uncompressed_data = vec![0; uncompressed_length as usize];
                let output = fastlz::decompress(&compressed_data, &mut uncompressed_data)
                    .ok()
                    .context("FastLZ decompression")?;
                if output.len() != uncompressed_data.len() {
                    bail!("Couldn't uncompress wave data using FastLZ");
                }
                uncompressed_data
            }
            (uncompressed_length, b'4') => decompress_lz4(&compressed_data, uncompressed_length)?,
            (uncompressed_length, _) => {
                let mut uncompressed_data = Vec::new();
                ZlibDecoder::new(&compressed_data[..])
                    .read_to_end(&mut uncompressed_data)
                    .context("ZLib decompression")?;
                if uncompressed_data.len() as u64 != uncompressed_length {
                    bail!(
                        "Wave data decompressed to {} bytes but should be {uncompressed_length}",
                        uncompressed_data.len()
                    );
                }
                uncompressed_data
            }
        })
    }
}

/// LZ4 and FastLZ can't expand data by more than this.
const MAX_EXPANSION: u64 = 256;

fn check_expansion(compressed_length: u64, uncompressed_length: u64) -> Result<()> {
    if uncompressed_length > compressed_length.saturating_mul(MAX_EXPANSION).saturating_add(64) {
        bail!("{compressed_length} bytes can't decompress to {uncompressed_length} bytes");
    }
    Ok(())
}

fn decompress_lz4(compressed: &[u8], uncompressed_length: u64) -> Result<Vec<u8>> {
    check_expansion(compressed.len() as u64, uncompressed_length)?;
    let data = lz4_flex::block::decompress(compressed, uncompressed_length as usize)
        .context("LZ4 decompression")?;
    Ok(data)
}

fn parse_hierarchy(data: &[u8]) -> Result<Hierarchy> {
    let mut cursor = Cursor::new(data);
    let mut hierarchy = Hierarchy::default();
    let mut scopes: Vec<String> = Vec::new();
    let mut next_varid = 0;

    while (cursor.position() as usize) < data.len() {
        let tag = cursor.read_u8()?;
        match tag {
            FST_ST_GEN_ATTRBEGIN => {
                let attr_type = cursor.read_u8()?;
                let attr_subtype = cursor.read_u8()?;
                let attr_name = cursor.read_null_terminated_string(MAX_NAME_LENGTH)?;
                let attr_value = cursor.read_varint()?;
                debug!("Attribute {attr_type}/{attr_subtype}: {attr_name:?} = {attr_value}");
                hierarchy.num_attributes += 1;
            }
            FST_ST_GEN_ATTREND => {}
            FST_ST_VCD_SCOPE => {
                let _scope_type = cursor.read_u8()?;
                let scope_name = cursor.read_null_terminated_string(MAX_NAME_LENGTH)?;
                let _scope_component = cursor.read_null_terminated_string(MAX_NAME_LENGTH)?;
                scopes.push(scope_name);
                hierarchy.num_scopes += 1;
            }
            FST_ST_VCD_UPSCOPE => {
                if scopes.pop().is_none() {
                    bail!("Upscope at the top level");
                }
            }
            var_type => {
                let direction = cursor.read_u8()?;
                // Some writers put a space before the bit range.
                let name = cursor
                    .read_null_terminated_string(MAX_NAME_LENGTH)?
                    .replace(" [", "[");
                let length = cursor.read_varint()?;
                let alias = cursor.read_varint()?;

                let id = if alias == 0 {
                    let id = next_varid;
                    next_varid += 1;
                    id
                } else {
                    (alias - 1) as usize
                };

                let path = if scopes.is_empty() {
                    name.clone()
                } else {
                    format!("{}.{}", scopes.join("."), name)
                };

                hierarchy.vars.push(HierarchyVar {
                    var_type,
                    direction,
                    name,
                    path,
                    length,
                    id: VarId(id),
                    is_alias: alias != 0,
                });
            }
        }
    }

    info!(
        "Read hierarchy: {} scopes, {} vars ({} handles)",
        hierarchy.num_scopes,
        hierarchy.vars.len(),
        next_varid
    );

    Ok(hierarchy)
}

/// Work out the byte range of each var's wave data, relative to the first
/// byte after the pack type. Vars with no changes get an empty range.
fn decode_position_table(
    encoding: BlockEncoding,
    table: &[u8],
    count: usize,
    waves_data_length: u64,
) -> Result<TiVec<VarId, Range<u64>>> {
    let mut slots: TiVec<VarId, PositionSlot> = TiVec::new();
    let mut cursor = Cursor::new(table);
    let mut offset: u64 = 0;

    let push_empty = |slots: &mut TiVec<VarId, PositionSlot>, run: u64| -> Result<()> {
        if run > (count - slots.len().min(count)) as u64 {
            bail!("Run of {run} empty vars overflows the {count} vars of the block");
        }
        slots.extend((0..run).map(|_| PositionSlot::Empty));
        Ok(())
    };

    match encoding {
        // VCDATA and DYN_ALIAS blocks share one table format.
        BlockEncoding::Plain | BlockEncoding::DynamicAlias => {
            while slots.len() < count && (cursor.position() as usize) < table.len() {
                let value = cursor.read_varint()?;
                if value == 0 {
                    let handle = cursor.read_varint()?;
                    let aliased = handle.checked_sub(1).context("Alias to handle 0")?;
                    slots.push(PositionSlot::Alias(VarId(aliased as usize)));
                } else if value & 1 == 1 {
                    offset = offset.checked_add(value >> 1).context("Offset overflow")?;
                    slots.push(PositionSlot::Offset(offset));
                } else {
                    push_empty(&mut slots, value >> 1)?;
                }
            }
        }
        BlockEncoding::DynamicAlias2 => {
            let mut prev_dynamic_alias = None;
            while slots.len() < count && (cursor.position() as usize) < table.len() {
                // Lowest bit indicates varint / svarint.
                let mut varint_bytes = [0; 10];
                let mut varint_length = 0;
                loop {
                    let byte = cursor.read_u8()?;
                    varint_bytes[varint_length] = byte;
                    varint_length += 1;
                    if byte & 0x80 == 0 {
                        break;
                    }
                    if varint_length >= varint_bytes.len() {
                        bail!("Invalid varint");
                    }
                }

                let varint_bytes = &varint_bytes[0..varint_length];

                if varint_bytes[0] & 0x01 == 0 {
                    // A run of vars with no changes, encoded as `run_length << 1`.
                    let run = decode_varint(varint_bytes).context("Varint decode error")? >> 1;
                    push_empty(&mut slots, run)?;
                    continue;
                }

                // A signed value, encoded as `value << 1 | 1`.
                //   0:  Same as the previous dynamic alias.
                //   <0: A dynamic alias to a previous var.
                //   >0: Delta from the previous offset.
                let value = decode_svarint(varint_bytes).context("Varint decode error")? >> 1;
                match value {
                    x if x > 0 => {
                        offset = offset.checked_add(x as u64).context("Offset overflow")?;
                        slots.push(PositionSlot::Offset(offset));
                    }
                    x if x < 0 => {
                        let aliased = VarId((-(x + 1)) as usize);
                        prev_dynamic_alias = Some(aliased);
                        slots.push(PositionSlot::Alias(aliased));
                    }
                    _ => match prev_dynamic_alias {
                        Some(aliased) => slots.push(PositionSlot::Alias(aliased)),
                        None => {
                            bail!("Position table repeats the previous alias but there is none")
                        }
                    },
                }
            }
        }
    }

    slots.resize(count, PositionSlot::Empty);

    let offsets: Vec<(VarId, u64)> = slots
        .iter_enumerated()
        .filter_map(|(varid, slot)| match slot {
            PositionSlot::Offset(offset) => Some((varid, *offset)),
            _ => None,
        })
        .collect();

    let mut ranges: TiVec<VarId, Range<u64>> = vec![0..0; count].into();

    // Offsets are 1-based from the pack type, and each slice ends where
    // the next one starts.
    for (i, &(varid, offset)) in offsets.iter().enumerate() {
        let start = offset.checked_sub(1).context("Invalid wave offset 0")?;
        let end = match offsets.get(i + 1) {
            Some(&(_, next)) => next - 1,
            None => waves_data_length,
        };
        if end < start || end > waves_data_length {
            bail!(
                "Wave data of var {} ({start}..{end}) is outside the {waves_data_length} bytes of wave data",
                varid.0
            );
        }
        ranges[varid] = start..end;
    }

    for (varid, slot) in slots.iter_enumerated() {
        if let PositionSlot::Alias(aliased) = slot {
            if *aliased >= varid {
                bail!(
                    "Position table aliases var {} to {} which has not been seen yet.",
                    varid.0,
                    aliased.0
                );
            }
            ranges[varid] = ranges[*aliased].clone();
        }
    }

    Ok(ranges)
}
