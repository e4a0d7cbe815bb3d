//! A small FST writer for building test traces.
//!
//! It produces the block layout GTKWave's writer does, with a choice of
//! hierarchy compression, wave packing and position table encoding, so
//! every reader path can be exercised without sample files.

use std::{collections::HashMap, io, io::Write, path::Path};

use flate2::{
    write::{GzEncoder, ZlibEncoder},
    Compression,
};

use crate::{
    fst::{
        BlockEncoding, BlockType, VarId, VarLength, VarType, FST_ST_GEN_ATTRBEGIN,
        FST_ST_GEN_ATTREND, FST_ST_VCD_SCOPE, FST_ST_VCD_UPSCOPE, HEADER_LENGTH,
        REAL_ENDIANNESS_BIG, REAL_ENDIANNESS_LITTLE,
    },
    varint::{encode_svarint, encode_varint, MAX_VARINT_BYTES},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HierarchyPacking {
    Gzip,
    Lz4,
    Lz4Duo,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WavePacking {
    None,
    Zlib,
    Lz4,
    FastLz,
}

#[derive(Clone, Debug)]
pub struct FixtureOptions {
    pub hierarchy: HierarchyPacking,
    pub waves: WavePacking,
    /// Also selects the Value Change block type. The alias encodings share
    /// the wave data of vars with identical changes in a block.
    pub encoding: BlockEncoding,
    /// ZLib compress the frames, time tables and geometry.
    pub compress_sections: bool,
    pub big_endian_reals: bool,
    pub timescale: i8,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            hierarchy: HierarchyPacking::Gzip,
            waves: WavePacking::Lz4,
            encoding: BlockEncoding::DynamicAlias2,
            compress_sections: false,
            big_endian_reals: false,
            timescale: -9,
        }
    }
}

enum HierarchyEntry {
    Scope(String),
    Upscope,
    Attribute(String),
    Var {
        name: String,
        var_type: VarType,
        length: u64,
        handle: VarId,
        is_alias: bool,
    },
}

/// Where a var's wave data is within a block.
enum Position {
    Empty,
    Offset(u64),
    Alias(VarId),
}

/// Collects a hierarchy and value changes, then writes them out as FST.
///
/// Changes at the earliest time go into the first block's frame. Changes to
/// zero width vars are dropped since FST can't store them.
pub struct FixtureWriter {
    options: FixtureOptions,
    entries: Vec<HierarchyEntry>,
    lengths: Vec<VarLength>,
    changes: Vec<(u64, VarId, String)>,
    block_splits: Vec<u64>,
    blackouts: Vec<(bool, u64)>,
}

fn push_varint(out: &mut Vec<u8>, value: u64) {
    let mut buf = [0; MAX_VARINT_BYTES];
    let length = encode_varint(&mut buf, value);
    out.extend_from_slice(&buf[..length]);
}

fn push_svarint(out: &mut Vec<u8>, value: i64) {
    let mut buf = [0; MAX_VARINT_BYTES];
    let length = encode_svarint(&mut buf, value);
    out.extend_from_slice(&buf[..length]);
}

fn push_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

fn push_block(out: &mut Vec<u8>, block_type: BlockType, payload: &[u8]) {
    out.push(block_type as u8);
    out.extend_from_slice(&(payload.len() as u64 + 8).to_be_bytes());
    out.extend_from_slice(payload);
}

fn zlib(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn fixed_string<const N: usize>(value: &str) -> [u8; N] {
    let mut out = [0; N];
    let length = value.len().min(N - 1);
    out[..length].copy_from_slice(&value.as_bytes()[..length]);
    out
}

impl FixtureWriter {
    pub fn new(options: FixtureOptions) -> Self {
        Self {
            options,
            entries: Vec::new(),
            lengths: Vec::new(),
            changes: Vec::new(),
            block_splits: Vec::new(),
            blackouts: Vec::new(),
        }
    }

    pub fn scope(&mut self, name: &str) {
        self.entries.push(HierarchyEntry::Scope(name.to_owned()));
    }

    pub fn upscope(&mut self) {
        self.entries.push(HierarchyEntry::Upscope);
    }

    /// A comment attribute in the current scope.
    pub fn attribute(&mut self, name: &str) {
        self.entries.push(HierarchyEntry::Attribute(name.to_owned()));
    }

    /// Declare a var with its own handle. Width 0 makes a zero width var.
    pub fn var(&mut self, name: &str, var_type: VarType, width: u32) -> VarId {
        let handle = VarId(self.lengths.len());
        self.lengths.push(VarLength::Bits(width));
        self.entries.push(HierarchyEntry::Var {
            name: name.to_owned(),
            var_type,
            length: width as u64,
            handle,
            is_alias: false,
        });
        handle
    }

    pub fn real_var(&mut self, name: &str) -> VarId {
        let handle = VarId(self.lengths.len());
        self.lengths.push(VarLength::Real);
        self.entries.push(HierarchyEntry::Var {
            name: name.to_owned(),
            var_type: VarType::FST_VT_VCD_REAL,
            length: 64,
            handle,
            is_alias: false,
        });
        handle
    }

    /// Declare another name for an existing handle.
    pub fn alias(&mut self, name: &str, var_type: VarType, handle: VarId) {
        let length = match self.lengths.get(handle.0) {
            Some(VarLength::Bits(bits)) => *bits as u64,
            _ => 64,
        };
        self.entries.push(HierarchyEntry::Var {
            name: name.to_owned(),
            var_type,
            length,
            handle,
            is_alias: true,
        });
    }

    /// Record a change. Bit vectors are given as characters (`0`, `1`, `x`,
    /// `z`, ...), reals in decimal.
    pub fn change(&mut self, time: u64, handle: VarId, value: &str) {
        self.changes.push((time, handle, value.to_owned()));
    }

    /// Start a new Value Change block for changes at or after `time`.
    pub fn split_block_at(&mut self, time: u64) {
        self.block_splits.push(time);
    }

    pub fn blackout(&mut self, dump_on: bool, time: u64) {
        self.blackouts.push((dump_on, time));
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        std::fs::write(path, self.finish()?)
    }

    pub fn finish(&self) -> io::Result<Vec<u8>> {
        let mut changes: Vec<&(u64, VarId, String)> = self
            .changes
            .iter()
            .filter(|(_, handle, _)| match self.lengths.get(handle.0) {
                Some(VarLength::Real) => true,
                Some(VarLength::Bits(bits)) => *bits > 0,
                None => false,
            })
            .collect();
        changes.sort_by_key(|(time, _, _)| *time);

        let start_time = changes.first().map_or(0, |(time, _, _)| *time);
        let end_time = changes.last().map_or(0, |(time, _, _)| *time);

        let mut splits = self.block_splits.clone();
        splits.sort_unstable();
        splits.dedup();

        let mut groups: Vec<Vec<&(u64, VarId, String)>> = vec![Vec::new(); splits.len() + 1];
        for change in changes {
            let index = splits.iter().filter(|&&split| split <= change.0).count();
            groups[index].push(change);
        }
        groups.retain(|group| !group.is_empty());
        if groups.is_empty() {
            groups.push(Vec::new());
        }

        let mut current: Vec<Vec<u8>> = self
            .lengths
            .iter()
            .map(|length| self.frame_value(*length, None))
            .collect();

        let mut blocks = Vec::new();
        for (i, group) in groups.iter().enumerate() {
            let block_start = group.first().map_or(start_time, |(time, _, _)| *time);
            let block_end = group.last().map_or(block_start, |(time, _, _)| *time);

            let mut wave_changes = &group[..];
            if i == 0 {
                let initial = group.iter().take_while(|(time, _, _)| *time == block_start).count();
                for (_, handle, value) in &group[..initial] {
                    current[handle.0] = self.frame_value(self.lengths[handle.0], Some(value.as_str()));
                }
                wave_changes = &group[initial..];
            }

            let frame = current.concat();
            blocks.push(self.value_change_block(block_start, block_end, &frame, wave_changes)?);

            for (_, handle, value) in wave_changes {
                current[handle.0] = self.frame_value(self.lengths[handle.0], Some(value.as_str()));
            }
        }

        let mut out = Vec::new();
        push_block(
            &mut out,
            BlockType::FST_BL_HDR,
            &self.header(start_time, end_time, blocks.len()),
        );

        let block_type = match self.options.encoding {
            BlockEncoding::Plain => BlockType::FST_BL_VCDATA,
            BlockEncoding::DynamicAlias => BlockType::FST_BL_VCDATA_DYN_ALIAS,
            BlockEncoding::DynamicAlias2 => BlockType::FST_BL_VCDATA_DYN_ALIAS2,
        };
        for block in &blocks {
            push_block(&mut out, block_type, block);
        }

        if !self.blackouts.is_empty() {
            let mut blackouts = self.blackouts.clone();
            blackouts.sort_by_key(|(_, time)| *time);
            let mut payload = Vec::new();
            push_varint(&mut payload, blackouts.len() as u64);
            let mut previous = 0;
            for (dump_on, time) in blackouts {
                payload.push(dump_on as u8);
                push_varint(&mut payload, time - previous);
                previous = time;
            }
            push_block(&mut out, BlockType::FST_BL_BLACKOUT, &payload);
        }

        push_block(&mut out, BlockType::FST_BL_GEOM, &self.geometry()?);

        let (hierarchy_type, hierarchy) = self.hierarchy()?;
        push_block(&mut out, hierarchy_type, &hierarchy);

        Ok(out)
    }

    fn frame_value(&self, length: VarLength, value: Option<&str>) -> Vec<u8> {
        match length {
            VarLength::Real => {
                let value = value.map_or(0.0, |v| v.parse::<f64>().unwrap_or(f64::NAN));
                if self.options.big_endian_reals {
                    value.to_be_bytes().to_vec()
                } else {
                    value.to_le_bytes().to_vec()
                }
            }
            VarLength::Bits(bits) => {
                let bits = bits as usize;
                let value = value.unwrap_or("x").as_bytes();
                if value.len() >= bits {
                    value[value.len() - bits..].to_vec()
                } else {
                    // Extend like VCD does: x and z extend themselves, anything else with 0.
                    let fill = match value.first() {
                        Some(c @ (b'x' | b'X' | b'z' | b'Z')) => *c,
                        _ => b'0',
                    };
                    let fill = if value.is_empty() { b'x' } else { fill };
                    let mut out = vec![fill; bits - value.len()];
                    out.extend_from_slice(value);
                    out
                }
            }
        }
    }

    fn push_wave_value(&self, out: &mut Vec<u8>, time_index_delta: u64, length: VarLength, value: &str) {
        let raw = self.frame_value(length, Some(value));
        match length {
            VarLength::Bits(1) => match raw[0] {
                bit @ (b'0' | b'1') => {
                    push_varint(out, (time_index_delta << 2) | (((bit - b'0') as u64) << 1))
                }
                state => {
                    let index = b"xzhuwl-?"
                        .iter()
                        .position(|c| *c == state.to_ascii_lowercase())
                        .unwrap_or(0);
                    push_varint(out, (time_index_delta << 4) | ((index as u64) << 1) | 1);
                }
            },
            VarLength::Bits(_) => {
                if raw.iter().all(|c| matches!(c, b'0' | b'1')) {
                    push_varint(out, time_index_delta << 1);
                    let mut packed = vec![0u8; (raw.len() + 7) / 8];
                    for (i, c) in raw.iter().enumerate() {
                        packed[i / 8] |= (c - b'0') << (7 - i % 8);
                    }
                    out.extend_from_slice(&packed);
                } else {
                    push_varint(out, (time_index_delta << 1) | 1);
                    out.extend_from_slice(&raw);
                }
            }
            VarLength::Real => {
                push_varint(out, time_index_delta << 1);
                out.extend_from_slice(&raw);
            }
        }
    }

    fn pack_wave(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        match self.options.waves {
            WavePacking::None => {
                push_varint(&mut out, 0);
                out.extend_from_slice(data);
            }
            WavePacking::Zlib => {
                push_varint(&mut out, data.len() as u64);
                out.extend_from_slice(&zlib(data)?);
            }
            WavePacking::Lz4 => {
                push_varint(&mut out, data.len() as u64);
                out.extend_from_slice(&lz4_flex::block::compress(data));
            }
            WavePacking::FastLz => {
                // The output must be 5% larger than the input and at least 66 bytes.
                let mut buffer = vec![0; data.len() + data.len() / 16 + 66];
                let compressed = fastlz::compress(data, &mut buffer).map_err(|()| {
                    io::Error::new(io::ErrorKind::Other, "FastLZ compression failed")
                })?;
                push_varint(&mut out, data.len() as u64);
                out.extend_from_slice(compressed);
            }
        }
        Ok(out)
    }

    /// ZLib compress a section if enabled and it changes the length, since
    /// equal lengths mean uncompressed.
    fn section(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        if self.options.compress_sections && !data.is_empty() {
            let compressed = zlib(data)?;
            if compressed.len() != data.len() {
                return Ok(compressed);
            }
        }
        Ok(data.to_vec())
    }

    fn value_change_block(
        &self,
        start_time: u64,
        end_time: u64,
        frame: &[u8],
        changes: &[&(u64, VarId, String)],
    ) -> io::Result<Vec<u8>> {
        let num_handles = self.lengths.len();

        let mut times: Vec<u64> = changes.iter().map(|(time, _, _)| *time).collect();
        times.dedup();

        let mut waves_per_var: Vec<Vec<u8>> = vec![Vec::new(); num_handles];
        let mut last_time_index = vec![0; num_handles];
        for (time, handle, value) in changes {
            let time_index = times.binary_search(time).unwrap_or_else(|i| i) as u64;
            let delta = time_index - last_time_index[handle.0];
            last_time_index[handle.0] = time_index;
            self.push_wave_value(
                &mut waves_per_var[handle.0],
                delta,
                self.lengths[handle.0],
                value,
            );
        }

        let packtype = match self.options.waves {
            WavePacking::Lz4 => b'4',
            WavePacking::FastLz => b'F',
            WavePacking::None | WavePacking::Zlib => b'Z',
        };
        let mut waves = vec![packtype];
        let mut positions = Vec::with_capacity(num_handles);
        let mut first_with_data: HashMap<&[u8], VarId> = HashMap::new();
        for (i, data) in waves_per_var.iter().enumerate() {
            if data.is_empty() {
                positions.push(Position::Empty);
                continue;
            }
            if self.options.encoding != BlockEncoding::Plain {
                if let Some(&aliased) = first_with_data.get(&data[..]) {
                    positions.push(Position::Alias(aliased));
                    continue;
                }
                first_with_data.insert(&data[..], VarId(i));
            }
            // Offsets count from the pack type, starting at 1.
            positions.push(Position::Offset(waves.len() as u64));
            waves.extend_from_slice(&self.pack_wave(data)?);
        }

        let table = self.position_table(&positions);

        let mut time_table = Vec::new();
        let mut previous = 0;
        for time in &times {
            push_varint(&mut time_table, time - previous);
            previous = *time;
        }

        let mut out = Vec::new();
        out.extend_from_slice(&start_time.to_be_bytes());
        out.extend_from_slice(&end_time.to_be_bytes());
        out.extend_from_slice(&0u64.to_be_bytes());

        let frame_data = self.section(frame)?;
        push_varint(&mut out, frame.len() as u64);
        push_varint(&mut out, frame_data.len() as u64);
        push_varint(&mut out, num_handles as u64);
        out.extend_from_slice(&frame_data);

        push_varint(&mut out, num_handles as u64);
        out.extend_from_slice(&waves);

        out.extend_from_slice(&table);
        out.extend_from_slice(&(table.len() as u64).to_be_bytes());

        let time_data = self.section(&time_table)?;
        out.extend_from_slice(&time_data);
        out.extend_from_slice(&(time_table.len() as u64).to_be_bytes());
        out.extend_from_slice(&(time_data.len() as u64).to_be_bytes());
        out.extend_from_slice(&(times.len() as u64).to_be_bytes());

        Ok(out)
    }

    fn position_table(&self, positions: &[Position]) -> Vec<u8> {
        let encoding = self.options.encoding;
        let mut table = Vec::new();
        let mut previous_offset = 0;
        let mut previous_alias = None;
        let mut empty_run = 0;

        let flush = |table: &mut Vec<u8>, run: &mut u64| {
            if *run == 0 {
                return;
            }
            push_varint(table, *run << 1);
            *run = 0;
        };

        for position in positions {
            match position {
                Position::Empty => {
                    empty_run += 1;
                }
                Position::Offset(offset) => {
                    flush(&mut table, &mut empty_run);
                    let delta = offset - previous_offset;
                    previous_offset = *offset;
                    match encoding {
                        BlockEncoding::Plain | BlockEncoding::DynamicAlias => {
                            push_varint(&mut table, (delta << 1) | 1)
                        }
                        BlockEncoding::DynamicAlias2 => {
                            push_svarint(&mut table, ((delta as i64) << 1) | 1)
                        }
                    }
                }
                Position::Alias(aliased) => {
                    flush(&mut table, &mut empty_run);
                    match encoding {
                        BlockEncoding::Plain | BlockEncoding::DynamicAlias => {
                            push_varint(&mut table, 0);
                            push_varint(&mut table, aliased.0 as u64 + 1);
                        }
                        BlockEncoding::DynamicAlias2 => {
                            if previous_alias == Some(*aliased) {
                                push_svarint(&mut table, 1);
                            } else {
                                push_svarint(&mut table, ((-(aliased.0 as i64) - 1) << 1) | 1);
                                previous_alias = Some(*aliased);
                            }
                        }
                    }
                }
            }
        }
        flush(&mut table, &mut empty_run);
        table
    }

    fn header(&self, start_time: u64, end_time: u64, num_blocks: usize) -> Vec<u8> {
        let num_scopes = self
            .entries
            .iter()
            .filter(|e| matches!(e, HierarchyEntry::Scope(_)))
            .count();
        let num_hierarchy_vars = self
            .entries
            .iter()
            .filter(|e| matches!(e, HierarchyEntry::Var { .. }))
            .count();
        let endianness = if self.options.big_endian_reals {
            REAL_ENDIANNESS_BIG
        } else {
            REAL_ENDIANNESS_LITTLE
        };

        let mut out = Vec::with_capacity(HEADER_LENGTH as usize);
        out.extend_from_slice(&start_time.to_be_bytes());
        out.extend_from_slice(&end_time.to_be_bytes());
        out.extend_from_slice(&endianness.to_le_bytes());
        out.extend_from_slice(&0u64.to_be_bytes());
        out.extend_from_slice(&(num_scopes as u64).to_be_bytes());
        out.extend_from_slice(&(num_hierarchy_vars as u64).to_be_bytes());
        out.extend_from_slice(&(self.lengths.len() as u64).to_be_bytes());
        out.extend_from_slice(&(num_blocks as u64).to_be_bytes());
        out.push(self.options.timescale as u8);
        out.extend_from_slice(&fixed_string::<128>("wavepeek fixture"));
        out.extend_from_slice(&fixed_string::<26>("Sun Oct 18 00:00:00 2026"));
        out.extend_from_slice(&[0; 93]);
        out.push(0);
        out.extend_from_slice(&0i64.to_be_bytes());
        out
    }

    fn geometry(&self) -> io::Result<Vec<u8>> {
        let mut lengths = Vec::new();
        for length in &self.lengths {
            push_varint(
                &mut lengths,
                match length {
                    VarLength::Real => 0,
                    VarLength::Bits(0) => 0xFFFFFFFF,
                    VarLength::Bits(bits) => *bits as u64,
                },
            );
        }
        let data = self.section(&lengths)?;

        let mut out = Vec::new();
        out.extend_from_slice(&(lengths.len() as u64).to_be_bytes());
        out.extend_from_slice(&(self.lengths.len() as u64).to_be_bytes());
        out.extend_from_slice(&data);
        Ok(out)
    }

    fn hierarchy(&self) -> io::Result<(BlockType, Vec<u8>)> {
        let mut raw = Vec::new();
        for entry in &self.entries {
            match entry {
                HierarchyEntry::Scope(name) => {
                    raw.push(FST_ST_VCD_SCOPE);
                    // VCD module.
                    raw.push(0);
                    push_string(&mut raw, name);
                    push_string(&mut raw, "");
                }
                HierarchyEntry::Upscope => raw.push(FST_ST_VCD_UPSCOPE),
                HierarchyEntry::Attribute(name) => {
                    raw.push(FST_ST_GEN_ATTRBEGIN);
                    // Misc attribute, comment subtype.
                    raw.push(0);
                    raw.push(0);
                    push_string(&mut raw, name);
                    push_varint(&mut raw, 0);
                    raw.push(FST_ST_GEN_ATTREND);
                }
                HierarchyEntry::Var {
                    name,
                    var_type,
                    length,
                    handle,
                    is_alias,
                } => {
                    raw.push(*var_type as u8);
                    // Implicit direction.
                    raw.push(0);
                    push_string(&mut raw, name);
                    push_varint(&mut raw, *length);
                    push_varint(&mut raw, if *is_alias { handle.0 as u64 + 1 } else { 0 });
                }
            }
        }

        let mut out = Vec::new();
        out.extend_from_slice(&(raw.len() as u64).to_be_bytes());
        let block_type = match self.options.hierarchy {
            HierarchyPacking::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&raw)?;
                out.extend_from_slice(&encoder.finish()?);
                BlockType::FST_BL_HIER
            }
            HierarchyPacking::Lz4 => {
                out.extend_from_slice(&lz4_flex::block::compress(&raw));
                BlockType::FST_BL_HIER_LZ4
            }
            HierarchyPacking::Lz4Duo => {
                let once = lz4_flex::block::compress(&raw);
                push_varint(&mut out, once.len() as u64);
                out.extend_from_slice(&lz4_flex::block::compress(&once));
                BlockType::FST_BL_HIER_LZ4DUO
            }
        };
        Ok((block_type, out))
    }
}
