// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Parser and in-memory model of the quantized weight container.
//!
//! The container is little-endian throughout: a fixed header, two f16
//! embedding planes, per-layer INT4 blocks in the canonical order
//! `q k v o ffn_up ffn_down` followed by four f16 layer-norm vectors,
//! the f16 lm head, and an optional SHA-256 checksum trailer. Checksums
//! are surfaced to the log, not enforced.

use crate::error::{self, ErrorKind};

use byteorder::{LittleEndian, ReadBytesExt};
use ii_logging::macros::*;

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Container magic "WTNT"
pub const CONTAINER_MAGIC: u32 = 0x5754_4E54;

/// Longest checksum entry name accepted from the trailer
const MAX_CHECKSUM_NAME_LEN: u32 = 256;

/// Upper bound on checksum trailer entries
const MAX_CHECKSUM_RECORDS: u32 = 4096;

/// Plausibility caps for header fields. A header outside these bounds is
/// treated as corrupted rather than allocated for.
const MAX_NUM_LAYERS: u32 = 512;
const MAX_HIDDEN_SIZE: u32 = 65_536;
const MAX_VOCAB_SIZE: u32 = 1 << 22;
const MAX_SEQ_LEN: u32 = 1 << 20;
const MAX_INTERMEDIATE_SIZE: u32 = 1 << 20;

/// Fixed-size container header, all fields u32 little-endian
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerHeader {
    pub version: u32,
    pub num_layers: u32,
    pub hidden_size: u32,
    pub num_heads: u32,
    pub vocab_size: u32,
    pub max_seq_len: u32,
    pub intermediate_size: u32,
    pub checksum_trailer_offset: u32,
}

impl ContainerHeader {
    pub fn parse<R: Read>(reader: &mut R) -> error::Result<Self> {
        let magic = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| read_err("header magic", e))?;
        if magic != CONTAINER_MAGIC {
            Err(ErrorKind::BadContainer(format!(
                "bad magic 0x{:08x}, expected 0x{:08x}",
                magic, CONTAINER_MAGIC
            )))?
        }

        let mut fields = [0u32; 8];
        reader
            .read_u32_into::<LittleEndian>(&mut fields)
            .map_err(|e| read_err("header fields", e))?;
        let header = Self {
            version: fields[0],
            num_layers: fields[1],
            hidden_size: fields[2],
            num_heads: fields[3],
            vocab_size: fields[4],
            max_seq_len: fields[5],
            intermediate_size: fields[6],
            checksum_trailer_offset: fields[7],
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> error::Result<()> {
        let in_range = |what: &str, value: u32, max: u32| -> error::Result<()> {
            if value == 0 || value > max {
                Err(ErrorKind::BadContainer(format!(
                    "{} = {} out of range 1..={}",
                    what, value, max
                )))?
            }
            Ok(())
        };
        in_range("num_layers", self.num_layers, MAX_NUM_LAYERS)?;
        in_range("hidden_size", self.hidden_size, MAX_HIDDEN_SIZE)?;
        in_range("num_heads", self.num_heads, self.hidden_size)?;
        in_range("vocab_size", self.vocab_size, MAX_VOCAB_SIZE)?;
        in_range("max_seq_len", self.max_seq_len, MAX_SEQ_LEN)?;
        in_range(
            "intermediate_size",
            self.intermediate_size,
            MAX_INTERMEDIATE_SIZE,
        )?;
        if self.hidden_size % self.num_heads != 0 {
            Err(ErrorKind::BadContainer(format!(
                "hidden_size {} not divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )))?
        }
        Ok(())
    }
}

/// Tensor quantized to signed 4-bit values packed two per byte.
/// Nibble `2k` sits in the low half of byte `k`, nibble `2k+1` in the
/// high half.
#[derive(Clone, Debug, PartialEq)]
pub struct Int4Block {
    pub scale: f32,
    pub zero_point: i8,
    num_weights: u64,
    packed: Vec<u8>,
}

impl Int4Block {
    /// Number of packed bytes a block of `num_weights` values occupies
    pub fn packed_len(num_weights: u64) -> u64 {
        (num_weights + 1) / 2
    }

    /// Creates a zero-filled block
    pub fn new(scale: f32, zero_point: i8, num_weights: u64) -> Self {
        Self {
            scale,
            zero_point,
            num_weights,
            packed: vec![0u8; Self::packed_len(num_weights) as usize],
        }
    }

    pub fn from_parts(
        scale: f32,
        zero_point: i8,
        num_weights: u64,
        packed: Vec<u8>,
    ) -> error::Result<Self> {
        let expected = Self::packed_len(num_weights);
        if packed.len() as u64 != expected {
            Err(ErrorKind::BadContainer(format!(
                "INT4 block holds {} packed bytes, expected {}",
                packed.len(),
                expected
            )))?
        }
        Ok(Self {
            scale,
            zero_point,
            num_weights,
            packed,
        })
    }

    pub fn num_weights(&self) -> u64 {
        self.num_weights
    }

    pub fn packed_bytes(&self) -> &[u8] {
        &self.packed
    }

    /// Returns the sign-extended value at `idx`
    pub fn get(&self, idx: u64) -> i8 {
        assert!(idx < self.num_weights, "weight index out of range");
        let byte = self.packed[(idx / 2) as usize];
        let nibble = if idx & 1 == 0 {
            byte & 0x0F
        } else {
            (byte >> 4) & 0x0F
        };
        if nibble & 0x8 != 0 {
            (nibble | 0xF0) as i8
        } else {
            nibble as i8
        }
    }

    /// Stores `value` at `idx`, clamped to the signed 4-bit range
    pub fn set(&mut self, idx: u64, value: i8) {
        assert!(idx < self.num_weights, "weight index out of range");
        let clamped = value.max(-8).min(7);
        let nibble = (clamped as u8) & 0x0F;
        let slot = (idx / 2) as usize;
        if idx & 1 == 0 {
            self.packed[slot] = self.packed[slot] & 0xF0 | nibble;
        } else {
            self.packed[slot] = self.packed[slot] & 0x0F | nibble << 4;
        }
    }

    pub fn dequantize(&self, idx: u64) -> f32 {
        (i32::from(self.get(idx)) - i32::from(self.zero_point)) as f32 * self.scale
    }
}

/// All tensors of one transformer layer
#[derive(Clone, Debug, PartialEq)]
pub struct LayerWeights {
    pub layer_idx: u32,
    pub hidden_size: u32,
    pub intermediate_size: u32,
    pub q: Int4Block,
    pub k: Int4Block,
    pub v: Int4Block,
    pub o: Int4Block,
    pub ffn_up: Int4Block,
    pub ffn_down: Int4Block,
    pub ln1_w: Vec<u16>,
    pub ln1_b: Vec<u16>,
    pub ln2_w: Vec<u16>,
    pub ln2_b: Vec<u16>,
}

impl LayerWeights {
    fn parse<R: Read>(
        reader: &mut R,
        header: &ContainerHeader,
        layer_idx: u32,
    ) -> error::Result<Self> {
        let hidden = u64::from(header.hidden_size);
        let intermediate = u64::from(header.intermediate_size);

        let q = read_block(reader, hidden * hidden, layer_idx, "q")?;
        let k = read_block(reader, hidden * hidden, layer_idx, "k")?;
        let v = read_block(reader, hidden * hidden, layer_idx, "v")?;
        let o = read_block(reader, hidden * hidden, layer_idx, "o")?;
        let ffn_up = read_block(reader, hidden * intermediate, layer_idx, "ffn_up")?;
        let ffn_down = read_block(reader, intermediate * hidden, layer_idx, "ffn_down")?;

        let ln1_w = read_f16_vec(reader, hidden, &format!("layer {} ln1_w", layer_idx))?;
        let ln1_b = read_f16_vec(reader, hidden, &format!("layer {} ln1_b", layer_idx))?;
        let ln2_w = read_f16_vec(reader, hidden, &format!("layer {} ln2_w", layer_idx))?;
        let ln2_b = read_f16_vec(reader, hidden, &format!("layer {} ln2_b", layer_idx))?;

        Ok(Self {
            layer_idx,
            hidden_size: header.hidden_size,
            intermediate_size: header.intermediate_size,
            q,
            k,
            v,
            o,
            ffn_up,
            ffn_down,
            ln1_w,
            ln1_b,
            ln2_w,
            ln2_b,
        })
    }

    /// Quantized blocks in the canonical container/staging order
    pub fn blocks(&self) -> [&Int4Block; 6] {
        [
            &self.q,
            &self.k,
            &self.v,
            &self.o,
            &self.ffn_up,
            &self.ffn_down,
        ]
    }

    /// Layer-norm vectors in the canonical container/staging order
    pub fn norm_vectors(&self) -> [&[u16]; 4] {
        [&self.ln1_w, &self.ln1_b, &self.ln2_w, &self.ln2_b]
    }
}

/// One entry of the checksum trailer
#[derive(Clone, Debug, PartialEq)]
pub struct ChecksumRecord {
    pub name: String,
    pub digest: [u8; 32],
}

/// Fully parsed weight container
#[derive(Clone, Debug, PartialEq)]
pub struct ModelWeights {
    pub config: ContainerHeader,
    pub token_embeddings: Vec<u16>,
    pub position_embeddings: Vec<u16>,
    pub layers: Vec<LayerWeights>,
    pub lm_head: Vec<u16>,
    pub checksums: Vec<ChecksumRecord>,
}

impl ModelWeights {
    /// Loads and parses the container at `path`, logging the surfaced
    /// checksums
    pub fn load<P: AsRef<Path>>(path: P) -> error::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let model = Self::parse(&mut BufReader::new(file))?;
        info!(
            "loaded weight container {}: {} layers, hidden {}, vocab {}",
            path.display(),
            model.config.num_layers,
            model.config.hidden_size,
            model.config.vocab_size
        );
        for record in &model.checksums {
            info!(
                "weight checksum {}: {}",
                record.name,
                hex::encode(&record.digest[..])
            );
        }
        Ok(model)
    }

    pub fn parse<R: Read>(reader: &mut R) -> error::Result<Self> {
        let header = ContainerHeader::parse(reader)?;

        let vocab_hidden = u64::from(header.vocab_size) * u64::from(header.hidden_size);
        let seq_hidden = u64::from(header.max_seq_len) * u64::from(header.hidden_size);

        let token_embeddings = read_f16_vec(reader, vocab_hidden, "token embeddings")?;
        let position_embeddings = read_f16_vec(reader, seq_hidden, "position embeddings")?;

        let mut layers = Vec::with_capacity(header.num_layers as usize);
        for layer_idx in 0..header.num_layers {
            layers.push(LayerWeights::parse(reader, &header, layer_idx)?);
        }

        let lm_head = read_f16_vec(reader, vocab_hidden, "lm head")?;

        let checksums = if header.checksum_trailer_offset != 0 {
            read_checksum_trailer(reader)?
        } else {
            Vec::new()
        };

        Ok(Self {
            config: header,
            token_embeddings,
            position_embeddings,
            layers,
            lm_head,
            checksums,
        })
    }
}

/// Maps an EOF hit inside an announced payload to `Truncated`
fn read_err(what: &str, e: io::Error) -> error::Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ErrorKind::Truncated(what.to_string()).into()
    } else {
        e.into()
    }
}

fn read_f16_vec<R: Read>(reader: &mut R, count: u64, what: &str) -> error::Result<Vec<u16>> {
    let mut values = vec![0u16; count as usize];
    reader
        .read_u16_into::<LittleEndian>(&mut values)
        .map_err(|e| read_err(what, e))?;
    Ok(values)
}

fn read_block<R: Read>(
    reader: &mut R,
    num_weights: u64,
    layer_idx: u32,
    name: &str,
) -> error::Result<Int4Block> {
    let what = format!("layer {} {} block", layer_idx, name);
    let scale = reader
        .read_f32::<LittleEndian>()
        .map_err(|e| read_err(&what, e))?;
    let zero_point = reader.read_i8().map_err(|e| read_err(&what, e))?;
    let byte_length = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| read_err(&what, e))?;

    let expected = Int4Block::packed_len(num_weights);
    if u64::from(byte_length) != expected {
        Err(ErrorKind::BadContainer(format!(
            "{}: {} packed bytes announced, expected {}",
            what, byte_length, expected
        )))?
    }

    let mut packed = vec![0u8; byte_length as usize];
    reader
        .read_exact(&mut packed)
        .map_err(|e| read_err(&what, e))?;
    Int4Block::from_parts(scale, zero_point, num_weights, packed)
}

fn read_checksum_trailer<R: Read>(reader: &mut R) -> error::Result<Vec<ChecksumRecord>> {
    let count = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| read_err("checksum trailer", e))?;
    if count > MAX_CHECKSUM_RECORDS {
        Err(ErrorKind::BadContainer(format!(
            "checksum trailer announces {} records",
            count
        )))?
    }

    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_len = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| read_err("checksum name length", e))?;
        if name_len > MAX_CHECKSUM_NAME_LEN {
            Err(ErrorKind::BadContainer(format!(
                "checksum name of {} bytes",
                name_len
            )))?
        }
        let mut name_bytes = vec![0u8; name_len as usize];
        reader
            .read_exact(&mut name_bytes)
            .map_err(|e| read_err("checksum name", e))?;
        let name = String::from_utf8(name_bytes)
            .map_err(|_| ErrorKind::BadContainer("checksum name is not UTF-8".to_string()))?;

        let mut digest = [0u8; 32];
        reader
            .read_exact(&mut digest)
            .map_err(|e| read_err("checksum digest", e))?;
        records.push(ChecksumRecord { name, digest });
    }
    Ok(records)
}
