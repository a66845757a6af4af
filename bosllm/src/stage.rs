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

//! Staging of parsed weights into the accelerator's DDR region.
//!
//! The write order is part of the hardware contract and must stay
//! deterministic: token embeddings, position embeddings, per-layer
//! `q k v o ffn_up ffn_down` packed bytes followed by the four
//! layer-norm vectors, and finally the lm head. INT4 blocks are copied
//! raw, f16 tensors little-endian.

use crate::error::{self, ErrorKind};
use crate::fp16;
use crate::mem::Region;
use crate::model::{LayerWeights, ModelWeights};

use byteorder::{ByteOrder, LittleEndian};
use ii_logging::macros::*;

/// Layout report of a staged model
#[derive(Clone, Debug, PartialEq)]
pub struct StagedModel {
    /// Physical base of the weights region
    pub base: u64,
    pub total_bytes: u64,
    pub token_embeddings_addr: u64,
    pub position_embeddings_addr: u64,
    pub lm_head_addr: u64,
    layer_addrs: Vec<u64>,
}

impl StagedModel {
    /// Physical base address of layer `idx`
    pub fn layer_address(&self, idx: usize) -> u64 {
        self.layer_addrs[idx]
    }

    pub fn num_layers(&self) -> usize {
        self.layer_addrs.len()
    }
}

fn checked_add(a: u64, b: u64) -> error::Result<u64> {
    a.checked_add(b)
        .ok_or_else(|| ErrorKind::BadContainer("tensor sizes overflow".to_string()).into())
}

fn f16_bytes(count: usize) -> error::Result<u64> {
    (count as u64)
        .checked_mul(2)
        .ok_or_else(|| ErrorKind::BadContainer("tensor sizes overflow".to_string()).into())
}

/// Bytes one layer occupies in DDR
pub fn staged_layer_size(layer: &LayerWeights) -> error::Result<u64> {
    let mut total = 0u64;
    for block in layer.blocks().iter() {
        total = checked_add(total, block.packed_bytes().len() as u64)?;
    }
    for vector in layer.norm_vectors().iter() {
        total = checked_add(total, f16_bytes(vector.len())?)?;
    }
    Ok(total)
}

/// Bytes the whole model occupies in DDR
pub fn required_ddr(model: &ModelWeights) -> error::Result<u64> {
    let mut total = f16_bytes(model.token_embeddings.len())?;
    total = checked_add(total, f16_bytes(model.position_embeddings.len())?)?;
    for layer in &model.layers {
        total = checked_add(total, staged_layer_size(layer)?)?;
    }
    checked_add(total, f16_bytes(model.lm_head.len())?)
}

/// Copies the model into `region` and reports the resulting layout
pub fn stage(model: &ModelWeights, region: &Region) -> error::Result<StagedModel> {
    let required = required_ddr(model)?;
    if required > region.size {
        Err(ErrorKind::InsufficientDdr {
            required,
            available: region.size,
        })?
    }

    let ddr = unsafe { region.as_mut_slice() };
    let mut offset = 0usize;

    let token_embeddings_addr = region.phys;
    write_f16(ddr, &mut offset, &model.token_embeddings);
    let position_embeddings_addr = region.phys + offset as u64;
    write_f16(ddr, &mut offset, &model.position_embeddings);

    let mut layer_addrs = Vec::with_capacity(model.layers.len());
    for layer in &model.layers {
        layer_addrs.push(region.phys + offset as u64);
        for block in layer.blocks().iter() {
            write_raw(ddr, &mut offset, block.packed_bytes());
        }
        for vector in layer.norm_vectors().iter() {
            write_f16(ddr, &mut offset, vector);
        }
    }

    let lm_head_addr = region.phys + offset as u64;
    write_f16(ddr, &mut offset, &model.lm_head);
    debug_assert_eq!(offset as u64, required);

    info!(
        "staged {} bytes of weights at 0x{:x} ({} layers)",
        required,
        region.phys,
        model.layers.len()
    );
    if let Some(first) = model.token_embeddings.first() {
        debug!("token embedding[0] = {}", fp16::to_f32(*first));
    }

    Ok(StagedModel {
        base: region.phys,
        total_bytes: required,
        token_embeddings_addr,
        position_embeddings_addr,
        lm_head_addr,
        layer_addrs,
    })
}

fn write_f16(ddr: &mut [u8], offset: &mut usize, values: &[u16]) {
    let end = *offset + values.len() * 2;
    LittleEndian::write_u16_into(values, &mut ddr[*offset..end]);
    *offset = end;
}

fn write_raw(ddr: &mut [u8], offset: &mut usize, bytes: &[u8]) {
    let end = *offset + bytes.len();
    ddr[*offset..end].copy_from_slice(bytes);
    *offset = end;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{MemoryLayout, RegionSpec};
    use crate::mem::{MemoryManager, RegionKind};
    use crate::model::{ContainerHeader, Int4Block};

    const HIDDEN: u32 = 4;
    const INTERMEDIATE: u32 = 8;
    const VOCAB: u32 = 8;
    const MAX_SEQ: u32 = 6;

    fn tiny_model(num_layers: u32) -> ModelWeights {
        let header = ContainerHeader {
            version: 1,
            num_layers,
            hidden_size: HIDDEN,
            num_heads: 2,
            vocab_size: VOCAB,
            max_seq_len: MAX_SEQ,
            intermediate_size: INTERMEDIATE,
            checksum_trailer_offset: 0,
        };
        let hidden = u64::from(HIDDEN);
        let intermediate = u64::from(INTERMEDIATE);
        let norm = vec![fp16::from_f32(1.0); HIDDEN as usize];
        let layers = (0..num_layers)
            .map(|layer_idx| {
                let mut q = Int4Block::new(0.5, 0, hidden * hidden);
                q.set(0, 7);
                q.set(1, -8);
                LayerWeights {
                    layer_idx,
                    hidden_size: HIDDEN,
                    intermediate_size: INTERMEDIATE,
                    q,
                    k: Int4Block::new(0.5, 0, hidden * hidden),
                    v: Int4Block::new(0.5, 0, hidden * hidden),
                    o: Int4Block::new(0.5, 0, hidden * hidden),
                    ffn_up: Int4Block::new(0.25, 1, hidden * intermediate),
                    ffn_down: Int4Block::new(0.25, 1, intermediate * hidden),
                    ln1_w: norm.clone(),
                    ln1_b: norm.clone(),
                    ln2_w: norm.clone(),
                    ln2_b: norm.clone(),
                }
            })
            .collect();
        ModelWeights {
            config: header,
            token_embeddings: vec![fp16::from_f32(0.5); (VOCAB * HIDDEN) as usize],
            position_embeddings: vec![fp16::from_f32(-1.0); (MAX_SEQ * HIDDEN) as usize],
            layers,
            lm_head: vec![fp16::from_f32(2.0); (VOCAB * HIDDEN) as usize],
            checksums: Vec::new(),
        }
    }

    fn weights_region(size: u64) -> MemoryManager {
        let layout = MemoryLayout {
            weights: RegionSpec {
                phys: 0x1000_0000,
                size,
            },
            kv_cache: RegionSpec {
                phys: 0x3000_0000,
                size: 4096,
            },
            input_buffer: RegionSpec {
                phys: 0x2000_0000,
                size: 1024,
            },
            output_buffer: RegionSpec {
                phys: 0x2000_4000,
                size: 1024,
            },
        };
        MemoryManager::new_heap(&layout).expect("reservation failed")
    }

    /// 4 attention blocks of 8 packed bytes, 2 ffn blocks of 16, 4 norm
    /// vectors of 8 bytes
    const LAYER_BYTES: u64 = 4 * 8 + 2 * 16 + 4 * 8;

    #[test]
    fn test_required_ddr() {
        let model = tiny_model(2);
        let expected = 64 + 48 + 2 * LAYER_BYTES + 64;
        assert_eq!(required_ddr(&model).expect("sizing failed"), expected);
        assert_eq!(
            staged_layer_size(&model.layers[0]).expect("sizing failed"),
            LAYER_BYTES
        );
    }

    #[test]
    fn test_stage_layout_deterministic() {
        let model = tiny_model(3);
        let mem = weights_region(4096);
        let region = mem.region(RegionKind::Weights);
        let staged = stage(&model, region).expect("staging failed");

        assert_eq!(staged.base, region.phys);
        assert_eq!(staged.token_embeddings_addr, region.phys);
        assert_eq!(staged.position_embeddings_addr, region.phys + 64);
        assert_eq!(staged.num_layers(), 3);
        for idx in 0..staged.num_layers() - 1 {
            assert_eq!(
                staged.layer_address(idx + 1) - staged.layer_address(idx),
                staged_layer_size(&model.layers[idx]).expect("sizing failed")
            );
        }
        assert_eq!(
            staged.lm_head_addr,
            staged.layer_address(2) + LAYER_BYTES
        );
        assert_eq!(
            staged.total_bytes,
            required_ddr(&model).expect("sizing failed")
        );
    }

    #[test]
    fn test_staged_bytes() {
        let model = tiny_model(1);
        let mem = weights_region(4096);
        let region = mem.region(RegionKind::Weights);
        let staged = stage(&model, region).expect("staging failed");

        let ddr = unsafe { region.as_mut_slice() };
        // first token embedding halfword, little-endian
        let expected = fp16::from_f32(0.5);
        assert_eq!(ddr[0], (expected & 0xFF) as u8);
        assert_eq!(ddr[1], (expected >> 8) as u8);

        // q packed bytes land at the start of the layer section
        let layer_off = (staged.layer_address(0) - region.phys) as usize;
        assert_eq!(&ddr[layer_off..layer_off + 8], model.layers[0].q.packed_bytes());
    }

    #[test]
    fn test_insufficient_ddr() {
        let model = tiny_model(2);
        let mem = weights_region(64);
        let err = stage(&model, mem.region(RegionKind::Weights)).expect_err("staging succeeded");
        match err.kind() {
            ErrorKind::InsufficientDdr {
                required,
                available,
            } => {
                assert_eq!(available, 64);
                assert!(required > available);
            }
            other => panic!("unexpected error kind {:?}", other),
        }
    }
}
