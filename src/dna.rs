//! DNA letters to base indices and back.
//!
//! Ambiguous IUPAC letters resolve to one of their candidate bases, uniformly at random.

use crate::error::{Result, VimError};
use burn::prelude::*;
use rand::Rng;

/// Base of each index.
pub const INDEX_TO_BASE: [char; 4] = ['A', 'C', 'G', 'T'];

/// Candidate bases of an IUPAC nucleotide letter.
pub fn letter_to_bases(letter: char) -> Option<&'static str> {
    let bases = match letter {
        'A' => "A",
        'B' => "CGT",
        'C' => "C",
        'D' => "AGT",
        'G' => "G",
        'H' => "ACT",
        'K' => "GT",
        'M' => "AC",
        'N' => "ACGT",
        'R' => "AG",
        'S' => "CG",
        'T' => "T",
        'V' => "ACG",
        'W' => "AT",
        'Y' => "CT",
        _ => return None,
    };
    Some(bases)
}

pub fn base_to_index(base: char) -> Option<usize> {
    INDEX_TO_BASE.iter().position(|b| *b == base)
}

pub fn dna_to_indices<R: Rng + ?Sized>(dna: &str, rng: &mut R) -> Result<Vec<i64>> {
    dna.chars()
        .map(|letter| {
            let bases = letter_to_bases(letter)
                .ok_or_else(|| VimError::Dna(format!("unknown nucleotide letter {letter:?}")))?;
            let base = bases.as_bytes()[rng.gen_range(0..bases.len())] as char;
            base_to_index(base)
                .map(|i| i as i64)
                .ok_or_else(|| VimError::Dna(format!("{base:?} is not a base")))
        })
        .collect()
}

/// # Shape
/// [dna.len()]
pub fn dna_to_tensor<B: Backend, R: Rng + ?Sized>(
    dna: &str,
    rng: &mut R,
    device: &B::Device,
) -> Result<Tensor<B, 1, Int>> {
    let indices = dna_to_indices(dna, rng)?;
    let len = indices.len();
    Ok(Tensor::from_data(TensorData::new(indices, [len]), device))
}

/// Decodes base indices up to, and excluding, the first `eos`.
pub fn indices_to_dna(sequence: &[i64], eos: i64) -> Result<String> {
    if (0..INDEX_TO_BASE.len() as i64).contains(&eos) {
        return Err(VimError::Dna(format!("eos {eos} is also a base index")));
    }
    sequence
        .iter()
        .take_while(|idx| **idx != eos)
        .map(|idx| {
            usize::try_from(*idx)
                .ok()
                .and_then(|i| INDEX_TO_BASE.get(i).copied())
                .ok_or_else(|| VimError::Dna(format!("{idx} is not a base index")))
        })
        .collect()
}

pub fn tensor_to_dna<B: Backend>(sequence: Tensor<B, 1, Int>, eos: i64) -> Result<String> {
    let indices = sequence
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| VimError::Dna(format!("{e:?}")))?;
    indices_to_dna(&indices, eos)
}

/// Cyclic roll towards higher indices by a uniformly random shift in `0..len`.
pub fn random_roll<B: Backend, R: Rng + ?Sized>(
    sequence: Tensor<B, 1, Int>,
    rng: &mut R,
) -> Tensor<B, 1, Int> {
    let [len] = sequence.dims();
    if len == 0 {
        return sequence;
    }
    let shift = rng.gen_range(0..len);
    roll(sequence, shift)
}

fn roll<B: Backend>(sequence: Tensor<B, 1, Int>, shift: usize) -> Tensor<B, 1, Int> {
    let [len] = sequence.dims();
    let shift = shift % len.max(1);
    if shift == 0 {
        return sequence;
    }
    let tail = sequence.clone().narrow(0, len - shift, shift);
    let head = sequence.narrow(0, 0, len - shift);
    Tensor::cat(vec![tail, head], 0)
}
