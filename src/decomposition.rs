//! Block decomposition of the rows of an `N x N` problem over the PEs, and the deterministic
//! local operands each PE builds from its block.

use crate::kernel::{Elem, KernelMode, Matrix};

use serde::{Deserialize, Serialize};

/// What happens to the `N mod P` rows left over by a block decomposition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemainderPolicy {
    /// No PE computes them, they stay zero in the gathered result
    Drop,
    /// The last PE computes them as part of its block
    #[serde(rename = "last")]
    LastPe,
}

impl Default for RemainderPolicy {
    fn default() -> Self {
        RemainderPolicy::Drop
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompositionError {
    /// a decomposition needs at least one PE
    NoPes,
}

impl std::fmt::Display for DecompositionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecompositionError::NoPes => write!(f, "cannot decompose over zero pes"),
        }
    }
}

impl std::error::Error for DecompositionError {}

/// A contiguous range of rows `[offset, offset + count)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    pub offset: usize,
    pub count: usize,
}

impl Block {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.count
    }
}

/// The ordered blocks owned by every PE, `blocks[pe].offset` is the prefix sum of the counts before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    len: usize,
    blocks: Vec<Block>,
}

impl Decomposition {
    /// Split `n` rows into `num_pes` blocks of `n / num_pes` rows.
    pub fn block(
        n: usize,
        num_pes: usize,
        policy: RemainderPolicy,
    ) -> Result<Decomposition, DecompositionError> {
        if num_pes == 0 {
            return Err(DecompositionError::NoPes);
        }
        let block = n / num_pes;
        let mut counts = vec![block; num_pes];
        if policy == RemainderPolicy::LastPe {
            counts[num_pes - 1] += n % num_pes;
        }
        let mut decomp = Decomposition::from_counts(&counts);
        decomp.len = n;
        Ok(decomp)
    }

    /// Blocks of arbitrary sizes laid out back to back, the length is the sum of the counts.
    pub fn from_counts(counts: &[usize]) -> Decomposition {
        let mut offset = 0;
        let blocks = counts
            .iter()
            .map(|&count| {
                let block = Block { offset, count };
                offset += count;
                block
            })
            .collect();
        Decomposition {
            len: offset,
            blocks,
        }
    }

    /// Length of the global vector described
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn num_pes(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block_of(&self, pe: usize) -> Option<Block> {
        self.blocks.get(pe).copied()
    }

    pub fn offsets(&self) -> Vec<usize> {
        self.blocks.iter().map(|b| b.offset).collect()
    }

    pub fn counts(&self) -> Vec<usize> {
        self.blocks.iter().map(|b| b.count).collect()
    }

    /// Number of rows owned by some PE
    pub fn covered(&self) -> usize {
        self.blocks.iter().map(|b| b.count).sum()
    }

    /// Number of rows owned by no PE
    pub fn remainder(&self) -> usize {
        self.len - self.covered()
    }
}

/// The operands of one PE: its `nlocal x N` row block and the all ones vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalOperands {
    pub matrix: Matrix,
    pub vector: Vec<Elem>,
}

impl LocalOperands {
    /// Operands of PE `id` owning `nlocal` rows of an `n x n` problem,
    /// entry `(i, j)` is `j + nlocal * id + i`.
    pub fn fill(id: usize, nlocal: usize, n: usize) -> LocalOperands {
        LocalOperands::for_block(
            Block {
                offset: nlocal * id,
                count: nlocal,
            },
            n,
            KernelMode::Serial,
        )
    }

    /// Operands for an explicit block, entry `(i, j)` is `j + block.offset + i`.
    pub fn for_block(block: Block, n: usize, mode: KernelMode) -> LocalOperands {
        let matrix = Matrix::from_fn(block.count, n, mode, |i, j| (j + block.offset + i) as Elem);
        LocalOperands {
            matrix,
            vector: vec![1; n],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mat_vec;

    #[test]
    fn block_offsets_are_prefix_sums() {
        let d = Decomposition::block(16, 4, RemainderPolicy::Drop).unwrap();
        assert_eq!(d.offsets(), vec![0, 4, 8, 12]);
        assert_eq!(d.counts(), vec![4, 4, 4, 4]);
        assert_eq!(d.remainder(), 0);
        assert_eq!(d.len(), 16);
    }

    #[test]
    fn remainder_policies() {
        let d = Decomposition::block(10, 4, RemainderPolicy::Drop).unwrap();
        assert_eq!(d.counts(), vec![2, 2, 2, 2]);
        assert_eq!(d.offsets(), vec![0, 2, 4, 6]);
        assert_eq!(d.covered(), 8);
        assert_eq!(d.remainder(), 2);

        let d = Decomposition::block(10, 4, RemainderPolicy::LastPe).unwrap();
        assert_eq!(d.counts(), vec![2, 2, 2, 4]);
        assert_eq!(d.block_of(3), Some(Block { offset: 6, count: 4 }));
        assert_eq!(d.remainder(), 0);
    }

    #[test]
    fn more_pes_than_rows() {
        let d = Decomposition::block(3, 5, RemainderPolicy::Drop).unwrap();
        assert_eq!(d.counts(), vec![0; 5]);
        assert_eq!(d.offsets(), vec![0; 5]);
        assert_eq!(d.remainder(), 3);
    }

    #[test]
    fn zero_pes_is_an_error() {
        assert_eq!(
            Decomposition::block(16, 0, RemainderPolicy::Drop),
            Err(DecompositionError::NoPes)
        );
    }

    #[test]
    fn from_counts_handles_uneven_blocks() {
        let d = Decomposition::from_counts(&[5, 0, 3]);
        assert_eq!(d.offsets(), vec![0, 5, 5]);
        assert_eq!(d.len(), 8);
        assert_eq!(d.block_of(2).unwrap().range(), 5..8);
        assert_eq!(d.block_of(3), None);
    }

    #[test]
    fn pe_two_of_four() {
        let ops = LocalOperands::fill(2, 4, 16);
        assert_eq!(ops.matrix.rows(), 4);
        assert_eq!(ops.matrix.row(0), (8..24).collect::<Vec<Elem>>().as_slice());
        assert!(ops.vector.iter().all(|&x| x == 1));
        let result = mat_vec(&ops.matrix, &ops.vector, KernelMode::Serial);
        assert_eq!(result[0], 248);
    }

    #[test]
    fn fill_is_reproducible() {
        let block = Decomposition::block(16, 4, RemainderPolicy::Drop)
            .unwrap()
            .block_of(2)
            .unwrap();
        assert_eq!(
            LocalOperands::fill(2, 4, 16),
            LocalOperands::for_block(block, 16, KernelMode::Parallel)
        );
    }
}
