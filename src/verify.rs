use crate::kernel::{mat_vec, Elem, KernelMode, Matrix};

/// Rows of the global reference matrix materialised at a time
pub const REFERENCE_BLOCK_ROWS: usize = 1024;

/// The serial reference result of the global problem: `m[i][j] = i + j`, `v = 1`.
///
/// The matrix is built and multiplied `REFERENCE_BLOCK_ROWS` rows at a time.
pub fn compute_reference(n: usize, mode: KernelMode) -> Vec<Elem> {
    let v = vec![1; n];
    let mut reference = Vec::with_capacity(n);
    let mut start = 0;
    while start < n {
        let rows = REFERENCE_BLOCK_ROWS.min(n - start);
        let block = Matrix::from_fn(rows, n, mode, |i, j| (start + i + j) as Elem);
        reference.extend(mat_vec(&block, &v, mode));
        start += rows;
    }
    reference
}

/// Row `i` of the reference result, `n*i + n(n-1)/2`
pub fn closed_form(n: usize, i: usize) -> Elem {
    let (n, i) = (n as Elem, i as Elem);
    n * i + n * (n - 1) / 2
}

/// The first position where the two results disagree.
///
/// `None` marks a position past the end of the shorter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub index: usize,
    pub distributed: Option<Elem>,
    pub reference: Option<Elem>,
}

struct Missing<'a>(&'a Option<Elem>);

impl std::fmt::Display for Missing<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{}", v),
            None => write!(f, "<missing>"),
        }
    }
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "at index {} -- {} != {}",
            self.index,
            Missing(&self.distributed),
            Missing(&self.reference)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub mismatch: Option<Mismatch>,
    /// number of positions examined
    pub compared: usize,
}

impl VerificationOutcome {
    pub fn ok(&self) -> bool {
        self.mismatch.is_none()
    }
}

/// Compare element-wise and stop at the first difference.
pub fn verify(distributed: &[Elem], reference: &[Elem]) -> VerificationOutcome {
    let common = distributed.len().min(reference.len());
    let mut compared = 0;
    for (index, (d, r)) in distributed.iter().zip(reference).enumerate() {
        compared += 1;
        if d != r {
            return VerificationOutcome {
                mismatch: Some(Mismatch {
                    index,
                    distributed: Some(*d),
                    reference: Some(*r),
                }),
                compared,
            };
        }
    }
    let mismatch = if distributed.len() != reference.len() {
        compared += 1;
        Some(Mismatch {
            index: common,
            distributed: distributed.get(common).copied(),
            reference: reference.get(common).copied(),
        })
    } else {
        None
    };
    VerificationOutcome { mismatch, compared }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_matches_closed_form() {
        for n in [0usize, 1, 4, 16, REFERENCE_BLOCK_ROWS + 3] {
            let reference = compute_reference(n, KernelMode::Parallel);
            assert_eq!(reference.len(), n);
            for (i, r) in reference.iter().enumerate() {
                assert_eq!(*r, closed_form(n, i));
            }
        }
    }

    #[test]
    fn identical_results_pass() {
        let reference = compute_reference(16, KernelMode::Serial);
        let outcome = verify(&reference, &reference);
        assert!(outcome.ok());
        assert_eq!(outcome.compared, 16);
    }

    #[test]
    fn first_mismatch_only() {
        let reference = compute_reference(8, KernelMode::Serial);
        let mut distributed = reference.clone();
        distributed[3] += 1;
        distributed[6] = 0;
        let outcome = verify(&distributed, &reference);
        let mismatch = outcome.mismatch.unwrap();
        assert_eq!(mismatch.index, 3);
        assert_eq!(mismatch.distributed, Some(reference[3] + 1));
        assert_eq!(mismatch.reference, Some(reference[3]));
        assert_eq!(outcome.compared, 4);
        assert_eq!(
            mismatch.to_string(),
            format!("at index 3 -- {} != {}", reference[3] + 1, reference[3])
        );
    }

    #[test]
    fn dropped_remainder_is_reported() {
        // 10 rows over 4 pes with the remainder dropped: rows 8 and 9 stay zero
        let reference = compute_reference(10, KernelMode::Serial);
        let mut distributed = reference.clone();
        distributed[8] = 0;
        distributed[9] = 0;
        let mismatch = verify(&distributed, &reference).mismatch.unwrap();
        assert_eq!(mismatch.index, 8);
        assert_eq!(mismatch.distributed, Some(0));
        assert_eq!(mismatch.reference, Some(closed_form(10, 8)));
    }

    #[test]
    fn length_difference_is_a_mismatch() {
        let reference = compute_reference(4, KernelMode::Serial);
        let outcome = verify(&reference[..3], &reference);
        let mismatch = outcome.mismatch.unwrap();
        assert_eq!(mismatch.index, 3);
        assert_eq!(mismatch.distributed, None);
        assert_eq!(mismatch.reference, Some(reference[3]));
        assert!(mismatch.to_string().starts_with("at index 3 -- <missing> != "));
    }
}
