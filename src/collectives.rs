//! Blocking collectives built on the comm words and heap of each PE.
//!
//! Every PE must call the same collectives in the same order, a PE that never arrives blocks the others
//! (after `LAMELLAR_DEADLOCK_TIMEOUT` seconds a warning is logged, the wait goes on).

use crate::decomposition::Decomposition;
use crate::kernel::Elem;
use crate::lamellae::comm::{check_pe, CommError, CommRdma, CommResult, WordLayout};
use crate::placement::DiagnosticsRecord;
use crate::LamellarWorld;

use serde::de::DeserializeOwned;
use serde::Serialize;

impl LamellarWorld {
    fn layout(&self) -> WordLayout {
        WordLayout::new(self.num_pes())
    }

    /// Every PE returns the value `val` passed by `root`
    pub(crate) fn broadcast_word(&self, root: usize, val: usize) -> CommResult<usize> {
        check_pe(root, self.num_pes())?;
        let index = self.layout().gather_rounds();
        // the previous value must have been read everywhere before it is overwritten
        self.barrier();
        if self.my_pe() == root {
            for pe in 0..self.num_pes() {
                self.comm.put_word(pe, index, val);
            }
        }
        self.barrier();
        Ok(self.comm.word(index))
    }

    /// Gather one byte buffer of arbitrary length from every PE into a single buffer on `root`.
    ///
    /// The lengths are exchanged first and turned into a displacement table, then the payloads move
    /// through the root's heap in rounds, each PE owning a slot of `heap_size / num_pes` bytes per round.
    /// Returns the table and the packed payloads on `root`, `None` everywhere else.
    #[tracing::instrument(skip_all)]
    pub(crate) fn gatherv_bytes(
        &self,
        root: usize,
        data: &[u8],
    ) -> CommResult<Option<(Decomposition, Vec<u8>)>> {
        check_pe(root, self.num_pes())?;
        let layout = self.layout();
        let num_pes = self.num_pes();
        let my_pe = self.my_pe();
        let slot = self.comm.heap_size() / num_pes;

        self.comm.put_word(root, layout.gather_len(my_pe), data.len());
        self.barrier();
        let displs = if my_pe == root {
            let lens = (0..num_pes)
                .map(|pe| self.comm.word(layout.gather_len(pe)))
                .collect::<Vec<_>>();
            Some(Decomposition::from_counts(&lens))
        } else {
            None
        };
        let rounds = match &displs {
            Some(displs) => displs
                .blocks()
                .iter()
                .map(|b| (b.count + slot - 1) / slot)
                .max()
                .unwrap_or(0),
            None => 0,
        };
        let rounds = self.broadcast_word(root, rounds)?;
        tracing::debug!(
            "[{}] gather to {} of {} bytes in {} rounds",
            my_pe,
            root,
            data.len(),
            rounds
        );

        let mut packed = vec![0u8; displs.as_ref().map_or(0, |d| d.len())];
        for round in 0..rounds {
            let start = (round * slot).min(data.len());
            let end = ((round + 1) * slot).min(data.len());
            if start < end {
                self.comm.put(root, my_pe * slot, &data[start..end])?;
            }
            self.barrier();
            if let Some(displs) = &displs {
                for (pe, block) in displs.blocks().iter().enumerate() {
                    let done = (round * slot).min(block.count);
                    let chunk = (block.count - done).min(slot);
                    if chunk > 0 {
                        let at = block.offset + done;
                        self.comm.get_local(pe * slot, &mut packed[at..at + chunk])?;
                    }
                }
            }
            self.barrier();
        }
        Ok(displs.map(|displs| (displs, packed)))
    }

    /// Gather one byte buffer of arbitrary length from every PE onto `root`.
    ///
    /// Returns the buffers ordered by pe id on `root` and `None` everywhere else.
    pub fn gather_bytes(&self, root: usize, data: &[u8]) -> CommResult<Option<Vec<Vec<u8>>>> {
        Ok(self.gatherv_bytes(root, data)?.map(|(displs, packed)| {
            displs
                .blocks()
                .iter()
                .map(|block| packed[block.range()].to_vec())
                .collect()
        }))
    }

    /// Gather one serializable value from every PE onto `root`
    pub fn gather<T: Serialize + DeserializeOwned>(
        &self,
        root: usize,
        val: &T,
    ) -> CommResult<Option<Vec<T>>> {
        let data = crate::serialize(val)?;
        match self.gather_bytes(root, &data)? {
            Some(bufs) => Ok(Some(
                bufs.iter()
                    .map(|buf| crate::deserialize(buf))
                    .collect::<Result<Vec<T>, _>>()?,
            )),
            None => Ok(None),
        }
    }

    /// Assemble the global result on `root`, each PE's `local` block placed at its offset.
    ///
    /// Positions owned by no PE stay zero. A PE whose block count differs from `local.len()` is an error on every PE.
    #[tracing::instrument(skip_all)]
    pub fn gather_results(
        &self,
        local: &[Elem],
        decomp: &Decomposition,
        root: usize,
    ) -> CommResult<Option<Vec<Elem>>> {
        if decomp.num_pes() != self.num_pes() {
            return Err(CommError::DecompositionMismatch {
                expected: self.num_pes(),
                found: decomp.num_pes(),
            });
        }
        let gathered = match self.gather_bytes(root, &crate::serialize(local)?)? {
            Some(bufs) => Some(
                bufs.iter()
                    .map(|buf| crate::deserialize::<Vec<Elem>>(buf))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };

        // pe + 1 of the first PE whose contribution does not fit its block, and what it sent
        let (bad, found) = match &gathered {
            Some(parts) => parts
                .iter()
                .zip(decomp.blocks())
                .enumerate()
                .find(|(_, (part, block))| part.len() != block.count)
                .map(|(pe, (part, _))| (pe + 1, part.len()))
                .unwrap_or((0, 0)),
            None => (0, 0),
        };
        let bad = self.broadcast_word(root, bad)?;
        if bad > 0 {
            let found = self.broadcast_word(root, found)?;
            let pe = bad - 1;
            return Err(CommError::CountMismatch {
                pe,
                expected: decomp.blocks()[pe].count,
                found,
            });
        }

        Ok(gathered.map(|parts: Vec<Vec<Elem>>| {
            let mut result = vec![0; decomp.len()];
            for (part, block) in parts.iter().zip(decomp.blocks()) {
                result[block.range()].copy_from_slice(part);
            }
            result
        }))
    }

    /// Gather every PE's host name and CPU id onto `root`.
    ///
    /// The host names are variable length, the displacement table built from their lengths
    /// locates each PE's name in the packed buffer.
    #[tracing::instrument(skip_all)]
    pub fn gather_diagnostics(
        &self,
        record: &DiagnosticsRecord,
        root: usize,
    ) -> CommResult<Option<Vec<DiagnosticsRecord>>> {
        let names = self.gatherv_bytes(root, &record.hostname)?;
        let cpus = self.gather(root, &record.cpu)?;
        match (names, cpus) {
            (Some((displs, all_names)), Some(cpus)) => Ok(Some(
                displs
                    .blocks()
                    .iter()
                    .zip(cpus)
                    .enumerate()
                    .map(|(pe, (block, cpu))| {
                        DiagnosticsRecord::new(pe, &all_names[block.range()], cpu)
                    })
                    .collect(),
            )),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::decomposition::{Decomposition, LocalOperands, RemainderPolicy};
    use crate::kernel::{mat_vec, Elem, KernelMode};
    use crate::placement::DiagnosticsRecord;
    use crate::verify::{compute_reference, verify};
    use crate::{Backend, CommError, LamellarWorldBuilder};

    use std::time::Duration;

    fn with_timeout<R: Send + 'static>(f: impl FnOnce() -> R + Send + 'static) -> R {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(f());
        });
        rx.recv_timeout(Duration::from_secs(120))
            .expect("collective did not finish")
    }

    fn threads(num_pes: usize, heap_size: usize) -> LamellarWorldBuilder {
        LamellarWorldBuilder::new()
            .with_lamellae(Backend::Threads)
            .with_num_pes(num_pes)
            .with_threads(2)
            .with_heap_size(heap_size)
    }

    fn distributed_matvec(
        n: usize,
        num_pes: usize,
        policy: RemainderPolicy,
    ) -> Vec<Option<Vec<Elem>>> {
        with_timeout(move || {
            threads(num_pes, 1 << 16)
                .launch(|world| {
                    let decomp = Decomposition::block(n, world.num_pes(), policy).unwrap();
                    let block = decomp.block_of(world.my_pe()).unwrap();
                    let ops = LocalOperands::for_block(block, n, KernelMode::Serial);
                    let local = world.install(|| mat_vec(&ops.matrix, &ops.vector, KernelMode::Parallel));
                    world.gather_results(&local, &decomp, 0).unwrap()
                })
                .unwrap()
        })
    }

    #[test]
    fn gathered_results_match_reference() {
        let n = 12;
        let reference = compute_reference(n, KernelMode::Serial);
        for num_pes in 1..=4 {
            let results = distributed_matvec(n, num_pes, RemainderPolicy::Drop);
            assert_eq!(results[0].as_ref(), Some(&reference), "num_pes {}", num_pes);
            assert!(results[1..].iter().all(|r| r.is_none()));
        }
    }

    #[test]
    fn last_pe_takes_the_remainder() {
        let n = 10;
        let results = distributed_matvec(n, 4, RemainderPolicy::LastPe);
        let outcome = verify(results[0].as_ref().unwrap(), &compute_reference(n, KernelMode::Serial));
        assert!(outcome.ok());
    }

    #[test]
    fn dropped_remainder_mismatches_at_first_uncovered_row() {
        let n = 10;
        let results = distributed_matvec(n, 4, RemainderPolicy::Drop);
        let gathered = results[0].as_ref().unwrap();
        assert_eq!(gathered[8..], [0, 0]);
        let mismatch = verify(gathered, &compute_reference(n, KernelMode::Serial))
            .mismatch
            .unwrap();
        assert_eq!(mismatch.index, 4 * (n / 4));
    }

    #[test]
    fn count_mismatch_fails_on_every_pe() {
        let results = with_timeout(|| {
            threads(3, 4096)
                .launch(|world| {
                    let decomp = Decomposition::block(9, 3, RemainderPolicy::Drop).unwrap();
                    let local = vec![1; if world.my_pe() == 1 { 2 } else { 3 }];
                    world.gather_results(&local, &decomp, 0)
                })
                .unwrap()
        });
        for res in results {
            match res {
                Err(CommError::CountMismatch {
                    pe,
                    expected,
                    found,
                }) => assert_eq!((pe, expected, found), (1, 3, 2)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn decomposition_must_match_world() {
        let results = with_timeout(|| {
            threads(2, 4096)
                .launch(|world| {
                    let decomp = Decomposition::block(8, 4, RemainderPolicy::Drop).unwrap();
                    world.gather_results(&[0; 2], &decomp, 0).is_err()
                })
                .unwrap()
        });
        assert_eq!(results, vec![true, true]);
    }

    #[test]
    fn diagnostics_of_different_lengths() {
        // 4 pes share a 64 byte heap: 16 byte slots, the longest name needs 7 rounds
        let long = "x".repeat(100);
        let names = ["", "node5", "a-rather-long-host-name-that-spans-slots", long.as_str()];
        let expected = names
            .iter()
            .enumerate()
            .map(|(pe, name)| DiagnosticsRecord::new(pe, name.as_bytes(), pe as i32 - 1))
            .collect::<Vec<_>>();
        let records = expected.clone();
        let results = with_timeout(move || {
            threads(4, 64)
                .launch(|world| {
                    world
                        .gather_diagnostics(&records[world.my_pe()], 2)
                        .unwrap()
                })
                .unwrap()
        });
        assert_eq!(results[2].as_ref(), Some(&expected));
        assert!(results[0].is_none() && results[1].is_none() && results[3].is_none());
    }

    #[test]
    fn packed_gather_offsets_follow_lengths() {
        let results = with_timeout(|| {
            threads(3, 24)
                .launch(|world| {
                    let data = vec![world.my_pe() as u8 + 1; [3, 0, 17][world.my_pe()]];
                    world.gatherv_bytes(1, &data).unwrap()
                })
                .unwrap()
        });
        let (displs, packed) = results[1].clone().unwrap();
        assert_eq!(displs.offsets(), vec![0, 3, 3]);
        assert_eq!(displs.counts(), vec![3, 0, 17]);
        assert_eq!(packed.len(), 20);
        assert!(packed[..3].iter().all(|b| *b == 1));
        assert!(packed[3..].iter().all(|b| *b == 3));
        assert!(results[0].is_none() && results[2].is_none());
    }

    #[test]
    fn repeated_gathers_reuse_the_heap() {
        let results = with_timeout(|| {
            threads(3, 48)
                .launch(|world| {
                    let mut all = Vec::new();
                    for round in 0..5usize {
                        let val = vec![world.my_pe() * 100 + round; round * 3];
                        all.push(world.gather(round % 3, &val).unwrap());
                    }
                    all
                })
                .unwrap()
        });
        for round in 0..5usize {
            for (pe, res) in results.iter().enumerate() {
                if pe == round % 3 {
                    let expected = (0..3)
                        .map(|p| vec![p * 100 + round; round * 3])
                        .collect::<Vec<_>>();
                    assert_eq!(res[round].as_ref(), Some(&expected));
                } else {
                    assert!(res[round].is_none());
                }
            }
        }
    }

    #[test]
    fn invalid_root_is_rejected() {
        let world = LamellarWorldBuilder::new()
            .with_lamellae(Backend::Local)
            .build()
            .unwrap();
        assert!(matches!(
            world.gather_bytes(1, b"abc"),
            Err(CommError::InvalidPe { pe: 1, num_pes: 1 })
        ));
        assert_eq!(
            world.gather_bytes(0, b"abc").unwrap(),
            Some(vec![b"abc".to_vec()])
        );
    }
}
