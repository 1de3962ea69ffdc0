use super::backend::CollectiveBackend;
use crate::error::{Error, Result};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// One ring hop. `seq` numbers the collective the payload belongs to.
#[derive(Debug)]
pub struct Message {
    seq: u64,
    payload: Vec<f32>,
}

/// A CPU-based collective backend.
///
/// Implements the **Ring** collectives over `crossbeam` channels: every rank sends only to its
/// right neighbour and receives only from its left one, so each step moves `1 / world_size` of
/// the buffer per link. This simulates the data movement that happens on GPUs via NCCL.
///
/// Each collective call gets the next sequence number; a message carrying a different number
/// means the ranks disagree on the order of collectives and is reported as
/// [`Error::CollectiveMismatch`]. A neighbour that exits drops its channel ends, which surfaces
/// as [`Error::Comm`] instead of a hang.
#[derive(Debug)]
pub struct CpuBackend {
    rank: usize,
    world_size: usize,
    left_rx: Receiver<Message>,
    right_tx: Sender<Message>,
    timeout: Option<Duration>,
    seq: AtomicU64,
}

impl CpuBackend {
    pub fn new(
        rank: usize,
        world_size: usize,
        left_rx: Receiver<Message>,
        right_tx: Sender<Message>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            rank,
            world_size,
            left_rx,
            right_tx,
            timeout,
            seq: AtomicU64::new(0),
        }
    }

    /// Builds a complete ring of `world_size` members, returned in rank order.
    ///
    /// Channel `i` connects rank `i` to rank `i + 1`. No endpoint is kept outside the ring.
    pub fn ring(world_size: usize, timeout: Option<Duration>) -> Vec<CpuBackend> {
        let (txs, mut rxs): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();
        // rank r receives on channel r - 1
        rxs.rotate_right(1);
        txs.into_iter()
            .zip(rxs)
            .enumerate()
            .map(|(rank, (right_tx, left_rx))| {
                CpuBackend::new(rank, world_size, left_rx, right_tx, timeout)
            })
            .collect()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// `(rank - offset) mod world_size`
    fn ring_index(&self, offset: usize) -> usize {
        (self.rank + self.world_size * 2 - offset % self.world_size) % self.world_size
    }

    fn send(&self, seq: u64, payload: Vec<f32>) -> Result<()> {
        self.right_tx
            .send(Message { seq, payload })
            .map_err(|_| Error::Comm {
                rank: self.rank,
                message: "right neighbour disconnected".to_string(),
            })
    }

    fn recv(&self, op: &'static str, seq: u64, expected_len: usize) -> Result<Vec<f32>> {
        let msg = match self.timeout {
            Some(timeout) => self.left_rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => Error::Timeout {
                    rank: self.rank,
                    op,
                    timeout_ms: timeout.as_millis(),
                },
                RecvTimeoutError::Disconnected => self.disconnected(op),
            })?,
            None => self.left_rx.recv().map_err(|_| self.disconnected(op))?,
        };
        if msg.seq != seq {
            return Err(Error::CollectiveMismatch {
                rank: self.rank,
                op,
                expected: seq,
                got: msg.seq,
            });
        }
        if msg.payload.len() != expected_len {
            return Err(Error::Comm {
                rank: self.rank,
                message: format!(
                    "{op}: received {} elements, expected {expected_len}",
                    msg.payload.len()
                ),
            });
        }
        Ok(msg.payload)
    }

    fn disconnected(&self, op: &'static str) -> Error {
        Error::Comm {
            rank: self.rank,
            message: format!("left neighbour disconnected during {op}"),
        }
    }

    /// Chunk `index` of a buffer of `len` elements split into `world_size` near-equal parts.
    fn chunk_range(&self, len: usize, index: usize) -> Range<usize> {
        let chunk = len.div_ceil(self.world_size);
        let start = (index * chunk).min(len);
        let end = (start + chunk).min(len);
        start..end
    }

    /// Phase 1 of the ring all-reduce. At step `s` rank `r` sends chunk `r - s - 1` and adds the
    /// incoming chunk `r - s - 2`; afterwards chunk `r` is fully reduced on rank `r`.
    fn ring_reduce_scatter(&self, op: &'static str, seq: u64, data: &mut [f32]) -> Result<()> {
        let len = data.len();
        for step in 0..self.world_size - 1 {
            let send = self.chunk_range(len, self.ring_index(step + 1));
            let recv = self.chunk_range(len, self.ring_index(step + 2));
            self.send(seq, data[send].to_vec())?;
            let incoming = self.recv(op, seq, recv.len())?;
            for (d, v) in data[recv].iter_mut().zip(incoming) {
                *d += v;
            }
        }
        Ok(())
    }

    /// Phase 2: at step `s` rank `r` forwards chunk `r - s` and stores chunk `r - s - 1`.
    fn ring_all_gather(&self, op: &'static str, seq: u64, data: &mut [f32]) -> Result<()> {
        let len = data.len();
        for step in 0..self.world_size - 1 {
            let send = self.chunk_range(len, self.ring_index(step));
            let recv = self.chunk_range(len, self.ring_index(step + 1));
            self.send(seq, data[send].to_vec())?;
            let incoming = self.recv(op, seq, recv.len())?;
            data[recv].copy_from_slice(&incoming);
        }
        Ok(())
    }
}

impl CollectiveBackend for CpuBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        let seq = self.next_seq();
        trace!(rank = self.rank, seq, len = buf.len(), "all_reduce_sum");
        if self.world_size == 1 {
            return Ok(());
        }
        self.ring_reduce_scatter("all_reduce_sum", seq, buf)?;
        self.ring_all_gather("all_reduce_sum", seq, buf)
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>> {
        let seq = self.next_seq();
        trace!(rank = self.rank, seq, len = local.len(), "all_gather");
        let chunk = local.len();
        let mut out = vec![0.0f32; chunk * self.world_size];
        out[self.rank * chunk..(self.rank + 1) * chunk].copy_from_slice(local);
        if self.world_size > 1 {
            // Equal local lengths make every chunk_range exactly `chunk` wide.
            self.ring_all_gather("all_gather", seq, &mut out)?;
        }
        Ok(out)
    }

    fn reduce_scatter(&self, full: &[f32]) -> Result<Vec<f32>> {
        let seq = self.next_seq();
        trace!(rank = self.rank, seq, len = full.len(), "reduce_scatter");
        crate::ensure!(
            full.len() % self.world_size == 0,
            "reduce_scatter of {} elements over {} ranks",
            full.len(),
            self.world_size
        );
        let mut data = full.to_vec();
        if self.world_size > 1 {
            self.ring_reduce_scatter("reduce_scatter", seq, &mut data)?;
        }
        let range = self.chunk_range(data.len(), self.rank);
        Ok(data[range].to_vec())
    }

    fn barrier(&self) -> Result<()> {
        let mut token = [0.0f32; 1];
        self.all_reduce_sum(&mut token)
    }
}
