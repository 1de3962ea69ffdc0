//! Memory-efficient attention over packed `qkv` activations.
//!
//! The forward pass never materialises the `[seqlen, seqlen]` score matrix: keys are visited in
//! tiles of [`BLOCK_N`] with a running maximum and normaliser (online softmax), and only the
//! log-sum-exp of every query row is kept. The backward pass rebuilds each probability from that
//! log-sum-exp.
//!
//! Layouts (all row-major, `N = batch * seqlen`, `H = num_heads`, `D = head_dim`):
//! * `qkv`: `[N, 3, H, D]` flattened to `[N, 3 * H * D]`
//! * `out`, `dout`: `[N, H, D]`
//! * `lse`: `[N, H]`

use crate::error::Result;
use rayon::prelude::*;

pub const PARALLEL_THRESHOLD: usize = 4096;

/// Number of keys processed per online-softmax step.
pub const BLOCK_N: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    pub batch: usize,
    pub seqlen: usize,
    pub num_heads: usize,
    pub head_dim: usize,
}

impl AttentionShape {
    pub fn tokens(&self) -> usize {
        self.batch * self.seqlen
    }

    pub fn qkv_width(&self) -> usize {
        3 * self.num_heads * self.head_dim
    }

    pub fn out_width(&self) -> usize {
        self.num_heads * self.head_dim
    }

    fn check(&self, name: &str, len: usize, width: usize) -> Result<()> {
        crate::ensure!(
            len == self.tokens() * width,
            "{name} has {len} elements, expected {} x {width}",
            self.tokens()
        );
        Ok(())
    }

    #[inline]
    fn q_offset(&self, token: usize, head: usize) -> usize {
        token * self.qkv_width() + head * self.head_dim
    }

    #[inline]
    fn k_offset(&self, token: usize, head: usize) -> usize {
        self.q_offset(token, head) + self.out_width()
    }

    #[inline]
    fn v_offset(&self, token: usize, head: usize) -> usize {
        self.q_offset(token, head) + 2 * self.out_width()
    }
}

/// Result of [`flash_attention_forward`].
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    pub out: Vec<f32>,
    pub lse: Vec<f32>,
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `softmax(scale * q k^T) v` per batch element and head, returning the log-sum-exp of every
/// query row as well.
///
/// With `causal`, query `t` attends to keys `0..=t` of its own sequence.
pub fn flash_attention_forward(
    qkv: &[f32],
    shape: AttentionShape,
    softmax_scale: f32,
    causal: bool,
) -> Result<AttentionOutput> {
    shape.check("qkv", qkv.len(), shape.qkv_width())?;
    let AttentionShape {
        seqlen,
        num_heads: h,
        head_dim: d,
        ..
    } = shape;

    let mut out = vec![0.0f32; shape.tokens() * h * d];
    let mut lse = vec![0.0f32; shape.tokens() * h];

    // One query token, all heads.
    let attn_fn = |(token, (out_token, lse_token)): (usize, (&mut [f32], &mut [f32]))| {
        let batch_idx = token / seqlen;
        let seq_idx = token % seqlen;
        let first_key = batch_idx * seqlen;
        let kv_len = if causal { seq_idx + 1 } else { seqlen };

        let mut scores = vec![0.0f32; BLOCK_N];
        let mut acc = vec![0.0f32; d];
        for head in 0..h {
            let q = &qkv[shape.q_offset(token, head)..shape.q_offset(token, head) + d];
            let mut row_max = f32::NEG_INFINITY;
            let mut row_sum = 0.0f32;
            acc.fill(0.0);

            for tile_start in (0..kv_len).step_by(BLOCK_N) {
                let tile_len = BLOCK_N.min(kv_len - tile_start);
                let mut tile_max = f32::NEG_INFINITY;
                for j in 0..tile_len {
                    let k_at = shape.k_offset(first_key + tile_start + j, head);
                    let s = softmax_scale * dot(q, &qkv[k_at..k_at + d]);
                    scores[j] = s;
                    tile_max = tile_max.max(s);
                }

                let new_max = row_max.max(tile_max);
                let correction = (row_max - new_max).exp();
                row_sum *= correction;
                acc.iter_mut().for_each(|a| *a *= correction);

                for j in 0..tile_len {
                    let p = (scores[j] - new_max).exp();
                    row_sum += p;
                    let v_at = shape.v_offset(first_key + tile_start + j, head);
                    for (a, v) in acc.iter_mut().zip(&qkv[v_at..v_at + d]) {
                        *a += p * v;
                    }
                }
                row_max = new_max;
            }

            let inv_sum = 1.0 / row_sum;
            for (o, a) in out_token[head * d..(head + 1) * d].iter_mut().zip(&acc) {
                *o = a * inv_sum;
            }
            lse_token[head] = row_max + row_sum.ln();
        }
    };

    if shape.tokens() * h * d >= PARALLEL_THRESHOLD {
        out.par_chunks_mut(h * d)
            .zip(lse.par_chunks_mut(h))
            .enumerate()
            .for_each(attn_fn);
    } else {
        out.chunks_mut(h * d)
            .zip(lse.chunks_mut(h))
            .enumerate()
            .for_each(attn_fn);
    }

    Ok(AttentionOutput { out, lse })
}

/// Gradient of [`flash_attention_forward`] with respect to the packed `qkv`.
///
/// With `P` rebuilt from `lse` and `D = rowsum(dO * O)`:
/// `dV = P^T dO`, `dS = P * (dO V^T - D)`, `dQ = scale * dS K`, `dK = scale * dS^T Q`.
pub fn flash_attention_backward(
    qkv: &[f32],
    out: &[f32],
    dout: &[f32],
    lse: &[f32],
    shape: AttentionShape,
    softmax_scale: f32,
    causal: bool,
) -> Result<Vec<f32>> {
    shape.check("qkv", qkv.len(), shape.qkv_width())?;
    shape.check("out", out.len(), shape.out_width())?;
    shape.check("dout", dout.len(), shape.out_width())?;
    shape.check("lse", lse.len(), shape.num_heads)?;
    let AttentionShape {
        batch,
        seqlen,
        num_heads: h,
        head_dim: d,
    } = shape;

    // dK and dV sum over queries, so the work is split per (batch, head).
    let head_grads = |bh: usize| -> [Vec<f32>; 3] {
        let batch_idx = bh / h;
        let head = bh % h;
        let first = batch_idx * seqlen;
        let mut dq = vec![0.0f32; seqlen * d];
        let mut dk = vec![0.0f32; seqlen * d];
        let mut dv = vec![0.0f32; seqlen * d];

        for t in 0..seqlen {
            let token = first + t;
            let o_at = token * h * d + head * d;
            let do_row = &dout[o_at..o_at + d];
            let delta = dot(do_row, &out[o_at..o_at + d]);
            let row_lse = lse[token * h + head];
            let q = &qkv[shape.q_offset(token, head)..shape.q_offset(token, head) + d];
            let kv_len = if causal { t + 1 } else { seqlen };

            for j in 0..kv_len {
                let k_at = shape.k_offset(first + j, head);
                let v_at = shape.v_offset(first + j, head);
                let k = &qkv[k_at..k_at + d];
                let v = &qkv[v_at..v_at + d];

                let p = (softmax_scale * dot(q, k) - row_lse).exp();
                let ds = p * (dot(do_row, v) - delta) * softmax_scale;
                for i in 0..d {
                    dv[j * d + i] += p * do_row[i];
                    dq[t * d + i] += ds * k[i];
                    dk[j * d + i] += ds * q[i];
                }
            }
        }
        [dq, dk, dv]
    };

    let grads: Vec<[Vec<f32>; 3]> = if batch * seqlen * h * d >= PARALLEL_THRESHOLD {
        (0..batch * h).into_par_iter().map(head_grads).collect()
    } else {
        (0..batch * h).map(head_grads).collect()
    };

    let mut dqkv = vec![0.0f32; shape.tokens() * shape.qkv_width()];
    for (bh, [dq, dk, dv]) in grads.iter().enumerate() {
        let first = (bh / h) * seqlen;
        let head = bh % h;
        for t in 0..seqlen {
            let token = first + t;
            let src = t * d..(t + 1) * d;
            let q_at = shape.q_offset(token, head);
            dqkv[q_at..q_at + d].copy_from_slice(&dq[src.clone()]);
            let k_at = shape.k_offset(token, head);
            dqkv[k_at..k_at + d].copy_from_slice(&dk[src.clone()]);
            let v_at = shape.v_offset(token, head);
            dqkv[v_at..v_at + d].copy_from_slice(&dv[src]);
        }
    }
    Ok(dqkv)
}
