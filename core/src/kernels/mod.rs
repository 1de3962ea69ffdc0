//! Compute kernels that operate on flat `f32` buffers.

pub mod attention;

pub use attention::{
    flash_attention_backward, flash_attention_forward, AttentionOutput, AttentionShape,
};
