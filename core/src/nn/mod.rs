pub mod activation;
pub mod attention;
pub mod block;
pub mod init;
pub mod linear;
pub mod mha;
pub mod mlp;
pub mod module;
pub mod norm;
pub mod rotary;

pub use activation::Activation;
pub use attention::SelfAttention;
pub use block::{Block, BlockOptions, DenseBlock, ForwardArgs, Sublayer};
pub use linear::{Linear, Projection};
pub use mha::MultiHeadAttention;
pub use mlp::Mlp;
pub use module::{Module, ParamEntry, Parameter};
pub use norm::LayerNorm;
pub use rotary::RotaryEmbedding;
