//! Dense layers and the layer enum the model graph is built from

pub mod conv;
mod layer;
pub mod linear;

pub use conv::Conv2d;
pub use layer::Layer;
pub use linear::Linear;
