pub mod block;
#[cfg(feature = "dna")]
pub mod dna;
pub mod drop_path;
pub mod error;
pub mod inflate;
pub mod mixer;
pub mod model;
pub mod norm;
pub mod optim;
pub mod schedule;
pub mod state;
pub mod utils;

pub use error::{Result, VimError};
pub use model::{VisionMamba, VisionMambaConfig};

/// Autodiff backend that recomputes activations on the backward pass instead of keeping them
/// all in memory.
pub type CheckpointedAutodiff<B> =
    burn::backend::Autodiff<B, burn::backend::autodiff::checkpoint::strategy::BalancedCheckpointing>;

pub mod prelude {
    pub use crate::block::*;
    pub use crate::drop_path::*;
    pub use crate::error::*;
    pub use crate::inflate::*;
    pub use crate::mixer::*;
    pub use crate::model::*;
    pub use crate::norm::*;
    pub use crate::optim::*;
    pub use crate::state::*;
    pub use crate::{CheckpointedAutodiff, VisionMamba, VisionMambaConfig};

    #[cfg(feature = "dna")]
    pub use crate::dna::*;
}
