mod cache;
mod mamba;

pub use cache::{InferenceCache, MambaCache, MambaCacheConfig};
pub use mamba::{Mamba, MambaConfig, ScanBranch, selective_scan};
