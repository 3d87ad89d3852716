//! Data plane: masked joins and the file-coordinating data manager.

mod deref;
mod manager;

pub use deref::{
    dereference, dereference_chain, dereference_chain_indices, dereference_indices, ChainHop,
    DerefOptions, IndexRect, MaskedRect, Rect, RefDirection, RefSource, RegionSource, RowSource,
    Selection,
};
pub use manager::{DataManager, DsetHandle, RefHandle, RegionHandle};
