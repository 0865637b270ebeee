//! Dataset layer behind the ctorch loader handles: MNIST IDX reading,
//! transforms and the batch cursor. Nothing here depends on a tensor engine.

pub mod dataset;
pub mod error;
pub mod loader;
pub mod mnist;
pub mod transform;

pub use dataset::{Dataset, Example};
pub use error::{DataError, Result};
pub use loader::{shuffle_indices, Batch, Cursor, Loader, LoaderConfig};
pub use mnist::{synthesize, Mnist, Split};
pub use transform::{Normalize, Transform};
