//! English to Chinese translation with a GRU encoder-decoder and attention,
//! trained with libtorch through `tch`.

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod loss;
pub mod model;
pub mod packing;
pub mod preprocess;
pub mod tokenize;
pub mod train;
pub mod translate;

pub use error::{Result, TranslateError};
