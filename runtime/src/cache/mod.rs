//! Cache module.
//!
//! `LayerCache`: content-addressed cache for extracted image layers.

pub mod layer_cache;

pub use layer_cache::LayerCache;
