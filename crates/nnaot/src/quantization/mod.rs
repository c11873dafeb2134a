//! Two-phase quantization.
//!
//! Phase one instruments an optimized graph with statistics collectors
//! ([`profile_quantization`]); after running it, the observed ranges are
//! extracted ([`generate_node_quantization_infos`]) and persisted. Phase two,
//! usually a separate process, rebuilds and optimizes the same graph, reloads
//! the records and rewrites operators to fixed point
//! ([`generate_quantized_graph`]). The statistics file is the only channel
//! between the phases.

mod info;
mod params;
mod profile;
mod rewrite;

pub use info::{
    deserialize_from_file, deserialize_from_str, serialize_to_file, serialize_to_string,
    NodeQuantizationInfo, PROFILE_FORMAT_VERSION,
};
pub use params::{
    choose_quantization_params, dequantize, quantize_i32, quantize_i8, rescale_i8, QuantParams,
    I8_MAX, I8_MIN,
};
pub use profile::{
    accumulate_range, generate_node_quantization_infos, profile_quantization,
    PROFILE_STATS_SUFFIX,
};
pub use rewrite::{generate_quantized_graph, is_quantizable, QuantizationOptions, QuantizationReport};
