//! Affine parameter selection and the scalar fixed-point arithmetic every
//! backend reproduces bit for bit.
//!
//! All helpers compute in single precision with one rounding step
//! (`round(v / scale + offset)`, halves away from zero) so that generated C
//! compiled without floating-point contraction yields identical integers.

pub use crate::tensor::QuantParams;

pub const I8_MIN: i32 = -128;
pub const I8_MAX: i32 = 127;

/// Picks int8 parameters covering `[min, max]`.
///
/// The range is widened to include zero so that zero is exactly
/// representable. The zero point comes from whichever end of the range
/// yields the smaller rounding error and is clamped into the int8 range.
pub fn choose_quantization_params(min: f32, max: f32) -> QuantParams {
    let min = f64::from(min.min(0.0));
    let max = f64::from(max.max(0.0));
    let qmin = f64::from(I8_MIN);
    let qmax = f64::from(I8_MAX);

    let mut scale = (max - min) / (qmax - qmin);
    if scale == 0.0 {
        scale = 0.1;
    }

    let zero_point_from_min = qmin - min / scale;
    let zero_point_from_max = qmax - max / scale;
    let zero_point_from_min_error = qmin.abs() + (min / scale).abs();
    let zero_point_from_max_error = qmax.abs() + (max / scale).abs();
    let initial = if zero_point_from_min_error < zero_point_from_max_error {
        zero_point_from_min
    } else {
        zero_point_from_max
    };

    let offset = if initial < qmin {
        I8_MIN
    } else if initial > qmax {
        I8_MAX
    } else {
        initial.round() as i32
    };

    QuantParams {
        scale: scale as f32,
        offset,
    }
}

pub fn quantize_i8(value: f32, params: QuantParams) -> i8 {
    let rounded = (value / params.scale + params.offset as f32).round();
    rounded.clamp(I8_MIN as f32, I8_MAX as f32) as i8
}

pub fn quantize_i32(value: f32, params: QuantParams) -> i32 {
    let rounded = (value / params.scale + params.offset as f32).round();
    rounded.clamp(-2_147_483_648.0, 2_147_483_520.0) as i32
}

pub fn dequantize(value: i32, params: QuantParams) -> f32 {
    params.scale * (value - params.offset) as f32
}

/// Maps `value` from `from` to `to` parameters.
pub fn rescale_i8(value: i8, from: QuantParams, to: QuantParams) -> i8 {
    quantize_i8(dequantize(value as i32, from), to)
}
