//! Built-in shape infer implementations for the common layer types.
//!
//! Parameters arrive as strings on the layer description; the helpers here
//! parse scalars and comma-separated lists, reporting the offending
//! parameter name on failure.

use crate::error::{ReshapeError, Result};
use crate::model::Shape;
use crate::registry::{ShapeInferExtension, ShapeInferImpl};
use std::collections::HashMap;
use std::sync::Arc;

const BUILT_IN_TYPES: &[&str] = &[
    "Input",
    "Const",
    "Memory",
    "ReLU",
    "Sigmoid",
    "TanH",
    "SoftMax",
    "ScaleShift",
    "Eltwise",
    "Concat",
    "Convolution",
    "Pooling",
    "FullyConnected",
    "Reshape",
    "Permute",
    "Flatten",
];

/// The always-present extension covering the built-in layer types.
pub struct BuiltInExtension;

impl ShapeInferExtension for BuiltInExtension {
    fn supported_types(&self) -> Vec<String> {
        BUILT_IN_TYPES.iter().map(|s| s.to_string()).collect()
    }

    fn implementation(&self, type_name: &str) -> Option<Arc<dyn ShapeInferImpl>> {
        let imp: Arc<dyn ShapeInferImpl> = match type_name.to_ascii_lowercase().as_str() {
            "input" | "const" | "memory" | "relu" | "sigmoid" | "tanh" | "softmax"
            | "scaleshift" => Arc::new(PassThrough),
            "eltwise" => Arc::new(Eltwise),
            "concat" => Arc::new(Concat),
            "convolution" => Arc::new(Convolution),
            "pooling" => Arc::new(Pooling),
            "fullyconnected" => Arc::new(FullyConnected),
            "reshape" => Arc::new(ReshapeOp),
            "permute" => Arc::new(Permute),
            "flatten" => Arc::new(Flatten),
            _ => return None,
        };
        Some(imp)
    }
}

fn param_err(key: &str, reason: &str) -> ReshapeError {
    ReshapeError::Implementation(format!("parameter '{key}' {reason}"))
}

fn int_param(params: &HashMap<String, String>, key: &str) -> Result<i64> {
    let raw = params.get(key).ok_or_else(|| param_err(key, "is missing"))?;
    raw.trim()
        .parse()
        .map_err(|_| param_err(key, "is not an integer"))
}

fn int_param_or(params: &HashMap<String, String>, key: &str, default: i64) -> Result<i64> {
    match params.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| param_err(key, "is not an integer")),
        None => Ok(default),
    }
}

fn int_list_param(params: &HashMap<String, String>, key: &str) -> Result<Vec<i64>> {
    let raw = params.get(key).ok_or_else(|| param_err(key, "is missing"))?;
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse()
                .map_err(|_| param_err(key, "is not a list of integers"))
        })
        .collect()
}

/// Expands a per-dimension parameter to `count` entries: a single value is
/// broadcast, a full list is used as-is.
fn per_dim(values: Vec<i64>, count: usize, key: &str) -> Result<Vec<i64>> {
    if values.len() == count {
        Ok(values)
    } else if values.len() == 1 {
        Ok(vec![values[0]; count])
    } else {
        Err(param_err(key, "has the wrong number of entries"))
    }
}

fn per_dim_param_or(
    params: &HashMap<String, String>,
    key: &str,
    count: usize,
    default: i64,
) -> Result<Vec<i64>> {
    match params.get(key) {
        Some(_) => per_dim(int_list_param(params, key)?, count, key),
        None => Ok(vec![default; count]),
    }
}

fn first_input<'a>(inputs: &'a [Shape]) -> Result<&'a Shape> {
    inputs
        .first()
        .ok_or_else(|| ReshapeError::Implementation("no input shapes provided".to_string()))
}

/// Output size of one spatial dimension of a convolution or pooling window.
fn window_output_size(
    in_size: usize,
    kernel: i64,
    stride: i64,
    dilation: i64,
    pad_begin: i64,
    pad_end: i64,
) -> Result<usize> {
    if stride <= 0 {
        return Err(param_err("strides", "must be positive"));
    }
    let padded = in_size as i64 + pad_begin + pad_end;
    let effective_kernel = dilation * (kernel - 1) + 1;
    let out = (padded - effective_kernel) / stride + 1;
    if out <= 0 {
        return Err(ReshapeError::Implementation(format!(
            "kernel of size {kernel} does not fit input dimension of size {in_size}"
        )));
    }
    Ok(out as usize)
}

/// Copies every input shape through unchanged. Covers activations and the
/// source types whose shapes are fixed elsewhere (input, const, memory).
struct PassThrough;

impl ShapeInferImpl for PassThrough {
    fn infer(
        &self,
        inputs: &[Shape],
        _params: &HashMap<String, String>,
        _blobs: &HashMap<String, Vec<f32>>,
    ) -> Result<Vec<Shape>> {
        if inputs.is_empty() {
            return Err(ReshapeError::Implementation(
                "no input shapes provided".to_string(),
            ));
        }
        Ok(inputs.to_vec())
    }
}

/// Elementwise operation over any number of inputs with numpy-style
/// broadcasting, aligned from the innermost dimension.
struct Eltwise;

impl ShapeInferImpl for Eltwise {
    fn infer(
        &self,
        inputs: &[Shape],
        _params: &HashMap<String, String>,
        _blobs: &HashMap<String, Vec<f32>>,
    ) -> Result<Vec<Shape>> {
        let mut out = first_input(inputs)?.clone();
        for shape in &inputs[1..] {
            out = broadcast(&out, shape)?;
        }
        Ok(vec![out])
    }
}

fn broadcast(a: &Shape, b: &Shape) -> Result<Shape> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < a.len() { a[a.len() - 1 - i] } else { 1 };
        let db = if i < b.len() { b[b.len() - 1 - i] } else { 1 };
        out[rank - 1 - i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            (x, y) => {
                return Err(ReshapeError::Implementation(format!(
                    "cannot broadcast shapes {a:?} and {b:?}: dimensions {x} and {y} differ"
                )));
            }
        };
    }
    Ok(out)
}

/// Concatenation along the `axis` parameter (default 1).
struct Concat;

impl ShapeInferImpl for Concat {
    fn infer(
        &self,
        inputs: &[Shape],
        params: &HashMap<String, String>,
        _blobs: &HashMap<String, Vec<f32>>,
    ) -> Result<Vec<Shape>> {
        let first = first_input(inputs)?;
        let axis = int_param_or(params, "axis", 1)?;
        if axis < 0 || axis as usize >= first.len() {
            return Err(param_err("axis", "is out of range for the input rank"));
        }
        let axis = axis as usize;

        let mut out = first.clone();
        for shape in &inputs[1..] {
            if shape.len() != first.len() {
                return Err(ReshapeError::Implementation(format!(
                    "concat inputs have mismatched ranks: {first:?} vs {shape:?}"
                )));
            }
            for (d, (&a, &b)) in first.iter().zip(shape).enumerate() {
                if d != axis && a != b {
                    return Err(ReshapeError::Implementation(format!(
                        "concat inputs differ outside axis {axis}: {first:?} vs {shape:?}"
                    )));
                }
            }
            out[axis] += shape[axis];
        }
        Ok(vec![out])
    }
}

/// Convolution over `[N, C, spatial...]` data. Weights are described by
/// parameters (`kernel`, `strides`, `dilations`, `pads_begin`, `pads_end`,
/// `output`) rather than a weights input port.
struct Convolution;

impl ShapeInferImpl for Convolution {
    fn infer(
        &self,
        inputs: &[Shape],
        params: &HashMap<String, String>,
        _blobs: &HashMap<String, Vec<f32>>,
    ) -> Result<Vec<Shape>> {
        let data = first_input(inputs)?;
        if data.len() < 3 {
            return Err(ReshapeError::Implementation(format!(
                "convolution input must have rank >= 3, got {data:?}"
            )));
        }
        let spatial = data.len() - 2;

        let out_channels = int_param(params, "output")?;
        if out_channels <= 0 {
            return Err(param_err("output", "must be positive"));
        }
        let kernel = per_dim(int_list_param(params, "kernel")?, spatial, "kernel")?;
        let strides = per_dim_param_or(params, "strides", spatial, 1)?;
        let dilations = per_dim_param_or(params, "dilations", spatial, 1)?;
        let pads_begin = per_dim_param_or(params, "pads_begin", spatial, 0)?;
        let pads_end = per_dim_param_or(params, "pads_end", spatial, 0)?;

        let mut out = vec![data[0], out_channels as usize];
        for i in 0..spatial {
            out.push(window_output_size(
                data[2 + i],
                kernel[i],
                strides[i],
                dilations[i],
                pads_begin[i],
                pads_end[i],
            )?);
        }
        Ok(vec![out])
    }
}

/// Pooling over `[N, C, spatial...]` data; channel count is preserved.
struct Pooling;

impl ShapeInferImpl for Pooling {
    fn infer(
        &self,
        inputs: &[Shape],
        params: &HashMap<String, String>,
        _blobs: &HashMap<String, Vec<f32>>,
    ) -> Result<Vec<Shape>> {
        let data = first_input(inputs)?;
        if data.len() < 3 {
            return Err(ReshapeError::Implementation(format!(
                "pooling input must have rank >= 3, got {data:?}"
            )));
        }
        let spatial = data.len() - 2;

        let kernel = per_dim(int_list_param(params, "kernel")?, spatial, "kernel")?;
        let strides = per_dim_param_or(params, "strides", spatial, 1)?;
        let pads_begin = per_dim_param_or(params, "pads_begin", spatial, 0)?;
        let pads_end = per_dim_param_or(params, "pads_end", spatial, 0)?;

        let mut out = vec![data[0], data[1]];
        for i in 0..spatial {
            out.push(window_output_size(
                data[2 + i],
                kernel[i],
                strides[i],
                1,
                pads_begin[i],
                pads_end[i],
            )?);
        }
        Ok(vec![out])
    }
}

/// Fully connected layer: `[N, ...] -> [N, out-size]`.
struct FullyConnected;

impl ShapeInferImpl for FullyConnected {
    fn infer(
        &self,
        inputs: &[Shape],
        params: &HashMap<String, String>,
        _blobs: &HashMap<String, Vec<f32>>,
    ) -> Result<Vec<Shape>> {
        let data = first_input(inputs)?;
        if data.is_empty() {
            return Err(ReshapeError::Implementation(
                "fully connected input must have rank >= 1".to_string(),
            ));
        }
        let out_size = int_param(params, "out-size")?;
        if out_size <= 0 {
            return Err(param_err("out-size", "must be positive"));
        }
        Ok(vec![vec![data[0], out_size as usize]])
    }
}

/// Reshape according to the `dim` parameter: `0` copies the input dimension
/// at the same position, `-1` is inferred from the remaining element count.
struct ReshapeOp;

impl ShapeInferImpl for ReshapeOp {
    fn infer(
        &self,
        inputs: &[Shape],
        params: &HashMap<String, String>,
        _blobs: &HashMap<String, Vec<f32>>,
    ) -> Result<Vec<Shape>> {
        let data = first_input(inputs)?;
        let dims = int_list_param(params, "dim")?;
        let total: usize = data.iter().product();

        let mut out = Vec::with_capacity(dims.len());
        let mut inferred = None;
        let mut known = 1usize;
        for (i, &d) in dims.iter().enumerate() {
            match d {
                0 => {
                    let copied = *data.get(i).ok_or_else(|| {
                        param_err("dim", "copies a dimension the input does not have")
                    })?;
                    out.push(copied);
                    known *= copied;
                }
                -1 => {
                    if inferred.is_some() {
                        return Err(param_err("dim", "may contain -1 at most once"));
                    }
                    inferred = Some(i);
                    out.push(0);
                }
                d if d > 0 => {
                    out.push(d as usize);
                    known *= d as usize;
                }
                _ => return Err(param_err("dim", "contains a negative dimension")),
            }
        }

        if let Some(i) = inferred {
            if known == 0 || total % known != 0 {
                return Err(ReshapeError::Implementation(format!(
                    "cannot infer -1 dimension: {total} elements do not divide into {dims:?}"
                )));
            }
            out[i] = total / known;
        } else if known != total {
            return Err(ReshapeError::Implementation(format!(
                "reshape to {dims:?} does not preserve the element count of {data:?}"
            )));
        }
        Ok(vec![out])
    }
}

/// Axis permutation via the `order` parameter.
struct Permute;

impl ShapeInferImpl for Permute {
    fn infer(
        &self,
        inputs: &[Shape],
        params: &HashMap<String, String>,
        _blobs: &HashMap<String, Vec<f32>>,
    ) -> Result<Vec<Shape>> {
        let data = first_input(inputs)?;
        let order = int_list_param(params, "order")?;
        if order.len() != data.len() {
            return Err(param_err("order", "must name every input axis once"));
        }
        let mut seen = vec![false; data.len()];
        let mut out = Vec::with_capacity(data.len());
        for &axis in &order {
            let axis = usize::try_from(axis)
                .ok()
                .filter(|&a| a < data.len())
                .ok_or_else(|| param_err("order", "is out of range for the input rank"))?;
            if seen[axis] {
                return Err(param_err("order", "repeats an axis"));
            }
            seen[axis] = true;
            out.push(data[axis]);
        }
        Ok(vec![out])
    }
}

/// Flattens to two dimensions around the `axis` parameter (default 1).
struct Flatten;

impl ShapeInferImpl for Flatten {
    fn infer(
        &self,
        inputs: &[Shape],
        params: &HashMap<String, String>,
        _blobs: &HashMap<String, Vec<f32>>,
    ) -> Result<Vec<Shape>> {
        let data = first_input(inputs)?;
        let axis = int_param_or(params, "axis", 1)?;
        if axis < 0 || axis as usize > data.len() {
            return Err(param_err("axis", "is out of range for the input rank"));
        }
        let axis = axis as usize;
        let outer: usize = data[..axis].iter().product();
        let inner: usize = data[axis..].iter().product();
        Ok(vec![vec![outer, inner]])
    }
}
