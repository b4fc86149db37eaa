use crate::error::{ReshapeError, Result};
use crate::model::{Layer, Shape};
use crate::registry::{ShapeInferImpl, ShapeInferRegistry};
use petgraph::graph::NodeIndex;
use std::collections::HashMap;
use std::sync::Arc;

/// Behavior selector for a launcher. Shared launcher state lives in
/// [`Launcher`]; the kind decides what `reshape` and `apply_changes` do.
#[derive(Clone)]
pub enum LauncherKind {
    /// Interior layer with a registered implementation.
    General(Arc<dyn ShapeInferImpl>),
    /// Declared input (or the write side of a memory cell); shape is seeded
    /// before the reshape pass.
    Input,
    /// Constant layer; shapes are captured at creation and never recomputed.
    Const(Vec<(String, Shape)>),
    /// Read side of a memory cell; shape is supplied externally each run
    /// instead of being computed from predecessors.
    OutMemory,
    /// Layer with no registered implementation. Passes recorded shapes
    /// through and fails only when asked to infer something new.
    Fake,
}

impl LauncherKind {
    fn name(&self) -> &'static str {
        match self {
            LauncherKind::General(_) => "general",
            LauncherKind::Input => "input",
            LauncherKind::Const(_) => "const",
            LauncherKind::OutMemory => "out-memory",
            LauncherKind::Fake => "fake",
        }
    }
}

/// Per-layer driver of one shape propagation pass.
///
/// A launcher holds the staged (not yet committed) shapes for its layer's
/// output ports. Each run goes reset, seed, reshape, commit; the staged
/// shapes only reach the live layer in `apply_changes`, after the reshape
/// pass succeeded for every layer.
pub struct Launcher {
    node: NodeIndex,
    layer_name: String,
    layer_type: String,
    kind: LauncherKind,
    staged: HashMap<String, Shape>,
    /// Externally supplied shapes for the read side of a memory cell.
    /// Unlike `staged`, these survive `reset` so a seed planted between
    /// runs is still there when the next reshape pass reaches the layer.
    seeds: HashMap<String, Shape>,
}

impl Launcher {
    fn new(node: NodeIndex, layer: &Layer, kind: LauncherKind) -> Self {
        Self {
            node,
            layer_name: layer.name.clone(),
            layer_type: layer.type_name.clone(),
            kind,
            staged: HashMap::new(),
            seeds: HashMap::new(),
        }
    }

    pub fn node(&self) -> NodeIndex {
        self.node
    }

    pub fn layer_name(&self) -> &str {
        &self.layer_name
    }

    pub fn layer_type(&self) -> &str {
        &self.layer_type
    }

    pub fn kind(&self) -> &LauncherKind {
        &self.kind
    }

    pub fn staged_shape(&self, port: &str) -> Option<&Shape> {
        self.staged.get(port)
    }

    /// Clears staged shapes from the previous run. Idempotent. External
    /// memory seeds are kept; they belong to the coming run.
    pub fn reset(&mut self) {
        self.staged.clear();
    }

    /// Stages an explicit shape for a named output port. Constant layers
    /// keep their fixed shape and ignore overrides; for the read side of a
    /// memory cell the shape lands in the seed slot consumed by the next
    /// reshape pass.
    pub fn set_shape_by_name(&mut self, shape: Shape, port: &str) {
        match self.kind {
            LauncherKind::Const(_) => {}
            LauncherKind::OutMemory => {
                self.seeds.insert(port.to_string(), shape);
            }
            _ => {
                self.staged.insert(port.to_string(), shape);
            }
        }
    }

    /// Stages the shape already recorded on the layer description for a
    /// named output port, used when the caller supplied no override.
    pub fn set_recorded_shape_by_name(&mut self, layer: &Layer, port: &str) -> Result<()> {
        let recorded = layer.output_port(port).ok_or_else(|| {
            ReshapeError::NotFound(format!(
                "layer '{}' has no output port '{port}'",
                self.layer_name
            ))
        })?;
        self.set_shape_by_name(recorded.shape.clone(), port);
        Ok(())
    }

    /// Stages output shapes for this layer given the shapes of its
    /// predecessor ports, gathered by the reshaper in topological order.
    pub fn reshape(&mut self, inputs: &[Shape], layer: &Layer) -> Result<()> {
        match &self.kind {
            LauncherKind::General(implementation) => {
                let outputs = implementation
                    .infer(inputs, &layer.params, &layer.blobs)
                    .map_err(|e| e.in_layer(&layer.name))?;
                if outputs.len() != layer.output_ports.len() {
                    return Err(ReshapeError::ShapeMismatch {
                        layer: layer.name.clone(),
                        expected: layer.output_ports.len(),
                        actual: outputs.len(),
                    });
                }
                for (port, shape) in layer.output_ports.iter().zip(outputs) {
                    self.staged.insert(port.name.clone(), shape);
                }
                Ok(())
            }
            LauncherKind::Input => Ok(()),
            LauncherKind::Const(fixed) => {
                for (port, shape) in fixed {
                    self.staged.insert(port.clone(), shape.clone());
                }
                Ok(())
            }
            LauncherKind::OutMemory => {
                // Prefer an externally seeded shape; fall back to the shape
                // recorded on the layer otherwise.
                for port in &layer.output_ports {
                    let shape = self
                        .seeds
                        .get(&port.name)
                        .cloned()
                        .unwrap_or_else(|| port.shape.clone());
                    self.staged.insert(port.name.clone(), shape);
                }
                Ok(())
            }
            LauncherKind::Fake => {
                let recorded: Vec<Shape> =
                    layer.input_ports.iter().map(|p| p.shape.clone()).collect();
                if inputs != recorded.as_slice() {
                    return Err(ReshapeError::UnsupportedType {
                        layer: layer.name.clone(),
                        type_name: layer.type_name.clone(),
                    });
                }
                for port in &layer.output_ports {
                    self.staged.insert(port.name.clone(), port.shape.clone());
                }
                Ok(())
            }
        }
    }

    /// Commits staged shapes onto the live layer's output ports. Must only
    /// run after the reshape pass succeeded for every layer.
    pub fn apply_changes(&self, layer: &mut Layer) {
        if matches!(self.kind, LauncherKind::Fake) {
            return;
        }
        for port in &mut layer.output_ports {
            if let Some(shape) = self.staged.get(&port.name) {
                port.shape = shape.clone();
            }
        }
    }
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("layer", &self.layer_name)
            .field("type", &self.layer_type)
            .field("kind", &self.kind.name())
            .finish()
    }
}

fn memory_index_set(layer: &Layer) -> bool {
    layer.param_as_int("index").unwrap_or(0) != 0
}

/// Classifies a layer and builds the matching launcher variant.
///
/// Input-positioned layers must be of type Input, Const, or Memory with the
/// `index` parameter set; those same types are rejected anywhere else in
/// the network. Other interior layers get a general launcher when an
/// implementation is registered for their type and a fake one otherwise.
pub fn create_launcher(
    node: NodeIndex,
    layer: &Layer,
    is_input: bool,
    registry: &ShapeInferRegistry,
) -> Result<Launcher> {
    if is_input {
        if layer.is_type("memory") && memory_index_set(layer) {
            return Ok(Launcher::new(node, layer, LauncherKind::Input));
        }
        if layer.is_type("const") {
            let fixed = layer
                .output_ports
                .iter()
                .map(|p| (p.name.clone(), p.shape.clone()))
                .collect();
            return Ok(Launcher::new(node, layer, LauncherKind::Const(fixed)));
        }
        if layer.is_type("input") {
            return Ok(Launcher::new(node, layer, LauncherKind::Input));
        }
        return Err(ReshapeError::StructuralPlacement {
            layer: layer.name.clone(),
            type_name: layer.type_name.clone(),
            position: "an input",
        });
    }

    if (layer.is_type("memory") && memory_index_set(layer))
        || layer.is_type("const")
        || layer.is_type("input")
    {
        return Err(ReshapeError::StructuralPlacement {
            layer: layer.name.clone(),
            type_name: layer.type_name.clone(),
            position: "an intermediate",
        });
    }

    match registry.resolve(&layer.type_name) {
        Some(_) if layer.is_type("memory") => {
            Ok(Launcher::new(node, layer, LauncherKind::OutMemory))
        }
        Some(implementation) => Ok(Launcher::new(
            node,
            layer,
            LauncherKind::General(implementation),
        )),
        None => Ok(Launcher::new(node, layer, LauncherKind::Fake)),
    }
}

/// Rebinds a launcher to a newly registered implementation, preserving the
/// layer identity. Used when a late extension upgrades fake launchers.
pub fn rebind_launcher(launcher: &Launcher, implementation: Arc<dyn ShapeInferImpl>) -> Launcher {
    Launcher {
        node: launcher.node,
        layer_name: launcher.layer_name.clone(),
        layer_type: launcher.layer_type.clone(),
        kind: LauncherKind::General(implementation),
        staged: HashMap::new(),
        seeds: HashMap::new(),
    }
}
