use crate::builtin::BuiltInExtension;
use crate::error::{ReshapeError, Result};
use crate::launcher::{Launcher, create_launcher, rebind_launcher};
use crate::model::{Network, Shape};
use crate::registry::{ShapeInferExtension, ShapeInferRegistry};
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// One launcher per layer; staged shapes live in the launchers.
    Launchers,
    /// No launchers; propagation runs over a shape overlay of the network.
    Snapshot,
}

/// Drives one shape propagation pass over the whole network.
///
/// Both operating modes stage every new shape away from the live graph and
/// commit only after the full pass succeeded, so a mid-pass failure leaves
/// the network exactly as it was. The topological order is computed once at
/// construction and reused for the reshape and commit passes of every run.
///
/// Not synchronized: callers sharing a reshaper across threads must
/// serialize access.
pub struct Reshaper {
    network: Network,
    mode: Mode,
    registry: ShapeInferRegistry,
    launchers: Vec<Launcher>,
    launcher_index: HashMap<String, usize>,
    sorted: Vec<NodeIndex>,
    inputs: Vec<NodeIndex>,
}

impl Reshaper {
    /// Launcher-based mode. Fails with a configuration error when the
    /// network has no layers or no discoverable input layers, or when a
    /// reserved layer type sits in an invalid position.
    pub fn new(network: Network) -> Result<Self> {
        let mut registry = ShapeInferRegistry::new();
        registry.register(Arc::new(BuiltInExtension))?;

        let sorted = network.toposort()?;
        let inputs = network.input_layers();
        if sorted.is_empty() || inputs.is_empty() {
            return Err(ReshapeError::Configuration(
                "failed to collect inputs and layers".to_string(),
            ));
        }

        let mut launchers = Vec::with_capacity(sorted.len());
        let mut launcher_index = HashMap::new();
        for &idx in &sorted {
            let layer = network.layer(idx);
            let is_input = inputs.contains(&idx);
            let launcher = create_launcher(idx, layer, is_input, &registry)?;
            launcher_index.insert(layer.name.clone(), launchers.len());
            launchers.push(launcher);
        }

        Ok(Self {
            network,
            mode: Mode::Launchers,
            registry,
            launchers,
            launcher_index,
            sorted,
            inputs,
        })
    }

    /// Snapshot mode: propagation works on a copy-on-write shape overlay
    /// and merges into the live network only on full success. Every layer
    /// type must resolve through the registry; there is no fake fallback.
    pub fn on_network(network: Network) -> Result<Self> {
        let mut registry = ShapeInferRegistry::new();
        registry.register(Arc::new(BuiltInExtension))?;
        let sorted = network.toposort()?;
        let inputs = network.input_layers();
        Ok(Self {
            network,
            mode: Mode::Snapshot,
            registry,
            launchers: Vec::new(),
            launcher_index: HashMap::new(),
            sorted,
            inputs,
        })
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn into_network(self) -> Network {
        self.network
    }

    /// Registers an extension. In launcher mode, every existing launcher
    /// whose layer type is covered by the new extension is rebuilt around
    /// the new implementation, upgrading previously fake launchers without
    /// touching the rest of the set.
    pub fn add_extension(&mut self, extension: Arc<dyn ShapeInferExtension>) -> Result<()> {
        // An extension claiming a type it cannot back must not commit any
        // type names, or the registry would block a corrected registration.
        for type_name in extension.supported_types() {
            if extension.implementation(&type_name).is_none() {
                return Err(ReshapeError::NotFound(format!(
                    "extension claims type '{type_name}' but returned no implementation for it"
                )));
            }
        }

        let added = self.registry.register(extension.clone())?;
        if self.mode == Mode::Snapshot {
            return Ok(());
        }

        // Collect the full replacement list before swapping anything in.
        let mut replacements = Vec::new();
        for (slot, launcher) in self.launchers.iter().enumerate() {
            if !added.contains(&launcher.layer_type().to_ascii_lowercase()) {
                continue;
            }
            let implementation = extension.implementation(launcher.layer_type()).ok_or_else(|| {
                ReshapeError::NotFound(format!(
                    "extension claims type '{}' but returned no implementation for it",
                    launcher.layer_type()
                ))
            })?;
            replacements.push((slot, rebind_launcher(launcher, implementation)));
        }
        for (slot, launcher) in replacements {
            self.launchers[slot] = launcher;
        }
        Ok(())
    }

    /// Introspection hook: the launcher driving a named layer.
    pub fn launcher_by_layer_name(&self, name: &str) -> Result<&Launcher> {
        self.launcher_slot(name).map(|slot| &self.launchers[slot])
    }

    /// Mutable access, e.g. for seeding the read side of a memory cell
    /// between runs.
    pub fn launcher_by_layer_name_mut(&mut self, name: &str) -> Result<&mut Launcher> {
        let slot = self.launcher_slot(name)?;
        Ok(&mut self.launchers[slot])
    }

    fn launcher_slot(&self, name: &str) -> Result<usize> {
        self.launcher_index.get(name).copied().ok_or_else(|| {
            ReshapeError::NotFound(format!(
                "failed to reshape layer '{name}': can't find the corresponding launcher"
            ))
        })
    }

    /// Propagates shapes through the whole network.
    ///
    /// In launcher mode `overrides` is keyed by input *port* name; in
    /// snapshot mode by *layer* name. Ports without an override keep the
    /// shape recorded on the graph description.
    pub fn run(&mut self, overrides: &HashMap<String, Shape>) -> Result<()> {
        match self.mode {
            Mode::Launchers => self.run_launchers(overrides),
            Mode::Snapshot => self.run_snapshot(overrides),
        }
    }

    fn run_launchers(&mut self, overrides: &HashMap<String, Shape>) -> Result<()> {
        for launcher in &mut self.launchers {
            launcher.reset();
        }

        // Seed input layers: override by port name, else the recorded shape.
        let mut seeds = Vec::with_capacity(self.inputs.len());
        for &idx in &self.inputs {
            seeds.push((self.launcher_slot(&self.network.layer(idx).name)?, idx));
        }
        for (slot, idx) in seeds {
            let layer = &self.network.graph[idx];
            let launcher = &mut self.launchers[slot];
            for port in &layer.output_ports {
                match overrides.get(&port.name) {
                    Some(shape) => launcher.set_shape_by_name(shape.clone(), &port.name),
                    None => launcher.set_recorded_shape_by_name(layer, &port.name)?,
                }
            }
        }

        // Reshape pass. Nothing touches the live graph here; a failure on
        // any layer aborts with all committed shapes intact.
        for i in 0..self.sorted.len() {
            let idx = self.sorted[i];
            let slot = self.launcher_slot(&self.network.layer(idx).name)?;
            let inputs = self.gather_input_shapes(idx)?;
            let layer = &self.network.graph[idx];
            self.launchers[slot].reshape(&inputs, layer)?;
        }

        // Commit pass, in the same order: staged shapes onto output ports,
        // then across each edge into the downstream input port.
        for i in 0..self.sorted.len() {
            let idx = self.sorted[i];
            let slot = self.launcher_slot(&self.network.layer(idx).name)?;
            let launcher = &self.launchers[slot];
            launcher.apply_changes(&mut self.network.graph[idx]);

            let updates: Vec<(NodeIndex, String, Shape)> = self
                .network
                .graph
                .edges_directed(idx, Direction::Outgoing)
                .filter_map(|edge| {
                    launcher.staged_shape(&edge.weight().src_port).map(|shape| {
                        (edge.target(), edge.weight().dst_port.clone(), shape.clone())
                    })
                })
                .collect();
            for (dst, dst_port, shape) in updates {
                let layer = &mut self.network.graph[dst];
                if let Some(port) = layer.input_ports.iter_mut().find(|p| p.name == dst_port) {
                    port.shape = shape;
                }
            }
        }
        Ok(())
    }

    /// Looks up the staged shape of every predecessor port of a layer, in
    /// input-port order. Predecessors were already reshaped thanks to the
    /// topological order; a miss here is an internal consistency bug.
    fn gather_input_shapes(&self, idx: NodeIndex) -> Result<Vec<Shape>> {
        let layer = self.network.layer(idx);
        let mut shapes = Vec::with_capacity(layer.input_ports.len());
        for port in &layer.input_ports {
            let edge = self
                .network
                .graph
                .edges_directed(idx, Direction::Incoming)
                .find(|e| e.weight().dst_port == port.name)
                .ok_or_else(|| {
                    ReshapeError::NotFound(format!(
                        "no connection feeds input port '{}' of layer '{}'",
                        port.name, layer.name
                    ))
                })?;
            let src_layer = self.network.layer(edge.source());
            let src_launcher = self.launcher_by_layer_name(&src_layer.name)?;
            let shape = src_launcher
                .staged_shape(&edge.weight().src_port)
                .ok_or_else(|| {
                    ReshapeError::NotFound(format!(
                        "layer '{}' has no staged shape for output port '{}'",
                        src_layer.name,
                        edge.weight().src_port
                    ))
                })?;
            shapes.push(shape.clone());
        }
        Ok(shapes)
    }

    fn run_snapshot(&mut self, overrides: &HashMap<String, Shape>) -> Result<()> {
        // Shape overlay standing in for a deep copy of the network.
        let mut in_shapes: HashMap<NodeIndex, Vec<Shape>> = HashMap::new();
        let mut out_shapes: HashMap<NodeIndex, Vec<Shape>> = HashMap::new();
        for idx in self.network.graph.node_indices() {
            let layer = self.network.layer(idx);
            in_shapes.insert(idx, layer.input_ports.iter().map(|p| p.shape.clone()).collect());
            out_shapes.insert(idx, layer.output_ports.iter().map(|p| p.shape.clone()).collect());
        }

        // Seed overrides by layer name; constants keep their fixed shape.
        for (layer_name, shape) in overrides {
            let Ok(idx) = self.network.index_of(layer_name) else {
                continue;
            };
            let layer = self.network.layer(idx);
            if layer.is_type("const") {
                continue;
            }
            if layer.output_ports.len() != 1 {
                return Err(ReshapeError::ShapeMismatch {
                    layer: layer.name.clone(),
                    expected: 1,
                    actual: layer.output_ports.len(),
                });
            }
            if let Some(slots) = out_shapes.get_mut(&idx) {
                slots[0] = shape.clone();
            }
        }

        // Propagate through the overlay in topological order.
        for i in 0..self.sorted.len() {
            let idx = self.sorted[i];
            let layer = self.network.layer(idx);
            let implementation = self.registry.resolve(&layer.type_name).ok_or_else(|| {
                ReshapeError::NotFound(format!(
                    "no shape infer implementation was found for type '{}'",
                    layer.type_name
                ))
            })?;

            // Source layers have no input ports; they are fed their own
            // output shapes so pass-through implementations keep the seeds.
            let gathered = if layer.input_ports.is_empty() {
                out_shapes.get(&idx).cloned().unwrap_or_default()
            } else {
                in_shapes.get(&idx).cloned().unwrap_or_default()
            };

            let outputs = implementation
                .infer(&gathered, &layer.params, &layer.blobs)
                .map_err(|e| e.in_layer(&layer.name))?;
            if outputs.len() != layer.output_ports.len() {
                return Err(ReshapeError::ShapeMismatch {
                    layer: layer.name.clone(),
                    expected: layer.output_ports.len(),
                    actual: outputs.len(),
                });
            }

            for edge in self.network.graph.edges_directed(idx, Direction::Outgoing) {
                let src_pos = layer
                    .output_ports
                    .iter()
                    .position(|p| p.name == edge.weight().src_port);
                let dst_pos = self
                    .network
                    .layer(edge.target())
                    .input_ports
                    .iter()
                    .position(|p| p.name == edge.weight().dst_port);
                if let (Some(src_pos), Some(dst_pos)) = (src_pos, dst_pos)
                    && let Some(slots) = in_shapes.get_mut(&edge.target())
                {
                    slots[dst_pos] = outputs[src_pos].clone();
                }
            }
            out_shapes.insert(idx, outputs);
        }

        // Full walk succeeded: merge the overlay into the live network.
        let indices: Vec<NodeIndex> = self.network.graph.node_indices().collect();
        for idx in indices {
            let layer = &mut self.network.graph[idx];
            if let Some(slots) = in_shapes.get(&idx) {
                for (port, shape) in layer.input_ports.iter_mut().zip(slots) {
                    port.shape = shape.clone();
                }
            }
            if let Some(slots) = out_shapes.get(&idx) {
                for (port, shape) in layer.output_ports.iter_mut().zip(slots) {
                    port.shape = shape.clone();
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Reshaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reshaper")
            .field("mode", &self.mode)
            .field("layers", &self.sorted.len())
            .field("launchers", &self.launchers)
            .finish()
    }
}
