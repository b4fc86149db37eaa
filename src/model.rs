use crate::error::{ReshapeError, Result};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tensor dimensions, outermost first. Rank is the vector length.
pub type Shape = Vec<usize>;

/// A connection point on a layer. Shapes are mutated by shape propagation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Port {
    pub name: String,
    #[serde(default)]
    pub shape: Shape,
}

/// A single node of the computation graph.
///
/// Parameters are kept as opaque strings and interpreted by the shape infer
/// implementation registered for the layer type. Constant data blobs travel
/// alongside them for implementations that need stored values (e.g. weights).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub blobs: HashMap<String, Vec<f32>>,
    #[serde(default)]
    pub input_ports: Vec<Port>,
    #[serde(default)]
    pub output_ports: Vec<Port>,
}

impl Layer {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            params: HashMap::new(),
            blobs: HashMap::new(),
            input_ports: Vec::new(),
            output_ports: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_blob(mut self, name: &str, values: Vec<f32>) -> Self {
        self.blobs.insert(name.to_string(), values);
        self
    }

    pub fn with_input(mut self, port: &str, shape: Shape) -> Self {
        self.input_ports.push(Port { name: port.to_string(), shape });
        self
    }

    pub fn with_output(mut self, port: &str, shape: Shape) -> Self {
        self.output_ports.push(Port { name: port.to_string(), shape });
        self
    }

    /// Layer types are compared case-insensitively everywhere.
    pub fn is_type(&self, type_name: &str) -> bool {
        self.type_name.eq_ignore_ascii_case(type_name)
    }

    pub fn param_as_int(&self, key: &str) -> Option<i64> {
        self.params.get(key)?.trim().parse().ok()
    }

    pub fn input_port(&self, name: &str) -> Option<&Port> {
        self.input_ports.iter().find(|p| p.name == name)
    }

    pub fn output_port(&self, name: &str) -> Option<&Port> {
        self.output_ports.iter().find(|p| p.name == name)
    }
}

/// Edge weight: names the producing output port and the consuming input port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub src_port: String,
    pub dst_port: String,
}

/// JSON description of a network: a list of layers plus "layer.port" links.
#[derive(Debug, Serialize, Deserialize)]
pub struct GraphDef {
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub links: Vec<LinkDef>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkDef(pub (String, String));

/// The computation graph: layers as nodes, port-to-port edges as weights.
///
/// Layer names are unique within the graph; `node_map` resolves them to
/// petgraph indices.
#[derive(Debug, Clone, Default)]
pub struct Network {
    pub graph: DiGraph<Layer, Connection>,
    node_map: HashMap<String, NodeIndex>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let def: GraphDef = serde_json::from_str(json)?;
        let mut network = Network::new();
        for layer in def.layers {
            network.add_layer(layer);
        }
        for LinkDef((from, to)) in def.links {
            let (src, src_port) = from
                .split_once('.')
                .ok_or_else(|| anyhow::anyhow!("Invalid source port address: {}", from))?;
            let (dst, dst_port) = to
                .split_once('.')
                .ok_or_else(|| anyhow::anyhow!("Invalid destination port address: {}", to))?;
            network.connect(src, src_port, dst, dst_port)?;
        }
        Ok(network)
    }

    pub fn add_layer(&mut self, layer: Layer) -> NodeIndex {
        let name = layer.name.clone();
        let idx = self.graph.add_node(layer);
        self.node_map.insert(name, idx);
        idx
    }

    pub fn connect(
        &mut self,
        src: &str,
        src_port: &str,
        dst: &str,
        dst_port: &str,
    ) -> Result<()> {
        let src_idx = self.index_of(src)?;
        let dst_idx = self.index_of(dst)?;
        if self.graph[src_idx].output_port(src_port).is_none() {
            return Err(ReshapeError::NotFound(format!(
                "layer '{src}' has no output port '{src_port}'"
            )));
        }
        if self.graph[dst_idx].input_port(dst_port).is_none() {
            return Err(ReshapeError::NotFound(format!(
                "layer '{dst}' has no input port '{dst_port}'"
            )));
        }
        self.graph.add_edge(
            src_idx,
            dst_idx,
            Connection {
                src_port: src_port.to_string(),
                dst_port: dst_port.to_string(),
            },
        );
        Ok(())
    }

    pub fn index_of(&self, name: &str) -> Result<NodeIndex> {
        self.node_map
            .get(name)
            .copied()
            .ok_or_else(|| ReshapeError::NotFound(format!("layer '{name}' not found in network")))
    }

    pub fn layer(&self, idx: NodeIndex) -> &Layer {
        &self.graph[idx]
    }

    pub fn layer_by_name(&self, name: &str) -> Option<&Layer> {
        self.node_map.get(name).map(|&idx| &self.graph[idx])
    }

    /// Layers with no incoming connections: declared inputs, constants and
    /// the write side of memory cells.
    pub fn input_layers(&self) -> Vec<NodeIndex> {
        self.graph.externals(Direction::Incoming).collect()
    }

    /// Dependency order for propagation. The order is computed here once and
    /// cached by the reshaper for both the reshape and the commit pass.
    pub fn toposort(&self) -> Result<Vec<NodeIndex>> {
        toposort(&self.graph, None).map_err(|cycle| {
            ReshapeError::Configuration(format!(
                "cycle detected in network at layer '{}'",
                self.graph[cycle.node_id()].name
            ))
        })
    }
}
