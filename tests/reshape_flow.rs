//! End-to-end shape propagation scenarios over small networks.

use shapeflow::{
    Layer, Network, ReshapeError, Reshaper, Result, Shape, ShapeInferExtension, ShapeInferImpl,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Input(data) -> Convolution(3x3, stride 1, pad 1, 64 filters) -> ReLU.
fn conv_network() -> Network {
    let mut network = Network::new();
    network.add_layer(Layer::new("in", "Input").with_output("data", vec![1, 3, 224, 224]));
    network.add_layer(
        Layer::new("conv1", "Convolution")
            .with_param("kernel", "3,3")
            .with_param("strides", "1,1")
            .with_param("pads_begin", "1,1")
            .with_param("pads_end", "1,1")
            .with_param("output", "64")
            .with_input("data", vec![1, 3, 224, 224])
            .with_output("out", vec![1, 64, 224, 224]),
    );
    network.add_layer(
        Layer::new("act", "ReLU")
            .with_input("data", vec![1, 64, 224, 224])
            .with_output("out", vec![1, 64, 224, 224]),
    );
    network.connect("in", "data", "conv1", "data").unwrap();
    network.connect("conv1", "out", "act", "data").unwrap();
    network
}

fn shape_of(network: &Network, layer: &str, port: &str) -> Shape {
    network
        .layer_by_name(layer)
        .unwrap()
        .output_port(port)
        .unwrap()
        .shape
        .clone()
}

#[test]
fn propagates_recorded_shapes_without_overrides() {
    let mut reshaper = Reshaper::new(conv_network()).unwrap();
    reshaper.run(&HashMap::new()).unwrap();

    let network = reshaper.network();
    assert_eq!(shape_of(network, "conv1", "out"), vec![1, 64, 224, 224]);
    assert_eq!(shape_of(network, "act", "out"), vec![1, 64, 224, 224]);
}

#[test]
fn propagates_overridden_batch_dimension() {
    let mut reshaper = Reshaper::new(conv_network()).unwrap();
    let overrides = HashMap::from([("data".to_string(), vec![2, 3, 224, 224])]);
    reshaper.run(&overrides).unwrap();

    let network = reshaper.network();
    assert_eq!(shape_of(network, "in", "data"), vec![2, 3, 224, 224]);
    assert_eq!(shape_of(network, "conv1", "out"), vec![2, 64, 224, 224]);
    assert_eq!(shape_of(network, "act", "out"), vec![2, 64, 224, 224]);
}

#[test]
fn run_is_idempotent() {
    let mut reshaper = Reshaper::new(conv_network()).unwrap();
    let overrides = HashMap::from([("data".to_string(), vec![4, 3, 224, 224])]);

    reshaper.run(&overrides).unwrap();
    let first = shape_of(reshaper.network(), "act", "out");
    reshaper.run(&overrides).unwrap();
    let second = shape_of(reshaper.network(), "act", "out");

    assert_eq!(first, second);
    assert_eq!(first, vec![4, 64, 224, 224]);
}

#[test]
fn edge_shapes_agree_after_run() {
    let mut reshaper = Reshaper::new(conv_network()).unwrap();
    let overrides = HashMap::from([("data".to_string(), vec![2, 3, 224, 224])]);
    reshaper.run(&overrides).unwrap();

    let network = reshaper.network();
    use petgraph::visit::EdgeRef;
    for edge in network.graph.edge_references() {
        let src = network.layer(edge.source());
        let dst = network.layer(edge.target());
        let src_shape = &src.output_port(&edge.weight().src_port).unwrap().shape;
        let dst_shape = &dst.input_port(&edge.weight().dst_port).unwrap().shape;
        assert_eq!(src_shape, dst_shape, "{} -> {}", src.name, dst.name);
    }
}

#[test]
fn failed_run_leaves_shapes_untouched() {
    // An unsupported interior type gets a fake launcher, which only fails
    // once a changed shape actually reaches it.
    let mut network = Network::new();
    network.add_layer(Layer::new("in", "Input").with_output("data", vec![1, 3, 224, 224]));
    network.add_layer(
        Layer::new("mystery", "CustomRoiOp")
            .with_input("data", vec![1, 3, 224, 224])
            .with_output("out", vec![1, 3, 224, 224]),
    );
    network.add_layer(
        Layer::new("act", "ReLU")
            .with_input("data", vec![1, 3, 224, 224])
            .with_output("out", vec![1, 3, 224, 224]),
    );
    network.connect("in", "data", "mystery", "data").unwrap();
    network.connect("mystery", "out", "act", "data").unwrap();

    let mut reshaper = Reshaper::new(network).unwrap();
    let overrides = HashMap::from([("data".to_string(), vec![2, 3, 224, 224])]);
    let err = reshaper.run(&overrides).unwrap_err();
    assert!(matches!(err, ReshapeError::UnsupportedType { .. }));

    // Nothing was committed anywhere, the seeded input included.
    let network = reshaper.network();
    assert_eq!(shape_of(network, "in", "data"), vec![1, 3, 224, 224]);
    assert_eq!(shape_of(network, "mystery", "out"), vec![1, 3, 224, 224]);
    assert_eq!(shape_of(network, "act", "out"), vec![1, 3, 224, 224]);
}

struct HalvingImpl;

impl ShapeInferImpl for HalvingImpl {
    fn infer(
        &self,
        inputs: &[Shape],
        _params: &HashMap<String, String>,
        _blobs: &HashMap<String, Vec<f32>>,
    ) -> Result<Vec<Shape>> {
        let data = &inputs[0];
        let mut out = data.clone();
        for dim in out.iter_mut().skip(2) {
            *dim /= 2;
        }
        Ok(vec![out])
    }
}

struct CustomRoiExtension;

impl ShapeInferExtension for CustomRoiExtension {
    fn supported_types(&self) -> Vec<String> {
        vec!["CustomRoiOp".to_string()]
    }

    fn implementation(&self, type_name: &str) -> Option<Arc<dyn ShapeInferImpl>> {
        type_name
            .eq_ignore_ascii_case("CustomRoiOp")
            .then(|| Arc::new(HalvingImpl) as Arc<dyn ShapeInferImpl>)
    }
}

#[test]
fn late_extension_upgrades_fake_launcher() {
    let mut network = Network::new();
    network.add_layer(Layer::new("in", "Input").with_output("data", vec![1, 8, 64, 64]));
    network.add_layer(
        Layer::new("roi", "CustomRoiOp")
            .with_input("data", vec![1, 8, 64, 64])
            .with_output("out", vec![1, 8, 64, 64]),
    );
    network.connect("in", "data", "roi", "data").unwrap();

    let mut reshaper = Reshaper::new(network).unwrap();

    // Unsupported for now: a changed input shape cannot be propagated.
    let overrides = HashMap::from([("data".to_string(), vec![2, 8, 64, 64])]);
    assert!(matches!(
        reshaper.run(&overrides),
        Err(ReshapeError::UnsupportedType { .. })
    ));

    reshaper.add_extension(Arc::new(CustomRoiExtension)).unwrap();
    reshaper.run(&overrides).unwrap();
    assert_eq!(
        shape_of(reshaper.network(), "roi", "out"),
        vec![2, 8, 32, 32]
    );
}

#[test]
fn registering_colliding_extension_fails() {
    let mut reshaper = Reshaper::new(conv_network()).unwrap();
    reshaper.add_extension(Arc::new(CustomRoiExtension)).unwrap();
    let err = reshaper
        .add_extension(Arc::new(CustomRoiExtension))
        .unwrap_err();
    assert_eq!(
        err,
        ReshapeError::DuplicateRegistration {
            types: vec!["CustomRoiOp".to_string()]
        }
    );
}

#[test]
fn const_as_interior_layer_is_rejected() {
    let mut network = Network::new();
    network.add_layer(Layer::new("in", "Input").with_output("data", vec![4]));
    network.add_layer(
        Layer::new("frozen", "Const")
            .with_input("data", vec![4])
            .with_output("out", vec![4]),
    );
    network.connect("in", "data", "frozen", "data").unwrap();

    let err = Reshaper::new(network).unwrap_err();
    assert!(matches!(err, ReshapeError::StructuralPlacement { .. }));
}

#[test]
fn empty_network_is_rejected() {
    let err = Reshaper::new(Network::new()).unwrap_err();
    assert!(matches!(err, ReshapeError::Configuration(_)));
}

#[test]
fn memory_read_layer_keeps_seeded_shape() {
    let mut network = Network::new();
    network.add_layer(Layer::new("in", "Input").with_output("data", vec![1, 16]));
    network.add_layer(
        Layer::new("state", "Memory")
            .with_param("index", "0")
            .with_input("data", vec![1, 16])
            .with_output("out", vec![1, 32]),
    );
    network.connect("in", "data", "state", "data").unwrap();

    let mut reshaper = Reshaper::new(network).unwrap();
    reshaper.run(&HashMap::new()).unwrap();

    // No override, no inference: the recorded shape survives as-is.
    assert_eq!(shape_of(reshaper.network(), "state", "out"), vec![1, 32]);
}

#[test]
fn memory_read_layer_uses_externally_seeded_shape() {
    let mut network = Network::new();
    network.add_layer(Layer::new("in", "Input").with_output("data", vec![1, 16]));
    network.add_layer(
        Layer::new("state", "Memory")
            .with_param("index", "0")
            .with_input("data", vec![1, 16])
            .with_output("out", vec![1, 32]),
    );
    network.connect("in", "data", "state", "data").unwrap();

    let mut reshaper = Reshaper::new(network).unwrap();
    reshaper
        .launcher_by_layer_name_mut("state")
        .unwrap()
        .set_shape_by_name(vec![1, 64], "out");
    reshaper.run(&HashMap::new()).unwrap();

    // The seed planted before the run wins over the recorded shape.
    assert_eq!(shape_of(reshaper.network(), "state", "out"), vec![1, 64]);
}

struct ClaimsWithoutImpl;

impl ShapeInferExtension for ClaimsWithoutImpl {
    fn supported_types(&self) -> Vec<String> {
        vec!["Phantom".to_string()]
    }

    fn implementation(&self, _type_name: &str) -> Option<Arc<dyn ShapeInferImpl>> {
        None
    }
}

struct PhantomExtension;

impl ShapeInferExtension for PhantomExtension {
    fn supported_types(&self) -> Vec<String> {
        vec!["Phantom".to_string()]
    }

    fn implementation(&self, type_name: &str) -> Option<Arc<dyn ShapeInferImpl>> {
        type_name
            .eq_ignore_ascii_case("Phantom")
            .then(|| Arc::new(HalvingImpl) as Arc<dyn ShapeInferImpl>)
    }
}

#[test]
fn extension_without_implementations_leaves_registry_clean() {
    let mut reshaper = Reshaper::new(conv_network()).unwrap();
    let err = reshaper.add_extension(Arc::new(ClaimsWithoutImpl)).unwrap_err();
    assert!(matches!(err, ReshapeError::NotFound(_)));

    // Nothing was committed: a working extension for the same type still
    // registers without a collision.
    reshaper.add_extension(Arc::new(PhantomExtension)).unwrap();
}

#[test]
fn const_layer_ignores_overrides() {
    let mut network = Network::new();
    network.add_layer(Layer::new("weights", "Const").with_output("w", vec![64, 3, 3, 3]));
    network.add_layer(
        Layer::new("act", "ReLU")
            .with_input("data", vec![64, 3, 3, 3])
            .with_output("out", vec![64, 3, 3, 3]),
    );
    network.connect("weights", "w", "act", "data").unwrap();

    let mut reshaper = Reshaper::new(network).unwrap();
    let overrides = HashMap::from([("w".to_string(), vec![1, 1])]);
    reshaper.run(&overrides).unwrap();
    assert_eq!(
        shape_of(reshaper.network(), "weights", "w"),
        vec![64, 3, 3, 3]
    );
}

mod snapshot {
    use super::*;

    #[test]
    fn propagates_shapes_keyed_by_layer_name() {
        let mut reshaper = Reshaper::on_network(conv_network()).unwrap();
        let overrides = HashMap::from([("in".to_string(), vec![2, 3, 224, 224])]);
        reshaper.run(&overrides).unwrap();

        let network = reshaper.network();
        assert_eq!(shape_of(network, "conv1", "out"), vec![2, 64, 224, 224]);
        assert_eq!(
            network
                .layer_by_name("act")
                .unwrap()
                .input_port("data")
                .unwrap()
                .shape,
            vec![2, 64, 224, 224]
        );
    }

    #[test]
    fn unknown_type_fails_with_not_found() {
        let mut network = Network::new();
        network.add_layer(Layer::new("in", "Input").with_output("data", vec![1, 4]));
        network.add_layer(
            Layer::new("mystery", "CustomRoiOp")
                .with_input("data", vec![1, 4])
                .with_output("out", vec![1, 4]),
        );
        network.connect("in", "data", "mystery", "data").unwrap();

        let mut reshaper = Reshaper::on_network(network).unwrap();
        let err = reshaper.run(&HashMap::new()).unwrap_err();
        assert!(matches!(err, ReshapeError::NotFound(_)));
    }

    #[test]
    fn failure_leaves_live_network_untouched() {
        let mut network = Network::new();
        network.add_layer(Layer::new("in", "Input").with_output("data", vec![1, 3, 8, 8]));
        network.add_layer(
            Layer::new("conv1", "Convolution")
                .with_param("kernel", "16,16")
                .with_param("output", "8")
                .with_input("data", vec![1, 3, 8, 8])
                .with_output("out", vec![1, 8, 1, 1]),
        );
        network.connect("in", "data", "conv1", "data").unwrap();

        // A 16x16 kernel does not fit an 8x8 input.
        let mut reshaper = Reshaper::on_network(network).unwrap();
        let err = reshaper.run(&HashMap::new()).unwrap_err();
        assert!(matches!(err, ReshapeError::Implementation(_)));
        assert_eq!(shape_of(reshaper.network(), "conv1", "out"), vec![1, 8, 1, 1]);
    }

    #[test]
    fn seeding_multi_output_layer_is_rejected() {
        let mut network = Network::new();
        network.add_layer(
            Layer::new("in", "Input")
                .with_output("a", vec![1, 4])
                .with_output("b", vec![1, 4]),
        );

        let mut reshaper = Reshaper::on_network(network).unwrap();
        let overrides = HashMap::from([("in".to_string(), vec![2, 4])]);
        let err = reshaper.run(&overrides).unwrap_err();
        assert!(matches!(err, ReshapeError::ShapeMismatch { .. }));
    }
}
