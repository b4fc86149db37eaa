use thiserror::Error;

/// Errors produced while building a [`crate::reshaper::Reshaper`] or running
/// a shape propagation pass. Any error surfaced from a run leaves the live
/// network with its pre-run shapes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReshapeError {
    #[error("unsupported model for shape inference: {0}")]
    Configuration(String),

    #[error("failed to add extension with already registered types: {}", .types.join(", "))]
    DuplicateRegistration { types: Vec<String> },

    #[error("layer '{layer}' of type '{type_name}' cannot appear as {position} layer in the network")]
    StructuralPlacement {
        layer: String,
        type_name: String,
        position: &'static str,
    },

    #[error("no shape infer implementation found for layer '{layer}' of type '{type_name}'")]
    UnsupportedType { layer: String, type_name: String },

    #[error("layer '{layer}': expected {expected} output shape(s), got {actual}")]
    ShapeMismatch {
        layer: String,
        expected: usize,
        actual: usize,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("shape inference failed: {0}")]
    Implementation(String),
}

impl ReshapeError {
    /// Prefixes an implementation failure with the layer it occurred in.
    /// All other variants already carry their own context.
    pub(crate) fn in_layer(self, layer: &str) -> Self {
        match self {
            ReshapeError::Implementation(msg) => {
                ReshapeError::Implementation(format!("layer '{layer}': {msg}"))
            }
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReshapeError>;
