use crate::error::{ReshapeError, Result};
use crate::model::Shape;
use std::collections::HashMap;
use std::sync::Arc;

/// A pluggable shape formula for one layer type.
///
/// Given the shapes flowing into a layer plus the layer's string parameters
/// and constant data blobs, returns one shape per output port. A failure
/// should be reported as [`ReshapeError::Implementation`] with a message
/// naming what went wrong; the reshaper adds the layer name.
pub trait ShapeInferImpl {
    fn infer(
        &self,
        inputs: &[Shape],
        params: &HashMap<String, String>,
        blobs: &HashMap<String, Vec<f32>>,
    ) -> Result<Vec<Shape>>;
}

/// An external source of shape infer implementations keyed by layer type.
pub trait ShapeInferExtension {
    /// Every layer type this extension can infer shapes for.
    fn supported_types(&self) -> Vec<String>;

    /// The implementation for one of the supported types, or `None` if the
    /// extension does not recognize it.
    fn implementation(&self, type_name: &str) -> Option<Arc<dyn ShapeInferImpl>>;
}

/// Maps layer types to shape infer implementations across all registered
/// extensions. Lookups are case-insensitive; type names must be unique
/// across extensions.
#[derive(Default)]
pub struct ShapeInferRegistry {
    extensions: Vec<Arc<dyn ShapeInferExtension>>,
    types: HashMap<String, usize>,
}

impl ShapeInferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an extension and returns the lower-cased type names it
    /// contributed. If any of its types is already registered, nothing is
    /// added and the error lists every colliding name.
    pub fn register(&mut self, extension: Arc<dyn ShapeInferExtension>) -> Result<Vec<String>> {
        let mut added = Vec::new();
        let mut duplicates = Vec::new();
        for type_name in extension.supported_types() {
            let key = type_name.to_ascii_lowercase();
            if self.types.contains_key(&key) || added.contains(&key) {
                duplicates.push(type_name);
            } else {
                added.push(key);
            }
        }
        if !duplicates.is_empty() {
            return Err(ReshapeError::DuplicateRegistration { types: duplicates });
        }

        let slot = self.extensions.len();
        for key in &added {
            self.types.insert(key.clone(), slot);
        }
        self.extensions.push(extension);
        Ok(added)
    }

    pub fn resolve(&self, type_name: &str) -> Option<Arc<dyn ShapeInferImpl>> {
        let slot = *self.types.get(&type_name.to_ascii_lowercase())?;
        self.extensions[slot].implementation(type_name)
    }
}
