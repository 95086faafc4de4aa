//! Process-wide layer registry.
//!
//! Layer implementations register a constructor per type name before
//! the first network is built. Lookups are case-insensitive.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::net::layer::Layer;
use crate::params::LayerParams;
use crate::{ErrorKind, Result};

pub type LayerConstructor = fn(&LayerParams) -> Result<Box<dyn Layer>>;

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<String, LayerConstructor>> = Mutex::new(HashMap::new());
}

fn registry() -> Result<::std::sync::MutexGuard<'static, HashMap<String, LayerConstructor>>> {
    REGISTRY
        .lock()
        .map_err(|_| ErrorKind::Internal("layer registry mutex poisoned".to_string()).into())
}

/// Register a constructor for a layer type. Re-registering the same
/// constructor is a no-op; a different one for the same type fails.
pub fn register(layer_type: &str, constructor: LayerConstructor) -> Result<()> {
    let mut registry = registry()?;
    let key = layer_type.to_lowercase();
    if let Some(existing) = registry.get(&key) {
        if *existing != constructor {
            bail!(ErrorKind::Duplicate(format!("layer type \"{}\" already registered", key)));
        }
        return Ok(());
    }
    registry.insert(key, constructor);
    Ok(())
}

pub fn unregister(layer_type: &str) -> Result<()> {
    registry()?.remove(&layer_type.to_lowercase());
    Ok(())
}

/// Instantiate a layer, or `None` for an unknown type.
pub fn create(layer_type: &str, params: &LayerParams) -> Result<Option<Box<dyn Layer>>> {
    let constructor = registry()?.get(&layer_type.to_lowercase()).cloned();
    match constructor {
        Some(constructor) => constructor(params).map(Some),
        None => Ok(None),
    }
}
