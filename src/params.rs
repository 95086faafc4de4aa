//! Untyped layer parameters, as produced by the importers.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use crate::tensor::Blob;
use crate::{ErrorKind, Result};

/// A scalar, string or numeric array parameter value.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Real(f64),
    Bool(bool),
    Str(String),
    IntArray(Vec<i64>),
    RealArray(Vec<f64>),
}

impl ParamValue {
    pub fn as_int(&self) -> Result<i64> {
        match self {
            ParamValue::Int(v) => Ok(*v),
            ParamValue::Real(v) => Ok(v.round() as i64),
            ParamValue::Bool(v) => Ok(*v as i64),
            ParamValue::IntArray(v) if v.len() == 1 => Ok(v[0]),
            ParamValue::RealArray(v) if v.len() == 1 => Ok(v[0].round() as i64),
            other => bail!(ErrorKind::TypeMismatch(format!("{:?} is not an integer", other))),
        }
    }

    pub fn as_real(&self) -> Result<f64> {
        match self {
            ParamValue::Int(v) => Ok(*v as f64),
            ParamValue::Real(v) => Ok(*v),
            ParamValue::IntArray(v) if v.len() == 1 => Ok(v[0] as f64),
            ParamValue::RealArray(v) if v.len() == 1 => Ok(v[0]),
            other => bail!(ErrorKind::TypeMismatch(format!("{:?} is not a real", other))),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            ParamValue::Bool(v) => Ok(*v),
            ParamValue::Int(v) => Ok(*v != 0),
            other => bail!(ErrorKind::TypeMismatch(format!("{:?} is not a boolean", other))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            ParamValue::Str(s) => Ok(s),
            other => bail!(ErrorKind::TypeMismatch(format!("{:?} is not a string", other))),
        }
    }

    pub fn as_ints(&self) -> Result<Vec<i64>> {
        match self {
            ParamValue::Int(v) => Ok(vec![*v]),
            ParamValue::Real(v) => Ok(vec![v.round() as i64]),
            ParamValue::IntArray(v) => Ok(v.clone()),
            ParamValue::RealArray(v) => Ok(v.iter().map(|x| x.round() as i64).collect()),
            other => bail!(ErrorKind::TypeMismatch(format!("{:?} is not an integer array", other))),
        }
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> ParamValue {
        ParamValue::Int(v as i64)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> ParamValue {
        ParamValue::Int(v)
    }
}

impl From<usize> for ParamValue {
    fn from(v: usize) -> ParamValue {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> ParamValue {
        ParamValue::Real(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> ParamValue {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> ParamValue {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> ParamValue {
        ParamValue::Str(v)
    }
}

impl From<Vec<i64>> for ParamValue {
    fn from(v: Vec<i64>) -> ParamValue {
        ParamValue::IntArray(v)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(v: Vec<f64>) -> ParamValue {
        ParamValue::RealArray(v)
    }
}

/// An ordered name to value map with typed accessors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dict {
    values: BTreeMap<String, ParamValue>,
}

impl Dict {
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn get_opt(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn get(&self, name: &str) -> Result<&ParamValue> {
        self.values
            .get(name)
            .ok_or_else(|| ErrorKind::NotFound(format!("required parameter \"{}\"", name)).into())
    }

    pub fn get_int(&self, name: &str) -> Result<i64> {
        self.get(name)?.as_int()
    }

    pub fn get_int_or(&self, name: &str, default: i64) -> Result<i64> {
        self.get_opt(name).map(|v| v.as_int()).unwrap_or(Ok(default))
    }

    pub fn get_real(&self, name: &str) -> Result<f64> {
        self.get(name)?.as_real()
    }

    pub fn get_real_or(&self, name: &str, default: f64) -> Result<f64> {
        self.get_opt(name).map(|v| v.as_real()).unwrap_or(Ok(default))
    }

    pub fn get_bool_or(&self, name: &str, default: bool) -> Result<bool> {
        self.get_opt(name).map(|v| v.as_bool()).unwrap_or(Ok(default))
    }

    pub fn get_str(&self, name: &str) -> Result<&str> {
        self.get(name)?.as_str()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (&**k, v))
    }
}

/// Everything an importer hands over to a layer constructor: scalar
/// parameters plus the learned tensors, in the order the layer expects
/// them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LayerParams {
    /// Name of the layer instance, filled in by the network.
    pub name: String,
    /// Type of the layer instance, filled in by the network.
    pub layer_type: String,
    pub blobs: Vec<Blob>,
    dict: Dict,
}

impl Deref for LayerParams {
    type Target = Dict;
    fn deref(&self) -> &Dict {
        &self.dict
    }
}

impl DerefMut for LayerParams {
    fn deref_mut(&mut self) -> &mut Dict {
        &mut self.dict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors() {
        let mut params = LayerParams::default();
        params.set("kernel_h", 3);
        params.set("eps", 1e-5);
        params.set("bias_term", true);
        params.set("pool", "MAX");
        assert_eq!(params.get_int("kernel_h").unwrap(), 3);
        assert_eq!(params.get_int_or("pad_h", 0).unwrap(), 0);
        assert!(params.get_real("eps").unwrap() < 1e-4);
        assert!(params.get_bool_or("bias_term", false).unwrap());
        assert_eq!(params.get_str("pool").unwrap(), "MAX");
        assert!(params.get_int("missing").is_err());
    }

    #[test]
    fn scalar_array_duality() {
        let v = ParamValue::RealArray(vec![4.0]);
        assert_eq!(v.as_int().unwrap(), 4);
        let v = ParamValue::RealArray(vec![1.0, 16.0, 5.0, 5.0]);
        assert_eq!(v.as_ints().unwrap(), vec![1, 16, 5, 5]);
        assert!(v.as_int().is_err());
    }
}
