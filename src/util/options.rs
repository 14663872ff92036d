//! String-keyed settings attached to a world (`bvh.builder`, `bvh.sah.*`).
//!
//! Values are either floats or strings. Lookups are lenient: a missing key or
//! a value of the wrong kind reads as `None` and callers fall back to their
//! defaults.

use std::collections::BTreeMap;
use std::fmt;

/// A single option value.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Float(f32),
    String(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{}", v),
            Self::String(s) => write!(f, "{}", s),
        }
    }
}

/// Ordered option map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    values: BTreeMap<String, OptionValue>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_float(&mut self, name: &str, value: f32) {
        self.values.insert(name.to_string(), OptionValue::Float(value));
    }

    pub fn set_string(&mut self, name: &str, value: &str) {
        self.values
            .insert(name.to_string(), OptionValue::String(value.to_string()));
    }

    /// Float value; string values that parse as numbers are accepted too.
    pub fn float(&self, name: &str) -> Option<f32> {
        match self.values.get(name)? {
            OptionValue::Float(v) => Some(*v),
            OptionValue::String(s) => s.trim().parse().ok(),
        }
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            OptionValue::String(s) => Some(s.as_str()),
            OptionValue::Float(_) => None,
        }
    }

    pub fn float_or(&self, name: &str, default: f32) -> f32 {
        self.float(name).unwrap_or(default)
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_lookup() {
        let mut o = Options::new();
        o.set_string("bvh.builder", "sah");
        o.set_float("bvh.sah.num_bins", 32.0);
        o.set_string("bvh.sah.min_overlap", " 0.25 ");

        assert_eq!(o.string("bvh.builder"), Some("sah"));
        assert_eq!(o.float("bvh.sah.num_bins"), Some(32.0));
        assert_eq!(o.float("bvh.sah.min_overlap"), Some(0.25));
        assert_eq!(o.float("bvh.builder"), None);
        assert_eq!(o.string("bvh.sah.num_bins"), None);
        assert_eq!(o.float_or("bvh.sah.traversal_cost", 10.0), 10.0);
    }

    #[test]
    fn test_overwrite() {
        let mut o = Options::new();
        o.set_float("bvh.sah.use_splits", 0.0);
        o.set_float("bvh.sah.use_splits", 1.0);
        assert_eq!(o.iter().count(), 1);
        assert_eq!(o.get("bvh.sah.use_splits"), Some(&OptionValue::Float(1.0)));
    }
}
