//! Contexts: concrete assignments of numeric values to a model's variables.
//!
//! A [`ContextTemplate`] is the fixed, ordered catalogue of variable keys for
//! one model architecture; it assigns each key a stable dense index. A
//! [`Context`] is one point in parameter space: a dense value array over that
//! template, addressable by key or by index. Contexts are immutable snapshots:
//! an optimizer step always produces a new context, never an in-place update,
//! so expression graphs built against an old context stay valid for
//! accept/reject comparison.

use crate::key::{Key, VariableKey};
use crate::scalar::Scalar;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use std::rc::Rc;

/// Ordered, deduplicated catalogue of variable keys with dense indices.
///
/// Established once per model architecture and immutable afterwards.
#[derive(Debug)]
pub struct ContextTemplate<K: Key> {
    keys: Vec<VariableKey<K>>,
    index: HashMap<VariableKey<K>, usize>,
}

impl<K: Key> ContextTemplate<K> {
    /// Builds a template from keys in declaration order, dropping duplicates.
    pub fn new(keys: impl IntoIterator<Item = VariableKey<K>>) -> Rc<Self> {
        let mut ordered = Vec::new();
        let mut index = HashMap::new();
        for key in keys {
            if !index.contains_key(&key) {
                index.insert(key.clone(), ordered.len());
                ordered.push(key);
            }
        }
        Rc::new(ContextTemplate {
            keys: ordered,
            index,
        })
    }

    /// Template covering every cell of an `height x width` matrix variable.
    pub fn for_matrix(id: K, height: usize, width: usize) -> Rc<Self> {
        ContextTemplate::new(
            (0..height)
                .flat_map(|r| (0..width).map(move |c| (r, c)))
                .map(|(r, c)| VariableKey::cell(id.clone(), r, c)),
        )
    }

    /// Number of catalogued keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when the template holds no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Dense index of `key`, or `None` when it is not catalogued.
    pub fn index_of(&self, key: &VariableKey<K>) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// Key at dense index `i`.
    pub fn key_at(&self, i: usize) -> &VariableKey<K> {
        &self.keys[i]
    }

    /// Iterates keys in dense-index order.
    pub fn keys(&self) -> impl Iterator<Item = &VariableKey<K>> {
        self.keys.iter()
    }
}

/// One point in parameter space: a dense value per template key.
#[derive(Clone, Debug)]
pub struct Context<K: Key> {
    template: Rc<ContextTemplate<K>>,
    values: Vec<f64>,
}

impl<K: Key> Context<K> {
    /// Context with the given values, one per template index.
    ///
    /// # Panics
    /// When the value count does not match the template, or any value is NaN.
    pub fn from_values(template: Rc<ContextTemplate<K>>, values: Vec<f64>) -> Self {
        assert_eq!(
            values.len(),
            template.len(),
            "context has {} values for a template of {} keys",
            values.len(),
            template.len()
        );
        assert!(
            values.iter().all(|v| !v.is_nan()),
            "context constructed with a NaN value"
        );
        Context { template, values }
    }

    /// All-zero context over `template`.
    pub fn zeros(template: Rc<ContextTemplate<K>>) -> Self {
        let values = vec![0.0; template.len()];
        Context { template, values }
    }

    /// Gaussian(0, `std`) random context, in the usual weight-init style.
    pub fn randomized(template: Rc<ContextTemplate<K>>, std: f64, rng: &mut impl Rng) -> Self {
        let normal = Normal::new(0.0, std).expect("init std must be finite and non-negative");
        let values = (0..template.len()).map(|_| normal.sample(rng)).collect();
        Context { template, values }
    }

    /// The template this context is laid out against.
    pub fn template(&self) -> &Rc<ContextTemplate<K>> {
        &self.template
    }

    /// Number of values (same as the template's key count).
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the context holds no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value for `key`, or `None` when the key is not catalogued.
    pub fn get(&self, key: &VariableKey<K>) -> Option<f64> {
        self.template.index_of(key).map(|i| self.values[i])
    }

    /// Value at dense index `i` (the fast path for repeated optimizer steps).
    pub fn value_at(&self, i: usize) -> f64 {
        self.values[i]
    }

    /// New context over the same template with replacement values.
    pub fn with_values(&self, values: Vec<f64>) -> Self {
        Context::from_values(Rc::clone(&self.template), values)
    }

    /// Derivative-tracking leaf node for `key`, valued from this context.
    ///
    /// # Panics
    /// When `key` is not catalogued in the template (fail-fast construction).
    pub fn variable(&self, key: VariableKey<K>) -> Scalar<K> {
        let value = self
            .get(&key)
            .unwrap_or_else(|| panic!("variable {key:?} is missing from the context"));
        Scalar::variable(key, value)
    }

    /// Constant-mode leaf for `key`: same value, no derivative tracking.
    ///
    /// # Panics
    /// When `key` is not catalogued in the template.
    pub fn constant(&self, key: &VariableKey<K>) -> Scalar<K> {
        let value = self
            .get(key)
            .unwrap_or_else(|| panic!("variable {key:?} is missing from the context"));
        Scalar::constant(value)
    }
}
