//! Scalar computation nodes: a forward value plus sparse partial derivatives.
//!
//! A [`Scalar`] is a cheap-to-clone handle to one point in an immutable
//! expression graph. Values are computed eagerly at construction; derivatives
//! are recomputed lazily by recursing into children on every request, unless a
//! node has been materialized with [`Scalar::cache`]. Every constructor
//! validates that the value is not NaN and fails fast at the node that
//! produced it.
//!
//! The node set is closed (constant / variable / sum / product / unary /
//! clipped / cached) and dispatched by exhaustive match, so a missing case in
//! any capability is a compile error.

use crate::gradient::GradientMap;
use crate::key::{Key, VariableKey};
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

/// One node variant in the expression graph.
enum Node<K: Key> {
    /// Fixed value; derivative identically zero.
    Constant { value: f64 },
    /// Independent parameter; derivative 1 at its own key, 0 elsewhere.
    Variable { value: f64, key: VariableKey<K> },
    /// Eager sum of two or more terms; derivatives recurse (sum rule).
    Sum { value: f64, terms: Vec<Scalar<K>> },
    /// Eager product; derivatives recurse (product rule).
    Product {
        value: f64,
        left: Scalar<K>,
        right: Scalar<K>,
    },
    /// `f(x)` with `f'(x)` stored once; derivative is `f'(x) * arg.d(k)`.
    Unary {
        value: f64,
        slope: f64,
        arg: Scalar<K>,
    },
    /// Value passthrough that zeroes derivative components below `threshold`.
    Clipped {
        value: f64,
        threshold: f64,
        arg: Scalar<K>,
    },
    /// Materialized node: value plus a fully realized sparse gradient.
    Cached {
        value: f64,
        gradient: GradientMap<K>,
    },
}

/// Handle to a scalar node in the expression graph.
///
/// Clones share the underlying node, so the same sub-expression can feed any
/// number of parents without duplication. Graphs are acyclic by construction
/// (built bottom-up) and immutable once built.
pub struct Scalar<K: Key>(Rc<Node<K>>);

impl<K: Key> Clone for Scalar<K> {
    fn clone(&self) -> Self {
        Scalar(Rc::clone(&self.0))
    }
}

/// Fails fast on NaN at the node that produced it.
fn guard(value: f64, op: &str) -> f64 {
    assert!(!value.is_nan(), "{op} produced NaN");
    value
}

impl<K: Key> Scalar<K> {
    /// Constant node; its derivative is identically zero.
    pub fn constant(value: f64) -> Self {
        Scalar(Rc::new(Node::Constant {
            value: guard(value, "constant"),
        }))
    }

    /// Variable leaf node for `key` holding `value`.
    ///
    /// Usually built through [`Context::variable`](crate::context::Context::variable),
    /// which checks the key against the template first.
    pub fn variable(key: VariableKey<K>, value: f64) -> Self {
        Scalar(Rc::new(Node::Variable {
            value: guard(value, "variable"),
            key,
        }))
    }

    /// Already-materialized node from a value and a realized gradient.
    ///
    /// Used by operators that accumulate their own sparse gradient directly
    /// (matrix multiply) instead of layering lazy sum/product nodes.
    pub(crate) fn materialized(value: f64, gradient: GradientMap<K>) -> Self {
        Scalar(Rc::new(Node::Cached {
            value: guard(value, "materialized node"),
            gradient,
        }))
    }

    /// Forward value. Never NaN.
    pub fn value(&self) -> f64 {
        match &*self.0 {
            Node::Constant { value }
            | Node::Variable { value, .. }
            | Node::Sum { value, .. }
            | Node::Product { value, .. }
            | Node::Unary { value, .. }
            | Node::Clipped { value, .. }
            | Node::Cached { value, .. } => *value,
        }
    }

    // -------------------------------------------------------------------------
    // Combinators — sum/product rules applied lazily on request
    // -------------------------------------------------------------------------

    /// Sum of two or more terms. Value is eager; derivatives recurse.
    pub fn sum(terms: Vec<Scalar<K>>) -> Self {
        assert!(terms.len() >= 2, "sum needs at least two terms");
        let value = guard(terms.iter().map(Scalar::value).sum(), "sum");
        Scalar(Rc::new(Node::Sum { value, terms }))
    }

    /// Addition: `self + other`.
    pub fn plus(&self, other: &Scalar<K>) -> Scalar<K> {
        Scalar::sum(vec![self.clone(), other.clone()])
    }

    /// Subtraction: `self + other * (-1)`.
    pub fn minus(&self, other: &Scalar<K>) -> Scalar<K> {
        self.plus(&other.times(&Scalar::constant(-1.0)))
    }

    /// Multiplication. Derivative w.r.t. k is `l.value*r.d(k) + r.value*l.d(k)`.
    pub fn times(&self, other: &Scalar<K>) -> Scalar<K> {
        let value = guard(self.value() * other.value(), "product");
        Scalar(Rc::new(Node::Product {
            value,
            left: self.clone(),
            right: other.clone(),
        }))
    }

    /// Division: `self * other^(-1)`.
    pub fn divide(&self, other: &Scalar<K>) -> Scalar<K> {
        self.times(&other.power(-1.0))
    }

    /// Power: `self^e`. Slope is `e * self^(e-1)`.
    pub fn power(&self, e: f64) -> Scalar<K> {
        let x = self.value();
        self.unary(guard(x.powf(e), "power"), e * x.powf(e - 1.0))
    }

    /// Exponential. Slope is `exp(self)`.
    pub fn exp(&self) -> Scalar<K> {
        let value = guard(self.value().exp(), "exp");
        self.unary(value, value)
    }

    /// Natural log. Slope is `1/self`. Fails fast for negative arguments.
    pub fn ln(&self) -> Scalar<K> {
        let x = self.value();
        self.unary(guard(x.ln(), "ln"), 1.0 / x)
    }

    /// Hyperbolic tangent. Slope is `1 - tanh(self)^2`.
    pub fn tanh(&self) -> Scalar<K> {
        let value = guard(self.value().tanh(), "tanh");
        self.unary(value, 1.0 - value * value)
    }

    /// Logistic sigmoid `1 / (1 + exp(-self))`. Slope is `s * (1 - s)`.
    pub fn sigmoid(&self) -> Scalar<K> {
        let value = guard(1.0 / (1.0 + (-self.value()).exp()), "sigmoid");
        self.unary(value, value * (1.0 - value))
    }

    fn unary(&self, value: f64, slope: f64) -> Scalar<K> {
        Scalar(Rc::new(Node::Unary {
            value,
            slope: guard(slope, "unary slope"),
            arg: self.clone(),
        }))
    }

    /// Value passthrough that zeroes derivative components whose magnitude is
    /// below `threshold`.
    ///
    /// This is a sparsifying filter, not a magnitude ceiling: large gradient
    /// entries pass unchanged, small ones are dropped.
    pub fn clip(&self, threshold: f64) -> Scalar<K> {
        assert!(
            threshold >= 0.0 && !threshold.is_nan(),
            "clip threshold must be non-negative"
        );
        Scalar(Rc::new(Node::Clipped {
            value: self.value(),
            threshold,
            arg: self.clone(),
        }))
    }

    /// The operand with the lesser current value, returned unchanged.
    ///
    /// Not a smooth min: the derivative jumps at the crossover. Used for
    /// one-sided constraint penalties. Ties return `a`.
    pub fn min(a: &Scalar<K>, b: &Scalar<K>) -> Scalar<K> {
        if a.value() <= b.value() {
            a.clone()
        } else {
            b.clone()
        }
    }

    // -------------------------------------------------------------------------
    // Derivatives — lookup, enumeration, materialization
    // -------------------------------------------------------------------------

    /// Partial derivative of this node with respect to `key`.
    pub fn derivative_at(&self, key: &VariableKey<K>) -> f64 {
        match &*self.0 {
            Node::Constant { .. } => 0.0,
            Node::Variable { key: own, .. } => {
                if own == key {
                    1.0
                } else {
                    0.0
                }
            }
            Node::Sum { terms, .. } => terms.iter().map(|t| t.derivative_at(key)).sum(),
            Node::Product { left, right, .. } => {
                let mut d = 0.0;
                if right.value() != 0.0 {
                    d += right.value() * left.derivative_at(key);
                }
                if left.value() != 0.0 {
                    d += left.value() * right.derivative_at(key);
                }
                d
            }
            Node::Unary { slope, arg, .. } => {
                if *slope == 0.0 {
                    0.0
                } else {
                    slope * arg.derivative_at(key)
                }
            }
            Node::Clipped { threshold, arg, .. } => {
                let d = arg.derivative_at(key);
                if d.abs() < *threshold {
                    0.0
                } else {
                    d
                }
            }
            Node::Cached { gradient, .. } => gradient.get(key),
        }
    }

    /// Walks every structurally possibly-nonzero derivative contribution.
    ///
    /// The sink may see the same key more than once (sum rule); per-key totals
    /// are whatever the contributions add up to. Subtrees whose contribution is
    /// guaranteed zero (zero-valued product operand, zero unary slope) are
    /// skipped entirely.
    pub fn for_each_derivative(&self, f: &mut dyn FnMut(&VariableKey<K>, f64)) {
        self.visit(1.0, f);
    }

    fn visit(&self, scale: f64, sink: &mut dyn FnMut(&VariableKey<K>, f64)) {
        match &*self.0 {
            Node::Constant { .. } => {}
            Node::Variable { key, .. } => sink(key, scale),
            Node::Sum { terms, .. } => {
                for term in terms {
                    term.visit(scale, sink);
                }
            }
            Node::Product { left, right, .. } => {
                if right.value() != 0.0 {
                    left.visit(scale * right.value(), sink);
                }
                if left.value() != 0.0 {
                    right.visit(scale * left.value(), sink);
                }
            }
            Node::Unary { slope, arg, .. } => {
                if *slope != 0.0 {
                    arg.visit(scale * slope, sink);
                }
            }
            Node::Clipped { threshold, arg, .. } => {
                // The filter applies to per-key totals, so the argument's
                // gradient must be realized before thresholding.
                for (key, d) in arg.gradient().iter() {
                    if d.abs() >= *threshold {
                        sink(key, scale * d);
                    }
                }
            }
            Node::Cached { gradient, .. } => {
                for (key, d) in gradient.iter() {
                    sink(key, scale * d);
                }
            }
        }
    }

    /// Full gradient: every nonzero partial derivative as a sparse map.
    ///
    /// Walks the tree once; does not change this node. Use [`Scalar::cache`]
    /// to keep the result attached.
    pub fn gradient(&self) -> GradientMap<K> {
        let mut map = GradientMap::new();
        self.visit(1.0, &mut |key, d| map.accumulate(key, d));
        map
    }

    /// Materializes this node: realizes the full gradient in one walk.
    ///
    /// A node reused by N downstream consumers without caching is retraversed
    /// up to N times; this is the sole mechanism for bounding that cost.
    /// Calling `cache` on an already-materialized node returns it unchanged.
    pub fn cache(&self, bucket_hint: usize) -> Scalar<K> {
        if let Node::Cached { .. } = &*self.0 {
            return self.clone();
        }
        let mut gradient = GradientMap::with_bucket_hint(bucket_hint);
        self.visit(1.0, &mut |key, d| gradient.accumulate(key, d));
        Scalar(Rc::new(Node::Cached {
            value: self.value(),
            gradient,
        }))
    }

    /// Materializes but keeps only the `n` largest-magnitude gradient entries.
    ///
    /// Bounds memory for very high-dimensional parameter spaces (embedding
    /// matrices) at the cost of dropping small-gradient contributions.
    pub fn discard_beyond(&self, n: usize) -> Scalar<K> {
        let mut gradient = self.gradient();
        gradient.retain_largest(n);
        Scalar(Rc::new(Node::Cached {
            value: self.value(),
            gradient,
        }))
    }

    /// Constant carrying the current value and no derivative.
    ///
    /// Truncates backpropagation: used across recurrent time steps when only
    /// a bounded window of history should receive gradient credit, or when
    /// only the numeric magnitude of a value matters.
    pub fn to_constant(&self) -> Scalar<K> {
        Scalar::constant(self.value())
    }

    /// Heuristic cost of re-deriving this node's gradient without caching:
    /// 0 for constants, 1 for variables and cached nodes, sum of children for
    /// combinators. The engine never auto-caches; callers use this to decide
    /// where to insert a cache point.
    pub fn branch_complexity(&self) -> u64 {
        match &*self.0 {
            Node::Constant { .. } => 0,
            Node::Variable { .. } | Node::Cached { .. } => 1,
            Node::Sum { terms, .. } => terms.iter().map(Scalar::branch_complexity).sum(),
            Node::Product { left, right, .. } => {
                left.branch_complexity() + right.branch_complexity()
            }
            Node::Unary { arg, .. } | Node::Clipped { arg, .. } => arg.branch_complexity(),
        }
    }
}

// -----------------------------------------------------------------------------
// std::ops — algebra on references: &a + &b, &a - &b, &a * &b, &a / &b, -&a
// -----------------------------------------------------------------------------

impl<K: Key> Add for &Scalar<K> {
    type Output = Scalar<K>;

    fn add(self, rhs: Self) -> Scalar<K> {
        self.plus(rhs)
    }
}

impl<K: Key> Sub for &Scalar<K> {
    type Output = Scalar<K>;

    fn sub(self, rhs: Self) -> Scalar<K> {
        self.minus(rhs)
    }
}

impl<K: Key> Mul for &Scalar<K> {
    type Output = Scalar<K>;

    fn mul(self, rhs: Self) -> Scalar<K> {
        self.times(rhs)
    }
}

impl<K: Key> Div for &Scalar<K> {
    type Output = Scalar<K>;

    fn div(self, rhs: Self) -> Scalar<K> {
        self.divide(rhs)
    }
}

impl<K: Key> Neg for &Scalar<K> {
    type Output = Scalar<K>;

    fn neg(self) -> Scalar<K> {
        self.times(&Scalar::constant(-1.0))
    }
}
