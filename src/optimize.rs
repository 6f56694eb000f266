//! Gradient-based optimization over contexts.
//!
//! The optimizer is a pure functional search: it holds no state machine, only
//! successive [`Solution`] triples of context, caller-defined result, and
//! objective node. The caller supplies a result-extraction closure (rebuilds
//! the expression graph against a context) and an objective-extraction closure
//! (picks the scalar to minimize out of the result), so the search is agnostic
//! to what the downstream model looks like.
//!
//! Three layers: [`step`] (one box-constrained descent step),
//! [`step_to_minimum`] / [`normalized_step_to_minimum`] (greedy shrinking-step
//! line search), and [`optimize_with_constraints`] (exterior penalty method).

use crate::context::Context;
use crate::key::{Key, VariableKey};
use crate::scalar::Scalar;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Per-variable `[min, max]` clamp applied after each descent step.
#[derive(Clone, Copy, Debug)]
pub struct BoxRange {
    pub min: f64,
    pub max: f64,
}

/// Registered box ranges, keyed per variable. Keys without an entry step
/// unclamped.
pub type Ranges<K> = HashMap<VariableKey<K>, BoxRange>;

/// Fatal optimizer-call-time configuration errors.
#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error("step multiplier must be positive, got {0}")]
    NonPositiveMultiplier(f64),
    #[error("inverted range [{min}, {max}] for {key}")]
    InvertedRange { key: String, min: f64, max: f64 },
    #[error("step produced NaN for {key}")]
    NanStep { key: String },
}

/// One point visited by the search: the context, the caller's result built
/// against it, and the objective node extracted from that result.
pub struct Solution<K: Key, R> {
    pub context: Context<K>,
    pub result: R,
    pub objective: Scalar<K>,
}

impl<K: Key, R> Solution<K, R> {
    fn evaluate(
        result_of: &impl Fn(&Context<K>) -> R,
        objective_of: &impl Fn(&R) -> Scalar<K>,
        context: Context<K>,
    ) -> Self {
        let result = result_of(&context);
        // Materialize once: the step loop reads every partial derivative.
        let objective = objective_of(&result).cache(context.len() * 2);
        Solution {
            context,
            result,
            objective,
        }
    }
}

/// One gradient-descent step: for every key,
/// `new = old - multiplier * objective.derivative_at(key)`, clamped into its
/// registered box range.
///
/// Returns a new context; the input context is untouched.
pub fn step<K: Key>(
    objective: &Scalar<K>,
    context: &Context<K>,
    ranges: &Ranges<K>,
    multiplier: f64,
) -> Result<Context<K>, OptimizeError> {
    let cached = objective.cache(context.len() * 2);
    apply_step(&cached, context, ranges, multiplier, false)
}

fn apply_step<K: Key>(
    cached_objective: &Scalar<K>,
    context: &Context<K>,
    ranges: &Ranges<K>,
    multiplier: f64,
    normalized: bool,
) -> Result<Context<K>, OptimizeError> {
    if !(multiplier > 0.0) {
        return Err(OptimizeError::NonPositiveMultiplier(multiplier));
    }

    // In normalized mode the step has fixed Euclidean length `multiplier`.
    let scale = if normalized {
        let norm = (0..context.len())
            .map(|i| cached_objective.derivative_at(context.template().key_at(i)))
            .map(|d| d * d)
            .sum::<f64>()
            .sqrt();
        if norm == 0.0 {
            return Ok(context.clone());
        }
        multiplier / norm
    } else {
        multiplier
    };

    let mut values = Vec::with_capacity(context.len());
    for i in 0..context.len() {
        let key = context.template().key_at(i);
        let mut v = context.value_at(i) - scale * cached_objective.derivative_at(key);
        if let Some(range) = ranges.get(key) {
            if range.min > range.max {
                return Err(OptimizeError::InvertedRange {
                    key: format!("{key:?}"),
                    min: range.min,
                    max: range.max,
                });
            }
            v = v.clamp(range.min, range.max);
        }
        if v.is_nan() {
            return Err(OptimizeError::NanStep {
                key: format!("{key:?}"),
            });
        }
        values.push(v);
    }
    Ok(context.with_values(values))
}

/// Greedy line search with raw-gradient-scaled steps.
///
/// From `step_size`, repeatedly steps from the best solution so far; accepts
/// whenever the objective strictly decreases, halves the step size on the
/// first non-improving attempt, and stops once the size falls to `min_step`
/// or below. Returns the best solution found. Greedy hill-climbing with
/// geometric shrinkage; relies on objective smoothness, detects no
/// non-convergence.
pub fn step_to_minimum<K: Key, R>(
    result_of: impl Fn(&Context<K>) -> R,
    objective_of: impl Fn(&R) -> Scalar<K>,
    start: Context<K>,
    ranges: &Ranges<K>,
    step_size: f64,
    min_step: f64,
) -> Result<Solution<K, R>, OptimizeError> {
    search_to_minimum(&result_of, &objective_of, start, ranges, step_size, min_step, false)
}

/// [`step_to_minimum`], but each step is normalized to a fixed Euclidean
/// length instead of scaling by raw gradient magnitude.
pub fn normalized_step_to_minimum<K: Key, R>(
    result_of: impl Fn(&Context<K>) -> R,
    objective_of: impl Fn(&R) -> Scalar<K>,
    start: Context<K>,
    ranges: &Ranges<K>,
    step_size: f64,
    min_step: f64,
) -> Result<Solution<K, R>, OptimizeError> {
    search_to_minimum(&result_of, &objective_of, start, ranges, step_size, min_step, true)
}

fn search_to_minimum<K: Key, R>(
    result_of: &impl Fn(&Context<K>) -> R,
    objective_of: &impl Fn(&R) -> Scalar<K>,
    start: Context<K>,
    ranges: &Ranges<K>,
    step_size: f64,
    min_step: f64,
    normalized: bool,
) -> Result<Solution<K, R>, OptimizeError> {
    if !(step_size > 0.0) {
        return Err(OptimizeError::NonPositiveMultiplier(step_size));
    }
    let mut best = Solution::evaluate(result_of, objective_of, start);
    let mut size = step_size;
    while size > min_step {
        let stepped = apply_step(&best.objective, &best.context, ranges, size, normalized)?;
        let candidate = Solution::evaluate(result_of, objective_of, stepped);
        if candidate.objective.value() < best.objective.value() {
            trace!(
                step = size,
                objective = candidate.objective.value(),
                "accepted descent step"
            );
            best = candidate;
        } else {
            size /= 2.0;
        }
    }
    debug!(objective = best.objective.value(), "line search finished");
    Ok(best)
}

/// Exterior penalty method: minimizes `f(x)` subject to `g_i(x) >= 0`.
///
/// Each outer round minimizes the augmented objective
/// `f + penalty_shape(multiplier * violation)` with
/// `violation = -sum_i min(g_i, 0)` (zero when feasible), then multiplies the
/// penalty multiplier by 10, until the violation falls within
/// `exceedance_tolerance`. The returned solution is re-expressed against the
/// original, unpenalized objective.
#[allow(clippy::too_many_arguments)]
pub fn optimize_with_constraints<K: Key, R>(
    result_of: impl Fn(&Context<K>) -> R,
    objective_of: impl Fn(&R) -> Scalar<K>,
    constraints: &[Box<dyn Fn(&R) -> Scalar<K>>],
    penalty_shape: impl Fn(&Scalar<K>) -> Scalar<K>,
    start: Context<K>,
    ranges: &Ranges<K>,
    step_size: f64,
    min_step: f64,
    exceedance_tolerance: f64,
) -> Result<Solution<K, R>, OptimizeError> {
    let violation_of = |result: &R| -> Scalar<K> {
        let zero = Scalar::constant(0.0);
        let shortfalls: Vec<Scalar<K>> = constraints
            .iter()
            .map(|g| Scalar::min(&g(result), &zero))
            .collect();
        let total = match shortfalls.len() {
            0 => zero,
            1 => shortfalls.into_iter().next().unwrap(),
            _ => Scalar::sum(shortfalls),
        };
        total.times(&Scalar::constant(-1.0))
    };

    let mut multiplier = 1.0;
    let mut context = start;
    loop {
        let round_multiplier = multiplier;
        let augmented = |result: &R| -> Scalar<K> {
            let penalty =
                penalty_shape(&violation_of(result).times(&Scalar::constant(round_multiplier)));
            objective_of(result).plus(&penalty)
        };
        let round = normalized_step_to_minimum(
            &result_of,
            augmented,
            context.clone(),
            ranges,
            step_size,
            min_step,
        )?;
        let violation = violation_of(&round.result).value();
        debug!(
            multiplier,
            violation,
            objective = objective_of(&round.result).value(),
            "penalty round finished"
        );
        context = round.context;
        if violation <= exceedance_tolerance {
            break;
        }
        multiplier *= 10.0;
    }
    Ok(Solution::evaluate(&result_of, &objective_of, context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextTemplate;
    use approx::assert_abs_diff_eq;

    type Ctx = Context<&'static str>;
    type Node = Scalar<&'static str>;

    fn xy_context(x: f64, y: f64) -> Ctx {
        let template = ContextTemplate::new(vec![
            VariableKey::scalar("x"),
            VariableKey::scalar("y"),
        ]);
        Context::from_values(template, vec![x, y])
    }

    fn xy(ctx: &Ctx) -> (Node, Node) {
        (
            ctx.variable(VariableKey::scalar("x")),
            ctx.variable(VariableKey::scalar("y")),
        )
    }

    #[test]
    fn step_descends_and_clamps_into_range() {
        let template = ContextTemplate::new(vec![VariableKey::scalar("x")]);
        let ctx = Context::from_values(template, vec![10.0]);
        let objective = ctx.variable(VariableKey::scalar("x")).power(2.0);

        let free = step(&objective, &ctx, &Ranges::new(), 0.3).unwrap();
        // new = 10 - 0.3 * 20 = 4
        assert_abs_diff_eq!(free.value_at(0), 4.0, epsilon = 1e-12);

        let mut ranges = Ranges::new();
        ranges.insert(VariableKey::scalar("x"), BoxRange { min: 5.0, max: 20.0 });
        let clamped = step(&objective, &ctx, &ranges, 0.3).unwrap();
        assert_abs_diff_eq!(clamped.value_at(0), 5.0, epsilon = 1e-12);
    }

    #[test]
    fn step_rejects_non_positive_multiplier() {
        let template = ContextTemplate::new(vec![VariableKey::scalar("x")]);
        let ctx = Context::from_values(template, vec![1.0]);
        let objective = ctx.variable(VariableKey::scalar("x"));
        let err = step(&objective, &ctx, &Ranges::new(), 0.0).unwrap_err();
        assert!(matches!(err, OptimizeError::NonPositiveMultiplier(_)));
    }

    #[test]
    fn step_rejects_inverted_range() {
        let template = ContextTemplate::new(vec![VariableKey::scalar("x")]);
        let ctx = Context::from_values(template, vec![1.0]);
        let objective = ctx.variable(VariableKey::scalar("x"));
        let mut ranges = Ranges::new();
        ranges.insert(VariableKey::scalar("x"), BoxRange { min: 2.0, max: -2.0 });
        let err = step(&objective, &ctx, &ranges, 1.0).unwrap_err();
        assert!(matches!(err, OptimizeError::InvertedRange { .. }));
    }

    #[test]
    fn step_to_minimum_finds_quadratic_minimum() {
        let best = step_to_minimum(
            |ctx: &Ctx| {
                let (x, y) = xy(ctx);
                x.power(2.0).plus(&y.power(2.0))
            },
            |objective: &Node| objective.clone(),
            xy_context(200.0, 200.0),
            &Ranges::new(),
            10_000.0,
            1e-6,
        )
        .unwrap();
        assert_abs_diff_eq!(best.objective.value(), 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(best.context.value_at(0), 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(best.context.value_at(1), 0.0, epsilon = 1e-3);
    }

    #[test]
    fn normalized_search_finds_quadratic_minimum() {
        let best = normalized_step_to_minimum(
            |ctx: &Ctx| {
                let (x, y) = xy(ctx);
                x.power(2.0).plus(&y.power(2.0))
            },
            |objective: &Node| objective.clone(),
            xy_context(3.0, -4.0),
            &Ranges::new(),
            16.0,
            1e-8,
        )
        .unwrap();
        assert_abs_diff_eq!(best.objective.value(), 0.0, epsilon = 1e-3);
    }

    #[test]
    fn penalty_method_solves_product_problem() {
        // minimize -x^2 y^3  s.t.  x >= 0, y >= 0, x + y <= 10  ->  (4, 6)
        type R = (Node, Node);
        let constraints: Vec<Box<dyn Fn(&R) -> Node>> = vec![
            Box::new(|(x, _): &R| x.clone()),
            Box::new(|(_, y): &R| y.clone()),
            Box::new(|(x, y): &R| Scalar::constant(10.0).minus(&x.plus(y))),
        ];
        let best = optimize_with_constraints(
            xy,
            |(x, y): &R| -&(&x.power(2.0) * &y.power(3.0)),
            &constraints,
            |v: &Node| v.exp(),
            xy_context(1.0, 1.0),
            &Ranges::new(),
            1.0,
            1e-7,
            1e-4,
        )
        .unwrap();
        assert_abs_diff_eq!(best.context.value_at(0), 4.0, epsilon = 1e-3);
        assert_abs_diff_eq!(best.context.value_at(1), 6.0, epsilon = 1e-3);
    }

    #[test]
    fn penalty_method_solves_linear_program() {
        // maximize x + y  s.t.  x >= 0, y >= 0, x + 0.5y <= 3, 0.5x + y <= 3  ->  (2, 2)
        type R = (Node, Node);
        let constraints: Vec<Box<dyn Fn(&R) -> Node>> = vec![
            Box::new(|(x, _): &R| x.clone()),
            Box::new(|(_, y): &R| y.clone()),
            Box::new(|(x, y): &R| {
                Scalar::constant(3.0).minus(&x.plus(&y.times(&Scalar::constant(0.5))))
            }),
            Box::new(|(x, y): &R| {
                Scalar::constant(3.0).minus(&x.times(&Scalar::constant(0.5)).plus(y))
            }),
        ];
        let best = optimize_with_constraints(
            xy,
            |(x, y): &R| -&x.plus(y),
            &constraints,
            |v: &Node| v.exp(),
            xy_context(0.0, 0.0),
            &Ranges::new(),
            1.0,
            1e-7,
            1e-4,
        )
        .unwrap();
        assert_abs_diff_eq!(best.context.value_at(0), 2.0, epsilon = 1e-3);
        assert_abs_diff_eq!(best.context.value_at(1), 2.0, epsilon = 1e-3);
    }

    #[test]
    fn solutions_keep_old_contexts_valid() {
        // The accept/reject loop compares objectives built against different
        // contexts; stepping must never mutate the context it read from.
        let template = ContextTemplate::new(vec![VariableKey::scalar("x")]);
        let ctx = Context::from_values(template, vec![8.0]);
        let objective = ctx.variable(VariableKey::scalar("x")).power(2.0);
        let next = step(&objective, &ctx, &Ranges::new(), 0.1).unwrap();
        assert_abs_diff_eq!(ctx.value_at(0), 8.0, epsilon = 1e-12);
        assert!(next.value_at(0) < 8.0);
        assert_abs_diff_eq!(objective.value(), 64.0, epsilon = 1e-12);
    }
}
