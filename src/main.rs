//! # scalargrad demo
//!
//! Drives the optimizer through three small showcases: an unconstrained
//! quadratic descent, an exterior-penalty constrained problem, and a
//! checkpoint round-trip of the winning context.

use scalargrad::optimize::{self, Ranges};
use scalargrad::{checkpoint, Context, ContextTemplate, Scalar, VariableKey};
use std::rc::Rc;
use tracing::info;

type Node = Scalar<String>;
type Ctx = Context<String>;

fn x_key() -> VariableKey<String> {
    VariableKey::scalar("x".to_string())
}

fn y_key() -> VariableKey<String> {
    VariableKey::scalar("y".to_string())
}

fn xy_template() -> Rc<ContextTemplate<String>> {
    ContextTemplate::new(vec![x_key(), y_key()])
}

fn xy(ctx: &Ctx) -> (Node, Node) {
    (ctx.variable(x_key()), ctx.variable(y_key()))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // ----- Unconstrained: minimize x^2 + y^2 from (200, 200) -----
    let start = Context::from_values(xy_template(), vec![200.0, 200.0]);
    let best = optimize::step_to_minimum(
        |ctx: &Ctx| {
            let (x, y) = xy(ctx);
            x.power(2.0).plus(&y.power(2.0))
        },
        |objective: &Node| objective.clone(),
        start,
        &Ranges::new(),
        10_000.0,
        1e-6,
    )?;
    info!(
        x = best.context.value_at(0),
        y = best.context.value_at(1),
        objective = best.objective.value(),
        "quadratic descent finished"
    );

    // ----- Constrained: minimize -x^2 y^3  s.t.  x, y >= 0, x + y <= 10 -----
    type R = (Node, Node);
    let constraints: Vec<Box<dyn Fn(&R) -> Node>> = vec![
        Box::new(|(x, _): &R| x.clone()),
        Box::new(|(_, y): &R| y.clone()),
        Box::new(|(x, y): &R| Scalar::constant(10.0).minus(&x.plus(y))),
    ];
    let start = Context::from_values(xy_template(), vec![1.0, 1.0]);
    let best = optimize::optimize_with_constraints(
        xy,
        |(x, y): &R| -&(&x.power(2.0) * &y.power(3.0)),
        &constraints,
        |v: &Node| v.exp(),
        start,
        &Ranges::new(),
        1.0,
        1e-7,
        1e-4,
    )?;
    info!(
        x = best.context.value_at(0),
        y = best.context.value_at(1),
        objective = best.objective.value(),
        "penalty method finished (expected x=4, y=6)"
    );

    // ----- Persistence: save the winning context, load it back -----
    let path = std::env::temp_dir().join("scalargrad_demo.ckpt");
    checkpoint::save_context(&best.context, &path)?;
    let restored = checkpoint::load_context(xy_template(), &path)?;
    info!(
        path = %path.display(),
        x = restored.value_at(0),
        y = restored.value_at(1),
        "checkpoint round-tripped"
    );
    let _ = std::fs::remove_file(&path);

    Ok(())
}
