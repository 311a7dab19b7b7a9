use std::collections::HashMap;
use std::f64::consts;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::entity::Entity;
use crate::folerr;
use crate::formula::EvalContext;
use crate::result::{FolErrorKind, FolResult};

/// Function implementation. Arguments arrive as unevaluated entities so an
/// implementation can decide how often, or whether, to evaluate each one.
pub type FunctionCompute = Box<dyn Fn(&EvalContext, &[Entity]) -> FolResult<f64> + Send + Sync>;

fn arg(ctx: &EvalContext, args: &[Entity], i: usize, id: &str) -> FolResult<f64> {
    match args.get(i) {
        Some(entity) => ctx.entity_value(entity),
        None => Err(folerr!(
            FolErrorKind::Domain,
            "'{}' needs at least {} arguments, got {}",
            id,
            i + 1,
            args.len()
        )),
    }
}

fn all_args(ctx: &EvalContext, args: &[Entity], id: &str) -> FolResult<Vec<f64>> {
    if args.is_empty() {
        return Err(folerr!(FolErrorKind::Domain, "'{}' needs arguments", id));
    }
    args.iter().map(|a| ctx.entity_value(a)).collect()
}

macro_rules! constant {
    ($map:expr, $name:expr, $value:expr) => {
        $map.insert(
            $name.to_string(),
            Box::new(move |_: &EvalContext, _: &[Entity]| Ok($value)) as FunctionCompute,
        )
    };
}

macro_rules! unary {
    ($map:expr, $name:expr, $f:expr) => {
        $map.insert(
            $name.to_string(),
            Box::new(move |ctx: &EvalContext, args: &[Entity]| {
                let x = arg(ctx, args, 0, $name)?;
                let f: fn(f64) -> f64 = $f;
                Ok(f(x))
            }) as FunctionCompute,
        )
    };
}

macro_rules! binary {
    ($map:expr, $name:expr, $f:expr) => {
        $map.insert(
            $name.to_string(),
            Box::new(move |ctx: &EvalContext, args: &[Entity]| {
                let a = arg(ctx, args, 0, $name)?;
                let b = arg(ctx, args, 1, $name)?;
                let f: fn(f64, f64) -> f64 = $f;
                Ok(f(a, b))
            }) as FunctionCompute,
        )
    };
}

macro_rules! ternary {
    ($map:expr, $name:expr, $f:expr) => {
        $map.insert(
            $name.to_string(),
            Box::new(move |ctx: &EvalContext, args: &[Entity]| {
                let a = arg(ctx, args, 0, $name)?;
                let b = arg(ctx, args, 1, $name)?;
                let c = arg(ctx, args, 2, $name)?;
                let f: fn(f64, f64, f64) -> f64 = $f;
                Ok(f(a, b, c))
            }) as FunctionCompute,
        )
    };
}

macro_rules! aggregate {
    ($map:expr, $name:expr, $f:expr) => {
        $map.insert(
            $name.to_string(),
            Box::new(move |ctx: &EvalContext, args: &[Entity]| {
                let values = all_args(ctx, args, $name)?;
                let f: fn(Vec<f64>) -> f64 = $f;
                Ok(f(values))
            }) as FunctionCompute,
        )
    };
}

fn nth_root(x: f64, n: f64) -> f64 {
    if x < 0.0 && n == n.floor() && (n as i64) % 2 != 0 {
        -(-x).powf(1.0 / n)
    } else {
        x.powf(1.0 / n)
    }
}

fn wrap_value(x: f64, lo: f64, hi: f64) -> f64 {
    let span = hi - lo;
    if span == 0.0 {
        lo
    } else {
        lo + (x - lo).rem_euclid(span)
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

fn factorial(ctx: &EvalContext, args: &[Entity]) -> FolResult<f64> {
    let x = arg(ctx, args, 0, "fact")?;
    if x < 0.0 || x != x.floor() {
        return Err(folerr!(
            FolErrorKind::Domain,
            "'fact' needs a non-negative integer, got {}",
            x
        ));
    }
    let mut result = 1.0;
    let mut i = 2.0;
    while i <= x {
        result *= i;
        i += 1.0;
    }
    Ok(result)
}

fn locked_rng(rng: &Mutex<StdRng>) -> FolResult<std::sync::MutexGuard<'_, StdRng>> {
    rng.lock()
        .map_err(|_| folerr!(FolErrorKind::State, "random state poisoned"))
}

fn install_random(map: &mut HashMap<String, FunctionCompute>) {
    let rng = Arc::new(Mutex::new(StdRng::from_entropy()));

    let shared = Arc::clone(&rng);
    map.insert(
        "rand".to_string(),
        Box::new(move |_: &EvalContext, _: &[Entity]| Ok(locked_rng(&shared)?.gen::<f64>())),
    );

    let shared = Arc::clone(&rng);
    map.insert(
        "randint".to_string(),
        Box::new(move |ctx: &EvalContext, args: &[Entity]| {
            let lo = arg(ctx, args, 0, "randint")?.floor() as i64;
            let hi = arg(ctx, args, 1, "randint")?.floor() as i64;
            if lo > hi {
                return Err(folerr!(
                    FolErrorKind::Domain,
                    "'randint' needs an ordered range, got {}..{}",
                    lo,
                    hi
                ));
            }
            Ok(locked_rng(&shared)?.gen_range(lo..=hi) as f64)
        }),
    );

    let shared = Arc::clone(&rng);
    map.insert(
        "randrange".to_string(),
        Box::new(move |ctx: &EvalContext, args: &[Entity]| {
            let lo = arg(ctx, args, 0, "randrange")?;
            let hi = arg(ctx, args, 1, "randrange")?;
            if lo >= hi {
                return Err(folerr!(
                    FolErrorKind::Domain,
                    "'randrange' needs an ordered range, got {}..{}",
                    lo,
                    hi
                ));
            }
            Ok(locked_rng(&shared)?.gen_range(lo..hi))
        }),
    );

    let shared = Arc::clone(&rng);
    map.insert(
        "seed".to_string(),
        Box::new(move |ctx: &EvalContext, args: &[Entity]| {
            let s = arg(ctx, args, 0, "seed")?;
            *locked_rng(&shared)? = StdRng::seed_from_u64(s as u64);
            Ok(s)
        }),
    );

    map.insert(
        "noise".to_string(),
        Box::new(move |ctx: &EvalContext, args: &[Entity]| {
            let x = arg(ctx, args, 0, "noise")?;
            Ok(((x * 12.9898 + 78.233).sin() + 1.0) * 0.5)
        }),
    );
}

/// Builds the default function catalog a fresh parser starts with.
pub(crate) fn default_functions() -> HashMap<String, FunctionCompute> {
    let mut map: HashMap<String, FunctionCompute> = HashMap::new();

    constant!(map, "pi", consts::PI);
    constant!(map, "e", consts::E);
    constant!(map, "phi", (1.0 + 5.0_f64.sqrt()) / 2.0);
    constant!(map, "tau", consts::TAU);
    constant!(map, "sqrt2", consts::SQRT_2);
    constant!(map, "sqrt3", 3.0_f64.sqrt());
    constant!(map, "ln2", consts::LN_2);
    constant!(map, "ln10", consts::LN_10);
    constant!(map, "log2e", consts::LOG2_E);
    constant!(map, "log10e", consts::LOG10_E);
    constant!(map, "inf", f64::INFINITY);
    constant!(map, "nan", f64::NAN);

    unary!(map, "abs", |x| x.abs());
    unary!(map, "round", |x| x.round());
    unary!(map, "floor", |x| x.floor());
    unary!(map, "ceil", |x| x.ceil());
    unary!(map, "sqrt", |x| x.sqrt());
    unary!(map, "brt", |x| x.cbrt());
    unary!(map, "exp", |x| x.exp());
    unary!(map, "log", |x| x.ln());
    unary!(map, "log10", |x| x.log10());
    unary!(map, "log2", |x| x.log2());
    unary!(map, "sin", |x| x.sin());
    unary!(map, "cos", |x| x.cos());
    unary!(map, "tan", |x| x.tan());
    unary!(map, "asin", |x| x.asin());
    unary!(map, "acos", |x| x.acos());
    unary!(map, "atan", |x| x.atan());
    unary!(map, "sinh", |x| x.sinh());
    unary!(map, "cosh", |x| x.cosh());
    unary!(map, "tanh", |x| x.tanh());
    unary!(map, "asinh", |x| x.asinh());
    unary!(map, "acosh", |x| x.acosh());
    unary!(map, "atanh", |x| x.atanh());
    unary!(map, "sec", |x| 1.0 / x.cos());
    unary!(map, "csc", |x| 1.0 / x.sin());
    unary!(map, "cot", |x| 1.0 / x.tan());
    unary!(map, "sign", |x| if x == 0.0 { 0.0 } else { x.signum() });
    unary!(map, "normalize", |x| if x == 0.0 { 0.0 } else { x / x.abs() });
    unary!(map, "deg", |x| x.to_degrees());
    unary!(map, "rad", |x| x.to_radians());
    unary!(map, "normalize_angle", |x| x.rem_euclid(consts::TAU));
    unary!(map, "bitnot", |x| !(x as i64) as f64);

    unary!(map, "length", |x| x.abs());

    binary!(map, "mod", |a, b| a % b);
    binary!(map, "pow", |a, b| a.powf(b));
    binary!(map, "atan2", |y, x| y.atan2(x));
    binary!(map, "hypot", |a, b| a.hypot(b));
    binary!(map, "dot", |a, b| a * b);
    binary!(map, "cross", |a, b| a * b);
    binary!(map, "distance", |a, b| (a - b).abs());
    binary!(map, "angle", |x, y| y.atan2(x));
    binary!(map, "nthroot", |x, n| nth_root(x, n));
    binary!(map, "root", |x, n| nth_root(x, n));
    binary!(map, "bitand", |a, b| ((a as i64) & (b as i64)) as f64);
    binary!(map, "bitor", |a, b| ((a as i64) | (b as i64)) as f64);
    binary!(map, "bitxor", |a, b| ((a as i64) ^ (b as i64)) as f64);
    binary!(map, "shl", |a, b| (a as i64).wrapping_shl(b as u32) as f64);
    binary!(map, "shr", |a, b| (a as i64).wrapping_shr(b as u32) as f64);

    ternary!(map, "clamp", |x, lo, hi| x.clamp(lo, hi));
    ternary!(map, "wrap", |x, lo, hi| wrap_value(x, lo, hi));
    ternary!(map, "lerp", |a, b, t| a + (b - a) * t);
    ternary!(map, "mix", |a, b, t| a + (b - a) * t);

    aggregate!(map, "min", |values| values
        .into_iter()
        .fold(f64::INFINITY, f64::min));
    aggregate!(map, "max", |values| values
        .into_iter()
        .fold(f64::NEG_INFINITY, f64::max));
    aggregate!(map, "sum", |values| values.into_iter().sum());
    aggregate!(map, "avg", |values| {
        let n = values.len() as f64;
        values.into_iter().sum::<f64>() / n
    });
    aggregate!(map, "median", median);

    map.insert("fact".to_string(), Box::new(factorial));

    install_random(&mut map);

    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::EvalMode;
    use crate::parser::Parser;

    fn eval(id: &str, args: &[f64]) -> FolResult<f64> {
        let parser = Parser::new();
        let ctx = EvalContext {
            parser: &parser,
            vars: &[],
            mode: EvalMode::OperationOrder,
        };
        let entities: Vec<Entity> = args.iter().map(|&v| Entity::num(v, '+')).collect();
        let map = default_functions();
        map[id](&ctx, &entities)
    }

    #[test]
    fn catalog_spot_checks() {
        assert_eq!(eval("abs", &[-3.0]).unwrap(), 3.0);
        assert_eq!(eval("pi", &[]).unwrap(), consts::PI);
        assert_eq!(eval("pow", &[2.0, 10.0]).unwrap(), 1024.0);
        assert_eq!(eval("min", &[3.0, 1.0, 2.0]).unwrap(), 1.0);
        assert_eq!(eval("median", &[3.0, 1.0, 2.0]).unwrap(), 2.0);
        assert_eq!(eval("fact", &[5.0]).unwrap(), 120.0);
        assert_eq!(eval("clamp", &[5.0, 0.0, 2.0]).unwrap(), 2.0);
        assert_eq!(eval("bitand", &[6.0, 3.0]).unwrap(), 2.0);
        assert_eq!(eval("nthroot", &[-8.0, 3.0]).unwrap(), -2.0);
        assert_eq!(eval("dot", &[3.0, 4.0]).unwrap(), 12.0);
        assert_eq!(eval("length", &[-5.0]).unwrap(), 5.0);
        assert_eq!(eval("distance", &[7.0, 3.0]).unwrap(), 4.0);
        assert_eq!(eval("angle", &[0.0, 1.0]).unwrap(), consts::FRAC_PI_2);
    }

    #[test]
    fn missing_arguments_are_domain_errors() {
        let e = eval("pow", &[2.0]).unwrap_err();
        assert_eq!(e.kind(), FolErrorKind::Domain);
        let e = eval("min", &[]).unwrap_err();
        assert_eq!(e.kind(), FolErrorKind::Domain);
        let e = eval("fact", &[-1.0]).unwrap_err();
        assert_eq!(e.kind(), FolErrorKind::Domain);
    }

    #[test]
    fn seeded_random_is_reproducible() {
        let map = default_functions();
        let parser = Parser::new();
        let ctx = EvalContext {
            parser: &parser,
            vars: &[],
            mode: EvalMode::OperationOrder,
        };
        let seed = [Entity::num(42.0, '+')];
        map["seed"](&ctx, &seed).unwrap();
        let first = map["rand"](&ctx, &[]).unwrap();
        map["seed"](&ctx, &seed).unwrap();
        let second = map["rand"](&ctx, &[]).unwrap();
        assert_eq!(first, second);
        assert!((0.0..1.0).contains(&first));
    }
}
