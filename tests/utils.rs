#![allow(dead_code)]

pub fn assert_float_eq_f64(x: f64, y: f64) {
    let tol = 1e-12 * x.abs().max(y.abs()).max(1.0);
    assert!((x - y).abs() <= tol, "{} and {} are not close", x, y);
}
