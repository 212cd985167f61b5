//! Minimal 2x2 linear algebra for the closed-form strength engine.

pub type Mat2 = [[f64; 2]; 2];
pub type Vec2 = [f64; 2];

pub fn inv2(m: Mat2) -> Mat2 {
    let mut det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
    if det.abs() < 1e-12 {
        det = 1e-12;
    }
    let inv_det = 1.0 / det;
    [[m[1][1] * inv_det, -m[0][1] * inv_det], [-m[1][0] * inv_det, m[0][0] * inv_det]]
}

pub fn matvec(m: Mat2, v: Vec2) -> Vec2 {
    [m[0][0] * v[0] + m[0][1] * v[1], m[1][0] * v[0] + m[1][1] * v[1]]
}

pub fn dot(a: Vec2, b: Vec2) -> f64 {
    a[0] * b[0] + a[1] * b[1]
}

/// Standard normal CDF via the error function.
pub fn normal_cdf(x: f64, mu: f64, sigma: f64) -> f64 {
    let sigma = sigma.max(1e-9);
    let z = (x - mu) / (sigma * std::f64::consts::SQRT_2);
    0.5 * (1.0 + erf(z))
}

/// 95% CI assuming normality: `mu +- 1.96*sigma`.
pub fn ci95(mu: f64, sigma: f64) -> [f64; 2] {
    let delta = 1.96 * sigma.max(1e-9);
    [round2(mu - delta), round2(mu + delta)]
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn round_n(x: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (x * factor).round() / factor
}

/// Abramowitz & Stegun approximation (7.1.26), accurate to ~1.5e-7 — the
/// standard library has no `erf`, and pulling in a numerics crate for one
/// function would be disproportionate to what this closed-form engine needs.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();
    sign * y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erf_matches_known_values() {
        assert!((erf(0.0)).abs() < 1e-9);
        assert!((erf(1.0) - 0.8427).abs() < 1e-3);
    }

    #[test]
    fn normal_cdf_at_mean_is_one_half() {
        assert!((normal_cdf(5.0, 5.0, 2.0) - 0.5).abs() < 1e-9);
    }
}
