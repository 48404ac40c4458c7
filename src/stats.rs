//! Student's-t quantile for the 95% confidence intervals in
//! [`crate::fit_workspace`] (spec §4.11). No distribution/statistics
//! crate exists anywhere in this workspace's stack, so — same call as
//! [`crate::derivative_queue`]'s worker pool — this is implemented
//! directly: a Lanczos `ln_gamma`, Lentz's continued fraction for the
//! regularized incomplete beta function, and a bisection search for the
//! quantile itself.

const LANCZOS_G: f64 = 7.0;
const LANCZOS_COEFFS: [f64; 9] = [
    0.999_999_999_999_809_93,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_13,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
];

/// Natural log of the gamma function, via the Lanczos approximation.
/// Accurate to ~15 significant digits for `x > 0`.
fn ln_gamma(x: f64) -> f64 {
    if x < 0.5 {
        // reflection formula: Gamma(x)Gamma(1-x) = pi / sin(pi x)
        (std::f64::consts::PI / (std::f64::consts::PI * x).sin()).ln() - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut a = LANCZOS_COEFFS[0];
        let t = x + LANCZOS_G + 0.5;
        for (i, &c) in LANCZOS_COEFFS.iter().enumerate().skip(1) {
            a += c / (x + i as f64);
        }
        0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + a.ln()
    }
}

/// Continued fraction for the regularized incomplete beta function,
/// Lentz's algorithm (Numerical Recipes §6.4).
fn beta_cf(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 200;
    const EPS: f64 = 1e-14;
    const TINY: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < TINY {
        d = TINY;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m_f = m as f64;
        let m2 = 2.0 * m_f;

        let aa = m_f * (b - m_f) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m_f) * (qab + m_f) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;

        if (del - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// The regularized incomplete beta function `I_x(a, b)`.
fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front =
        ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_cf(a, b, x) / a
    } else {
        1.0 - front * beta_cf(b, a, 1.0 - x) / b
    }
}

/// Two-sided CDF of the Student's-t distribution with `dof` degrees of
/// freedom, `P(T <= t)`.
pub fn student_t_cdf(t: f64, dof: f64) -> f64 {
    if dof <= 0.0 {
        return f64::NAN;
    }
    let x = dof / (dof + t * t);
    let ib = regularized_incomplete_beta(dof / 2.0, 0.5, x);
    if t >= 0.0 {
        1.0 - 0.5 * ib
    } else {
        0.5 * ib
    }
}

/// The quantile (inverse CDF) of the Student's-t distribution: the
/// value `t` such that `student_t_cdf(t, dof) == p`, found by
/// bisection. `p` must be in `(0, 1)`; `dof` must be positive.
pub fn student_t_quantile(p: f64, dof: f64) -> f64 {
    if dof <= 0.0 || !(0.0..1.0).contains(&p) {
        return f64::NAN;
    }
    if (p - 0.5).abs() < 1e-15 {
        return 0.0;
    }

    let mut lo = -1.0e6;
    let mut hi = 1.0e6;
    // grow the bracket until the CDF straddles p, rather than assuming
    // the fixed range always suffices for very small dof.
    while student_t_cdf(lo, dof) > p {
        lo *= 2.0;
    }
    while student_t_cdf(hi, dof) < p {
        hi *= 2.0;
    }

    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if student_t_cdf(mid, dof) < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-10 * (1.0 + hi.abs()) {
            break;
        }
    }
    0.5 * (lo + hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ln_gamma_matches_known_factorials() {
        // Gamma(n+1) = n!
        assert!((ln_gamma(1.0).exp() - 1.0).abs() < 1e-9);
        assert!((ln_gamma(5.0).exp() - 24.0).abs() < 1e-7);
        assert!((ln_gamma(10.0).exp() - 362_880.0).abs() < 1e-2);
    }

    #[test]
    fn test_student_t_cdf_is_half_at_zero() {
        assert!((student_t_cdf(0.0, 10.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_student_t_quantile_matches_known_table_values() {
        // standard two-sided 95% critical values from a t-table
        assert!((student_t_quantile(0.975, 10.0) - 2.228).abs() < 1e-3);
        assert!((student_t_quantile(0.975, 30.0) - 2.042).abs() < 1e-3);
        assert!((student_t_quantile(0.975, 1.0) - 12.706).abs() < 1e-2);
    }

    #[test]
    fn test_student_t_quantile_converges_to_normal_at_large_dof() {
        // the normal 97.5% quantile is 1.95996...
        let t = student_t_quantile(0.975, 10_000.0);
        assert!((t - 1.95996).abs() < 1e-2);
    }

    #[test]
    fn test_quantile_and_cdf_are_inverses() {
        let t = student_t_quantile(0.9, 7.0);
        let p = student_t_cdf(t, 7.0);
        assert!((p - 0.9).abs() < 1e-6);
    }
}
