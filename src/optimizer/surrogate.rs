//! One-dimensional Gaussian-process surrogate with Expected Improvement.
//!
//! Observations are per-value hit rates. The kernel is a squared
//! exponential around a prior mean of 0.5; each observation carries its own
//! binomial noise variance, so a value shot ten times pulls the posterior
//! harder than a value shot once.

use super::history::ValueGroup;

/// Prior mean of the hit-rate surface.
const PRIOR_MEAN: f64 = 0.5;
/// Prior variance of the hit-rate surface.
const SIGNAL_VARIANCE: f64 = 0.25;
/// Diagonal jitter keeping the Gram matrix positive definite.
const JITTER: f64 = 1e-9;

/// Fitted surrogate.
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    xs: Vec<f64>,
    alpha: Vec<f64>,
    chol: Vec<f64>,
    length_scale: f64,
}

impl GaussianProcess {
    /// Fit to value groups. `None` when there is nothing to fit or the Gram
    /// matrix is numerically unusable.
    pub fn fit(groups: &[ValueGroup], length_scale: f64) -> Option<Self> {
        if groups.is_empty() || !(length_scale > 0.0) || !length_scale.is_finite() {
            return None;
        }
        let n = groups.len();
        let xs: Vec<f64> = groups.iter().map(|g| g.value).collect();
        let ys: Vec<f64> = groups.iter().map(|g| g.rate() - PRIOR_MEAN).collect();

        let mut gram = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                gram[i * n + j] = kernel(xs[i], xs[j], length_scale);
            }
            gram[i * n + i] += observation_noise(&groups[i]) + JITTER;
        }
        let chol = cholesky(&gram, n)?;
        let z = forward_substitute(&chol, n, &ys);
        let alpha = backward_substitute(&chol, n, &z);
        if alpha.iter().any(|a| !a.is_finite()) {
            return None;
        }
        Some(Self {
            xs,
            alpha,
            chol,
            length_scale,
        })
    }

    /// Posterior mean and standard deviation at `x`.
    pub fn predict(&self, x: f64) -> (f64, f64) {
        let n = self.xs.len();
        let k_star: Vec<f64> = self
            .xs
            .iter()
            .map(|&xi| kernel(x, xi, self.length_scale))
            .collect();
        let mean = PRIOR_MEAN
            + k_star
                .iter()
                .zip(&self.alpha)
                .map(|(k, a)| k * a)
                .sum::<f64>();
        let v = forward_substitute(&self.chol, n, &k_star);
        let var = (SIGNAL_VARIANCE - v.iter().map(|vi| vi * vi).sum::<f64>()).max(0.0);
        (mean, var.sqrt())
    }
}

/// Squared-exponential kernel.
fn kernel(a: f64, b: f64, length_scale: f64) -> f64 {
    let d = (a - b) / length_scale;
    SIGNAL_VARIANCE * (-0.5 * d * d).exp()
}

/// Binomial variance of a group's hit rate, with a Laplace-smoothed rate so
/// all-hit and all-miss groups keep some uncertainty.
fn observation_noise(group: &ValueGroup) -> f64 {
    let n = f64::from(group.shots.max(1));
    let p = (f64::from(group.hits) + 1.0) / (n + 2.0);
    p * (1.0 - p) / n
}

/// Expected Improvement of a posterior `(mean, std)` over `best`.
///
/// `xi` trades exploration against exploitation.
pub fn expected_improvement(mean: f64, std: f64, best: f64, xi: f64) -> f64 {
    let improvement = mean - best - xi;
    if std < 1e-12 {
        return improvement.max(0.0);
    }
    let z = improvement / std;
    (improvement * normal_cdf(z) + std * normal_pdf(z)).max(0.0)
}

/// Approximate the standard normal CDF using the Abramowitz & Stegun
/// rational approximation (max error 7.5e-8).
///
/// # Panics
/// This function never panics.
pub fn normal_cdf(x: f64) -> f64 {
    if x < -8.0 {
        return 0.0;
    }
    if x > 8.0 {
        return 1.0;
    }
    let t = 1.0 / (1.0 + 0.2316419 * x.abs());
    let p = normal_pdf(x)
        * (t * (0.3193815 + t * (-0.3565638 + t * (1.781478 + t * (-1.8212560 + t * 1.3302744)))));
    if x > 0.0 {
        1.0 - p
    } else {
        p
    }
}

/// Standard normal density.
pub fn normal_pdf(x: f64) -> f64 {
    0.3989422804014327 * (-x * x / 2.0).exp() // 1/sqrt(2*pi)
}

/// Lower-triangular Cholesky factor of a row-major `n×n` matrix.
fn cholesky(a: &[f64], n: usize) -> Option<Vec<f64>> {
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if !(sum > 0.0) || !sum.is_finite() {
                    return None;
                }
                l[i * n + i] = sum.sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }
    Some(l)
}

/// Solve `L z = b`.
fn forward_substitute(l: &[f64], n: usize, b: &[f64]) -> Vec<f64> {
    let mut z = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[i * n + k] * z[k];
        }
        z[i] = sum / l[i * n + i];
    }
    z
}

/// Solve `Lᵀ x = z`.
fn backward_substitute(l: &[f64], n: usize, z: &[f64]) -> Vec<f64> {
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = z[i];
        for k in (i + 1)..n {
            sum -= l[k * n + i] * x[k];
        }
        x[i] = sum / l[i * n + i];
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(value: f64, hits: u32, shots: u32) -> ValueGroup {
        ValueGroup { value, hits, shots }
    }

    #[test]
    fn test_normal_cdf_known_points() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-3);
        assert_eq!(normal_cdf(-9.0), 0.0);
        assert_eq!(normal_cdf(9.0), 1.0);
    }

    #[test]
    fn test_cholesky_solves_small_system() {
        let a = [4.0, 2.0, 2.0, 3.0];
        let l = cholesky(&a, 2).expect("test: positive definite");
        let z = forward_substitute(&l, 2, &[2.0, 1.0]);
        let x = backward_substitute(&l, 2, &z);
        // A x = b
        assert!((4.0 * x[0] + 2.0 * x[1] - 2.0).abs() < 1e-12);
        assert!((2.0 * x[0] + 3.0 * x[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        assert!(cholesky(&[1.0, 2.0, 2.0, 1.0], 2).is_none());
    }

    #[test]
    fn test_fit_empty_is_none() {
        assert!(GaussianProcess::fit(&[], 1.0).is_none());
        assert!(GaussianProcess::fit(&[group(1.0, 1, 1)], 0.0).is_none());
    }

    #[test]
    fn test_posterior_follows_data_and_reverts_far_away() {
        let gp = GaussianProcess::fit(&[group(0.0, 10, 10), group(1.0, 0, 10)], 0.5)
            .expect("test: fit");
        let (m0, s0) = gp.predict(0.0);
        let (m1, _) = gp.predict(1.0);
        let (far, s_far) = gp.predict(50.0);
        assert!(m0 > 0.8);
        assert!(m1 < 0.2);
        assert!((far - PRIOR_MEAN).abs() < 1e-6);
        assert!(s_far > s0);
    }

    #[test]
    fn test_expected_improvement_properties() {
        assert_eq!(expected_improvement(0.4, 0.0, 0.5, 0.0), 0.0);
        assert!((expected_improvement(0.7, 0.0, 0.5, 0.0) - 0.2).abs() < 1e-12);
        let narrow = expected_improvement(0.5, 0.01, 0.5, 0.0);
        let wide = expected_improvement(0.5, 0.3, 0.5, 0.0);
        assert!(wide > narrow);
        assert!(expected_improvement(0.0, 0.5, 1.0, 0.01) >= 0.0);
    }
}
