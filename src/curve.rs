// SPDX-License-Identifier: MIT OR Apache-2.0

//! Slider-to-factor mapping.
//!
//! [`ScaleMode::Real`] passes the slider value through unchanged.
//! [`ScaleMode::Soft`] eases it through a [`SoftCurve`]: a quadratic
//! reduction below the neutral point and a square-root boost above it, so
//! that pulling a slider down is expressive while pushing it up saturates
//! quickly.
//!
//! ```text
//!   v < n :  n - k_down * (n - v)^2      (floored at 0)
//!   v > n :  n + k_up   * (v - n)^p
//! ```
//!
//! | Sensitivity | `n` | `k_down` | `k_up` | `p` | factor at 0.0 | factor at 2.0 |
//! |-------------|-----|----------|--------|-----|---------------|---------------|
//! | standard | 1.0 | 1.0 | 0.2 | 0.5 | 0.0 | 1.2 |
//! | conservative | 1.0 | 0.2 | 0.1 | 0.5 | 0.8 | 1.1 |

use crate::config::{ScaleMode, Sensitivity};

/// Constants of the soft-mode easing curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftCurve {
    /// Slider value that maps to itself.
    pub neutral: f64,
    /// Quadratic coefficient of the reduction branch.
    pub k_down: f64,
    /// Coefficient of the boost branch.
    pub k_up: f64,
    /// Exponent of the boost branch; below 1 for sub-linear growth.
    pub exponent: f64,
}

impl SoftCurve {
    /// Curve for diffusion-model weights.
    pub const STANDARD: Self = Self {
        neutral: 1.0,
        k_down: 1.0,
        k_up: 0.2,
        exponent: 0.5,
    };

    /// Curve for text-encoder weights: the factor stays within `[0.8, 1.1]`
    /// for sliders in `[0, 2]`.
    pub const CONSERVATIVE: Self = Self {
        neutral: 1.0,
        k_down: 0.2,
        k_up: 0.1,
        exponent: 0.5,
    };

    /// Curve constants for a sensitivity level.
    #[must_use]
    pub const fn for_sensitivity(sensitivity: Sensitivity) -> Self {
        match sensitivity {
            Sensitivity::Standard => Self::STANDARD,
            Sensitivity::Conservative => Self::CONSERVATIVE,
        }
    }

    /// Evaluate the curve.
    #[must_use]
    pub fn eval(&self, slider: f64) -> f64 {
        let n = self.neutral;
        if slider < n {
            let delta = n - slider;
            // Never flip the sign of a weight.
            (n - self.k_down * delta * delta).max(0.0)
        } else if slider > n {
            n + self.k_up * (slider - n).powf(self.exponent)
        } else {
            // Exactly neutral, or NaN: pass through.
            slider
        }
    }
}

/// Map a slider value to a multiplicative scale factor.
///
/// `compute_scale(1.0, _, _) == 1.0` for every mode and sensitivity.
/// Non-finite inputs propagate unchanged; the injector rejects them before
/// touching any tensor.
#[must_use]
pub fn compute_scale(slider: f64, mode: ScaleMode, sensitivity: Sensitivity) -> f64 {
    match mode {
        ScaleMode::Real => slider,
        ScaleMode::Soft => SoftCurve::for_sensitivity(sensitivity).eval(slider),
    }
}
