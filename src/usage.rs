//! Normalized per-node resource usage samples.
//!
//! A [`Usage`] holds six resource readings for one node over one sampling
//! window, each already normalized against its configured maximum (CPU and
//! I/O-wait against 100 %, disk against `server.disk_max`, network against
//! `server.net_max`).  The scalar [`rate`](Usage::rate) derived from a sample
//! is the learning signal fed to the complementarity estimators.

use serde::{Deserialize, Serialize};

/// CPU / I/O-wait fraction above which a node counts as busy.
const IDLE_THRESHOLD: f64 = 0.05;

/// One normalized usage sample for a single node.
///
/// All fields are fractions of the per-resource maximum.  A default-constructed
/// sample is all zeroes, which is also what the sampler reports for hosts that
/// returned no points in the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub cpu: f64,
    pub io_wait: f64,
    pub dsk_read: f64,
    pub dsk_write: f64,
    pub net_recv: f64,
    pub net_sent: f64,
}

impl Usage {
    /// Whether the node did measurable work during the window.
    ///
    /// Idle intervals are excluded from estimator updates so that a node
    /// merely hosting containers does not teach the estimator anything.
    pub fn is_not_idle(&self) -> bool {
        self.cpu > IDLE_THRESHOLD || self.io_wait > IDLE_THRESHOLD
    }

    /// Scalar summary of the sample used as the estimator reward.
    ///
    /// `tanh` saturates the disk and network terms so a streaming job cannot
    /// dominate the signal, and the `exp(-5 * io_wait)` factor dampens
    /// I/O-bound intervals where high throughput does not mean healthy
    /// progress.
    pub fn rate(&self) -> f64 {
        let io = (self.dsk_read + self.dsk_write).tanh() + (self.net_recv + self.net_sent).tanh();
        (1.0 + self.cpu + io * (-5.0 * self.io_wait).exp()).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_usage_is_idle() {
        assert!(!Usage::default().is_not_idle());
    }

    #[test]
    fn idle_threshold_boundaries() {
        let below = Usage {
            cpu: 0.04,
            io_wait: 0.04,
            ..Usage::default()
        };
        assert!(!below.is_not_idle());

        let cpu_above = Usage {
            cpu: 0.06,
            ..Usage::default()
        };
        assert!(cpu_above.is_not_idle());

        let io_above = Usage {
            io_wait: 0.06,
            ..Usage::default()
        };
        assert!(io_above.is_not_idle());
    }

    #[test]
    fn rate_of_idle_node_is_e() {
        // All-zero sample: exp(1 + 0 + 0).
        assert!((Usage::default().rate() - 1.0f64.exp()).abs() < 1e-12);
    }

    #[test]
    fn rate_matches_formula() {
        let u = Usage {
            cpu: 0.5,
            io_wait: 0.2,
            dsk_read: 0.3,
            dsk_write: 0.1,
            net_recv: 0.2,
            net_sent: 0.05,
        };
        let expected =
            (1.0 + 0.5 + (0.4f64.tanh() + 0.25f64.tanh()) * (-1.0f64).exp()).exp();
        assert!((u.rate() - expected).abs() < 1e-12);
    }

    #[test]
    fn io_wait_dampens_the_io_term() {
        let busy_disk = Usage {
            cpu: 0.5,
            dsk_read: 1.0,
            ..Usage::default()
        };
        let busy_disk_waiting = Usage {
            io_wait: 1.0,
            ..busy_disk
        };
        assert!(busy_disk_waiting.rate() < busy_disk.rate());
    }
}
