//! Composite health score computation.
//!
//! The score blends three signals observed per relay:
//! - latency (rolling average of recent request latencies)
//! - success rate (recent request outcomes)
//! - connection stability (clean connects vs unexpected closes)

/// Weight for the latency component of the composite score.
const LATENCY_WEIGHT: f64 = 0.4;

/// Weight for the success-rate component.
const SUCCESS_WEIGHT: f64 = 0.4;

/// Weight for the connection-stability component.
const STABILITY_WEIGHT: f64 = 0.2;

/// Score assumed for endpoints without enough samples to judge.
///
/// New relays start neutral rather than unhealthy so a fresh endpoint is not
/// disqualified before it has been tried.
pub const DEFAULT_SCORE: f64 = 0.5;

/// Stability delta applied on a clean connect.
pub const STABILITY_CONNECT_BONUS: f64 = 0.1;

/// Stability delta applied on an unexpected close.
pub const STABILITY_DISCONNECT_PENALTY: f64 = 0.25;

/// Inputs for score computation, snapshotted from an endpoint's windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreInputs {
    /// Rolling average latency in milliseconds, if any samples exist.
    pub avg_latency_ms: Option<f64>,
    /// Success rate over the outcome window (0.0 - 1.0), if any samples exist.
    pub success_rate: Option<f64>,
    /// Connection stability (0.0 - 1.0).
    pub stability: f64,
}

/// Compute the composite health score for one endpoint.
///
/// `latency_score = max(0, 1 - avg_latency / max_latency)`; a missing
/// component scores neutral (0.5) so a relay probed only one way is not
/// punished for the signal it has no samples for.
pub fn composite_score(inputs: &ScoreInputs, max_latency_ms: f64) -> f64 {
    let latency_score = match inputs.avg_latency_ms {
        Some(avg) if max_latency_ms > 0.0 => (1.0 - avg / max_latency_ms).max(0.0),
        _ => DEFAULT_SCORE,
    };

    let success_score = inputs.success_rate.unwrap_or(DEFAULT_SCORE).clamp(0.0, 1.0);
    let stability = inputs.stability.clamp(0.0, 1.0);

    latency_score * LATENCY_WEIGHT + success_score * SUCCESS_WEIGHT + stability * STABILITY_WEIGHT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_healthy_endpoint() {
        let inputs = ScoreInputs {
            avg_latency_ms: Some(50.0),
            success_rate: Some(1.0),
            stability: 1.0,
        };
        let score = composite_score(&inputs, 3000.0);
        // (1 - 50/3000)*0.4 + 1.0*0.4 + 1.0*0.2 = 0.99333...
        assert!((score - 0.99333).abs() < 0.001);
    }

    #[test]
    fn test_score_failing_endpoint() {
        let inputs = ScoreInputs {
            avg_latency_ms: Some(2500.0),
            success_rate: Some(0.2),
            stability: 0.3,
        };
        let score = composite_score(&inputs, 3000.0);
        // (1 - 2500/3000)*0.4 + 0.2*0.4 + 0.3*0.2 = 0.20666...
        assert!((score - 0.20666).abs() < 0.001);
        assert!(score < DEFAULT_SCORE);
    }

    #[test]
    fn test_latency_floor_at_zero() {
        let inputs = ScoreInputs {
            avg_latency_ms: Some(10_000.0),
            success_rate: Some(1.0),
            stability: 1.0,
        };
        // Latency beyond the budget contributes zero, not negative.
        let score = composite_score(&inputs, 3000.0);
        assert!((score - 0.6).abs() < 0.001);
    }

    #[test]
    fn test_missing_components_score_neutral() {
        let inputs = ScoreInputs {
            avg_latency_ms: None,
            success_rate: None,
            stability: 0.5,
        };
        let score = composite_score(&inputs, 3000.0);
        assert!((score - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_zero_max_latency_does_not_divide() {
        let inputs = ScoreInputs {
            avg_latency_ms: Some(100.0),
            success_rate: Some(1.0),
            stability: 1.0,
        };
        let score = composite_score(&inputs, 0.0);
        // Latency component falls back to neutral
        assert!((score - (0.5 * 0.4 + 0.4 + 0.2)).abs() < 0.001);
    }
}
