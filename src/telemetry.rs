//! Decoder for the telemetry stream produced on the pod.
//!
//! The remote status command prints one JSON object per line on stdout.
//! Decoding is pure: a bad line is an error for the caller to log and
//! discard, never a reason to tear down the tunnel.

use serde::Deserialize;

/// One utilization/memory sample from the pod.
///
/// Utilization fields are percentages summed across cores/GPUs and may
/// exceed 100. Memory fields are totals in GB (10^9 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UtilizationSample {
    pub cpu_util: f64,
    pub cpu_mem_gb: f64,
    pub gpu_util: f64,
    pub gpu_mem_gb: f64,
}

impl UtilizationSample {
    /// Decode a single line of the telemetry stream. Unknown or missing
    /// fields are rejected rather than defaulted.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// Whether this sample counts as workload activity.
    pub fn is_active(&self, cpu_threshold: f64, gpu_threshold: f64) -> bool {
        self.cpu_util >= cpu_threshold || self.gpu_util >= gpu_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_line() {
        let sample = UtilizationSample::parse(
            r#"{"cpu_util": 5.0, "gpu_util": 95.0, "cpu_mem_gb": 2.1, "gpu_mem_gb": 10.0}"#,
        )
        .unwrap();
        assert_eq!(sample.cpu_util, 5.0);
        assert_eq!(sample.gpu_util, 95.0);
        assert_eq!(sample.cpu_mem_gb, 2.1);
        assert_eq!(sample.gpu_mem_gb, 10.0);
    }

    #[test]
    fn test_parse_tolerates_surrounding_whitespace() {
        let sample = UtilizationSample::parse(
            " {\"cpu_util\": 0.0, \"cpu_mem_gb\": 0.0, \"gpu_util\": 0.0, \"gpu_mem_gb\": 0.0}\n",
        )
        .unwrap();
        assert_eq!(sample.cpu_util, 0.0);
    }

    #[test]
    fn test_missing_field_rejected() {
        let result =
            UtilizationSample::parse(r#"{"cpu_util": 5.0, "gpu_util": 95.0, "cpu_mem_gb": 2.1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = UtilizationSample::parse(
            r#"{"cpu_util": 5.0, "gpu_util": 95.0, "cpu_mem_gb": 2.1, "gpu_mem_gb": 10.0, "extra": 1}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_line_rejected() {
        assert!(UtilizationSample::parse("ssh: connection banner").is_err());
        assert!(UtilizationSample::parse("").is_err());
    }

    #[test]
    fn test_utilization_may_exceed_100() {
        let sample = UtilizationSample::parse(
            r#"{"cpu_util": 640.0, "gpu_util": 380.0, "cpu_mem_gb": 50.0, "gpu_mem_gb": 120.0}"#,
        )
        .unwrap();
        assert!(sample.is_active(50.0, 10.0));
    }

    #[test]
    fn test_activity_thresholds() {
        let sample = UtilizationSample::parse(
            r#"{"cpu_util": 5.0, "gpu_util": 95.0, "cpu_mem_gb": 2.1, "gpu_mem_gb": 10.0}"#,
        )
        .unwrap();

        // GPU crosses its threshold even though CPU does not
        assert!(sample.is_active(50.0, 80.0));
        // Neither crosses
        assert!(!sample.is_active(50.0, 96.0));
        // Threshold is inclusive
        assert!(sample.is_active(5.0, 96.0));
    }
}
