use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Data-quality accounting for one transform run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformReport {
    pub raw_records: usize,
    pub kept: usize,
    /// Records without a usable location id or timestamp.
    pub dropped_missing_required: usize,
    pub duplicates_removed: usize,
    pub records_with_violations: usize,
    /// Non-coercible values nulled, per column.
    pub nulled_fields: BTreeMap<String, usize>,
    pub violation_fraction: f64,
    pub unknown_fields: BTreeSet<String>,
}

impl TransformReport {
    pub fn total_nulled(&self) -> usize {
        self.nulled_fields.values().sum()
    }

    pub fn generate_summary(&self) -> String {
        let pct = |n: usize| {
            if self.raw_records == 0 {
                0.0
            } else {
                100.0 * n as f64 / self.raw_records as f64
            }
        };

        let mut summary = String::new();
        summary.push_str("=== Transform Report ===\n");
        summary.push_str(&format!("Raw Records: {}\n", self.raw_records));
        summary.push_str(&format!(
            "Kept Records: {} ({:.1}%)\n",
            self.kept,
            pct(self.kept)
        ));
        summary.push_str(&format!(
            "Dropped (missing location/timestamp): {}\n",
            self.dropped_missing_required
        ));
        summary.push_str(&format!("Duplicates Removed: {}\n", self.duplicates_removed));
        summary.push_str(&format!(
            "Records With Violations: {} ({:.1}%)\n",
            self.records_with_violations,
            self.violation_fraction * 100.0
        ));

        if !self.nulled_fields.is_empty() {
            summary.push_str("\nNulled Fields:\n");
            for (column, count) in &self.nulled_fields {
                summary.push_str(&format!("  {column}: {count}\n"));
            }
        }

        if !self.unknown_fields.is_empty() {
            summary.push_str(&format!(
                "\nUnknown Provider Fields ({}): {}\n",
                self.unknown_fields.len(),
                self.unknown_fields
                    .iter()
                    .take(20)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_mentions_counts() {
        let mut report = TransformReport {
            raw_records: 100,
            kept: 97,
            dropped_missing_required: 3,
            records_with_violations: 5,
            violation_fraction: 0.05,
            ..Default::default()
        };
        report.nulled_fields.insert("humidity".into(), 5);
        report.unknown_fields.insert("rain.3h".into());

        let summary = report.generate_summary();
        assert!(summary.contains("Kept Records: 97 (97.0%)"));
        assert!(summary.contains("Dropped (missing location/timestamp): 3"));
        assert!(summary.contains("humidity: 5"));
        assert!(summary.contains("rain.3h"));
        assert_eq!(report.total_nulled(), 5);
    }

    #[test]
    fn test_empty_report_summary() {
        let summary = TransformReport::default().generate_summary();
        assert!(summary.contains("Raw Records: 0"));
        assert!(!summary.contains("Nulled Fields"));
    }
}
