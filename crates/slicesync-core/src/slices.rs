//! Known slices
//!
//! The fixed set of slice keys the application stores remotely. Account
//! deletion removes exactly these documents.

use serde::{Deserialize, Serialize};

use crate::keys::SliceKey;

pub const PROFILE: &str = "profile";
pub const GLUCOSE: &str = "glucose";
pub const MEDICATIONS: &str = "medications";
pub const MEALS: &str = "meals";
pub const EXAMS: &str = "exams";
pub const CONTACTS: &str = "contacts";
pub const SCHEDULES: &str = "schedules";
pub const DASHBOARD_CONFIG: &str = "dashboard-config";

/// Every slice with a remote document
pub const KNOWN_SLICES: [&str; 8] = [
    PROFILE,
    GLUCOSE,
    MEDICATIONS,
    MEALS,
    EXAMS,
    CONTACTS,
    SCHEDULES,
    DASHBOARD_CONFIG,
];

/// [`KNOWN_SLICES`] as validated keys
pub fn known_slices() -> Vec<SliceKey> {
    KNOWN_SLICES
        .iter()
        .filter_map(|name| SliceKey::new(*name).ok())
        .collect()
}

/// Glucose range shown on the dashboard, in mg/dL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardConfig {
    pub low_threshold: u32,
    pub high_threshold: u32,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            low_threshold: 70,
            high_threshold: 180,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_known_slices_are_valid_keys() {
        assert_eq!(known_slices().len(), KNOWN_SLICES.len());
    }

    #[test]
    fn test_dashboard_config_wire_shape() {
        let value = serde_json::to_value(DashboardConfig::default()).unwrap();
        assert_eq!(value, json!({"lowThreshold": 70, "highThreshold": 180}));
    }
}
