//! Per-category behavior toggles, resolved once at startup.

/// Dataset-category profile controlling input assembly and regularization.
///
/// Categories whose ground truth contains challenging scale outliers get
/// the scale penalties; the same categories carry per-view focal lengths
/// and origin-distance hints that are folded into the predictor input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryProfile {
    pub regularize_scales: bool,
    pub use_focals: bool,
    pub concat_origin_distances: bool,
}

impl CategoryProfile {
    /// Map a category name to its profile. Unknown categories get the
    /// plain profile.
    pub fn resolve(category: &str) -> Self {
        match category {
            "hydrants" | "teddybears" => Self {
                regularize_scales: true,
                use_focals: true,
                concat_origin_distances: true,
            },
            _ => Self {
                regularize_scales: false,
                use_focals: false,
                concat_origin_distances: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outlier_categories_enable_everything() {
        for category in ["hydrants", "teddybears"] {
            let profile = CategoryProfile::resolve(category);
            assert!(profile.regularize_scales);
            assert!(profile.use_focals);
            assert!(profile.concat_origin_distances);
        }
    }

    #[test]
    fn test_other_categories_get_plain_profile() {
        for category in ["cars", "chairs", "objaverse", "nmr", ""] {
            let profile = CategoryProfile::resolve(category);
            assert!(!profile.regularize_scales);
            assert!(!profile.use_focals);
            assert!(!profile.concat_origin_distances);
        }
    }
}
