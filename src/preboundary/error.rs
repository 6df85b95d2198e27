//! Error Types
//!
//! Only the data errors abort a run. Validation, degenerate and constrained
//! conditions are reported through status fields and warning lists instead.

use crate::preboundary::types::DecisionWindow;

/// Errors produced by the allocation core.
#[derive(Debug, Clone, PartialEq)]
pub enum PreboundaryError {
    /// No historical episode exists for the window across the whole population.
    NoHistory { window: DecisionWindow },
    /// Episodes exist, but none yields a usable drift observation.
    NoUsableHistory {
        window: DecisionWindow,
        episodes: usize,
    },
    /// The configuration violates a documented bound.
    InvalidConfig(String),
    /// Scenario validation flagged candidates and the abort policy is active.
    ScenarioValidationFailed {
        window: DecisionWindow,
        warnings: Vec<String>,
    },
}

impl PreboundaryError {
    /// True for the fatal data-error class (no scenarios can be built).
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            Self::NoHistory { .. } | Self::NoUsableHistory { .. }
        )
    }
}

impl std::fmt::Display for PreboundaryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoHistory { window } => {
                write!(f, "no historical episodes for window {}", window)
            }
            Self::NoUsableHistory { window, episodes } => write!(
                f,
                "{} episodes for window {} but none with a positive decision-time denominator",
                episodes, window
            ),
            Self::InvalidConfig(reason) => write!(f, "invalid config: {}", reason),
            Self::ScenarioValidationFailed { window, warnings } => write!(
                f,
                "scenario validation failed for window {} ({} warnings)",
                window,
                warnings.len()
            ),
        }
    }
}

impl std::error::Error for PreboundaryError {}

pub type Result<T> = std::result::Result<T, PreboundaryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_error_classification() {
        assert!(PreboundaryError::NoHistory {
            window: DecisionWindow::Day
        }
        .is_data_error());
        assert!(PreboundaryError::NoUsableHistory {
            window: DecisionWindow::Day,
            episodes: 3
        }
        .is_data_error());
        assert!(!PreboundaryError::InvalidConfig("k_max".into()).is_data_error());
    }

    #[test]
    fn test_display_mentions_window() {
        let err = PreboundaryError::NoHistory {
            window: DecisionWindow::TMinus1,
        };
        assert!(err.to_string().contains("T-1"));
    }
}
