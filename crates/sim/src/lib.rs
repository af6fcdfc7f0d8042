//! Lossy-link simulation for fpvlink

pub mod scenarios;

use fpvlink_radio::LinkConditions;

pub struct SimulationPresets;

impl SimulationPresets {
    pub fn good_conditions() -> LinkConditions {
        LinkConditions { packet_loss: 0.05, ..LinkConditions::default() }
    }

    pub fn average_conditions() -> LinkConditions {
        LinkConditions { packet_loss: 0.15, ..LinkConditions::default() }
    }

    pub fn poor_conditions() -> LinkConditions {
        LinkConditions { packet_loss: 0.30, corruption: 0.01, ..LinkConditions::default() }
    }

    /// Flying at the edge of range behind obstacles.
    pub fn extreme_conditions() -> LinkConditions {
        LinkConditions { packet_loss: 0.50, corruption: 0.05, ..LinkConditions::default() }
    }

    pub fn all() -> Vec<(&'static str, LinkConditions)> {
        vec![
            ("Good", Self::good_conditions()),
            ("Average", Self::average_conditions()),
            ("Poor", Self::poor_conditions()),
            ("Extreme", Self::extreme_conditions()),
        ]
    }
}
