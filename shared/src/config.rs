use crate::Vec3;
use serde::{Deserialize, Serialize};

/// How many rescue targets must be secured to win.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub enum RequiredSecured {
    Fixed(u32),
    /// Inclusive range, rolled once by the authority at match start.
    Range { min: u32, max: u32 },
}

/// Axis-aligned box.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Zone {
    pub min: Vec3,
    pub max: Vec3,
}

impl Zone {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }
}

/// Values fixed at session creation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SessionConfig {
    pub max_peers: usize,
    pub required_secured: RequiredSecured,
    pub match_duration_secs: f32,
    /// Skips the lobby ready-check and never times the match out.
    pub testing_mode: bool,
    pub rescue_target_count: u32,
    pub connect_duration_secs: f32,
    pub interact_cooldown_secs: f32,
    pub max_health: f32,
    pub goal_zone: Zone,
    pub spawn_area: Zone,
    pub kill_plane_y: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_peers: 3,
            required_secured: RequiredSecured::Range { min: 2, max: 4 },
            match_duration_secs: 300.0,
            testing_mode: false,
            rescue_target_count: 4,
            connect_duration_secs: 15.0,
            interact_cooldown_secs: 5.0,
            max_health: 100.0,
            goal_zone: Zone::new(Vec3::new(-10.0, -5.0, 40.0), Vec3::new(10.0, 10.0, 60.0)),
            spawn_area: Zone::new(Vec3::new(-20.0, 0.0, -20.0), Vec3::new(20.0, 0.0, 20.0)),
            kill_plane_y: -30.0,
        }
    }
}

impl SessionConfig {
    /// Clamps values into the ranges the session logic supports.
    pub fn sanitized(mut self) -> Self {
        self.max_peers = self.max_peers.max(1);
        if let RequiredSecured::Range { min, max } = self.required_secured {
            if min > max {
                self.required_secured = RequiredSecured::Range { min: max, max: min };
            }
        }
        self.match_duration_secs = self.match_duration_secs.max(0.0);
        self.connect_duration_secs = self.connect_duration_secs.max(0.0);
        self.interact_cooldown_secs = self.interact_cooldown_secs.max(0.0);
        self.max_health = self.max_health.max(1.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_contains() {
        let zone = Zone::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(10.0, 10.0, 10.0));
        assert!(zone.contains(Vec3::new(5.0, 5.0, 5.0)));
        assert!(zone.contains(Vec3::new(10.0, 0.0, 0.0)));
        assert!(!zone.contains(Vec3::new(10.1, 5.0, 5.0)));
        assert!(!zone.contains(Vec3::new(5.0, -0.1, 5.0)));
    }

    #[test]
    fn test_sanitized_swaps_inverted_range() {
        let config = SessionConfig {
            required_secured: RequiredSecured::Range { min: 5, max: 2 },
            max_peers: 0,
            max_health: -3.0,
            ..SessionConfig::default()
        }
        .sanitized();

        assert_eq!(
            config.required_secured,
            RequiredSecured::Range { min: 2, max: 5 }
        );
        assert_eq!(config.max_peers, 1);
        assert_eq!(config.max_health, 1.0);
    }

    #[test]
    fn test_default_connect_duration() {
        let config = SessionConfig::default();
        assert_eq!(config.connect_duration_secs, 15.0);
        assert!(!config.testing_mode);
    }
}
