//! Seeding profiles: named bundles of caps, probabilities and cadences.
//!
//! A profile is validated as a whole before any part of it is applied, so a
//! rejected profile leaves sessions, shaper and connection caps untouched.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::{ConfigurationError, check_probability};
use crate::peer::{ConnectionBehavior, PeerConnectionManager};
use crate::shaper::SpeedShaper;
use crate::torrent::TorrentSession;

const KIB: u64 = 1024;
/// Shortest announce interval a profile may ask for.
pub const MIN_PROFILE_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

/// Behavior bundle applied to a torrent session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeedingProfile {
    pub name: String,
    /// Upload cap in bytes per second, 0 for unlimited
    pub upload_speed: u64,
    /// Download cap in bytes per second, 0 for unlimited
    pub download_speed: u64,
    pub max_connections: usize,
    pub announce_interval: Duration,
    /// Chance per peer tick that a connection toggles idle
    pub idle_probability: f64,
    /// Chance per report that speed spikes by the burst multiplier
    pub burst_probability: f64,
    /// Chance per peer tick that a `have` is sent
    pub have_probability: f64,
    /// Fraction of pieces advertised in the bitfield
    pub completion: f64,
}

impl SeedingProfile {
    pub fn conservative() -> Self {
        Self {
            name: "conservative".to_string(),
            upload_speed: 50 * KIB,
            download_speed: 10 * KIB,
            max_connections: 10,
            announce_interval: Duration::from_secs(3600),
            idle_probability: 0.4,
            burst_probability: 0.02,
            have_probability: 0.01,
            completion: 1.0,
        }
    }

    pub fn balanced() -> Self {
        Self {
            name: "balanced".to_string(),
            upload_speed: 200 * KIB,
            download_speed: 50 * KIB,
            max_connections: 30,
            announce_interval: Duration::from_secs(1800),
            idle_probability: 0.2,
            burst_probability: 0.05,
            have_probability: 0.05,
            completion: 1.0,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            name: "aggressive".to_string(),
            upload_speed: 0,
            download_speed: 0,
            max_connections: 80,
            announce_interval: Duration::from_secs(900),
            idle_probability: 0.05,
            burst_probability: 0.15,
            have_probability: 0.1,
            completion: 1.0,
        }
    }

    /// A user-defined bundle starting from `balanced` values.
    pub fn custom(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::balanced()
        }
    }

    /// Looks up a preset by name.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError::InvalidProfile` - No preset has that name
    pub fn by_name(name: &str) -> Result<Self, ConfigurationError> {
        match name {
            "conservative" => Ok(Self::conservative()),
            "balanced" => Ok(Self::balanced()),
            "aggressive" => Ok(Self::aggressive()),
            other => Err(ConfigurationError::InvalidProfile {
                name: other.to_string(),
                reason: "unknown preset (expected conservative, balanced or aggressive)"
                    .to_string(),
            }),
        }
    }

    /// Checks every field.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError::InvalidRange` - A probability or fraction out of range
    /// - `ConfigurationError::InvalidProfile` - Zero connections or too-short interval
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        check_probability("profile.idle_probability", self.idle_probability)?;
        check_probability("profile.burst_probability", self.burst_probability)?;
        check_probability("profile.have_probability", self.have_probability)?;
        if !(self.completion > 0.0 && self.completion <= 1.0) {
            return Err(ConfigurationError::InvalidRange {
                field: "profile.completion",
                reason: format!("must be within (0, 1], got {}", self.completion),
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigurationError::InvalidProfile {
                name: self.name.clone(),
                reason: "max_connections must be greater than zero".to_string(),
            });
        }
        if self.announce_interval < MIN_PROFILE_ANNOUNCE_INTERVAL {
            return Err(ConfigurationError::InvalidProfile {
                name: self.name.clone(),
                reason: format!(
                    "announce interval {:?} is below {:?}",
                    self.announce_interval, MIN_PROFILE_ANNOUNCE_INTERVAL
                ),
            });
        }
        Ok(())
    }

    /// Per-tick connection behavior derived from this profile.
    pub fn connection_behavior(&self) -> ConnectionBehavior {
        ConnectionBehavior {
            idle_probability: self.idle_probability,
            have_probability: self.have_probability,
        }
    }
}

/// Applies profiles to sessions and the components that enforce them.
pub struct SeedingProfileEngine {
    shaper: Arc<SpeedShaper>,
    connections: Arc<PeerConnectionManager>,
    default_profile: SeedingProfile,
}

impl SeedingProfileEngine {
    /// # Errors
    ///
    /// Propagates validation errors of `default_profile`.
    pub fn new(
        shaper: Arc<SpeedShaper>,
        connections: Arc<PeerConnectionManager>,
        default_profile: SeedingProfile,
    ) -> Result<Self, ConfigurationError> {
        default_profile.validate()?;
        Ok(Self {
            shaper,
            connections,
            default_profile,
        })
    }

    /// Profile given to sessions added from now on.
    pub fn default_profile(&self) -> &SeedingProfile {
        &self.default_profile
    }

    /// Applies `profile` to one session.
    ///
    /// Caps are staged in the shaper and take effect on its next refill; the
    /// connection cap governs future admissions only; the announce interval
    /// is picked up when the next announce is scheduled. No connection is
    /// closed.
    ///
    /// # Errors
    ///
    /// Any validation error; nothing is changed in that case.
    pub fn apply(
        &self,
        session: &mut TorrentSession,
        profile: SeedingProfile,
    ) -> Result<(), ConfigurationError> {
        profile.validate()?;
        self.install(session, profile);
        Ok(())
    }

    /// Applies `profile` to every session and makes it the default.
    ///
    /// # Errors
    ///
    /// Any validation error; no session is changed in that case.
    pub fn apply_global<'a>(
        &mut self,
        sessions: impl IntoIterator<Item = &'a mut TorrentSession>,
        profile: SeedingProfile,
    ) -> Result<usize, ConfigurationError> {
        profile.validate()?;
        let mut applied = 0;
        for session in sessions {
            self.install(session, profile.clone());
            applied += 1;
        }
        tracing::info!("Profile '{}' applied globally to {applied} sessions", profile.name);
        self.default_profile = profile;
        Ok(applied)
    }

    fn install(&self, session: &mut TorrentSession, profile: SeedingProfile) {
        let info_hash = session.info_hash();
        self.shaper
            .set_torrent_caps(&info_hash, profile.upload_speed, profile.download_speed);
        self.connections
            .set_torrent_cap(&info_hash, profile.max_connections);
        tracing::info!(
            info_hash = %info_hash,
            "Profile '{}' applied: up {} B/s, down {} B/s, {} connections",
            profile.name,
            profile.upload_speed,
            profile.download_speed,
            profile.max_connections
        );
        session.set_profile(profile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for name in ["conservative", "balanced", "aggressive"] {
            let profile = SeedingProfile::by_name(name).unwrap();
            assert_eq!(profile.name, name);
            profile.validate().unwrap();
        }
        assert_eq!(SeedingProfile::conservative().upload_speed, 50 * 1024);
        assert_eq!(SeedingProfile::aggressive().upload_speed, 0);
        assert_eq!(SeedingProfile::balanced().max_connections, 30);
    }

    #[test]
    fn test_unknown_preset() {
        assert!(matches!(
            SeedingProfile::by_name("turbo"),
            Err(ConfigurationError::InvalidProfile { .. })
        ));
    }

    #[test]
    fn test_validation_rejects_each_bad_field() {
        let cases: Vec<(SeedingProfile, &str)> = vec![
            (
                SeedingProfile {
                    idle_probability: 1.5,
                    ..SeedingProfile::custom("c")
                },
                "profile.idle_probability",
            ),
            (
                SeedingProfile {
                    burst_probability: -0.1,
                    ..SeedingProfile::custom("c")
                },
                "profile.burst_probability",
            ),
            (
                SeedingProfile {
                    completion: 0.0,
                    ..SeedingProfile::custom("c")
                },
                "profile.completion",
            ),
        ];
        for (profile, field) in cases {
            match profile.validate() {
                Err(ConfigurationError::InvalidRange { field: got, .. }) => assert_eq!(got, field),
                other => panic!("expected InvalidRange for {field}, got {other:?}"),
            }
        }

        let no_connections = SeedingProfile {
            max_connections: 0,
            ..SeedingProfile::custom("c")
        };
        assert!(matches!(
            no_connections.validate(),
            Err(ConfigurationError::InvalidProfile { .. })
        ));
        let too_chatty = SeedingProfile {
            announce_interval: Duration::from_secs(30),
            ..SeedingProfile::custom("c")
        };
        assert!(too_chatty.validate().is_err());
    }
}
