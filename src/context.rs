//! Per-session application context
//!
//! Built once when the user logs in and handed to the coordinator; nothing in
//! the crate reads profile data from global state.

use crate::core::{Destination, PeerDescriptor, Role};
use crate::tracking::CoordinatorError;
use crate::utils::TrackingConfig;
use std::sync::Arc;

/// Read-only access to the signed-in user's profile
pub trait ProfileStore: Send + Sync {
    fn current_user_id(&self) -> Option<String>;

    fn current_role(&self) -> Option<Role>;

    /// Anchors only
    fn destination(&self) -> Option<Destination>;

    fn display_name(&self) -> Option<String>;

    /// 0.0 to 1.0
    fn battery_level(&self) -> Option<f32> {
        None
    }
}

/// Fixed profile, used by the simulation and tests
#[derive(Debug, Clone, PartialEq)]
pub struct StaticProfile {
    pub user_id: String,
    pub role: Role,
    pub display_name: String,
    pub destination: Option<Destination>,
    pub battery_level: Option<f32>,
}

impl StaticProfile {
    pub fn anchor(user_id: &str, destination: Destination) -> Self {
        Self {
            user_id: user_id.to_string(),
            role: Role::Anchor,
            display_name: format!("{} anchor", destination),
            destination: Some(destination),
            battery_level: None,
        }
    }

    pub fn navigator(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            role: Role::Navigator,
            display_name: format!("navigator {}", user_id),
            destination: None,
            battery_level: None,
        }
    }

    pub fn with_battery(mut self, level: f32) -> Self {
        self.battery_level = Some(level.clamp(0.0, 1.0));
        self
    }
}

impl ProfileStore for StaticProfile {
    fn current_user_id(&self) -> Option<String> {
        Some(self.user_id.clone())
    }

    fn current_role(&self) -> Option<Role> {
        Some(self.role)
    }

    fn destination(&self) -> Option<Destination> {
        self.destination
    }

    fn display_name(&self) -> Option<String> {
        Some(self.display_name.clone())
    }

    fn battery_level(&self) -> Option<f32> {
        self.battery_level
    }
}

/// Profile store and configuration for one signed-in session
#[derive(Clone)]
pub struct AppContext {
    pub profile: Arc<dyn ProfileStore>,
    pub config: TrackingConfig,
}

impl AppContext {
    pub fn new(profile: Arc<dyn ProfileStore>, config: TrackingConfig) -> Self {
        Self { profile, config }
    }

    /// Handshake descriptor for this device, built from the profile
    pub fn local_descriptor(&self) -> Result<PeerDescriptor, CoordinatorError> {
        let user_id = self
            .profile
            .current_user_id()
            .filter(|id| !id.is_empty())
            .ok_or(CoordinatorError::Profile { field: "user_id" })?;
        let role = self
            .profile
            .current_role()
            .ok_or(CoordinatorError::Profile { field: "role" })?;
        let display_name = self.profile.display_name().unwrap_or_else(|| user_id.clone());

        let descriptor = PeerDescriptor::new(role, user_id, display_name);
        Ok(match (role, self.profile.destination()) {
            (Role::Anchor, Some(destination)) => descriptor.with_destination(destination),
            _ => descriptor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyProfile;

    impl ProfileStore for EmptyProfile {
        fn current_user_id(&self) -> Option<String> {
            None
        }
        fn current_role(&self) -> Option<Role> {
            Some(Role::Anchor)
        }
        fn destination(&self) -> Option<Destination> {
            None
        }
        fn display_name(&self) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_descriptor_from_profile() {
        let context = AppContext::new(
            Arc::new(StaticProfile::anchor("u42", Destination::Kitchen)),
            TrackingConfig::default(),
        );
        let descriptor = context.local_descriptor().unwrap();
        assert_eq!(descriptor.peer_id().as_str(), "anchor-u42");
        assert_eq!(descriptor.destination, Some(Destination::Kitchen));
    }

    #[test]
    fn test_navigator_never_carries_destination() {
        let mut profile = StaticProfile::navigator("n1");
        profile.destination = Some(Destination::Window);
        let context = AppContext::new(Arc::new(profile), TrackingConfig::default());
        assert_eq!(context.local_descriptor().unwrap().destination, None);
    }

    #[test]
    fn test_missing_user_is_an_error() {
        let context = AppContext::new(Arc::new(EmptyProfile), TrackingConfig::default());
        assert!(matches!(
            context.local_descriptor(),
            Err(CoordinatorError::Profile { field: "user_id" })
        ));
    }
}
