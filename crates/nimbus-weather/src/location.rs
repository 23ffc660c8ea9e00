//! Which location to show weather for, and how that choice is persisted.
//!
//! The chosen city and the "use device location" flag live in two stores: a
//! session store that only lasts for the process and a long-lived local store.
//! On load the session value wins over the local one.

use async_trait::async_trait;
use nimbus_core::LocationConfig;

use crate::error::LocationError;
use crate::store::{KeyValueStore, MemoryStore};
use crate::types::{Coordinates, FetchTarget, LocationDescriptor, Position};

/// Session: city currently shown
pub const KEY_CURRENT_CITY: &str = "current_city";
/// Local: last non-empty city the user picked
pub const KEY_LAST_CITY: &str = "last_city";
/// Session and local: `"1"` when device location is in use
pub const KEY_USE_GPS: &str = "use_gps";
/// Local: city to restore when device location is turned off
pub const KEY_PREV_CITY: &str = "prev_city";

/// Device location permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    Granted,
    Denied,
    #[default]
    Prompt,
}

/// Source of device positions
#[async_trait]
pub trait Geolocator: Send + Sync {
    async fn permission(&self) -> Permission;
    async fn current_position(&self) -> Result<Position, LocationError>;
}

/// Always reports the same position, e.g. coordinates given on the command line.
#[derive(Debug, Clone)]
pub struct FixedGeolocator {
    position: Position,
}

impl FixedGeolocator {
    pub fn new(coords: Coordinates) -> Self {
        Self {
            position: Position {
                coords,
                accuracy_meters: None,
            },
        }
    }
}

#[async_trait]
impl Geolocator for FixedGeolocator {
    async fn permission(&self) -> Permission {
        Permission::Granted
    }

    async fn current_position(&self) -> Result<Position, LocationError> {
        Ok(self.position)
    }
}

/// For hosts without a location service
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableGeolocator;

#[async_trait]
impl Geolocator for UnavailableGeolocator {
    async fn permission(&self) -> Permission {
        Permission::Prompt
    }

    async fn current_position(&self) -> Result<Position, LocationError> {
        Err(LocationError::ServiceUnavailable)
    }
}

/// Session plus local persistence
pub struct LocationStore {
    session: Box<dyn KeyValueStore>,
    local: Box<dyn KeyValueStore>,
}

impl LocationStore {
    pub fn new(session: Box<dyn KeyValueStore>, local: Box<dyn KeyValueStore>) -> Self {
        Self { session, local }
    }

    /// Both stores in memory
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()), Box::new(MemoryStore::new()))
    }

    /// Fresh session over an existing local store
    pub fn with_local(local: Box<dyn KeyValueStore>) -> Self {
        Self::new(Box::new(MemoryStore::new()), local)
    }

    fn non_empty(store: &dyn KeyValueStore, key: &str) -> Option<String> {
        store.get(key).filter(|v| !v.is_empty())
    }

    fn write(store: &dyn KeyValueStore, key: &str, value: &str) {
        if let Err(e) = store.set(key, value) {
            tracing::warn!("Failed to persist {}: {:#}", key, e);
        }
    }
}

impl std::fmt::Debug for LocationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationStore").finish_non_exhaustive()
    }
}

/// The user's location choice: a typed city, or device location with the city kept
/// as a fallback.
#[derive(Debug)]
pub struct LocationProvider {
    store: LocationStore,
    city: String,
    use_gps: bool,
    prev_city: String,
    permission: Permission,
    position: Option<Position>,
}

impl LocationProvider {
    pub fn load(store: LocationStore, config: &LocationConfig) -> Self {
        let city = LocationStore::non_empty(store.session.as_ref(), KEY_CURRENT_CITY)
            .or_else(|| LocationStore::non_empty(store.local.as_ref(), KEY_LAST_CITY))
            .unwrap_or_else(|| config.default_city.clone());

        let use_gps = store
            .session
            .get(KEY_USE_GPS)
            .or_else(|| store.local.get(KEY_USE_GPS))
            .is_some_and(|v| v == "1");

        let prev_city = LocationStore::non_empty(store.local.as_ref(), KEY_PREV_CITY)
            .unwrap_or_else(|| config.default_city.clone());

        tracing::debug!(city, use_gps, "Loaded location state");
        Self {
            store,
            city,
            use_gps,
            prev_city,
            permission: Permission::default(),
            position: None,
        }
    }

    pub fn city(&self) -> &str {
        &self.city
    }

    pub fn use_gps(&self) -> bool {
        self.use_gps
    }

    pub fn prev_city(&self) -> &str {
        &self.prev_city
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn position(&self) -> Option<Position> {
        self.position
    }

    pub fn set_city(&mut self, city: &str) {
        self.city = city.trim().to_string();
        LocationStore::write(self.store.session.as_ref(), KEY_CURRENT_CITY, &self.city);
        if !self.city.is_empty() {
            LocationStore::write(self.store.local.as_ref(), KEY_LAST_CITY, &self.city);
        }
    }

    /// Turning device location on remembers the typed city; turning it off
    /// restores that city when none is set.
    pub fn set_use_gps(&mut self, enabled: bool) {
        self.use_gps = enabled;
        let flag = if enabled { "1" } else { "0" };
        LocationStore::write(self.store.session.as_ref(), KEY_USE_GPS, flag);
        LocationStore::write(self.store.local.as_ref(), KEY_USE_GPS, flag);

        if enabled {
            if !self.city.is_empty() {
                self.prev_city = self.city.clone();
                LocationStore::write(self.store.local.as_ref(), KEY_PREV_CITY, &self.prev_city);
            }
        } else if self.city.is_empty() {
            let restored = self.prev_city.clone();
            self.set_city(&restored);
        }
    }

    /// A denied permission switches device location off.
    pub fn set_permission(&mut self, permission: Permission) -> Result<(), LocationError> {
        self.permission = permission;
        if permission != Permission::Denied {
            return Ok(());
        }

        tracing::info!("Location permission denied, using city");
        self.position = None;
        if self.use_gps {
            self.set_use_gps(false);
        }
        Err(LocationError::PermissionDenied)
    }

    pub fn update_position(&mut self, position: Position) {
        self.position = Some(position);
    }

    /// Ask `geolocator` for a fix when device location is on.
    ///
    /// Returns `Ok(None)` when device location is off.
    pub async fn locate(
        &mut self,
        geolocator: &dyn Geolocator,
    ) -> Result<Option<Position>, LocationError> {
        if !self.use_gps {
            return Ok(None);
        }

        self.set_permission(geolocator.permission().await)?;

        match geolocator.current_position().await {
            Ok(position) => {
                self.update_position(position);
                Ok(Some(position))
            }
            Err(LocationError::PermissionDenied) => {
                self.set_permission(Permission::Denied)?;
                Ok(None)
            }
            Err(e) => {
                tracing::warn!("Device location failed: {}", e);
                Err(e)
            }
        }
    }

    /// Fetcher input: device coordinates when in use and known, the city as fallback.
    pub fn target(&self) -> FetchTarget {
        let coords = self
            .position
            .filter(|_| self.use_gps && self.permission != Permission::Denied)
            .map(|p| p.coords);

        FetchTarget {
            coords,
            city: None,
        }
        .with_fallback_city(Some(self.city.clone()))
    }

    /// What is being shown: device position when in use, else the city.
    pub fn descriptor(&self) -> Option<LocationDescriptor> {
        match self.position {
            Some(position) if self.use_gps && self.permission != Permission::Denied => {
                Some(LocationDescriptor::Coordinates(position))
            }
            _ if !self.city.is_empty() => Some(LocationDescriptor::City(self.city.clone())),
            _ => None,
        }
    }
}
