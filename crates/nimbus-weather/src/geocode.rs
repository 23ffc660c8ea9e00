//! Reverse geocoding: turn coordinates into a human-readable place label.
//!
//! Labels are cached in the shared cache under `rev:<lat>,<lon>` (three decimals)
//! for ten minutes. A cache hit never touches the network. Starting a lookup
//! cancels the previous in-flight lookup of the same geocoder.

use nimbus_core::ConfigError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::services::WeatherServices;
use crate::types::{Coordinates, GeoPlace, Payload};

pub const REVERSE_TTL_MS: u64 = 10 * 60_000;

/// Only the nearest place is used
const REVERSE_LIMIT: u32 = 1;

/// Cache key for the label of `coords`
pub fn reverse_key(coords: Coordinates) -> String {
    format!("rev:{}", coords.rounded().label())
}

/// Preferred label for a reverse geocoding result: the name in `lang`, then the
/// provider's default name, then the coordinates themselves.
pub fn place_label(place: Option<&GeoPlace>, coords: Coordinates, lang: &str) -> String {
    place
        .and_then(|p| {
            p.local_names
                .get(lang)
                .filter(|name| !name.is_empty())
                .or(Some(&p.name).filter(|name| !name.is_empty()))
        })
        .cloned()
        .unwrap_or_else(|| coords.label())
}

pub struct ReverseGeocoder {
    services: WeatherServices,
    ttl: Duration,
    current: Mutex<Option<CancellationToken>>,
}

impl ReverseGeocoder {
    pub fn new(services: WeatherServices) -> Self {
        Self {
            services,
            ttl: Duration::from_millis(REVERSE_TTL_MS),
            current: Mutex::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Label for `coords`.
    ///
    /// Returns `FetchError::Cancelled` when a newer lookup or [`Self::cancel`]
    /// superseded this one.
    pub async fn lookup(&self, coords: Coordinates) -> Result<String, FetchError> {
        let coords = coords.rounded();
        let key = reverse_key(coords);

        if let Some(label) = self.cached(&key) {
            tracing::debug!(key, "Reverse geocode cache hit");
            return Ok(label);
        }

        let api = Arc::clone(&self.services.api);
        if !api.is_configured() {
            return Err(ConfigError::MissingSetting("WEATHER_API_KEY".to_string()).into());
        }

        let token = self.begin();
        let lang = api.lang().to_string();
        let call = self.services.inflight.run(&key, move || async move {
            let places = api.reverse(coords, REVERSE_LIMIT).await?;
            Ok(Payload::Place(place_label(places.first(), coords, &lang)))
        });

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(FetchError::Cancelled),
            outcome = call => outcome,
        };
        let payload = outcome?;

        self.services.cache.set(key.as_str(), payload.clone(), self.ttl);
        let label = payload.as_place().unwrap_or_default().to_string();
        tracing::debug!(key, label, "Reverse geocode resolved");
        Ok(label)
    }

    /// Cancel the in-flight lookup, if any.
    pub fn cancel(&self) {
        if let Some(token) = self.current.lock().take() {
            token.cancel();
        }
    }

    fn cached(&self, key: &str) -> Option<String> {
        let entry = self.services.cache.get(key)?;
        entry.data.as_place().map(str::to_string)
    }

    fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.current.lock().replace(token.clone()) {
            previous.cancel();
        }
        token
    }
}

impl Drop for ReverseGeocoder {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for ReverseGeocoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseGeocoder")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
