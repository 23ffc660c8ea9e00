//! Process-wide services shared by every fetcher and geocode lookup.

use std::sync::Arc;

use crate::cache::TtlCache;
use crate::client::WeatherApi;
use crate::dedupe::Dedupe;
use crate::types::Payload;

/// Shared cache, in-flight registry and API client.
///
/// Create one at startup and clone it into every [`crate::WeatherFetcher`] and
/// [`crate::ReverseGeocoder`] so identical requests from different views collapse.
/// Lives for the process; cleared only through [`WeatherServices::clear_cache`].
#[derive(Clone)]
pub struct WeatherServices {
    pub(crate) api: Arc<dyn WeatherApi>,
    pub(crate) cache: TtlCache<Payload>,
    pub(crate) inflight: Dedupe<Payload>,
}

impl WeatherServices {
    pub fn new(api: Arc<dyn WeatherApi>) -> Self {
        Self {
            api,
            cache: TtlCache::new(),
            inflight: Dedupe::new(),
        }
    }

    pub fn cache(&self) -> &TtlCache<Payload> {
        &self.cache
    }

    pub fn inflight(&self) -> &Dedupe<Payload> {
        &self.inflight
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

impl std::fmt::Debug for WeatherServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherServices")
            .field("cached", &self.cache.len())
            .field("inflight", &self.inflight)
            .finish()
    }
}
