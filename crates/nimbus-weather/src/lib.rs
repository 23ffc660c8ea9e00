//! Weather data for Nimbus
//!
//! Fetches current conditions and forecasts from an OpenWeatherMap-compatible API.
//! Requests go through a process-wide TTL cache and in-flight dedupe registry
//! ([`WeatherServices`]), are retried on transient failures, and are published to
//! subscribers by a [`WeatherFetcher`] per location view.

pub mod cache;
pub mod client;
pub mod dedupe;
pub mod error;
pub mod fetcher;
pub mod geocode;
pub mod location;
pub mod retry;
pub mod services;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use cache::{cache_key, CacheEntry, TtlCache};
pub use client::{WeatherApi, WeatherClient};
pub use dedupe::Dedupe;
pub use error::{ErrorKind, FetchError, LocationError};
pub use fetcher::{FetchOptions, FetchState, FetchStatus, WeatherFetcher};
pub use geocode::ReverseGeocoder;
pub use location::{
    FixedGeolocator, Geolocator, LocationProvider, LocationStore, Permission,
    UnavailableGeolocator,
};
pub use retry::{with_retry, RetryPolicy};
pub use services::WeatherServices;
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use types::*;
