//! HTTP client for the weather and geocoding endpoints (OpenWeatherMap schema).

use async_trait::async_trait;
use nimbus_core::WeatherSettings;
use reqwest::{Client, Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use url::Url;

use crate::error::FetchError;
use crate::types::{
    ApiQuery, Coordinates, CurrentWeather, Forecast, GeoPlace, Payload, RequestKind,
};

const REQUEST_TIMEOUT_SECS: u64 = 10;
const USER_AGENT: &str = "Nimbus/0.1.0";
const FALLBACK_GEO_BASE: &str = "https://api.openweathermap.org/geo/1.0";

/// The current and forecast endpoints only exist on API version 2.5.
const LEGACY_VERSION_SUFFIX: &str = "/data/2.5";
const ONECALL_VERSION_SUFFIX: &str = "/data/3.0";

/// The provider operations the fetcher depends on.
#[async_trait]
pub trait WeatherApi: Send + Sync {
    /// False when credentials are missing; callers must not issue requests then.
    fn is_configured(&self) -> bool;

    /// Language used for localized place names.
    fn lang(&self) -> &str;

    /// Current conditions or forecast for a city or coordinates.
    async fn fetch(&self, kind: RequestKind, query: &ApiQuery) -> Result<Payload, FetchError>;

    /// Reverse geocoding: places near `coords`, nearest first.
    async fn reverse(&self, coords: Coordinates, limit: u32) -> Result<Vec<GeoPlace>, FetchError>;
}

/// reqwest-backed [`WeatherApi`]
#[derive(Debug, Clone)]
pub struct WeatherClient {
    client: Arc<Client>,
    settings: WeatherSettings,
}

impl WeatherClient {
    pub fn new(settings: WeatherSettings) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client: Arc::new(client),
            settings,
        })
    }

    pub fn settings(&self) -> &WeatherSettings {
        &self.settings
    }

    /// Base URL for `/weather` and `/forecast`, trailing slashes trimmed.
    fn weather_base(&self) -> String {
        let base = self.settings.base_url.trim_end_matches('/');
        match base.strip_suffix(ONECALL_VERSION_SUFFIX) {
            Some(root) => format!("{}{}", root, LEGACY_VERSION_SUFFIX),
            None => base.to_string(),
        }
    }

    /// `<origin of base URL>/geo/1.0`
    fn geo_base(&self) -> String {
        match Url::parse(self.settings.base_url.trim_end_matches('/')) {
            Ok(url) if url.has_host() => format!("{}/geo/1.0", url.origin().ascii_serialization()),
            _ => FALLBACK_GEO_BASE.to_string(),
        }
    }

    /// `params` plus credentials; empty values are left out.
    fn query_string(
        &self,
        params: Vec<(&'static str, String)>,
        localized: bool,
    ) -> Vec<(&'static str, String)> {
        let mut all = params;
        all.push(("appid", self.settings.api_key.clone()));
        if localized {
            all.push(("units", self.settings.units.clone()));
            all.push(("lang", self.settings.lang.clone()));
        }
        all.retain(|(_, v)| !v.is_empty());
        all
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&'static str, String)],
    ) -> Result<T, FetchError> {
        self.settings.require_api_key()?;

        let response = self.client.get(url).query(query).send().await?;
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))
    }

    /// Non-success responses become `FetchError::Http` carrying the status.
    async fn check_status(response: Response) -> Result<Response, FetchError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let reason = status.canonical_reason().unwrap_or("");
        let detail = response.text().await.unwrap_or_default();
        let hint = if status.as_u16() == 401 {
            " - check WEATHER_API_KEY (valid and activated) and use /data/2.5 for /weather and /forecast"
        } else {
            ""
        };
        let message = format!("HTTP {}: {}{} {}", status.as_u16(), reason, hint, detail);

        tracing::debug!("Weather API returned status {}", status);
        Err(FetchError::http(status.as_u16(), message.trim_end()))
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn current(&self, query: &ApiQuery) -> Result<CurrentWeather, FetchError> {
        let url = format!("{}{}", self.weather_base(), RequestKind::Current.path());
        self.get_json(&url, &self.query_string(query.params(), true)).await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn forecast(&self, query: &ApiQuery) -> Result<Forecast, FetchError> {
        let url = format!("{}{}", self.weather_base(), RequestKind::Forecast.path());
        self.get_json(&url, &self.query_string(query.params(), true)).await
    }
}

#[async_trait]
impl WeatherApi for WeatherClient {
    fn is_configured(&self) -> bool {
        self.settings.has_api_key()
    }

    fn lang(&self) -> &str {
        &self.settings.lang
    }

    async fn fetch(&self, kind: RequestKind, query: &ApiQuery) -> Result<Payload, FetchError> {
        match kind {
            RequestKind::Current => self.current(query).await.map(Payload::Current),
            RequestKind::Forecast => self.forecast(query).await.map(Payload::Forecast),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn reverse(&self, coords: Coordinates, limit: u32) -> Result<Vec<GeoPlace>, FetchError> {
        let url = format!("{}/reverse", self.geo_base());
        let params = vec![
            ("lat", coords.lat.to_string()),
            ("lon", coords.lon.to_string()),
            ("limit", limit.to_string()),
        ];
        self.get_json(&url, &self.query_string(params, false)).await
    }
}
