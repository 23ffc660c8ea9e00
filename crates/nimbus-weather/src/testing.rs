//! Scriptable in-process `WeatherApi` for unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::client::WeatherApi;
use crate::error::FetchError;
use crate::types::{ApiQuery, Coordinates, CurrentWeather, GeoPlace, Payload, RequestKind};

type Responder =
    Box<dyn Fn(RequestKind, &ApiQuery) -> (Duration, Result<Payload, FetchError>) + Send + Sync>;
type ReverseResponder =
    Box<dyn Fn(Coordinates) -> (Duration, Result<Vec<GeoPlace>, FetchError>) + Send + Sync>;

pub(crate) struct FakeApi {
    configured: bool,
    lang: String,
    respond: Responder,
    reverse_respond: ReverseResponder,
    calls: Mutex<Vec<(RequestKind, ApiQuery)>>,
    reverse_calls: Mutex<Vec<Coordinates>>,
}

impl FakeApi {
    /// Answers every request with current weather named after the query, after 100ms.
    pub fn new() -> Self {
        Self {
            configured: true,
            lang: "vi".to_string(),
            respond: Box::new(|_, query| (Duration::from_millis(100), Ok(current(&label(query))))),
            reverse_respond: Box::new(|_| (Duration::from_millis(100), Ok(Vec::new()))),
            calls: Mutex::new(Vec::new()),
            reverse_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn respond_with(
        mut self,
        respond: impl Fn(RequestKind, &ApiQuery) -> (Duration, Result<Payload, FetchError>)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.respond = Box::new(respond);
        self
    }

    pub fn reverse_with(
        mut self,
        respond: impl Fn(Coordinates) -> (Duration, Result<Vec<GeoPlace>, FetchError>)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.reverse_respond = Box::new(respond);
        self
    }

    pub fn unconfigured(mut self) -> Self {
        self.configured = false;
        self
    }

    pub fn with_lang(mut self, lang: &str) -> Self {
        self.lang = lang.to_string();
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<(RequestKind, ApiQuery)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn reverse_count(&self) -> usize {
        self.reverse_calls.lock().len()
    }
}

#[async_trait]
impl WeatherApi for FakeApi {
    fn is_configured(&self) -> bool {
        self.configured
    }

    fn lang(&self) -> &str {
        &self.lang
    }

    async fn fetch(&self, kind: RequestKind, query: &ApiQuery) -> Result<Payload, FetchError> {
        self.calls.lock().push((kind, query.clone()));
        let (delay, outcome) = (self.respond)(kind, query);
        tokio::time::sleep(delay).await;
        outcome
    }

    async fn reverse(&self, coords: Coordinates, _limit: u32) -> Result<Vec<GeoPlace>, FetchError> {
        self.reverse_calls.lock().push(coords);
        let (delay, outcome) = (self.reverse_respond)(coords);
        tokio::time::sleep(delay).await;
        outcome
    }
}

pub(crate) fn current(name: &str) -> Payload {
    Payload::Current(CurrentWeather {
        name: name.to_string(),
        ..Default::default()
    })
}

/// City name, or `lat,lon` for coordinate queries.
pub(crate) fn label(query: &ApiQuery) -> String {
    match query {
        ApiQuery::City(name) => name.clone(),
        ApiQuery::Coords(c) => c.label(),
    }
}

pub(crate) fn place_name(payload: &Option<Payload>) -> Option<String> {
    payload
        .as_ref()
        .and_then(Payload::as_current)
        .map(|c| c.name.clone())
}
