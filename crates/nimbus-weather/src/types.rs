use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coordinates are rounded to this many steps per degree (~100 m) before they are
/// used in cache keys or requests.
const COORD_STEPS_PER_DEGREE: f64 = 1000.0;

/// Geographic coordinates in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Round to three decimals so noisy GPS readings map to the same request.
    pub fn rounded(self) -> Self {
        Self {
            lat: (self.lat * COORD_STEPS_PER_DEGREE).round() / COORD_STEPS_PER_DEGREE,
            lon: (self.lon * COORD_STEPS_PER_DEGREE).round() / COORD_STEPS_PER_DEGREE,
        }
    }

    /// `"21.028,105.854"`
    pub fn label(&self) -> String {
        format!("{:.3},{:.3}", self.lat, self.lon)
    }
}

/// A device position fix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub coords: Coordinates,
    pub accuracy_meters: Option<f64>,
}

/// Where the user wants weather for: a typed city or a device position.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationDescriptor {
    City(String),
    Coordinates(Position),
}

/// Input of a fetch attempt.
///
/// Coordinates win when both are present; the city is then only used as the
/// fallback when the coordinate request is rejected with 401.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchTarget {
    pub coords: Option<Coordinates>,
    pub city: Option<String>,
}

impl FetchTarget {
    pub fn city(name: impl Into<String>) -> Self {
        Self::default().with_fallback_city(Some(name.into()))
    }

    pub fn coords(coords: Coordinates) -> Self {
        Self {
            coords: Some(coords),
            city: None,
        }
    }

    /// Blank names are treated as "no city".
    pub fn with_fallback_city(mut self, city: Option<String>) -> Self {
        self.city = city
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_none() && self.city.is_none()
    }

    /// Query for the coordinate path, rounded.
    pub fn coords_query(&self) -> Option<ApiQuery> {
        self.coords.map(|c| ApiQuery::Coords(c.rounded()))
    }

    pub fn city_query(&self) -> Option<ApiQuery> {
        self.city.clone().map(ApiQuery::City)
    }
}

impl From<LocationDescriptor> for FetchTarget {
    fn from(descriptor: LocationDescriptor) -> Self {
        match descriptor {
            LocationDescriptor::City(name) => FetchTarget::city(name),
            LocationDescriptor::Coordinates(position) => FetchTarget::coords(position.coords),
        }
    }
}

/// Which logical endpoint a request goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestKind {
    #[default]
    Current,
    Forecast,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Forecast => "forecast",
        }
    }

    pub(crate) fn path(&self) -> &'static str {
        match self {
            Self::Current => "/weather",
            Self::Forecast => "/forecast",
        }
    }
}

/// Location parameters of a single API request
#[derive(Debug, Clone, PartialEq)]
pub enum ApiQuery {
    City(String),
    Coords(Coordinates),
}

impl ApiQuery {
    pub fn params(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::City(name) => vec![("q", name.clone())],
            Self::Coords(c) => vec![("lat", c.lat.to_string()), ("lon", c.lon.to_string())],
        }
    }

    pub fn is_coords(&self) -> bool {
        matches!(self, Self::Coords(_))
    }
}

/// Weather condition as reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Condition {
    pub id: i32,
    pub main: String,
    pub description: String,
    pub icon: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MainReadings {
    pub temp: f64,
    pub feels_like: f64,
    pub humidity: u8,
    /// hPa
    pub pressure: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SunTimes {
    /// Epoch seconds
    pub sunrise: i64,
    /// Epoch seconds
    pub sunset: i64,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Wind {
    pub speed: f64,
    pub deg: Option<f64>,
}

/// Current weather conditions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentWeather {
    pub name: String,
    /// Observation time, epoch seconds
    pub dt: i64,
    /// Offset from UTC in seconds
    pub timezone: i32,
    /// Metres
    pub visibility: Option<u32>,
    pub main: MainReadings,
    pub weather: Vec<Condition>,
    pub sys: SunTimes,
    pub wind: Option<Wind>,
}

impl CurrentWeather {
    pub fn condition(&self) -> Option<&Condition> {
        self.weather.first()
    }

    pub fn sunrise(&self) -> Option<DateTime<FixedOffset>> {
        local_time(self.sys.sunrise, self.timezone)
    }

    pub fn sunset(&self) -> Option<DateTime<FixedOffset>> {
        local_time(self.sys.sunset, self.timezone)
    }

    pub fn visibility_km(&self) -> Option<f64> {
        self.visibility.map(|m| f64::from(m) / 1000.0)
    }
}

/// One three-hour forecast slot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastSlot {
    /// Epoch seconds
    pub dt: i64,
    pub main: MainReadings,
    pub weather: Vec<Condition>,
    /// Probability of precipitation, 0..=1
    pub pop: f64,
}

impl ForecastSlot {
    pub fn condition(&self) -> Option<&Condition> {
        self.weather.first()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastCity {
    pub name: String,
    pub country: Option<String>,
    /// Offset from UTC in seconds
    pub timezone: i32,
    pub sunrise: i64,
    pub sunset: i64,
}

/// Five-day forecast, slots ordered by time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Forecast {
    pub list: Vec<ForecastSlot>,
    pub city: ForecastCity,
}

/// Forecast slots falling on one local calendar day
#[derive(Debug, Clone, PartialEq)]
pub struct DayForecast<'a> {
    pub date: NaiveDate,
    pub slots: Vec<&'a ForecastSlot>,
}

impl DayForecast<'_> {
    pub fn high(&self) -> Option<f64> {
        self.slots.iter().map(|s| s.main.temp).reduce(f64::max)
    }

    pub fn low(&self) -> Option<f64> {
        self.slots.iter().map(|s| s.main.temp).reduce(f64::min)
    }
}

impl Forecast {
    /// Group slots by the location's local calendar day, keeping slot order.
    pub fn days(&self) -> Vec<DayForecast<'_>> {
        let mut days: Vec<DayForecast<'_>> = Vec::new();
        for slot in &self.list {
            let Some(date) = local_time(slot.dt, self.city.timezone).map(|t| t.date_naive())
            else {
                continue;
            };
            match days.last_mut() {
                Some(day) if day.date == date => day.slots.push(slot),
                _ => days.push(DayForecast {
                    date,
                    slots: vec![slot],
                }),
            }
        }
        days
    }

    /// Time of `slot` at the forecast location
    pub fn local_time(&self, slot: &ForecastSlot) -> Option<DateTime<FixedOffset>> {
        local_time(slot.dt, self.city.timezone)
    }

    /// Up to eight slots on the same local day as `now`.
    pub fn today_hourly(&self, now: DateTime<Utc>) -> Vec<&ForecastSlot> {
        let today = now.with_timezone(&offset(self.city.timezone)).date_naive();
        self.list
            .iter()
            .filter(|slot| {
                local_time(slot.dt, self.city.timezone).map(|t| t.date_naive()) == Some(today)
            })
            .take(8)
            .collect()
    }
}

/// Entry of a reverse geocoding response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoPlace {
    pub name: String,
    pub local_names: HashMap<String, String>,
    pub lat: f64,
    pub lon: f64,
    pub country: Option<String>,
    pub state: Option<String>,
}

/// Value held in the shared cache and published to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Current(CurrentWeather),
    Forecast(Forecast),
    /// Human-readable place label from reverse geocoding
    Place(String),
}

impl Payload {
    pub fn as_current(&self) -> Option<&CurrentWeather> {
        match self {
            Self::Current(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_forecast(&self) -> Option<&Forecast> {
        match self {
            Self::Forecast(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_place(&self) -> Option<&str> {
        match self {
            Self::Place(label) => Some(label),
            _ => None,
        }
    }
}

fn offset(seconds: i32) -> FixedOffset {
    FixedOffset::east_opt(seconds).unwrap_or_else(|| Utc.fix())
}

fn local_time(epoch_seconds: i64, offset_seconds: i32) -> Option<DateTime<FixedOffset>> {
    DateTime::from_timestamp(epoch_seconds, 0).map(|t| t.with_timezone(&offset(offset_seconds)))
}
