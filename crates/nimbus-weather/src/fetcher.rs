//! Keeps the weather for one location current and publishes it.
//!
//! A [`WeatherFetcher`] owns a driver task. The handle sends commands (location
//! changes, refresh triggers, visibility) and exposes the latest [`FetchState`]
//! through a `watch` channel. Every attempt gets its own cancellation token; starting
//! a new attempt cancels the previous one so only the newest request can publish.
//! Dropping the handle stops the driver and aborts whatever is in flight.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use nimbus_core::config::DEFAULT_POLL_MS;
use nimbus_core::{ConfigError, WeatherSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cache::cache_key;
use crate::error::FetchError;
use crate::retry::{with_retry, RetryPolicy};
use crate::services::WeatherServices;
use crate::types::{ApiQuery, CurrentWeather, FetchTarget, Forecast, Payload, RequestKind};

pub const DEFAULT_CACHE_MS: u64 = 45_000;
pub const FORECAST_CACHE_MS: u64 = 5 * 60_000;
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

/// Data older than this many poll intervals is reported as stale
const STALE_FACTOR: f64 = 1.5;

/// Per-fetcher behaviour
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    pub kind: RequestKind,
    /// `None` disables polling
    pub poll_interval: Option<Duration>,
    /// Freshness window for cached data, also used as the cache TTL on write
    pub cache_for: Duration,
    /// Quiet period after a location change before fetching
    pub debounce: Duration,
    pub retry: RetryPolicy,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            kind: RequestKind::Current,
            poll_interval: Some(Duration::from_millis(DEFAULT_POLL_MS)),
            cache_for: Duration::from_millis(DEFAULT_CACHE_MS),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            retry: RetryPolicy::default(),
        }
    }
}

impl FetchOptions {
    /// Current conditions, polled every minute.
    pub fn current() -> Self {
        Self::default()
    }

    /// Five-day forecast: cached for five minutes, never polled.
    pub fn forecast() -> Self {
        Self {
            kind: RequestKind::Forecast,
            poll_interval: None,
            cache_for: Duration::from_millis(FORECAST_CACHE_MS),
            ..Self::default()
        }
    }

    /// Take the poll interval from configuration when this fetcher polls at all.
    pub fn with_settings(mut self, settings: &WeatherSettings) -> Self {
        if self.poll_interval.is_some() {
            self.poll_interval = settings.poll_interval();
        }
        self
    }

    pub fn stale_after(&self) -> Duration {
        self.poll_interval
            .unwrap_or(self.cache_for)
            .mul_f64(STALE_FACTOR)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStatus {
    /// No city or coordinates to fetch for
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// Snapshot published after every change.
///
/// A failed attempt keeps the last good `data` so it stays visible next to the error.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchState {
    pub status: FetchStatus,
    pub data: Option<Payload>,
    pub loading: bool,
    pub error: Option<FetchError>,
    /// When `data` was produced, on the runtime clock
    pub last_updated: Option<Instant>,
    /// Wall-clock time of `last_updated`, for display
    pub last_updated_at: Option<DateTime<Utc>>,
    pub stale_after: Duration,
}

impl FetchState {
    fn new(stale_after: Duration) -> Self {
        Self {
            status: FetchStatus::Idle,
            data: None,
            loading: false,
            error: None,
            last_updated: None,
            last_updated_at: None,
            stale_after,
        }
    }

    /// Stale when never updated or updated longer than `stale_after` ago.
    pub fn is_stale(&self) -> bool {
        match self.last_updated {
            Some(at) => at.elapsed() > self.stale_after,
            None => true,
        }
    }

    pub fn current(&self) -> Option<&CurrentWeather> {
        self.data.as_ref().and_then(Payload::as_current)
    }

    pub fn forecast(&self) -> Option<&Forecast> {
        self.data.as_ref().and_then(Payload::as_forecast)
    }
}

#[derive(Debug)]
enum Command {
    SetLocation(FetchTarget),
    Refresh,
    Focus,
    Online,
    Visible(bool),
}

/// Handle to a running fetcher. Dropping it tears the fetcher down.
#[derive(Debug)]
pub struct WeatherFetcher {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<FetchState>,
    shutdown: CancellationToken,
}

impl WeatherFetcher {
    /// Start a fetcher with no location. Must be called inside a tokio runtime.
    pub fn spawn(services: WeatherServices, options: FetchOptions) -> Self {
        let (state_tx, state_rx) = watch::channel(FetchState::new(options.stale_after()));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let driver = Driver {
            ctx: Arc::new(AttemptContext {
                services,
                options,
                state: state_tx,
            }),
            target: FetchTarget::default(),
            visible: true,
            shutdown: shutdown.clone(),
            current: None,
        };
        tokio::spawn(driver.run(command_rx));

        Self {
            commands: command_tx,
            state: state_rx,
            shutdown,
        }
    }

    /// Switch location. The fetch starts after the debounce period; changes that
    /// round to the current request are ignored.
    pub fn set_location(&self, target: impl Into<FetchTarget>) {
        self.send(Command::SetLocation(target.into()));
    }

    pub fn refresh(&self) {
        self.send(Command::Refresh);
    }

    /// The view regained focus
    pub fn notify_focus(&self) {
        self.send(Command::Focus);
    }

    /// Network connectivity came back
    pub fn notify_online(&self) {
        self.send(Command::Online);
    }

    /// Poll ticks are skipped while hidden.
    pub fn set_visible(&self, visible: bool) {
        self.send(Command::Visible(visible));
    }

    pub fn state(&self) -> FetchState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FetchState> {
        self.state.clone()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Fetcher driver has stopped");
        }
    }
}

impl Drop for WeatherFetcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

type Attempt = BoxFuture<'static, ()>;

struct Driver {
    ctx: Arc<AttemptContext>,
    target: FetchTarget,
    visible: bool,
    shutdown: CancellationToken,
    /// Token of the newest attempt
    current: Option<CancellationToken>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut debounce: Option<Instant> = None;
        let mut poll = self.poll_timer();
        let mut attempt: Option<Attempt> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        Command::SetLocation(target) => {
                            if same_request(&self.target, &target) {
                                continue;
                            }
                            tracing::debug!(?target, "Location changed");
                            self.target = target;
                            self.cancel_current();
                            attempt = None;
                            debounce = Some(Instant::now() + self.ctx.options.debounce);
                            poll = self.poll_timer();
                        }
                        Command::Refresh | Command::Focus | Command::Online => {
                            debounce = None;
                            attempt = Some(self.start_attempt());
                        }
                        Command::Visible(visible) => self.visible = visible,
                    }
                }
                _ = wait_until(debounce) => {
                    debounce = None;
                    attempt = Some(self.start_attempt());
                }
                _ = next_tick(&mut poll) => {
                    if self.visible && !self.target.is_empty() {
                        attempt = Some(self.start_attempt());
                    } else {
                        tracing::trace!("Skipping poll");
                    }
                }
                _ = settle(&mut attempt) => attempt = None,
            }
        }

        self.cancel_current();
        tracing::debug!("Fetcher stopped");
    }

    fn start_attempt(&mut self) -> Attempt {
        self.cancel_current();
        let token = self.shutdown.child_token();
        self.current = Some(token.clone());
        Box::pin(Arc::clone(&self.ctx).run(self.target.clone(), token))
    }

    fn cancel_current(&mut self) {
        if let Some(token) = self.current.take() {
            token.cancel();
        }
    }

    fn poll_timer(&self) -> Option<Interval> {
        let period = self.ctx.options.poll_interval.filter(|p| !p.is_zero())?;
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(timer)
    }
}

fn same_request(a: &FetchTarget, b: &FetchTarget) -> bool {
    a.coords_query() == b.coords_query() && a.city == b.city
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn settle(attempt: &mut Option<Attempt>) {
    match attempt {
        Some(attempt) => attempt.await,
        None => std::future::pending().await,
    }
}

/// A query together with its cache and dedupe key
struct KeyedQuery {
    key: String,
    query: ApiQuery,
}

impl KeyedQuery {
    fn new(kind: RequestKind, query: ApiQuery) -> Self {
        Self {
            key: cache_key(kind, &query),
            query,
        }
    }
}

/// What an attempt needs, shared by all attempts of one fetcher
struct AttemptContext {
    services: WeatherServices,
    options: FetchOptions,
    state: watch::Sender<FetchState>,
}

impl AttemptContext {
    async fn run(self: Arc<Self>, target: FetchTarget, token: CancellationToken) {
        if target.is_empty() {
            self.publish(|s| {
                s.status = FetchStatus::Idle;
                s.loading = false;
                s.error = None;
            });
            return;
        }

        if !self.services.api.is_configured() {
            let error = FetchError::from(ConfigError::MissingSetting(
                "WEATHER_API_KEY".to_string(),
            ));
            tracing::warn!("Weather fetch skipped: {}", error);
            self.publish_error(error);
            return;
        }

        let kind = self.options.kind;
        let by_coords = target.coords_query().map(|q| KeyedQuery::new(kind, q));
        let by_city = target.city_query().map(|q| KeyedQuery::new(kind, q));

        let cached = [by_coords.as_ref(), by_city.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|request| self.services.cache.get(&request.key));

        if let Some(entry) = cached {
            let fresh = entry.is_fresh_within(self.options.cache_for);
            tracing::debug!(fresh, age = ?entry.age(), "Cache hit");
            let updated_at = wall_clock(entry.age());
            self.publish(|s| {
                s.status = FetchStatus::Success;
                s.data = Some(entry.data);
                s.loading = !fresh;
                s.error = None;
                s.last_updated = Some(entry.timestamp);
                s.last_updated_at = Some(updated_at);
            });
            if fresh {
                return;
            }
        }

        let Some(mut request) = by_coords.as_ref().or(by_city.as_ref()) else {
            return;
        };

        self.publish(|s| {
            s.status = FetchStatus::Loading;
            s.loading = true;
            s.error = None;
        });

        let mut outcome = self.request(request, &token).await;

        if matches!(&outcome, Err(e) if e.is_auth()) && request.query.is_coords() {
            if let Some(fallback) = by_city.as_ref() {
                tracing::info!(
                    "Coordinate request rejected (401), falling back to city {}",
                    fallback.key
                );
                request = fallback;
                outcome = self.request(request, &token).await;
            }
        }

        if token.is_cancelled() {
            tracing::debug!(key = %request.key, "Discarding superseded result");
            return;
        }

        match outcome {
            Ok(payload) => {
                self.services
                    .cache
                    .set(request.key.clone(), payload.clone(), self.options.cache_for);
                tracing::info!(key = %request.key, "Weather updated");
                self.publish(|s| {
                    s.status = FetchStatus::Success;
                    s.data = Some(payload);
                    s.loading = false;
                    s.error = None;
                    s.last_updated = Some(Instant::now());
                    s.last_updated_at = Some(Utc::now());
                });
            }
            Err(e) => {
                tracing::warn!(key = %request.key, "Weather fetch failed: {}", e);
                self.publish_error(e);
            }
        }
    }

    /// One network request through the shared dedupe registry, retried per policy.
    async fn request(
        &self,
        request: &KeyedQuery,
        token: &CancellationToken,
    ) -> Result<Payload, FetchError> {
        let api = Arc::clone(&self.services.api);
        let policy = self.options.retry.clone();
        let kind = self.options.kind;
        let query = request.query.clone();

        let call = self.services.inflight.run(&request.key, move || async move {
            with_retry(&policy, || api.fetch(kind, &query)).await
        });

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(FetchError::Cancelled),
            outcome = call => outcome,
        }
    }

    fn publish(&self, update: impl FnOnce(&mut FetchState)) {
        self.state.send_modify(update);
    }

    fn publish_error(&self, error: FetchError) {
        self.publish(|s| {
            s.status = FetchStatus::Error;
            s.loading = false;
            s.error = Some(error);
        });
    }
}

/// Wall-clock time `age` ago
fn wall_clock(age: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() - age
}
