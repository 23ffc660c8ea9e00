//! Nimbus: live weather in the terminal.
//!
//! Shows current conditions for the remembered city (or device coordinates given on
//! the command line), refreshes them on the configured poll interval and optionally
//! prints the five-day forecast.

use anyhow::Result;
use chrono::{Local, Utc};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;

use nimbus_core::{AppError, Config};
use nimbus_weather::{
    Coordinates, FetchError, FetchOptions, FetchState, FetchStatus, FileStore, FixedGeolocator,
    Geolocator, LocationProvider, LocationStore, ReverseGeocoder, UnavailableGeolocator,
    WeatherClient, WeatherFetcher, WeatherServices,
};

/// Live weather for a city or your coordinates
#[derive(Parser)]
#[command(name = "nimbus", version, about)]
struct Cli {
    /// City to show. Remembered for next time.
    #[arg(long)]
    city: Option<String>,

    /// Device latitude. Switches to device location.
    #[arg(long, requires = "lon", allow_negative_numbers = true)]
    lat: Option<f64>,

    /// Device longitude
    #[arg(long, requires = "lat", allow_negative_numbers = true)]
    lon: Option<f64>,

    /// Stop using device location and go back to the city
    #[arg(long, conflicts_with = "lat")]
    no_gps: bool,

    /// Also show the five-day forecast
    #[arg(long)]
    forecast: bool,

    /// Print one update and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    nimbus_core::init();

    if let Err(e) = run(Cli::parse()).await {
        tracing::error!("{:#}", e);
        eprintln!("{}", user_message(&e));
        std::process::exit(1);
    }
}

fn user_message(error: &anyhow::Error) -> String {
    if let Some(e) = error.downcast_ref::<AppError>() {
        e.user_message().to_string()
    } else if let Some(e) = error.downcast_ref::<FetchError>() {
        e.user_message().to_string()
    } else {
        format!("{:#}", error)
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (config, _) = Config::load_validated().map_err(AppError::from)?;

    let client = WeatherClient::new(config.weather.clone())?;
    let services = WeatherServices::new(Arc::new(client));

    let local = FileStore::in_dir(&config.config_dir)?;
    let mut location = LocationProvider::load(
        LocationStore::with_local(Box::new(local)),
        &config.location,
    );

    if let Some(city) = &cli.city {
        location.set_city(city);
    }
    if cli.no_gps {
        location.set_use_gps(false);
    }

    let geolocator: Box<dyn Geolocator> = match (cli.lat, cli.lon) {
        (Some(lat), Some(lon)) => {
            location.set_use_gps(true);
            Box::new(FixedGeolocator::new(Coordinates::new(lat, lon)))
        }
        _ => Box::new(UnavailableGeolocator),
    };
    if let Err(e) = location.locate(geolocator.as_ref()).await {
        eprintln!("{}", e.user_message());
    }

    let target = location.target();
    tracing::info!(?target, "Starting weather dashboard");

    let current = WeatherFetcher::spawn(
        services.clone(),
        FetchOptions::current().with_settings(&config.weather),
    );
    current.set_location(target.clone());

    let forecast = cli.forecast.then(|| {
        let fetcher = WeatherFetcher::spawn(services.clone(), FetchOptions::forecast());
        fetcher.set_location(target.clone());
        fetcher
    });

    let place = match target.coords {
        Some(coords) => ReverseGeocoder::new(services.clone())
            .lookup(coords)
            .await
            .map_err(|e| tracing::debug!("Reverse geocode failed: {}", e))
            .ok(),
        None => None,
    };

    let mut current_rx = current.subscribe();
    let mut forecast_rx = forecast.as_ref().map(WeatherFetcher::subscribe);

    if cli.once {
        let state = settled(&mut current_rx).await;
        print_current(&state, place.as_deref());
        if let Some(rx) = forecast_rx.as_mut() {
            print_forecast(&settled(rx).await);
        }
        return match state.error {
            Some(error) if state.data.is_none() => Err(error.into()),
            _ => Ok(()),
        };
    }

    loop {
        tokio::select! {
            changed = current_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = current_rx.borrow_and_update().clone();
                if is_settled(&state) {
                    print_current(&state, place.as_deref());
                }
            }
            changed = forecast_changed(&mut forecast_rx) => {
                if changed.is_err() {
                    break;
                }
                if let Some(rx) = forecast_rx.as_mut() {
                    let state = rx.borrow_and_update().clone();
                    if is_settled(&state) {
                        print_forecast(&state);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn is_settled(state: &FetchState) -> bool {
    matches!(state.status, FetchStatus::Success | FetchStatus::Error) && !state.loading
}

async fn settled(rx: &mut watch::Receiver<FetchState>) -> FetchState {
    if let Ok(state) = rx.wait_for(is_settled).await {
        return state.clone();
    }
    rx.borrow().clone()
}

async fn forecast_changed(
    rx: &mut Option<watch::Receiver<FetchState>>,
) -> Result<(), watch::error::RecvError> {
    match rx {
        Some(rx) => rx.changed().await,
        None => std::future::pending().await,
    }
}

fn print_current(state: &FetchState, place: Option<&str>) {
    if let Some(current) = state.current() {
        let title = place.unwrap_or(&current.name);
        let description = current
            .condition()
            .map(|c| c.description.as_str())
            .unwrap_or_default();
        println!();
        println!("{}  {:.1}°  {}", title, current.main.temp, description);
        println!(
            "  Feels like {:.1}°  Humidity {}%  Pressure {} hPa",
            current.main.feels_like, current.main.humidity, current.main.pressure
        );
        if let Some(km) = current.visibility_km() {
            println!("  Visibility {:.1} km", km);
        }
        if let (Some(sunrise), Some(sunset)) = (current.sunrise(), current.sunset()) {
            println!(
                "  Sunrise {}  Sunset {}",
                sunrise.format("%H:%M"),
                sunset.format("%H:%M")
            );
        }
    }

    if let Some(error) = &state.error {
        println!("  ! {}", error.user_message());
    }

    if let Some(at) = state.last_updated_at {
        let stale = if state.is_stale() { " (stale)" } else { "" };
        println!(
            "  Updated {}{}",
            at.with_timezone(&Local).format("%H:%M:%S"),
            stale
        );
    }
}

fn print_forecast(state: &FetchState) {
    let Some(forecast) = state.forecast() else {
        if let Some(error) = &state.error {
            println!("  ! Forecast: {}", error.user_message());
        }
        return;
    };

    let hourly = forecast.today_hourly(Utc::now());
    if !hourly.is_empty() {
        println!();
        println!("Today");
        for slot in hourly {
            let time = forecast
                .local_time(slot)
                .map(|t| t.format("%H:%M").to_string())
                .unwrap_or_default();
            println!(
                "  {}  {:>5.1}°  rain {:>3.0}%",
                time,
                slot.main.temp,
                slot.pop * 100.0
            );
        }
    }

    println!();
    println!("Next days");
    for day in forecast.days().iter().take(5) {
        let description = day
            .slots
            .get(day.slots.len() / 2)
            .and_then(|s| s.condition())
            .map(|c| c.description.as_str())
            .unwrap_or_default();
        println!(
            "  {}  {:>5.1}° / {:>5.1}°  {}",
            day.date.format("%a %d/%m"),
            day.high().unwrap_or_default(),
            day.low().unwrap_or_default(),
            description
        );
    }
}
