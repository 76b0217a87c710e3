//! Sunrise and sunset for the garden's location, and the light schedule built on them.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use sunrise::{Coordinates, SolarDay, SolarEvent};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SunError {
    #[error("Unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("Latitude {0} is outside -90..=90")]
    InvalidLatitude(f64),

    #[error("Longitude {0} is outside -180..=180")]
    InvalidLongitude(f64),

    #[error("No sunrise/sunset at {location} on {date}")]
    NoSunEvents { location: String, date: NaiveDate },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Location {
    pub city: String,
    pub region: String,
    pub timezone: Tz,
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(
        city: impl Into<String>,
        region: impl Into<String>,
        timezone: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<Self, SunError> {
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| SunError::UnknownTimezone(timezone.to_string()))?;
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(SunError::InvalidLatitude(latitude));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(SunError::InvalidLongitude(longitude));
        }
        Ok(Self {
            city: city.into(),
            region: region.into(),
            timezone,
            latitude,
            longitude,
        })
    }

    /// Calendar date at the garden for an instant.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.timezone).date_naive()
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}/{} ({}, {:.6}, {:.6})",
            self.city, self.region, self.timezone, self.latitude, self.longitude
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SunEvents {
    pub sunrise: DateTime<Utc>,
    pub sunset: DateTime<Utc>,
}

impl SunEvents {
    /// `sunrise <= at < sunset`.
    pub fn is_daylight(&self, at: DateTime<Utc>) -> bool {
        self.sunrise <= at && at < self.sunset
    }
}

pub trait SunCalculator: Send {
    fn sunrise_sunset(&self, location: &Location, date: NaiveDate) -> Result<SunEvents, SunError>;
}

/// NOAA sunrise equation from the `sunrise` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct AstronomicalCalculator;

impl SunCalculator for AstronomicalCalculator {
    fn sunrise_sunset(&self, location: &Location, date: NaiveDate) -> Result<SunEvents, SunError> {
        let no_events = || SunError::NoSunEvents {
            location: location.to_string(),
            date,
        };
        let coordinates =
            Coordinates::new(location.latitude, location.longitude).ok_or_else(no_events)?;
        let day = SolarDay::new(coordinates, date);
        let sunrise = day.event_time(SolarEvent::Sunrise);
        let sunset = day.event_time(SolarEvent::Sunset);
        // Polar day and night come back as a degenerate pair.
        if sunrise >= sunset {
            return Err(no_events());
        }
        Ok(SunEvents { sunrise, sunset })
    }
}

/// Caches the day's sun events and refetches them every `refresh_ticks` ticks.
pub struct SunSchedule {
    calculator: Box<dyn SunCalculator>,
    location: Location,
    refresh_ticks: u32,
    ticks_since_fetch: u32,
    events: Option<SunEvents>,
}

impl SunSchedule {
    pub fn new(calculator: Box<dyn SunCalculator>, location: Location, refresh_ticks: u32) -> Self {
        Self {
            calculator,
            location,
            refresh_ticks: refresh_ticks.max(1),
            ticks_since_fetch: 0,
            events: None,
        }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn events(&self) -> Option<SunEvents> {
        self.events
    }

    /// Desired light state for this tick, `None` when no sun events were ever fetched.
    pub fn light_desired(&mut self, now: DateTime<Utc>) -> Option<bool> {
        if self.events.is_none() || self.ticks_since_fetch >= self.refresh_ticks {
            self.refresh(now);
        }
        self.ticks_since_fetch += 1;
        self.events.map(|events| events.is_daylight(now))
    }

    fn refresh(&mut self, now: DateTime<Utc>) {
        let date = self.location.local_date(now);
        self.ticks_since_fetch = 0;
        match self.calculator.sunrise_sunset(&self.location, date) {
            Ok(events) => {
                info!(
                    "{}: sunrise {} sunset {}",
                    self.location,
                    events.sunrise.with_timezone(&self.location.timezone),
                    events.sunset.with_timezone(&self.location.timezone)
                );
                self.events = Some(events);
            }
            Err(e) => match self.events {
                Some(_) => warn!("Keeping previous sun events: {}", e),
                None => warn!("No sun events available yet: {}", e),
            },
        }
        debug!("Next sun event refresh in {} ticks", self.refresh_ticks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct CountingCalculator {
        calls: Arc<Mutex<u32>>,
        fail: bool,
    }

    impl SunCalculator for CountingCalculator {
        fn sunrise_sunset(
            &self,
            location: &Location,
            date: NaiveDate,
        ) -> Result<SunEvents, SunError> {
            *self.calls.lock().unwrap() += 1;
            if self.fail {
                return Err(SunError::NoSunEvents {
                    location: location.to_string(),
                    date,
                });
            }
            Ok(SunEvents {
                sunrise: Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
                sunset: Utc.with_ymd_and_hms(2024, 6, 1, 21, 0, 0).unwrap(),
            })
        }
    }

    fn new_york() -> Location {
        Location::new("New York", "United States", "America/New_York", 40.725380, -73.980760)
            .unwrap()
    }

    #[test]
    fn daylight_is_half_open() {
        let events = SunEvents {
            sunrise: Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
            sunset: Utc.with_ymd_and_hms(2024, 6, 1, 21, 0, 0).unwrap(),
        };
        assert!(events.is_daylight(events.sunrise));
        assert!(events.is_daylight(Utc.with_ymd_and_hms(2024, 6, 1, 20, 59, 59).unwrap()));
        assert!(!events.is_daylight(events.sunset));
        assert!(!events.is_daylight(Utc.with_ymd_and_hms(2024, 6, 1, 8, 59, 59).unwrap()));
    }

    #[test]
    fn invalid_locations_are_rejected() {
        assert!(matches!(
            Location::new("x", "y", "Mars/Olympus_Mons", 0.0, 0.0),
            Err(SunError::UnknownTimezone(_))
        ));
        assert!(matches!(
            Location::new("x", "y", "UTC", 91.0, 0.0),
            Err(SunError::InvalidLatitude(_))
        ));
        assert!(matches!(
            Location::new("x", "y", "UTC", 0.0, -181.0),
            Err(SunError::InvalidLongitude(_))
        ));
    }

    #[test]
    fn local_date_follows_timezone() {
        let location = new_york();
        let late_evening = Utc.with_ymd_and_hms(2024, 6, 2, 2, 0, 0).unwrap();
        assert_eq!(
            location.local_date(late_evening),
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
        );
    }

    #[test]
    fn new_york_midsummer_has_daylight_around_noon() {
        let location = new_york();
        let date = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
        let events = AstronomicalCalculator.sunrise_sunset(&location, date).unwrap();
        let local_noon = Utc.with_ymd_and_hms(2024, 6, 21, 16, 0, 0).unwrap();
        let local_midnight = Utc.with_ymd_and_hms(2024, 6, 21, 4, 0, 0).unwrap();
        assert!(events.is_daylight(local_noon));
        assert!(!events.is_daylight(local_midnight));
        let day_length = events.sunset - events.sunrise;
        assert!(day_length > chrono::Duration::hours(14));
        assert!(day_length < chrono::Duration::hours(16));
    }

    #[test]
    fn polar_night_has_no_sun_events() {
        let tromso = Location::new("Tromso", "Norway", "Europe/Oslo", 69.6492, 18.9553).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 12, 21).unwrap();
        assert!(matches!(
            AstronomicalCalculator.sunrise_sunset(&tromso, date),
            Err(SunError::NoSunEvents { .. })
        ));
    }

    #[test]
    fn schedule_refetches_after_refresh_ticks() {
        let calculator = CountingCalculator::default();
        let calls = calculator.calls.clone();
        let mut schedule = SunSchedule::new(Box::new(calculator), new_york(), 3);
        let noon = Utc.with_ymd_and_hms(2024, 6, 1, 16, 0, 0).unwrap();

        for _ in 0..3 {
            assert_eq!(schedule.light_desired(noon), Some(true));
        }
        assert_eq!(*calls.lock().unwrap(), 1);

        assert_eq!(schedule.light_desired(noon), Some(true));
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[test]
    fn schedule_without_events_has_no_opinion() {
        let calculator = CountingCalculator {
            fail: true,
            ..Default::default()
        };
        let calls = calculator.calls.clone();
        let mut schedule = SunSchedule::new(Box::new(calculator), new_york(), 720);
        let noon = Utc.with_ymd_and_hms(2024, 6, 1, 16, 0, 0).unwrap();

        assert_eq!(schedule.light_desired(noon), None);
        // Retried on the next tick rather than after a full refresh period.
        assert_eq!(schedule.light_desired(noon), None);
        assert_eq!(*calls.lock().unwrap(), 2);
    }
}
