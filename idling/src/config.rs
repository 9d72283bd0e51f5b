//! Runtime configuration, read from the environment.

use std::{collections::HashMap, env, error, fmt, time::Duration};

use regex::Regex;

/// How long to wait for all resources to become idle before giving up.
pub const ENV_TIMEOUT: &str = "ESPRESSO_IDLING_TIMEOUT";

/// How often to re-check, and warn about, resources that are still busy.
pub const ENV_WARNING_INTERVAL: &str = "ESPRESSO_IDLING_WARNING_INTERVAL";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(26);
pub const DEFAULT_WARNING_INTERVAL: Duration = Duration::from_secs(5);

/// The longest accepted timeout or warning interval.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

const DURATION_PATTERN: &str = r"\A\s*(\d+)\s*(ms|s|m|h)\s*\z";

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub timeout: Duration,
    pub warning_interval: Duration,
}

/// A source of configuration strings.
pub trait Strings {
    /// Retrieves the value for `key`, if set.
    fn get(&self, key: &str) -> Result<Option<String>, Error>;
}

/// Reads configuration from the process environment.
pub struct Env;

/// Configuration values supplied directly, for tests.
#[derive(Clone, Debug, Default)]
pub struct TestEnv {
    values: HashMap<&'static str, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    InvalidEnvVar {
        name: String,
        value: String,
        reason: ParseError,
    },
    WarningIntervalExceedsTimeout {
        warning_interval: Duration,
        timeout: Duration,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParseError {
    NotADuration,
    NotUnicode,
    ZeroDuration,
    TooLarge,
}

// ===== impl Config =====

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Self::load(&Env)
    }

    pub fn load<S: Strings>(strings: &S) -> Result<Self, Error> {
        let durations = duration_regex();
        let timeout = parse(strings, ENV_TIMEOUT, |s| parse_duration(&durations, s))?;
        let warning_interval =
            parse(strings, ENV_WARNING_INTERVAL, |s| parse_duration(&durations, s))?;

        let config = Config {
            timeout: timeout.unwrap_or(DEFAULT_TIMEOUT),
            warning_interval: warning_interval.unwrap_or(DEFAULT_WARNING_INTERVAL),
        };

        if config.warning_interval > config.timeout {
            error!(
                "{} ({:?}) must not exceed {} ({:?})",
                ENV_WARNING_INTERVAL, config.warning_interval, ENV_TIMEOUT, config.timeout,
            );
            return Err(Error::WarningIntervalExceedsTimeout {
                warning_interval: config.warning_interval,
                timeout: config.timeout,
            });
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeout: DEFAULT_TIMEOUT,
            warning_interval: DEFAULT_WARNING_INTERVAL,
        }
    }
}

// ===== impl Env =====

impl Strings for Env {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        match env::var(key) {
            Ok(value) => Ok(Some(value)),
            Err(env::VarError::NotPresent) => Ok(None),
            Err(env::VarError::NotUnicode(value)) => {
                error!("{} is not encoded in Unicode: {:?}", key, value);
                Err(Error::InvalidEnvVar {
                    name: key.to_owned(),
                    value: value.to_string_lossy().into_owned(),
                    reason: ParseError::NotUnicode,
                })
            }
        }
    }
}

// ===== impl TestEnv =====

impl TestEnv {
    pub fn put(&mut self, key: &'static str, value: String) {
        self.values.insert(key, value);
    }
}

impl Strings for TestEnv {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.values.get(key).cloned())
    }
}

// ===== impl Error =====

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::InvalidEnvVar { ref name, ref value, reason } => {
                write!(f, "invalid value {:?} for {}: {}", value, name, reason)
            }
            Error::WarningIntervalExceedsTimeout { warning_interval, timeout } => write!(
                f,
                "warning interval ({:?}) exceeds the timeout ({:?})",
                warning_interval, timeout
            ),
        }
    }
}

impl error::Error for Error {}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ParseError::NotADuration => f.pad("not a duration; expected e.g. `500ms` or `26s`"),
            ParseError::NotUnicode => f.pad("not valid unicode"),
            ParseError::ZeroDuration => f.pad("duration must be greater than zero"),
            ParseError::TooLarge => f.pad("duration must not exceed 24h"),
        }
    }
}

// ===== parsing =====

fn parse<S, T, P>(strings: &S, name: &str, parse: P) -> Result<Option<T>, Error>
where
    S: Strings,
    P: FnOnce(&str) -> Result<T, ParseError>,
{
    match strings.get(name)? {
        Some(ref value) => {
            let parsed = parse(value.as_str()).map_err(|reason| {
                error!("{}={:?} is not valid: {}", name, value, reason);
                Error::InvalidEnvVar {
                    name: name.to_owned(),
                    value: value.clone(),
                    reason,
                }
            })?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn duration_regex() -> Regex {
    Regex::new(DURATION_PATTERN).expect("duration regex")
}

fn parse_duration(re: &Regex, s: &str) -> Result<Duration, ParseError> {
    let cap = re.captures(s).ok_or(ParseError::NotADuration)?;

    // Only digits match, so a failed parse is an overflow.
    let magnitude: u64 = cap[1].parse().map_err(|_| ParseError::TooLarge)?;
    let secs_per_unit = match &cap[2] {
        "ms" => return bounded(Duration::from_millis(magnitude)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => unreachable!("duration regex only matches known units"),
    };
    let secs = magnitude.checked_mul(secs_per_unit).ok_or(ParseError::TooLarge)?;
    bounded(Duration::from_secs(secs))
}

fn bounded(d: Duration) -> Result<Duration, ParseError> {
    if d == Duration::from_secs(0) {
        Err(ParseError::ZeroDuration)
    } else if d > MAX_DURATION {
        Err(ParseError::TooLarge)
    } else {
        Ok(d)
    }
}
