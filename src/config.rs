//! Configuration

use std::convert::TryFrom;
use std::fmt;
use std::fs;
use std::path::Path;

use clap::ArgMatches;

/// Error that can occur during the cli config parsing
#[derive(Debug)]
pub enum ConfigError {
    /// A configuration `field` is required
    Required(String),
    /// A `field` conversion error occured
    Conversion(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Required(field) => write!(f, "The '{}' argument is required", field),
            ConfigError::Conversion(field) => {
                write!(f, "The '{}' argument could not be parsed", field)
            }
        }
    }
}

/// Selected execution backend
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BackendKind {
    /// AFL fork server under a userspace emulator
    Qemu,
    /// Superblock trace parsing under a dynamic translation tool
    Valgrind,
}

/// Config regarding I/O
#[derive(Debug)]
pub struct IOConfig {
    /// Seed input directory
    pub input_dir: String,
    /// Directory receiving crashing inputs
    pub output_dir: String,
    /// Working directory for the fork server plumbing
    pub work_dir: String,
}

impl IOConfig {
    /// Validate the `IOConfig`
    pub fn validate(&self) -> Result<(), String> {
        let input_dir = Path::new(&self.input_dir);
        if !input_dir.is_dir() {
            return Err(format!(
                "The input directory does not exist: {:?}",
                input_dir
            ));
        }

        let work_dir = Path::new(&self.work_dir);
        if !work_dir.is_dir() {
            return Err(format!(
                "The working directory does not exist: {:?}",
                work_dir
            ));
        }
        Ok(())
    }
}

impl TryFrom<&ArgMatches<'_>> for IOConfig {
    type Error = ConfigError;

    fn try_from(matches: &ArgMatches) -> Result<Self, Self::Error> {
        let input_dir = matches
            .value_of("input")
            .map(String::from)
            .ok_or_else(|| ConfigError::Required("input".to_string()))?;
        let output_dir = matches
            .value_of("output")
            .map(String::from)
            .ok_or_else(|| ConfigError::Required("output".to_string()))?;
        let work_dir = matches
            .value_of("workdir")
            .map(String::from)
            .ok_or_else(|| ConfigError::Required("workdir".to_string()))?;

        Ok(Self {
            input_dir,
            output_dir,
            work_dir,
        })
    }
}

/// Config regarding the target executable
#[derive(Debug)]
pub struct ExeConfig {
    /// Path to the target executable
    pub target: String,
    /// Backend used to run it
    pub backend: BackendKind,
}

impl ExeConfig {
    /// Validate the `ExeConfig`
    pub fn validate(&self) -> Result<(), String> {
        let target = Path::new(&self.target);
        match fs::metadata(target) {
            Ok(metadata) if metadata.is_file() => Ok(()),
            Ok(_) => Err(format!("The target is not a regular file: {:?}", target)),
            Err(error) => Err(format!("Cannot access the target {:?}: {}", target, error)),
        }
    }
}

impl TryFrom<&ArgMatches<'_>> for ExeConfig {
    type Error = ConfigError;

    fn try_from(matches: &ArgMatches) -> Result<Self, Self::Error> {
        let target = matches
            .value_of("target")
            .map(String::from)
            .ok_or_else(|| ConfigError::Required("target".to_string()))?;

        let backend = if matches.is_present("qemu") {
            BackendKind::Qemu
        } else if matches.is_present("valgrind") {
            BackendKind::Valgrind
        } else {
            return Err(ConfigError::Required("backend".to_string()));
        };

        Ok(Self { target, backend })
    }
}

/// Config regarding engine behavior
#[derive(Debug)]
pub struct AppConfig {
    /// Verbose mode
    pub verbose: bool,
    /// Per execution timeout in seconds, 0 to disable
    pub timeout: u64,
    /// Status line refresh interval in milliseconds
    pub stat_interval: u64,
}

impl TryFrom<&ArgMatches<'_>> for AppConfig {
    type Error = ConfigError;

    fn try_from(matches: &ArgMatches) -> Result<Self, Self::Error> {
        let timeout = matches
            .value_of("timeout")
            .ok_or_else(|| ConfigError::Required("timeout".to_string()))?
            .parse::<u64>()
            .map_err(|_| ConfigError::Conversion("timeout".to_string()))?;
        let stat_interval = matches
            .value_of("stat_interval")
            .ok_or_else(|| ConfigError::Required("stat_interval".to_string()))?
            .parse::<u64>()
            .map_err(|_| ConfigError::Conversion("stat_interval".to_string()))?;

        Ok(Self {
            verbose: matches.is_present("verbose"),
            timeout,
            stat_interval,
        })
    }
}

/// Global configuration
#[derive(Debug)]
pub struct Config {
    /// I/O configuration
    pub io_config: IOConfig,
    /// Target configuration
    pub exe_config: ExeConfig,
    /// Engine configuration
    pub app_config: AppConfig,
}

impl Config {
    /// Validate the whole configuration
    pub fn validate(&self) -> Result<(), String> {
        self.io_config.validate()?;
        self.exe_config.validate()
    }
}

impl TryFrom<&ArgMatches<'_>> for Config {
    type Error = ConfigError;

    fn try_from(matches: &ArgMatches) -> Result<Self, Self::Error> {
        Ok(Self {
            io_config: IOConfig::try_from(matches)?,
            exe_config: ExeConfig::try_from(matches)?,
            app_config: AppConfig::try_from(matches)?,
        })
    }
}
