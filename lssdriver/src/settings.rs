use config::{Config, ConfigError, Environment, File};
use dotenv::dotenv;
use lsscache::{info, linear_samples, log_samples, FilterParams, FrwModel, GrowthParams, LoopParams, MatsubaraXyParams, Tolerances};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Once;

pub const ENV_PREFIX: &str = "LSSEFT";

/// How many kernels run side by side. Named levels scale with the machine, `Workers` pins
/// the count. Configured as `"off"`, `"low"`, `"mild"`, `"high"` or a plain number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    Off,
    Low,
    Mild,
    High,
    Workers(usize),
}

impl Parallelism {
    pub fn worker_count(self) -> usize {
        let cpus = num_cpus::get();
        let n = match self {
            Parallelism::Off => 1,
            Parallelism::Low => cpus / 8,
            Parallelism::Mild => cpus / 4,
            Parallelism::High => cpus / 2,
            Parallelism::Workers(n) => n,
        };
        n.max(1)
    }
}

impl FromStr for Parallelism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = s.trim().to_lowercase();
        match level.as_str() {
            "off" => Ok(Parallelism::Off),
            "low" => Ok(Parallelism::Low),
            "mild" => Ok(Parallelism::Mild),
            "high" => Ok(Parallelism::High),
            _ => match level.parse::<usize>() {
                Ok(0) => Err("worker count must be at least 1".to_string()),
                Ok(n) => Ok(Parallelism::Workers(n)),
                Err(_) => Err(format!("expected off, low, mild, high or a worker count, got {:?}", s)),
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawParallelism {
    Count(usize),
    Level(String),
}

impl<'de> Deserialize<'de> for Parallelism {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawParallelism::deserialize(deserializer)? {
            RawParallelism::Count(0) => Err(serde::de::Error::custom("worker count must be at least 1")),
            RawParallelism::Count(n) => Ok(Parallelism::Workers(n)),
            RawParallelism::Level(level) => level.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseSettings,
    #[serde(default)]
    pub tolerances: Tolerances,
    #[serde(default)]
    pub model: FrwModel,
    pub sampling: SamplingSettings,
    pub spectrum: SpectrumSettings,
    pub workers: WorkerSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    pub path: String,
    pub cache_size_mb: usize,
    /// Remove rows left behind by interrupted runs before computing anything.
    #[serde(default)]
    pub prune_on_start: bool,
}

/// Sample grids. Redshifts are spaced linearly, wavenumbers logarithmically.
#[derive(Debug, Deserialize, Clone)]
pub struct SamplingSettings {
    pub z_min: f64,
    pub z_max: f64,
    pub z_samples: usize,
    pub k_min: f64,
    pub k_max: f64,
    pub k_samples: usize,
    pub ir_cutoffs: Vec<f64>,
    pub uv_cutoffs: Vec<f64>,
    pub ir_resum: Vec<f64>,
}

impl SamplingSettings {
    pub fn redshifts(&self) -> Vec<f64> {
        linear_samples(self.z_min, self.z_max, self.z_samples)
    }

    pub fn wavenumbers(&self) -> Vec<f64> {
        log_samples(self.k_min, self.k_max, self.k_samples)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpectrumSettings {
    /// Two column text file of `k P(k)`, `#` starts a comment.
    pub linear_pk_path: String,
    #[serde(default)]
    pub growth: GrowthParams,
    #[serde(default)]
    pub loop_integral: LoopParams,
    #[serde(default)]
    pub filter: FilterParams,
    #[serde(default)]
    pub matsubara_xy: MatsubaraXyParams,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerSettings {
    pub parallelism: Parallelism,
    /// Results persisted per store transaction.
    pub store_batch_size: usize,
}

impl WorkerSettings {
    pub fn worker_count(&self) -> usize {
        self.parallelism.worker_count()
    }
}

static DOTENV_ONCE: Once = Once::new();

fn ensure_dotenv_loaded() {
    DOTENV_ONCE.call_once(|| match dotenv() {
        Ok(_) => info!("Config loaded including .env file."),
        Err(_) => info!("Config loaded without .env file."),
    });
}

/// Reads `path` and overlays `<prefix>__SECTION__KEY` environment variables.
pub fn load_config<T>(path: &str, prefix: &str) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Debug,
{
    ensure_dotenv_loaded();
    let cfg = Config::builder()
        .add_source(File::with_name(path).required(true))
        .add_source(Environment::with_prefix(prefix).try_parsing(true).separator("__"))
        .build()?
        .try_deserialize::<T>()?;
    info!("{:#?}", cfg);
    Ok(cfg)
}

impl AppConfig {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = load_config(path, ENV_PREFIX)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects grids that would tokenize to nothing or to a single point repeated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sampling;
        let problem = if s.z_samples == 0 || s.k_samples == 0 {
            Some("sampling needs at least one redshift and one wavenumber".to_string())
        } else if s.z_min > s.z_max {
            Some(format!("z_min {} exceeds z_max {}", s.z_min, s.z_max))
        } else if s.k_min <= 0.0 || s.k_min > s.k_max {
            Some(format!("wavenumbers need 0 < k_min <= k_max, got {} and {}", s.k_min, s.k_max))
        } else if s.ir_cutoffs.is_empty() || s.uv_cutoffs.is_empty() || s.ir_resum.is_empty() {
            Some("IR cutoffs, UV cutoffs and IR resummation scales must not be empty".to_string())
        } else if self.workers.store_batch_size == 0 {
            Some("store_batch_size must be at least 1".to_string())
        } else {
            None
        };
        match problem {
            Some(msg) => Err(ConfigError::Message(msg)),
            None => Ok(()),
        }
    }
}
