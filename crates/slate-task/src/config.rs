//! Task configuration. One TOML file declares the task kind, output layout,
//! and a table per pipeline step. A step table can be switched off with
//! `enabled = false`, in which case its remaining keys are never parsed or
//! validated; a step table that is absent counts as disabled.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use slate_lib::connectivity::ConnMethod;
use slate_lib::sourcespace;
use slate_lib::wavelet::{ThresholdMode, Wavelet};
use std::fs;
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    RestingSourcePsd,
    SourceAnalysis,
    LineNoiseCheck,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::RestingSourcePsd => "resting_source_psd",
            TaskKind::SourceAnalysis => "source_analysis",
            TaskKind::LineNoiseCheck => "line_noise_check",
        }
    }
}

/// Step enablement with lazily parsed parameters.
#[derive(Debug, Clone)]
pub enum StepConfig<T> {
    Disabled,
    Enabled(T),
}

impl<T> Default for StepConfig<T> {
    fn default() -> Self {
        StepConfig::Disabled
    }
}

impl<T> StepConfig<T> {
    pub fn is_enabled(&self) -> bool {
        matches!(self, StepConfig::Enabled(_))
    }

    pub fn params(&self) -> Option<&T> {
        match self {
            StepConfig::Enabled(params) => Some(params),
            StepConfig::Disabled => None,
        }
    }
}

impl<'de, T> Deserialize<'de> for StepConfig<T>
where
    T: DeserializeOwned,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = toml::Value::deserialize(deserializer)?;
        let enabled = match value.get("enabled") {
            None => true,
            Some(toml::Value::Boolean(flag)) => *flag,
            Some(other) => {
                return Err(serde::de::Error::custom(format!(
                    "enabled must be a boolean, got {other}"
                )))
            }
        };
        if !enabled {
            return Ok(StepConfig::Disabled);
        }
        let params = value.try_into().map_err(serde::de::Error::custom)?;
        Ok(StepConfig::Enabled(params))
    }
}

impl<T> Serialize for StepConfig<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(Serialize)]
        struct Enabled<'a, T: Serialize> {
            enabled: bool,
            #[serde(flatten)]
            params: &'a T,
        }
        #[derive(Serialize)]
        struct Disabled {
            enabled: bool,
        }
        match self {
            StepConfig::Disabled => Disabled { enabled: false }.serialize(serializer),
            StepConfig::Enabled(params) => Enabled {
                enabled: true,
                params,
            }
            .serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LineNoiseParams {
    pub fline: f64,
    pub nkeep: usize,
    pub max_iter: usize,
}

impl Default for LineNoiseParams {
    fn default() -> Self {
        Self {
            fline: 50.0,
            nkeep: 1,
            max_iter: 1,
        }
    }
}

impl LineNoiseParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.fline > 0.0) {
            bail!("line_noise.fline must be positive, got {}", self.fline);
        }
        if self.nkeep < 1 {
            bail!("line_noise.nkeep must be at least 1");
        }
        if self.max_iter < 1 {
            bail!("line_noise.max_iter must be at least 1");
        }
        Ok(())
    }
}

/// Decomposition depth: an explicit level or "auto" for the deepest the
/// signal supports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaveletLevel {
    Fixed(i64),
    Named(String),
}

impl Default for WaveletLevel {
    fn default() -> Self {
        WaveletLevel::Named("auto".into())
    }
}

impl WaveletLevel {
    pub fn resolve(&self) -> Option<usize> {
        match self {
            WaveletLevel::Fixed(level) => Some(*level as usize),
            WaveletLevel::Named(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveletParams {
    pub wavelet: String,
    pub level: WaveletLevel,
    pub mode: ThresholdMode,
    pub threshold_scale: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub erp_bandpass: Option<(f64, f64)>,
    pub psd_fmax: f64,
}

impl Default for WaveletParams {
    fn default() -> Self {
        Self {
            wavelet: "sym4".into(),
            level: WaveletLevel::default(),
            mode: ThresholdMode::Soft,
            threshold_scale: 1.0,
            erp_bandpass: None,
            psd_fmax: 45.0,
        }
    }
}

impl WaveletParams {
    pub fn validate(&self) -> Result<()> {
        Wavelet::by_name(&self.wavelet).context("wavelet_threshold.wavelet")?;
        match &self.level {
            WaveletLevel::Fixed(level) if *level < 0 => {
                bail!("wavelet_threshold.level must be >= 0, got {level}");
            }
            WaveletLevel::Named(name) if name != "auto" => {
                bail!(
                    "wavelet_threshold.level must be an integer >= 0 or \"auto\", got {name:?}"
                );
            }
            _ => {}
        }
        if !(self.threshold_scale > 0.0) {
            bail!(
                "wavelet_threshold.threshold_scale must be positive, got {}",
                self.threshold_scale
            );
        }
        if let Some((lo, hi)) = self.erp_bandpass {
            if !(lo > 0.0 && hi > lo) {
                bail!(
                    "wavelet_threshold.erp_bandpass must satisfy 0 < lo < hi, got ({lo}, {hi})"
                );
            }
        }
        if !(self.psd_fmax > 0.0) {
            bail!(
                "wavelet_threshold.psd_fmax must be positive, got {}",
                self.psd_fmax
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpochingParams {
    /// Epoch length in seconds.
    pub length: f64,
    /// Overlap between consecutive epochs in seconds.
    pub overlap: f64,
}

impl Default for EpochingParams {
    fn default() -> Self {
        Self {
            length: 4.0,
            overlap: 0.0,
        }
    }
}

impl EpochingParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.length > 0.0) {
            bail!("epoching.length must be positive, got {}", self.length);
        }
        if !(self.overlap >= 0.0 && self.overlap < self.length) {
            bail!(
                "epoching.overlap must be in [0, length), got {} with length {}",
                self.overlap,
                self.length
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RejectEpochsParams {
    pub n_interpolate: Vec<usize>,
    pub consensus: Vec<f64>,
}

impl Default for RejectEpochsParams {
    fn default() -> Self {
        Self {
            n_interpolate: vec![1, 4, 8],
            consensus: vec![0.1, 0.25, 0.5, 0.75, 0.9],
        }
    }
}

impl RejectEpochsParams {
    pub fn validate(&self) -> Result<()> {
        if self.n_interpolate.is_empty() {
            bail!("reject_epochs.n_interpolate must not be empty");
        }
        if self.n_interpolate.iter().any(|&n| n == 0) {
            bail!("reject_epochs.n_interpolate values must be positive");
        }
        if self.consensus.is_empty() {
            bail!("reject_epochs.consensus must not be empty");
        }
        if let Some(bad) = self.consensus.iter().find(|&&c| !(c > 0.0 && c <= 1.0)) {
            bail!(
                "reject_epochs.consensus values must be in (0, 1], got {bad}"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceLocalizationParams {
    /// Executable implementing the localization contract.
    pub program: PathBuf,
    pub lambda2: f64,
    pub n_jobs: usize,
}

impl Default for SourceLocalizationParams {
    fn default() -> Self {
        Self {
            program: PathBuf::from("slate-localize"),
            lambda2: 1.0 / 9.0,
            n_jobs: 1,
        }
    }
}

impl SourceLocalizationParams {
    pub fn validate(&self) -> Result<()> {
        if self.program.as_os_str().is_empty() {
            bail!("source_localization.program must not be empty");
        }
        if !(self.lambda2 > 0.0) {
            bail!(
                "source_localization.lambda2 must be positive, got {}",
                self.lambda2
            );
        }
        if self.n_jobs < 1 {
            bail!("source_localization.n_jobs must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcePsdParams {
    pub fmin: f64,
    pub fmax: f64,
    /// Welch segment length in seconds.
    pub segment_duration: f64,
    /// Welch segment overlap as a fraction in [0, 1).
    pub segment_overlap: f64,
}

impl Default for SourcePsdParams {
    fn default() -> Self {
        Self {
            fmin: 0.5,
            fmax: 45.0,
            segment_duration: 4.0,
            segment_overlap: 0.5,
        }
    }
}

impl SourcePsdParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.fmin >= 0.0 && self.fmax > self.fmin) {
            bail!(
                "source_psd requires 0 <= fmin < fmax, got fmin {} fmax {}",
                self.fmin,
                self.fmax
            );
        }
        if !(self.segment_duration > 0.0) {
            bail!(
                "source_psd.segment_duration must be positive, got {}",
                self.segment_duration
            );
        }
        if !(self.segment_overlap >= 0.0 && self.segment_overlap < 1.0) {
            bail!(
                "source_psd.segment_overlap must be in [0, 1), got {}",
                self.segment_overlap
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AperiodicFitParams {
    pub fmin: f64,
    pub fmax: f64,
    pub peak_width_limits: (f64, f64),
    pub max_n_peaks: usize,
    pub batch_size: usize,
    pub n_jobs: usize,
}

impl Default for AperiodicFitParams {
    fn default() -> Self {
        Self {
            fmin: 1.0,
            fmax: 45.0,
            peak_width_limits: (1.0, 8.0),
            max_n_peaks: 6,
            batch_size: 2000,
            n_jobs: 1,
        }
    }
}

impl AperiodicFitParams {
    pub fn validate(&self) -> Result<()> {
        validate_fit_params(
            "aperiodic_fit",
            self.fmin,
            self.fmax,
            self.peak_width_limits,
            self.max_n_peaks,
            self.batch_size,
            self.n_jobs,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodicFitParams {
    pub fmin: f64,
    pub fmax: f64,
    pub peak_width_limits: (f64, f64),
    pub max_n_peaks: usize,
    pub batch_size: usize,
    pub n_jobs: usize,
}

impl Default for PeriodicFitParams {
    fn default() -> Self {
        Self {
            fmin: 1.0,
            fmax: 45.0,
            peak_width_limits: (1.0, 12.0),
            max_n_peaks: 6,
            batch_size: 2000,
            n_jobs: 1,
        }
    }
}

impl PeriodicFitParams {
    pub fn validate(&self) -> Result<()> {
        validate_fit_params(
            "periodic_fit",
            self.fmin,
            self.fmax,
            self.peak_width_limits,
            self.max_n_peaks,
            self.batch_size,
            self.n_jobs,
        )
    }
}

fn validate_fit_params(
    step: &str,
    fmin: f64,
    fmax: f64,
    peak_width_limits: (f64, f64),
    max_n_peaks: usize,
    batch_size: usize,
    n_jobs: usize,
) -> Result<()> {
    if !(fmin > 0.0 && fmax > fmin) {
        bail!("{step} requires 0 < fmin < fmax, got fmin {fmin} fmax {fmax}");
    }
    let (lo, hi) = peak_width_limits;
    if !(lo > 0.0 && hi > lo) {
        bail!("{step}.peak_width_limits must satisfy 0 < lower < upper, got ({lo}, {hi})");
    }
    if max_n_peaks < 1 {
        bail!("{step}.max_n_peaks must be at least 1");
    }
    if batch_size < 1 {
        bail!("{step}.batch_size must be at least 1");
    }
    if n_jobs < 1 {
        bail!("{step}.n_jobs must be at least 1");
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityParams {
    /// Sampled epoch length in seconds.
    pub epoch_length: f64,
    pub n_epochs: usize,
    pub methods: Vec<ConnMethod>,
    pub rois: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for ConnectivityParams {
    fn default() -> Self {
        Self {
            epoch_length: 4.0,
            n_epochs: 60,
            methods: ConnMethod::all().to_vec(),
            rois: sourcespace::sensorimotor_rois(),
            seed: None,
        }
    }
}

impl ConnectivityParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.epoch_length > 0.0) {
            bail!(
                "connectivity.epoch_length must be positive, got {}",
                self.epoch_length
            );
        }
        if self.n_epochs < 1 {
            bail!("connectivity.n_epochs must be at least 1");
        }
        if self.methods.is_empty() {
            bail!("connectivity.methods must not be empty");
        }
        if self.rois.is_empty() {
            bail!("connectivity.rois must not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepTable {
    pub line_noise: StepConfig<LineNoiseParams>,
    pub wavelet_threshold: StepConfig<WaveletParams>,
    pub epoching: StepConfig<EpochingParams>,
    pub reject_epochs: StepConfig<RejectEpochsParams>,
    pub source_localization: StepConfig<SourceLocalizationParams>,
    pub source_psd: StepConfig<SourcePsdParams>,
    pub aperiodic_fit: StepConfig<AperiodicFitParams>,
    pub periodic_fit: StepConfig<PeriodicFitParams>,
    pub connectivity: StepConfig<ConnectivityParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub derivatives_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            derivatives_dir: PathBuf::from("derivatives"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub task: TaskKind,
    #[serde(default = "default_montage")]
    pub montage: String,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub steps: StepTable,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

fn default_montage() -> String {
    "GSN-HydroCel-129".into()
}

impl TaskConfig {
    /// Read and validate a config file. Fails before any data is touched.
    pub fn load(path: &Path) -> Result<TaskConfig> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: TaskConfig = toml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            bail!(
                "unsupported schema_version {}, this build expects {}",
                self.schema_version,
                SCHEMA_VERSION
            );
        }
        let steps = &self.steps;
        if let Some(params) = steps.line_noise.params() {
            params.validate()?;
        }
        if let Some(params) = steps.wavelet_threshold.params() {
            params.validate()?;
        }
        if let Some(params) = steps.epoching.params() {
            params.validate()?;
        }
        if let Some(params) = steps.reject_epochs.params() {
            params.validate()?;
        }
        if let Some(params) = steps.source_localization.params() {
            params.validate()?;
            if self.montage.trim().is_empty() {
                bail!("montage must not be empty when source_localization is enabled");
            }
        }
        if let Some(params) = steps.source_psd.params() {
            params.validate()?;
        }
        if let Some(params) = steps.aperiodic_fit.params() {
            params.validate()?;
        }
        if let Some(params) = steps.periodic_fit.params() {
            params.validate()?;
        }
        if let Some(params) = steps.connectivity.params() {
            params.validate()?;
        }
        Ok(())
    }
}
