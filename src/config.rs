//! Configuration types for the document-processing service.
//!
//! All behaviour is controlled through [`ServiceConfig`], built via its
//! [`ServiceConfigBuilder`]. The converter pool has its own nested
//! [`ConverterConfig`] because it is also constructed standalone in tests and
//! by callers that only need the pool.
//!
//! # Design choice: builder over constructor
//! Setters clamp obviously-wrong values (zero workers, zero timeouts) so a
//! misconfigured environment degrades to a working minimum instead of a
//! deadlocked pool. `build()` rejects the combinations that cannot be
//! repaired, such as an empty port range.

use crate::error::ServiceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Whether PDF pages are recognised by OCR or read from their text layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationMode {
    /// Rasterise every page and run OCR on it. (default)
    #[default]
    Ocr,
    /// Extract embedded PDF text; images are acknowledged but not recognised.
    NoOcr,
}

impl FromStr for OperationMode {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "OCR" => Ok(OperationMode::Ocr),
            "NO_OCR" | "NOOCR" => Ok(OperationMode::NoOcr),
            other => Err(ServiceError::InvalidConfig(format!(
                "unknown operation mode '{other}' (expected OCR or NO_OCR)"
            ))),
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationMode::Ocr => f.write_str("OCR"),
            OperationMode::NoOcr => f.write_str("NO_OCR"),
        }
    }
}

// ── Port range ───────────────────────────────────────────────────────────

/// Half-open range of TCP ports available to converter workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end
    }

    /// Port for a zero-based worker slot, if it falls inside the range.
    pub fn port_for_slot(&self, slot: usize) -> Option<u16> {
        let port = u16::try_from(slot).ok().and_then(|s| self.start.checked_add(s))?;
        self.contains(port).then_some(port)
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..self.end
    }
}

impl FromStr for PortRange {
    type Err = ServiceError;

    /// Accepts `9900-9904`, `9900,9904` and `(9900, 9904)`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('(').trim_end_matches(')');
        let (a, b) = trimmed
            .split_once(',')
            .or_else(|| trimmed.split_once('-'))
            .ok_or_else(|| {
                ServiceError::InvalidConfig(format!("port range '{s}' must look like 9900-9904"))
            })?;
        let parse = |v: &str| {
            v.trim().parse::<u16>().map_err(|e| {
                ServiceError::InvalidConfig(format!("invalid port '{}' in '{s}': {e}", v.trim()))
            })
        };
        let range = PortRange::new(parse(a)?, parse(b)?);
        if range.is_empty() {
            return Err(ServiceError::InvalidConfig(format!(
                "port range '{s}' is empty (end must be greater than start)"
            )));
        }
        Ok(range)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

// ── Command templates ────────────────────────────────────────────────────

/// An external command with `{placeholder}` substitution in program and args.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Substitute every `{key}` with its value.
    pub fn render(&self, vars: &[(&str, &str)]) -> (String, Vec<String>) {
        let fill = |s: &str| {
            vars.iter().fold(s.to_string(), |acc, (key, value)| {
                acc.replace(&format!("{{{key}}}"), value)
            })
        };
        (fill(&self.program), self.args.iter().map(|a| fill(a)).collect())
    }

    /// `unoserver` listening on `{host}:{port}` with a private profile.
    pub fn unoserver_server() -> Self {
        Self::new(
            "{python}",
            [
                "-m",
                "unoserver.server",
                "--interface",
                "{host}",
                "--port",
                "{port}",
                "--uno-port",
                "{uno_port}",
                "--executable",
                "{soffice}",
                "--user-installation",
                "{profile}",
            ],
        )
    }

    /// One-shot `unoserver` client converting `{input}` to PDF at `{output}`.
    pub fn unoserver_client() -> Self {
        Self::new(
            "{python}",
            [
                "-c",
                "from unoserver.client import converter_main; converter_main()",
                "{input}",
                "{output}",
                "--host",
                "{host}",
                "--port",
                "{port}",
                "--convert-to",
                "pdf",
            ],
        )
    }
}

// ── Converter pool ───────────────────────────────────────────────────────

/// Settings for the converter-process pool.
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    /// Number of converter workers to provision. Default: 1.
    pub workers: usize,

    /// First port used when `port_range` is not set. Default: 9900.
    pub base_port: u16,

    /// Explicit port range. When `None` the range is `base_port..base_port + workers`.
    pub port_range: Option<PortRange>,

    /// Interface the servers listen on. Default: `localhost`.
    pub host: String,

    /// Python interpreter substituted for `{python}`. Default: `python3`.
    pub python: String,

    /// LibreOffice executable substituted for `{soffice}`. Default: `soffice`.
    pub soffice: String,

    /// Long-lived server command.
    pub server_command: CommandTemplate,

    /// Per-conversion client command.
    pub client_command: CommandTemplate,

    /// Flag used to pass a LibreOffice import filter to the client.
    /// `None` disables filter hints. Default: `--input-filter`.
    pub input_filter_flag: Option<String>,

    /// Offset from the worker port to its internal UNO port. Default: 100.
    pub uno_port_offset: u16,

    /// Wall-clock budget of one conversion in seconds. Default: 100.
    pub process_timeout_secs: u64,

    /// Health monitor interval in seconds. Default: 10.
    pub monitor_interval_secs: u64,

    /// Grace period between terminate and kill, in milliseconds. Default: 3000.
    pub shutdown_grace_ms: u64,

    /// Extra acquire attempts when every worker is busy. Default: 2.
    ///
    /// Delays double after each attempt: 200 ms → 400 ms. Set to 0 to fall
    /// back to text extraction immediately.
    pub acquire_retries: u32,

    /// Initial acquire retry delay in milliseconds. Default: 200.
    pub acquire_backoff_ms: u64,

    /// Shared `{port: pid}` registry for replicas on one host.
    pub registry_path: Option<PathBuf>,

    /// Fixed slot for this replica in the registry. Requires `registry_path`.
    pub replica_slot: Option<usize>,

    /// Directory for conversion scratch files and worker profiles.
    pub tmp_dir: PathBuf,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            base_port: 9900,
            port_range: None,
            host: "localhost".into(),
            python: "python3".into(),
            soffice: "soffice".into(),
            server_command: CommandTemplate::unoserver_server(),
            client_command: CommandTemplate::unoserver_client(),
            input_filter_flag: Some("--input-filter".into()),
            uno_port_offset: 100,
            process_timeout_secs: 100,
            monitor_interval_secs: 10,
            shutdown_grace_ms: 3000,
            acquire_retries: 2,
            acquire_backoff_ms: 200,
            registry_path: None,
            replica_slot: None,
            tmp_dir: default_tmp_dir(),
        }
    }
}

impl ConverterConfig {
    pub fn effective_port_range(&self) -> PortRange {
        self.port_range.unwrap_or_else(|| {
            let count = u16::try_from(self.workers).unwrap_or(u16::MAX);
            PortRange::new(self.base_port, self.base_port.saturating_add(count))
        })
    }

    pub(crate) fn validate(&self) -> Result<(), ServiceError> {
        let range = self.effective_port_range();
        if range.is_empty() {
            return Err(ServiceError::InvalidConfig(format!(
                "converter port range {range} is empty"
            )));
        }
        if let Some(slot) = self.replica_slot {
            if self.registry_path.is_none() {
                return Err(ServiceError::InvalidConfig(
                    "replica_slot requires registry_path".into(),
                ));
            }
            if range.port_for_slot(slot).is_none() {
                return Err(ServiceError::InvalidConfig(format!(
                    "replica slot {slot} is outside port range {range}"
                )));
            }
        }
        if self.server_command.program.is_empty() || self.client_command.program.is_empty() {
            return Err(ServiceError::InvalidConfig(
                "converter commands must name a program".into(),
            ));
        }
        Ok(())
    }
}

// ── OCR engine ───────────────────────────────────────────────────────────

/// Settings for the tesseract command-line engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TesseractConfig {
    /// Executable name or path. Default: `tesseract`.
    pub binary: String,
    /// Language pack(s), e.g. `eng` or `eng+deu`. Default: `eng`.
    pub lang: String,
    /// Extra flags passed verbatim (e.g. `--psm 6`).
    pub extra_flags: Vec<String>,
    /// Value for `TESSDATA_PREFIX`, if set.
    pub tessdata_prefix: Option<PathBuf>,
}

impl Default for TesseractConfig {
    fn default() -> Self {
        Self {
            binary: "tesseract".into(),
            lang: "eng".into(),
            extra_flags: Vec::new(),
            tessdata_prefix: None,
        }
    }
}

// ── Service ──────────────────────────────────────────────────────────────

/// Configuration for a [`crate::process::Processor`].
///
/// # Example
/// ```rust
/// use ocr_service::{OperationMode, ServiceConfig};
///
/// let config = ServiceConfig::builder()
///     .mode(OperationMode::NoOcr)
///     .dpi(300)
///     .converter_workers(4)
///     .build()
///     .unwrap();
/// assert_eq!(config.converter.effective_port_range().len(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// OCR or NO_OCR. Default: OCR.
    pub mode: OperationMode,

    /// Rasterisation DPI. Range 72–600. Default: 200.
    ///
    /// Pages are rendered at `dpi / 72` times their natural size.
    pub dpi: u32,

    /// Convert page images to 8-bit grayscale before OCR. Default: true.
    pub grayscale: bool,

    /// Blocking tasks used to rasterise one PDF. Default: 1.
    pub converter_threads: usize,

    /// Concurrent OCR tasks across all requests. Default: number of CPUs.
    pub ocr_workers: usize,

    /// Per-page OCR timeout in seconds. Default: 30.
    pub ocr_timeout_secs: u64,

    /// Minimum printable-character ratio for plain text. Default: 0.95.
    pub text_threshold: f32,

    /// Scratch directory. Default: `$TMPDIR/ocr-service`.
    pub tmp_dir: PathBuf,

    pub tesseract: TesseractConfig,

    pub converter: ConverterConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            mode: OperationMode::default(),
            dpi: 200,
            grayscale: true,
            converter_threads: 1,
            ocr_workers: num_cpus::get().max(1),
            ocr_timeout_secs: 30,
            text_threshold: 0.95,
            tmp_dir: default_tmp_dir(),
            tesseract: TesseractConfig::default(),
            converter: ConverterConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    /// Render scale applied to PDF pages.
    pub fn render_scale(&self) -> f32 {
        self.dpi as f32 / 72.0
    }
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir().join("ocr-service")
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn mode(mut self, mode: OperationMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn grayscale(mut self, v: bool) -> Self {
        self.config.grayscale = v;
        self
    }

    pub fn converter_threads(mut self, n: usize) -> Self {
        self.config.converter_threads = n.max(1);
        self
    }

    pub fn ocr_workers(mut self, n: usize) -> Self {
        self.config.ocr_workers = n.max(1);
        self
    }

    pub fn ocr_timeout_secs(mut self, secs: u64) -> Self {
        self.config.ocr_timeout_secs = secs.max(1);
        self
    }

    pub fn text_threshold(mut self, t: f32) -> Self {
        self.config.text_threshold = t.clamp(0.0, 1.0);
        self
    }

    /// Set the scratch directory for both the service and the converter pool.
    pub fn tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.config.converter.tmp_dir = dir.clone();
        self.config.tmp_dir = dir;
        self
    }

    pub fn tesseract_binary(mut self, binary: impl Into<String>) -> Self {
        self.config.tesseract.binary = binary.into();
        self
    }

    pub fn tesseract_lang(mut self, lang: impl Into<String>) -> Self {
        self.config.tesseract.lang = lang.into();
        self
    }

    /// Whitespace-separated flags appended to every tesseract call.
    pub fn tesseract_flags(mut self, flags: &str) -> Self {
        self.config.tesseract.extra_flags = flags.split_whitespace().map(String::from).collect();
        self
    }

    pub fn tessdata_prefix(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.tesseract.tessdata_prefix = Some(dir.into());
        self
    }

    pub fn converter_workers(mut self, n: usize) -> Self {
        self.config.converter.workers = n.max(1);
        self
    }

    pub fn port_range(mut self, range: PortRange) -> Self {
        self.config.converter.port_range = Some(range);
        self
    }

    pub fn converter_host(mut self, host: impl Into<String>) -> Self {
        self.config.converter.host = host.into();
        self
    }

    pub fn python(mut self, python: impl Into<String>) -> Self {
        self.config.converter.python = python.into();
        self
    }

    pub fn soffice(mut self, soffice: impl Into<String>) -> Self {
        self.config.converter.soffice = soffice.into();
        self
    }

    pub fn server_command(mut self, cmd: CommandTemplate) -> Self {
        self.config.converter.server_command = cmd;
        self
    }

    pub fn client_command(mut self, cmd: CommandTemplate) -> Self {
        self.config.converter.client_command = cmd;
        self
    }

    pub fn conversion_timeout_secs(mut self, secs: u64) -> Self {
        self.config.converter.process_timeout_secs = secs.max(1);
        self
    }

    pub fn monitor_interval_secs(mut self, secs: u64) -> Self {
        self.config.converter.monitor_interval_secs = secs.max(1);
        self
    }

    pub fn shutdown_grace_ms(mut self, ms: u64) -> Self {
        self.config.converter.shutdown_grace_ms = ms;
        self
    }

    pub fn acquire_retries(mut self, n: u32) -> Self {
        self.config.converter.acquire_retries = n;
        self
    }

    pub fn acquire_backoff_ms(mut self, ms: u64) -> Self {
        self.config.converter.acquire_backoff_ms = ms;
        self
    }

    pub fn registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.converter.registry_path = Some(path.into());
        self
    }

    pub fn replica_slot(mut self, slot: usize) -> Self {
        self.config.converter.replica_slot = Some(slot);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, ServiceError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(ServiceError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.tesseract.lang.trim().is_empty() {
            return Err(ServiceError::InvalidConfig(
                "tesseract language must not be empty".into(),
            ));
        }
        c.converter.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_service_settings() {
        let c = ServiceConfig::default();
        assert_eq!(c.mode, OperationMode::Ocr);
        assert_eq!(c.dpi, 200);
        assert_eq!(c.ocr_timeout_secs, 30);
        assert_eq!(c.converter.process_timeout_secs, 100);
        assert_eq!(c.converter.effective_port_range(), PortRange::new(9900, 9901));
        assert!((c.text_threshold - 0.95).abs() < f32::EPSILON);
    }

    #[test]
    fn builder_clamps_and_validates() {
        let c = ServiceConfig::builder()
            .dpi(10)
            .ocr_workers(0)
            .converter_workers(0)
            .build()
            .unwrap();
        assert_eq!(c.dpi, 72);
        assert_eq!(c.ocr_workers, 1);
        assert_eq!(c.converter.workers, 1);
    }

    #[test]
    fn replica_slot_requires_registry() {
        let err = ServiceConfig::builder().replica_slot(0).build().unwrap_err();
        assert!(err.to_string().contains("registry_path"));
    }

    #[test]
    fn replica_slot_outside_range_is_rejected() {
        let err = ServiceConfig::builder()
            .port_range(PortRange::new(9900, 9902))
            .registry_path("/tmp/ports.json")
            .replica_slot(5)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("outside"));
    }

    #[test]
    fn port_range_parses_common_forms() {
        assert_eq!("9900-9904".parse::<PortRange>().unwrap(), PortRange::new(9900, 9904));
        assert_eq!("(9900, 9902)".parse::<PortRange>().unwrap(), PortRange::new(9900, 9902));
        assert_eq!("9910,9911".parse::<PortRange>().unwrap().len(), 1);
        assert!("9904-9900".parse::<PortRange>().is_err());
        assert!("nonsense".parse::<PortRange>().is_err());
    }

    #[test]
    fn port_for_slot_stays_in_range() {
        let r = PortRange::new(9900, 9903);
        assert_eq!(r.port_for_slot(2), Some(9902));
        assert_eq!(r.port_for_slot(3), None);
    }

    #[test]
    fn operation_mode_parses() {
        assert_eq!("ocr".parse::<OperationMode>().unwrap(), OperationMode::Ocr);
        assert_eq!("NO_OCR".parse::<OperationMode>().unwrap(), OperationMode::NoOcr);
        assert_eq!("no-ocr".parse::<OperationMode>().unwrap(), OperationMode::NoOcr);
        assert!("fast".parse::<OperationMode>().is_err());
    }

    #[test]
    fn template_render_substitutes_placeholders() {
        let t = CommandTemplate::new("{python}", ["--port", "{port}", "{host}:{port}"]);
        let (program, args) = t.render(&[("python", "python3"), ("port", "9900"), ("host", "lo")]);
        assert_eq!(program, "python3");
        assert_eq!(args, vec!["--port", "9900", "lo:9900"]);
    }
}
