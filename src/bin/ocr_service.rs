//! CLI binary for ocr-service.
//!
//! A thin shim over the library crate: maps flags to `ServiceConfig`, starts
//! the converter pool, processes each input and prints one JSON response per
//! document on stdout.

use anyhow::{Context, Result};
use clap::Parser;
use ocr_service::{
    OperationMode, PortRange, ProcessRequest, ProcessResult, Processor, ServiceConfig,
};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract text from a scanned PDF with OCR
  ocr-service scan.pdf

  # Read embedded text layers only; images are acknowledged, not recognised
  ocr-service --mode NO_OCR report.docx slides.pptx

  # Process a JSON request {"binary_data": "<base64>", "footer": {...}}
  ocr-service --request body.json

  # Two converter workers on a custom port range
  ocr-service --converter-workers 2 --port-range 9900-9902 letter.odt

EXTERNAL PROGRAMS:
  pdfium      shared library; set PDFIUM_LIB_PATH if it is not on the system path
  unoserver   LibreOffice conversion server (python3 -m unoserver.server)
  tesseract   OCR engine, needed in OCR mode

LOGGING:
  RUST_LOG overrides --verbose/--quiet, e.g. RUST_LOG=ocr_service=debug
"#;

/// Extract text and metadata from documents.
#[derive(Parser, Debug)]
#[command(
    name = "ocr-service",
    version,
    about = "Extract text from office documents, PDFs, images, HTML, XML and RTF",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Documents to process.
    files: Vec<PathBuf>,

    /// JSON request file with base64 `binary_data` and optional `footer`.
    #[arg(long, env = "OCR_SERVICE_REQUEST", conflicts_with = "files")]
    request: Option<PathBuf>,

    /// Operation mode: OCR or NO_OCR.
    #[arg(long, env = "OCR_SERVICE_MODE", default_value = "OCR")]
    mode: OperationMode,

    /// Rendering DPI (72–600).
    #[arg(long, env = "OCR_SERVICE_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Keep colour when rendering pages for OCR.
    #[arg(long, env = "OCR_SERVICE_NO_GRAYSCALE")]
    no_grayscale: bool,

    /// Parallel OCR workers (default: number of CPUs).
    #[arg(long, env = "OCR_SERVICE_OCR_WORKERS")]
    ocr_workers: Option<usize>,

    /// Per-page OCR timeout in seconds.
    #[arg(long, env = "OCR_SERVICE_OCR_TIMEOUT", default_value_t = 30)]
    ocr_timeout: u64,

    /// Blocking threads used to rasterise one PDF.
    #[arg(long, env = "OCR_SERVICE_CONVERTER_THREADS", default_value_t = 1)]
    converter_threads: usize,

    /// Tesseract language pack(s), e.g. eng or eng+deu.
    #[arg(long, env = "OCR_SERVICE_LANG", default_value = "eng")]
    lang: String,

    /// Extra flags for tesseract, e.g. "--psm 6".
    #[arg(long, env = "OCR_SERVICE_TESSERACT_FLAGS", allow_hyphen_values = true)]
    tesseract_flags: Option<String>,

    /// Tesseract executable.
    #[arg(long, env = "OCR_SERVICE_TESSERACT_BIN", default_value = "tesseract")]
    tesseract_bin: String,

    /// Directory holding tesseract language data.
    #[arg(long, env = "OCR_SERVICE_TESSDATA_PREFIX")]
    tessdata_prefix: Option<PathBuf>,

    /// Number of converter server processes.
    #[arg(long, env = "OCR_SERVICE_CONVERTER_WORKERS", default_value_t = 1)]
    converter_workers: usize,

    /// Converter port range, e.g. 9900-9904 (end exclusive).
    #[arg(long, env = "OCR_SERVICE_PORT_RANGE")]
    port_range: Option<PortRange>,

    /// Converter timeout in seconds; the process tree is killed after it.
    #[arg(long, env = "OCR_SERVICE_CONVERSION_TIMEOUT", default_value_t = 100)]
    conversion_timeout: u64,

    /// Seconds between converter health checks.
    #[arg(long, env = "OCR_SERVICE_MONITOR_INTERVAL", default_value_t = 10)]
    monitor_interval: u64,

    /// LibreOffice executable used by the converter server.
    #[arg(long, env = "OCR_SERVICE_SOFFICE", default_value = "soffice")]
    soffice: String,

    /// Python interpreter with unoserver installed.
    #[arg(long, env = "OCR_SERVICE_PYTHON", default_value = "python3")]
    python: String,

    /// Shared port registry for several replicas on one host.
    #[arg(long, env = "OCR_SERVICE_REGISTRY")]
    registry: Option<PathBuf>,

    /// Fixed slot of this replica in the port range (needs --registry).
    #[arg(long, env = "OCR_SERVICE_REPLICA_SLOT", requires = "registry")]
    replica_slot: Option<usize>,

    /// Scratch directory for conversions and converter profiles.
    #[arg(long, env = "OCR_SERVICE_TMP_DIR")]
    tmp_dir: Option<PathBuf>,

    /// Do not start converter processes; office input falls back to text extraction.
    #[arg(long, env = "OCR_SERVICE_NO_CONVERTER")]
    no_converter: bool,

    /// Pretty-print JSON output.
    #[arg(long)]
    pretty: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "OCR_SERVICE_VERBOSE")]
    verbose: bool,

    /// Suppress all logs except errors.
    #[arg(short, long, env = "OCR_SERVICE_QUIET")]
    quiet: bool,
}

/// One unit of work read from the command line.
struct Job {
    label: String,
    bytes: Vec<u8>,
    file_name: Option<String>,
    footer: Option<serde_json::Value>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let jobs = read_jobs(&cli).await?;
    let config = build_config(&cli)?;
    let processor = Processor::new(config).context("Failed to initialise processor")?;

    if cli.no_converter {
        info!("Converter pool disabled; office documents use text fallback only");
    } else {
        processor
            .start_pool()
            .await
            .context("Failed to start converter pool")?;
    }

    let outcome = tokio::select! {
        r = run_jobs(&processor, jobs, cli.pretty) => r,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; shutting down converter pool");
            Ok(false)
        }
    };

    processor.stop_pool().await;

    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}

/// Process every job, printing one JSON line each. Returns whether all succeeded.
async fn run_jobs(processor: &Processor, jobs: Vec<Job>, pretty: bool) -> Result<bool> {
    let mut all_ok = true;
    let stdout = io::stdout();
    for job in jobs {
        info!("Processing {}", job.label);
        let output = processor.process(job.bytes, job.file_name.as_deref()).await;
        let result = ProcessResult::from_output(output, job.footer);
        all_ok &= result.success;

        let json = if pretty {
            serde_json::to_string_pretty(&result)
        } else {
            serde_json::to_string(&result)
        }
        .context("Failed to serialise result")?;
        let mut out = stdout.lock();
        writeln!(out, "{json}").context("Failed to write to stdout")?;
    }
    Ok(all_ok)
}

async fn read_jobs(cli: &Cli) -> Result<Vec<Job>> {
    if let Some(path) = &cli.request {
        let body = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read request from {:?}", path))?;
        let request: ProcessRequest = serde_json::from_str(&body)
            .with_context(|| format!("Invalid request JSON in {:?}", path))?;
        let bytes = request.decode_bytes()?;
        return Ok(vec![Job {
            label: path.display().to_string(),
            bytes,
            file_name: request.file_name,
            footer: request.footer,
        }]);
    }

    if cli.files.is_empty() {
        anyhow::bail!("No input: pass one or more files or --request <file.json>");
    }
    let mut jobs = Vec::with_capacity(cli.files.len());
    for path in &cli.files {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;
        jobs.push(Job {
            label: path.display().to_string(),
            bytes,
            file_name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            footer: None,
        });
    }
    Ok(jobs)
}

/// Map CLI args to `ServiceConfig`.
fn build_config(cli: &Cli) -> Result<ServiceConfig> {
    let mut builder = ServiceConfig::builder()
        .mode(cli.mode)
        .dpi(cli.dpi)
        .grayscale(!cli.no_grayscale)
        .ocr_timeout_secs(cli.ocr_timeout)
        .converter_threads(cli.converter_threads)
        .tesseract_binary(cli.tesseract_bin.clone())
        .tesseract_lang(cli.lang.clone())
        .converter_workers(cli.converter_workers)
        .conversion_timeout_secs(cli.conversion_timeout)
        .monitor_interval_secs(cli.monitor_interval)
        .soffice(cli.soffice.clone())
        .python(cli.python.clone());

    if let Some(n) = cli.ocr_workers {
        builder = builder.ocr_workers(n);
    }
    if let Some(flags) = &cli.tesseract_flags {
        builder = builder.tesseract_flags(flags);
    }
    if let Some(dir) = &cli.tessdata_prefix {
        builder = builder.tessdata_prefix(dir);
    }
    if let Some(range) = cli.port_range {
        builder = builder.port_range(range);
    }
    if let Some(path) = &cli.registry {
        builder = builder.registry_path(path);
    }
    if let Some(slot) = cli.replica_slot {
        builder = builder.replica_slot(slot);
    }
    if let Some(dir) = &cli.tmp_dir {
        builder = builder.tmp_dir(dir);
    }

    builder.build().context("Invalid configuration")
}
