//! Building converter server and client commands.

use crate::config::ConverterConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// LibreOffice import filters keyed by lower-case file extension.
const INPUT_FILTERS: &[(&str, &str)] = &[
    ("odt", "writer8"),
    ("ott", "writer8_template"),
    ("doc", "MS Word 97"),
    ("dot", "MS Word 97 Vorlage"),
    ("docx", "MS Word 2007 XML"),
    ("dotx", "MS Word 2007 XML Template"),
    ("docm", "MS Word 2007 XML VBA"),
    ("html", "HTML (StarWriter)"),
    ("htm", "HTML (StarWriter)"),
    ("xhtml", "HTML (StarWriter)"),
    ("txt", "Text"),
    ("rtf", "Rich Text Format"),
    ("wpd", "WordPerfect"),
    ("xls", "MS Excel 97"),
    ("xlsx", "Calc Office Open XML"),
    ("xlsm", "Calc Office Open XML"),
    ("csv", "Text - txt - csv (StarCalc)"),
    ("ods", "calc8"),
    ("ots", "calc8_template"),
    ("ppt", "MS PowerPoint 97"),
    ("pps", "MS PowerPoint 97 Autoplay"),
    ("pptx", "Impress MS PowerPoint 2007 XML"),
    ("ppsx", "Impress MS PowerPoint 2007 XML AutoPlay"),
    ("odp", "impress8"),
    ("otp", "impress8_template"),
    ("odg", "draw8"),
    ("vsd", "Visio Document"),
];

/// LibreOffice import filter for a file extension (without the dot).
pub fn input_filter_for(extension: &str) -> Option<&'static str> {
    let ext = extension.trim_start_matches('.').to_ascii_lowercase();
    INPUT_FILTERS
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, filter)| *filter)
}

/// Private LibreOffice profile directory for the worker on `port`.
pub fn profile_dir(config: &ConverterConfig, port: u16) -> PathBuf {
    config.tmp_dir.join(format!("lo_profile_{port}"))
}

/// Long-lived server command for the worker on `port`.
pub(crate) fn server_command(config: &ConverterConfig, port: u16) -> (String, Command) {
    let port_s = port.to_string();
    let uno_port = port.saturating_add(config.uno_port_offset).to_string();
    let profile = profile_dir(config, port).to_string_lossy().to_string();
    let (program, args) = config.server_command.render(&[
        ("python", &config.python),
        ("soffice", &config.soffice),
        ("host", &config.host),
        ("port", &port_s),
        ("uno_port", &uno_port),
        ("profile", &profile),
    ]);

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    (program, cmd)
}

/// One-shot client command converting `input` into `output` via `port`.
pub(crate) fn client_command(
    config: &ConverterConfig,
    port: u16,
    input: &Path,
    output: &Path,
    input_filter: Option<&str>,
) -> (String, Command) {
    let port_s = port.to_string();
    let input_s = input.to_string_lossy();
    let output_s = output.to_string_lossy();
    let (program, mut args) = config.client_command.render(&[
        ("python", &config.python),
        ("soffice", &config.soffice),
        ("host", &config.host),
        ("port", &port_s),
        ("input", &input_s),
        ("output", &output_s),
    ]);
    if let (Some(flag), Some(filter)) = (&config.input_filter_flag, input_filter) {
        args.push(flag.clone());
        args.push(filter.to_string());
    }

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    (program, cmd)
}
