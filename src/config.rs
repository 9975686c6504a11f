use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::tools::{ToolProfile, find_tool};

/// Default request body limit, matching the backends' 16 MiB cap
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Processor runs are killed after this long unless `RA_PROCESS_TIMEOUT_SECS` says otherwise
pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Where finished outputs are looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    /// One directory per file id; downloads only ever see their own output
    Isolated,
    /// Every upload shares one directory and one fixed output filename
    Shared,
}

/// Whether `/upload` waits for the processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Blocking,
    Deferred,
}

impl RetrievalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RetrievalMode::Isolated => "isolated",
            RetrievalMode::Shared => "shared",
        }
    }
}

impl ProcessingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingMode::Blocking => "blocking",
            ProcessingMode::Deferred => "deferred",
        }
    }
}

impl FromStr for RetrievalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "isolated" => Ok(RetrievalMode::Isolated),
            "shared" | "legacy" => Ok(RetrievalMode::Shared),
            _ => Err("expected isolated or shared".to_string()),
        }
    }
}

impl FromStr for ProcessingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blocking" | "sync" => Ok(ProcessingMode::Blocking),
            "deferred" | "async" => Ok(ProcessingMode::Deferred),
            _ => Err("expected blocking or deferred".to_string()),
        }
    }
}

/// External command run against each saved upload
///
/// Arguments may contain `{input}`, `{output_dir}` and `{template}`
/// placeholders. When no argument mentions `{input}` the saved path is
/// appended as the last argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessorCommand {
    pub fn new<S: Into<String>>(program: S, args: impl IntoIterator<Item = S>) -> Self {
        ProcessorCommand {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a whitespace separated command line; `None` when it is blank
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(ProcessorCommand {
            program,
            args: parts.collect(),
        })
    }
}

/// The processing collaborator behind the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collaborator {
    /// Run a local command against the saved upload
    Command(ProcessorCommand),
    /// Forward the upload to a backend service and relay its answer
    Http { url: String, field_name: String },
}

/// Runtime configuration for the relay proxy
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,

    /// Tool whose defaults fill any unset value
    pub tool: &'static ToolProfile,

    /// Directory shared by all uploads
    pub upload_dir: PathBuf,

    pub collaborator: Collaborator,

    /// Name the processor gives its result file
    pub output_name: String,

    /// Served, in order, when a finished job left no output behind
    pub template_candidates: Vec<PathBuf>,

    /// Shared template reset by `/clear-template`
    pub working_template: Option<PathBuf>,

    pub template_headers: Vec<String>,

    /// Lowercase extensions without the dot
    pub allowed_extensions: Vec<String>,

    pub retrieval: RetrievalMode,
    pub processing: ProcessingMode,

    /// Maximum number of processor runs at once
    pub workers: usize,

    pub process_timeout: Option<Duration>,
    pub max_upload_bytes: usize,
    pub allowed_origin: Option<String>,
}

impl RelayConfig {
    /// Read `RA_*` environment variables, falling back to the tool's defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any key lookup
    ///
    /// # Arguments
    /// * `lookup` - Returns the raw value for a variable name, if set
    ///
    /// # Returns
    /// * `Result<RelayConfig, ConfigError>` - The configuration or the first invalid value
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let slug = get("RA_TOOL").unwrap_or_else(|| "rcm-converter".to_string());
        let tool = find_tool(&slug).ok_or_else(|| ConfigError::UnknownTool(slug.clone()))?;

        let host = get("RA_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = parse_var("RA_PORT", get("RA_PORT"))?.unwrap_or(3000);
        let upload_dir = PathBuf::from(get("RA_UPLOAD_DIR").unwrap_or_else(|| "uploads".to_string()));

        let command = get("RA_PROCESSOR_CMD").and_then(|line| ProcessorCommand::parse(&line));
        let collaborator = match (get("RA_BACKEND_URL"), command) {
            (Some(url), _) => Collaborator::Http {
                url,
                field_name: tool.field_name.to_string(),
            },
            (None, Some(command)) => Collaborator::Command(command),
            (None, None) => match tool.default_command.split_first() {
                Some((program, args)) => {
                    Collaborator::Command(ProcessorCommand::new(*program, args.iter().copied()))
                }
                None => Collaborator::Http {
                    url: tool.upload_url(),
                    field_name: tool.field_name.to_string(),
                },
            },
        };

        let output_name = get("RA_OUTPUT_NAME").unwrap_or_else(|| tool.default_filename.to_string());

        let template_candidates = match get("RA_TEMPLATE_PATHS") {
            Some(paths) => env::split_paths(&paths).collect(),
            None => default_template_candidates(tool),
        };

        let working_template = get("RA_WORKING_TEMPLATE").map(PathBuf::from).or_else(|| {
            match (tool.clear_template_path, tool.template_file) {
                (Some(_), Some(file)) => Some(PathBuf::from("templates").join(file)),
                _ => None,
            }
        });

        let template_headers = match get("RA_TEMPLATE_HEADERS") {
            Some(headers) => split_list(&headers),
            None => tool.template_headers.iter().map(|h| h.to_string()).collect(),
        };

        let allowed_extensions: Vec<String> = match get("RA_ALLOWED_EXTENSIONS") {
            Some(exts) => split_list(&exts)
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            None => tool.extensions.iter().map(|ext| ext.to_string()).collect(),
        };
        if allowed_extensions.is_empty() {
            return Err(ConfigError::InvalidValue {
                var: "RA_ALLOWED_EXTENSIONS",
                value: String::new(),
                reason: "at least one extension is required".to_string(),
            });
        }

        let retrieval = parse_var("RA_RETRIEVAL", get("RA_RETRIEVAL"))?.unwrap_or(RetrievalMode::Isolated);
        let processing =
            parse_var("RA_PROCESSING", get("RA_PROCESSING"))?.unwrap_or(ProcessingMode::Blocking);

        let workers: usize = parse_var("RA_WORKERS", get("RA_WORKERS"))?.unwrap_or(4);
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                var: "RA_WORKERS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        // 0 disables the timeout
        let process_timeout = match parse_var::<u64>("RA_PROCESS_TIMEOUT_SECS", get("RA_PROCESS_TIMEOUT_SECS"))? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(DEFAULT_PROCESS_TIMEOUT),
        };
        let max_upload_bytes =
            parse_var("RA_MAX_UPLOAD_BYTES", get("RA_MAX_UPLOAD_BYTES"))?.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);
        let allowed_origin = match lookup("RA_ALLOWED_ORIGIN") {
            Some(origin) if origin.trim().is_empty() => None,
            Some(origin) => Some(origin),
            None => Some("http://localhost:3000".to_string()),
        };

        Ok(RelayConfig {
            host,
            port,
            tool,
            upload_dir,
            collaborator,
            output_name,
            template_candidates,
            working_template,
            template_headers,
            allowed_extensions,
            retrieval,
            processing,
            workers,
            process_timeout,
            max_upload_bytes,
            allowed_origin,
        })
    }

    /// Socket address the server binds to
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.host.parse().map_err(|_| ConfigError::InvalidValue {
            var: "RA_HOST",
            value: self.host.clone(),
            reason: "expected an IP address".to_string(),
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// `backends/<tool>/templates/<file>` relative to `.`, `..` and `../..`
fn default_template_candidates(tool: &ToolProfile) -> Vec<PathBuf> {
    let Some(file) = tool.template_file else {
        return Vec::new();
    };
    ["", "..", "../.."]
        .iter()
        .map(|prefix| {
            PathBuf::from(prefix)
                .join("backends")
                .join(tool.slug)
                .join("templates")
                .join(file)
        })
        .collect()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_var<T>(var: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|value| {
        value.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
            var,
            value: value.clone(),
            reason: e.to_string(),
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<RelayConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_follow_the_rcm_converter() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.tool.slug, "rcm-converter");
        assert_eq!(config.port, 3000);
        assert_eq!(config.output_name, "RCM-High-Level-View.xlsx");
        assert_eq!(config.allowed_extensions, vec!["xlsx", "xls"]);
        assert_eq!(config.retrieval, RetrievalMode::Isolated);
        assert_eq!(config.processing, ProcessingMode::Blocking);
        assert_eq!(config.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
        assert_eq!(config.process_timeout, Some(DEFAULT_PROCESS_TIMEOUT));
        assert_eq!(config.template_candidates.len(), 3);
        assert!(
            config.template_candidates[1]
                .ends_with("backends/rcm-converter/templates/rcm-control-view.xlsx")
        );
        match config.collaborator {
            Collaborator::Command(cmd) => {
                assert_eq!(cmd.program, "python");
                assert!(cmd.args.contains(&"{input}".to_string()));
            }
            other => panic!("expected a command collaborator, got {other:?}"),
        }
    }

    #[test]
    fn tools_without_a_command_forward_over_http() {
        let config = config_from(&[("RA_TOOL", "gap-builder")]).unwrap();
        assert_eq!(
            config.collaborator,
            Collaborator::Http {
                url: "http://localhost:5002/api/generate-gaps".to_string(),
                field_name: "file".to_string(),
            }
        );
        assert!(config.template_candidates.is_empty());
    }

    #[test]
    fn scoping_document_forwards_to_its_service() {
        let config = config_from(&[("RA_TOOL", "scoping-document")]).unwrap();
        assert_eq!(
            config.collaborator,
            Collaborator::Http {
                url: "http://localhost:5000/upload".to_string(),
                field_name: "file".to_string(),
            }
        );
        assert_eq!(
            config.working_template,
            Some(PathBuf::from("templates").join("Scoping Document.xlsx"))
        );
    }

    #[test]
    fn zero_timeout_disables_it() {
        let config = config_from(&[("RA_PROCESS_TIMEOUT_SECS", "0")]).unwrap();
        assert_eq!(config.process_timeout, None);
    }

    #[test]
    fn extension_overrides_are_normalised() {
        let config = config_from(&[("RA_ALLOWED_EXTENSIONS", " .DOCX ,, .Xlsm ")]).unwrap();
        assert_eq!(config.allowed_extensions, vec!["docx".to_string(), "xlsm".to_string()]);
        assert!(matches!(
            config_from(&[("RA_ALLOWED_EXTENSIONS", " , ")]),
            Err(ConfigError::InvalidValue {
                var: "RA_ALLOWED_EXTENSIONS",
                ..
            })
        ));
    }

    #[test]
    fn backend_url_beats_processor_command() {
        let config = config_from(&[
            ("RA_BACKEND_URL", "http://backend:9000/upload"),
            ("RA_PROCESSOR_CMD", "sh convert.sh"),
        ])
        .unwrap();
        assert!(matches!(config.collaborator, Collaborator::Http { .. }));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("RA_PORT", "8088"),
            ("RA_PROCESSOR_CMD", "  sh   ./convert.sh  {input} "),
            ("RA_ALLOWED_EXTENSIONS", ".XLSX, csv"),
            ("RA_RETRIEVAL", "shared"),
            ("RA_PROCESSING", "deferred"),
            ("RA_WORKERS", "2"),
            ("RA_PROCESS_TIMEOUT_SECS", "30"),
            ("RA_ALLOWED_ORIGIN", ""),
        ])
        .unwrap();
        assert_eq!(config.port, 8088);
        assert_eq!(
            config.collaborator,
            Collaborator::Command(ProcessorCommand::new("sh", ["./convert.sh", "{input}"]))
        );
        assert_eq!(config.allowed_extensions, vec!["xlsx", "csv"]);
        assert_eq!(config.retrieval, RetrievalMode::Shared);
        assert_eq!(config.processing, ProcessingMode::Deferred);
        assert_eq!(config.workers, 2);
        assert_eq!(config.process_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.allowed_origin, None);
    }

    #[test]
    fn scoping_tool_has_a_working_template() {
        let config = config_from(&[("RA_TOOL", "scoping-document")]).unwrap();
        assert_eq!(
            config.working_template,
            Some(PathBuf::from("templates/Scoping Document.xlsx"))
        );
        assert_eq!(config.template_headers.first().map(String::as_str), Some("Process"));
        assert_eq!(config.allowed_extensions, vec!["docx"]);
    }

    #[test]
    fn bad_values_are_reported() {
        assert_eq!(
            config_from(&[("RA_TOOL", "nope")]).unwrap_err(),
            ConfigError::UnknownTool("nope".to_string())
        );
        assert!(matches!(
            config_from(&[("RA_PORT", "http")]),
            Err(ConfigError::InvalidValue { var: "RA_PORT", .. })
        ));
        assert!(matches!(
            config_from(&[("RA_WORKERS", "0")]),
            Err(ConfigError::InvalidValue { var: "RA_WORKERS", .. })
        ));
        assert!(matches!(
            config_from(&[("RA_RETRIEVAL", "random")]),
            Err(ConfigError::InvalidValue { var: "RA_RETRIEVAL", .. })
        ));
    }

    #[test]
    fn listen_addr_requires_an_ip() {
        let mut config = config_from(&[]).unwrap();
        assert_eq!(config.listen_addr().unwrap().to_string(), "127.0.0.1:3000");
        config.host = "localhost".to_string();
        assert!(config.listen_addr().is_err());
    }
}
