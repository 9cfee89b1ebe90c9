use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use detexec::adapters::StdEnvAdapter;
use detexec::bench::{BenchResult, BenchSpec};
use detexec::cas::CasError;
use detexec::config::{EngineConfig, ENV_INHIBITOR};
use detexec::digest::Digest;
use detexec::drift::{self, DriftReport};
use detexec::observability::{init_observability, shutdown_observability};
use detexec::ports::EnvironmentPort;
use detexec::registry::{OperationRegistry, RegistryError};
use detexec::replay::{self, ReplayMode};
use detexec::sandbox::SandboxError;
use detexec::schema::{self, ErrorCode};
use detexec::{Engine, EngineError, ErrorDoc, ExecOptions};

const EXIT_OK: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_REJECTED: u8 = 2;
const EXIT_INHIBITED: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "detexec", version, about = "Deterministic command execution")]
struct Cli {
    /// YAML configuration file (default: $DETEXEC_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// CAS base directory, overriding the configuration
    #[arg(long = "cas", global = true)]
    cas: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run and replay execution requests
    Exec {
        #[command(subcommand)]
        cmd: ExecCmd,
    },
    /// Check digests
    Digest {
        #[command(subcommand)]
        cmd: DigestCmd,
    },
    /// Content-addressed store maintenance
    Cas {
        #[command(subcommand)]
        cmd: CasCmd,
    },
    /// Hash-chained record of stored executions
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },
    Bench {
        #[command(subcommand)]
        cmd: BenchCmd,
    },
    Drift {
        #[command(subcommand)]
        cmd: DriftCmd,
    },
    Health,
    Doctor,
    ValidateReplacement,
    Version,
    Metrics,
    Status,
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[derive(Subcommand, Debug)]
enum ExecCmd {
    Run {
        /// Request document (`-` for stdin)
        #[arg(long)]
        request: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        /// Do not write the result to the CAS
        #[arg(long)]
        no_store: bool,
    },
    Replay {
        #[arg(long)]
        request: PathBuf,
        /// Result document whose `result_digest` is expected
        #[arg(long)]
        result: Option<PathBuf>,
        /// Expected result digest (hex)
        #[arg(long, conflicts_with = "result")]
        expected: Option<String>,
        /// Run the request again instead of reading the stored record
        #[arg(long, conflicts_with = "stored")]
        reexecute: bool,
        /// Only consult the stored record
        #[arg(long)]
        stored: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DigestCmd {
    Verify {
        #[arg(long)]
        result: PathBuf,
    },
    File {
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum CasCmd {
    Gc {
        #[arg(long)]
        grace_secs: Option<u64>,
        #[arg(long)]
        dry_run: bool,
    },
    Put {
        #[arg(long)]
        file: PathBuf,
    },
    Get {
        #[arg(long)]
        digest: String,
        /// Write raw bytes here instead of printing base64
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Info {
        #[arg(long)]
        digest: String,
    },
    Verify,
}

#[derive(Subcommand, Debug)]
enum AuditCmd {
    /// Walk the chain and report the first break
    Verify,
}

#[derive(Subcommand, Debug)]
enum BenchCmd {
    Run {
        /// Bench spec (JSON or YAML)
        #[arg(long)]
        spec: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Compare {
        #[arg(long)]
        baseline: PathBuf,
        #[arg(long)]
        current: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum DriftCmd {
    Analyze {
        #[arg(long)]
        bench: PathBuf,
        #[arg(long)]
        baseline: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Pretty {
        #[arg(long = "in")]
        input: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    Show,
}

/// A failure that carries a wire error code.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
struct Structured {
    code: ErrorCode,
    message: String,
}

impl From<EngineError> for Structured {
    fn from(e: EngineError) -> Self {
        let doc = ErrorDoc::from(&e);
        Self {
            code: doc.error_code,
            message: doc.message,
        }
    }
}

fn structured(e: impl Into<EngineError>) -> anyhow::Error {
    anyhow::Error::new(Structured::from(e.into()))
}

fn registry_failure(e: RegistryError) -> anyhow::Error {
    anyhow::Error::new(Structured {
        code: e.code(),
        message: e.to_string(),
    })
}

fn exit_for(code: ErrorCode) -> u8 {
    match code {
        ErrorCode::ExecutionInhibited => EXIT_INHIBITED,
        ErrorCode::JsonParseError
        | ErrorCode::SchemaViolation
        | ErrorCode::InvalidDigest
        | ErrorCode::ConfigInvalid
        | ErrorCode::AbiVersionMismatch
        | ErrorCode::VersionMismatch
        | ErrorCode::HashBackendMismatch
        | ErrorCode::ReplayFailed
        | ErrorCode::DriftDetected => EXIT_REJECTED,
        _ => EXIT_FAILED,
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read stdin")?;
        return Ok(buf);
    }
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = read_input(path)?;
    serde_json::from_str(&text).map_err(|e| structured(schema::RequestError::Parse(e)))
}

fn emit<T: Serialize>(doc: &T, out: Option<&Path>) -> Result<()> {
    let text = serde_json::to_string_pretty(doc).context("failed to encode output")?;
    match out {
        Some(path) => fs::write(path, text.as_bytes())
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

fn parse_digest(hex: &str) -> Result<Digest> {
    hex.parse::<Digest>()
        .map_err(|e| structured(CasError::from(e)))
}

fn load_bench_spec(path: &Path) -> Result<BenchSpec> {
    let text = read_input(path)?;
    let yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    );
    let value: Value = if yaml {
        serde_yaml::from_str(&text).map_err(|e| {
            anyhow::Error::new(Structured {
                code: ErrorCode::JsonParseError,
                message: format!("{}: {e}", path.display()),
            })
        })?
    } else {
        serde_json::from_str(&text).map_err(|e| structured(schema::RequestError::Parse(e)))?
    };
    BenchSpec::from_value(value).map_err(structured)
}

fn load_config(cli: &Cli, env: &dyn EnvironmentPort) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(cli.config.as_deref(), env).map_err(structured)?;
    if let Some(cas) = &cli.cas {
        config.cas_root = cas.clone();
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<u8> {
    let env = StdEnvAdapter;
    // Checked before the config is read so a broken config cannot mask it.
    if env.is_exactly(ENV_INHIBITOR, "1") {
        return Err(structured(SandboxError::Inhibited(format!(
            "{ENV_INHIBITOR}=1: execution disabled by configuration"
        ))));
    }
    let config = load_config(&cli, &env)?;
    let engine = Engine::new(config, &env);
    engine.ensure_enabled().map_err(structured)?;
    let registry = OperationRegistry::new().map_err(|e| structured(EngineError::Internal(e)))?;

    match cli.command {
        Commands::Exec { cmd } => match cmd {
            ExecCmd::Run {
                request,
                out,
                no_store,
            } => {
                let text = read_input(&request)?;
                let req = schema::parse_request(&text).map_err(structured)?;
                let outcome = engine
                    .execute(&req, ExecOptions { store: !no_store })
                    .await
                    .map_err(structured)?;
                let mut doc = serde_json::to_value(&outcome.result)?;
                if let (Some(record), Value::Object(map)) = (outcome.record_digest, &mut doc) {
                    map.insert("record_digest".to_string(), Value::String(record.to_hex()));
                }
                emit(&doc, out.as_deref())?;
                Ok(if outcome.result.ok { EXIT_OK } else { EXIT_FAILED })
            }
            ExecCmd::Replay {
                request,
                result,
                expected,
                reexecute,
                stored,
            } => {
                let text = read_input(&request)?;
                let req = schema::parse_request(&text).map_err(structured)?;
                let expected = match (result, expected) {
                    (Some(path), _) => {
                        let doc = schema::parse_result(&read_input(&path)?).map_err(structured)?;
                        Some(doc.result_digest)
                    }
                    (None, e) => e,
                };
                let mode = if reexecute {
                    ReplayMode::Reexecute
                } else if stored {
                    ReplayMode::Stored
                } else {
                    ReplayMode::Auto
                };
                let report = engine
                    .replay(&req, expected.as_deref(), mode)
                    .await
                    .map_err(structured)?;
                emit(&report, None)?;
                Ok(if report.ok { EXIT_OK } else { EXIT_REJECTED })
            }
        },
        Commands::Digest { cmd } => match cmd {
            DigestCmd::Verify { result } => {
                let doc = schema::parse_result(&read_input(&result)?).map_err(structured)?;
                let check = replay::verify_result(&doc);
                emit(&check, None)?;
                Ok(if check.ok { EXIT_OK } else { EXIT_REJECTED })
            }
            DigestCmd::File { file } => {
                let digest = Digest::of_file(&file)
                    .with_context(|| format!("failed to hash {}", file.display()))?;
                emit(
                    &serde_json::json!({
                        "ok": true,
                        "path": file,
                        "digest": digest.to_hex(),
                        "hash_primitive": detexec::version::HASH_PRIMITIVE,
                    }),
                    None,
                )?;
                Ok(EXIT_OK)
            }
        },
        Commands::Cas { cmd } => match cmd {
            CasCmd::Gc {
                grace_secs,
                dry_run,
            } => {
                let mut payload = serde_json::Map::new();
                if let Some(secs) = grace_secs {
                    payload.insert("grace_secs".to_string(), secs.into());
                }
                payload.insert("dry_run".to_string(), dry_run.into());
                let summary = registry
                    .call(&engine, "cas_gc", Value::Object(payload))
                    .await
                    .map_err(registry_failure)?;
                emit(&summary, None)?;
                Ok(EXIT_OK)
            }
            CasCmd::Put { file } => {
                let bytes = fs::read(&file).with_context(|| format!("failed to read {}", file.display()))?;
                let digest = engine
                    .cas()
                    .and_then(|cas| Ok(cas.put(&bytes)?))
                    .map_err(structured)?;
                emit(
                    &serde_json::json!({"ok": true, "digest": digest.to_hex(), "size": bytes.len()}),
                    None,
                )?;
                Ok(EXIT_OK)
            }
            CasCmd::Get { digest, out } => {
                let digest = parse_digest(&digest)?;
                let bytes = engine
                    .cas()
                    .and_then(|cas| Ok(cas.get(&digest)?))
                    .map_err(structured)?
                    .ok_or_else(|| structured(EngineError::NotFound(digest.to_hex())))?;
                match out {
                    Some(path) => {
                        fs::write(&path, &bytes)
                            .with_context(|| format!("failed to write {}", path.display()))?;
                    }
                    None => emit(
                        &serde_json::json!({
                            "ok": true,
                            "digest": digest.to_hex(),
                            "size": bytes.len(),
                            "content_base64": base64::engine::general_purpose::STANDARD.encode(&bytes),
                        }),
                        None,
                    )?,
                }
                Ok(EXIT_OK)
            }
            CasCmd::Info { digest } => {
                let digest = parse_digest(&digest)?;
                let info = engine
                    .cas()
                    .and_then(|cas| Ok(cas.info(&digest)?))
                    .map_err(structured)?
                    .ok_or_else(|| structured(EngineError::NotFound(digest.to_hex())))?;
                emit(&info, None)?;
                Ok(EXIT_OK)
            }
            CasCmd::Verify => {
                let summary = engine
                    .cas()
                    .and_then(|cas| Ok(cas.verify_all()?))
                    .map_err(structured)?;
                emit(&summary, None)?;
                Ok(if summary.corrupt.is_empty() { EXIT_OK } else { EXIT_REJECTED })
            }
        },
        Commands::Audit { cmd: AuditCmd::Verify } => {
            let report = registry
                .call(&engine, "audit_verify", Value::Null)
                .await
                .map_err(registry_failure)?;
            emit(&report, None)?;
            Ok(match report.get("ok") {
                Some(Value::Bool(true)) => EXIT_OK,
                _ => EXIT_REJECTED,
            })
        }
        Commands::Bench { cmd } => match cmd {
            BenchCmd::Run { spec, out } => {
                let spec = load_bench_spec(&spec)?;
                let result = engine.bench(&spec).await.map_err(structured)?;
                emit(&result, out.as_deref())?;
                Ok(EXIT_OK)
            }
            BenchCmd::Compare {
                baseline,
                current,
                out,
            } => {
                let baseline: BenchResult = read_json(&baseline)?;
                let current: BenchResult = read_json(&current)?;
                let report = drift::analyze(&current, Some(&baseline), &engine.config().drift);
                emit(&report, out.as_deref())?;
                Ok(if report.ok { EXIT_OK } else { EXIT_REJECTED })
            }
        },
        Commands::Drift { cmd } => match cmd {
            DriftCmd::Analyze {
                bench,
                baseline,
                out,
            } => {
                let current: BenchResult = read_json(&bench)?;
                let baseline: Option<BenchResult> = match baseline {
                    Some(path) => Some(read_json(&path)?),
                    None => None,
                };
                let report = drift::analyze(&current, baseline.as_ref(), &engine.config().drift);
                emit(&report, out.as_deref())?;
                Ok(if report.ok { EXIT_OK } else { EXIT_REJECTED })
            }
            DriftCmd::Pretty { input } => {
                let report: DriftReport = read_json(&input)?;
                print!("{}", drift::render_pretty(&report));
                Ok(EXIT_OK)
            }
        },
        Commands::Health => diagnostic(&registry, &engine, "health").await,
        Commands::Doctor => diagnostic(&registry, &engine, "doctor").await,
        Commands::ValidateReplacement => diagnostic(&registry, &engine, "validate_replacement").await,
        Commands::Version => diagnostic(&registry, &engine, "version").await,
        Commands::Metrics => diagnostic(&registry, &engine, "metrics").await,
        Commands::Status => diagnostic(&registry, &engine, "status").await,
        Commands::Config { cmd: ConfigCmd::Show } => {
            emit(engine.config(), None)?;
            Ok(EXIT_OK)
        }
    }
}

/// Prints a diagnostics document. Reports with `"ok": false` exit 2.
async fn diagnostic(registry: &OperationRegistry, engine: &Engine, op: &str) -> Result<u8> {
    let doc = registry
        .call(engine, op, Value::Null)
        .await
        .map_err(registry_failure)?;
    emit(&doc, None)?;
    Ok(match doc.get("ok") {
        Some(Value::Bool(false)) => EXIT_REJECTED,
        _ => EXIT_OK,
    })
}

fn report_failure(err: &anyhow::Error) -> u8 {
    let (code, message) = match err.downcast_ref::<Structured>() {
        Some(s) => (s.code, s.message.clone()),
        None => (ErrorCode::IoError, format!("{err:#}")),
    };
    let doc = ErrorDoc {
        ok: false,
        error_code: code,
        message,
    };
    match serde_json::to_string(&doc) {
        Ok(text) => eprintln!("{text}"),
        Err(_) => eprintln!("{{\"ok\":false,\"error_code\":\"{code}\"}}"),
    }
    exit_for(code)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_observability("warn") {
        eprintln!("warning: logging disabled: {e}");
    }
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => return ExitCode::from(report_failure(&anyhow::Error::new(e).context("tokio runtime"))),
    };
    let code = match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => report_failure(&e),
    };
    shutdown_observability();
    ExitCode::from(code)
}
