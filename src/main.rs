//! # agrafes
//!
//! Batch command-line façade over [`corpus_engine`]: most subcommands call
//! the same component functions the HTTP sidecar calls, record a run, and
//! print exactly one JSON object to stdout. Parse errors and runtime errors
//! alike produce the sidecar's error envelope on stdout with a non-zero exit
//! code; stderr carries only structured log lines, never the result.
//!
//! `serve`/`status`/`shutdown` are the three commands that instead deal with
//! a (possibly already-running) sidecar process via its portfile and
//! loopback HTTP endpoint.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use corpus_engine::error::ApiError;
use corpus_engine::{
    aligner, config, curation, db, diagnostics, export, ingest, indexer, metadata, migrate,
    portfile, query, runs, segmenter, server,
};

#[derive(Parser)]
#[command(
    name = "agrafes",
    about = "A local multilingual corpus engine: ingestion, FTS, alignment, and a localhost sidecar",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "./config/agrafes.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fresh config file and apply migrations to a new database.
    InitProject {
        #[arg(long, default_value = "./corpus.db")]
        db_path: PathBuf,
        #[arg(long, default_value = "migrations")]
        migrations_dir: PathBuf,
    },

    /// Import a document from a file on disk.
    Import {
        #[arg(long)]
        title: String,
        #[arg(long)]
        language: String,
        #[arg(long)]
        doc_role: Option<String>,
        #[arg(long)]
        resource_type: Option<String>,
        #[arg(long)]
        source_path: PathBuf,
    },

    /// Rebuild the FTS5 index from the current line units.
    Index,

    /// Run a full-text query.
    Query {
        #[arg(long)]
        fts_query: String,
        #[arg(long)]
        language: Option<String>,
        #[arg(long)]
        doc_id: Option<i64>,
        #[arg(long)]
        resource_type: Option<String>,
        #[arg(long)]
        doc_role: Option<String>,
        /// segment | kwic
        #[arg(long, default_value = "segment")]
        mode: String,
        #[arg(long, default_value_t = 10)]
        kwic_window: usize,
        #[arg(long)]
        all_occurrences: bool,
        #[arg(long)]
        include_aligned: bool,
        #[arg(long)]
        aligned_cap: Option<usize>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Align a pivot document against a target document.
    Align {
        #[arg(long)]
        pivot_doc_id: i64,
        #[arg(long)]
        target_doc_id: i64,
        /// external_id | position | similarity | external_id_then_position
        #[arg(long, default_value = "external_id")]
        strategy: String,
        #[arg(long)]
        similarity_threshold: Option<f64>,
        #[arg(long)]
        debug: bool,
    },

    /// Export corpus data for downstream tooling.
    Export {
        #[command(subcommand)]
        kind: ExportKind,
    },

    /// Report metadata completeness for one or all documents.
    ValidateMeta {
        #[arg(long)]
        doc_id: Option<i64>,
    },

    /// Apply regex curation rules to a document's stored text.
    Curate {
        #[arg(long)]
        doc_id: Option<i64>,
        /// Path to a JSON file containing an array of curation rules.
        #[arg(long)]
        rules_file: PathBuf,
        /// Evaluate without writing; print a before/after preview instead.
        #[arg(long)]
        preview: bool,
        #[arg(long, default_value_t = 10)]
        max_examples: usize,
    },

    /// Destructively resegment a document's line units into sentences.
    Segment {
        #[arg(long)]
        doc_id: i64,
        #[arg(long)]
        language: String,
        /// auto | default | fr_strict | en_strict
        #[arg(long)]
        pack: Option<String>,
    },

    /// Start the localhost HTTP sidecar.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// off | auto | explicit
        #[arg(long)]
        token_mode: Option<String>,
        #[arg(long)]
        token: Option<String>,
    },

    /// Report whether a sidecar is running for this database, plus DB health.
    Status,

    /// Ask a running sidecar to shut down gracefully.
    Shutdown,
}

#[derive(Subcommand)]
enum ExportKind {
    /// Export a document's line units as TEI-ish XML.
    Tei {
        #[arg(long)]
        doc_id: i64,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Export one alignment run's links as CSV.
    AlignCsv {
        #[arg(long)]
        align_run_id: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Export one run's ledger entry as a JSON report.
    RunReport {
        #[arg(long)]
        target_run_id: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn init_logging() {
    let ansi = atty::is(atty::Stream::Stderr);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .try_init();
}

fn print_result(value: &Value) {
    println!("{}", serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()));
}

fn ok_envelope(status: &str, run_id: Option<&str>, data: Value) -> Value {
    let mut value = if data.is_object() { data } else { json!({ "result": data }) };
    let obj = value.as_object_mut().expect("checked above");
    obj.insert("ok".to_string(), json!(true));
    obj.insert("api_version".to_string(), json!(server::API_VERSION));
    obj.insert("status".to_string(), json!(status));
    if let Some(id) = run_id {
        obj.insert("run_id".to_string(), json!(id));
    }
    value
}

/// Record a run, execute `fut`, fill in `stats_json` with the outcome, and
/// return the success envelope or the error, matching the sidecar's
/// `run_and_record` behavior so CLI and HTTP invocations share one ledger.
async fn run_and_record<T: serde::Serialize>(
    database: &db::Db,
    db_parent: &std::path::Path,
    kind: &str,
    params: Value,
    status: &str,
    fut: impl std::future::Future<Output = anyhow::Result<T>>,
) -> Result<Value, ApiError> {
    let run_id = runs::new_run_id();
    runs::create_run(database, &run_id, kind, &params).await.map_err(ApiError::from)?;

    let mut log = runs::setup_run_logger(db_parent, &run_id).ok();
    if let Some((writer, _guard)) = log.as_mut() {
        runs::log_run_line(writer, &run_id, kind, "started", &params);
    }

    match fut.await {
        Ok(result) => {
            let data = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
            let _ = runs::update_run_stats(database, &run_id, &data).await;
            if let Some((writer, _guard)) = log.as_mut() {
                runs::log_run_line(writer, &run_id, kind, "finished ok", &data);
            }
            Ok(ok_envelope(status, Some(&run_id), data))
        }
        Err(err) => {
            let stats = json!({ "error": err.to_string() });
            let _ = runs::update_run_stats(database, &run_id, &stats).await;
            if let Some((writer, _guard)) = log.as_mut() {
                runs::log_run_line(writer, &run_id, kind, "finished error", &stats);
            }
            Err(ApiError::from(err))
        }
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let envelope = ApiError::BadRequest(err.to_string()).envelope();
            print_result(&envelope);
            std::process::exit(1);
        }
    };

    match dispatch(cli).await {
        Ok(value) => print_result(&value),
        Err(err) => {
            print_result(&err.envelope());
            std::process::exit(1);
        }
    }
}

async fn dispatch(cli: Cli) -> Result<Value, ApiError> {
    if let Commands::InitProject { db_path, migrations_dir } = cli.command {
        return init_project(&cli.config, db_path, migrations_dir).await;
    }

    let cfg = config::load_config(&cli.config).map_err(ApiError::from)?;

    match cli.command {
        Commands::InitProject { .. } => unreachable!("handled above"),

        Commands::Import { title, language, doc_role, resource_type, source_path } => {
            let db_parent = db::db_parent(&cfg);
            let database = db::connect(&cfg).await.map_err(ApiError::from)?;
            let bytes = std::fs::read(&source_path).map_err(|e| {
                ApiError::BadRequest(format!("reading {}: {}", source_path.display(), e))
            })?;
            let source_path_str = source_path.display().to_string();
            let params_json = json!({
                "title": title, "language": language, "doc_role": doc_role,
                "resource_type": resource_type, "source_path": source_path_str,
            });
            let import_params = ingest::ImportParams {
                title: &title,
                language: &language,
                doc_role: doc_role.as_deref(),
                resource_type: resource_type.as_deref(),
                source_path: Some(source_path_str.as_str()),
            };
            run_and_record(
                &database,
                &db_parent,
                "import",
                params_json,
                "ok",
                ingest::import_document(&database, &bytes, import_params),
            )
            .await
        }

        Commands::Index => {
            let db_parent = db::db_parent(&cfg);
            let database = db::connect(&cfg).await.map_err(ApiError::from)?;
            run_and_record(&database, &db_parent, "index", json!({}), "ok", async {
                indexer::build_index(&database).await.map(|count| json!({ "units_indexed": count }))
            })
            .await
        }

        Commands::Query {
            fts_query,
            language,
            doc_id,
            resource_type,
            doc_role,
            mode,
            kwic_window,
            all_occurrences,
            include_aligned,
            aligned_cap,
            limit,
            offset,
        } => {
            let db_parent = db::db_parent(&cfg);
            let database = db::connect(&cfg).await.map_err(ApiError::from)?;
            let mode_enum = match mode.as_str() {
                "kwic" => query::QueryMode::Kwic,
                "segment" => query::QueryMode::Segment,
                other => return Err(ApiError::Validation(format!("unknown query mode: {:?}", other))),
            };
            let params_json = json!({ "fts_query": fts_query, "mode": mode, "limit": limit, "offset": offset });
            let params = query::QueryParams {
                fts_query: &fts_query,
                language: language.as_deref(),
                doc_id,
                resource_type: resource_type.as_deref(),
                doc_role: doc_role.as_deref(),
                mode: mode_enum,
                kwic_window,
                all_occurrences,
                include_aligned,
                aligned_cap,
                limit,
                offset,
            };
            run_and_record(&database, &db_parent, "query", params_json, "ok", query::run_query(&database, params)).await
        }

        Commands::Align { pivot_doc_id, target_doc_id, strategy, similarity_threshold, debug } => {
            let db_parent = db::db_parent(&cfg);
            let database = db::connect(&cfg).await.map_err(ApiError::from)?;
            let parsed_strategy =
                aligner::AlignStrategy::parse(&strategy).map_err(|e| ApiError::Validation(e.to_string()))?;
            let threshold = similarity_threshold.unwrap_or(cfg.alignment.similarity_threshold);
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ApiError::Validation(format!(
                    "similarity_threshold must be in [0,1], got {}",
                    threshold
                )));
            }
            let params_json =
                json!({ "pivot_doc_id": pivot_doc_id, "target_doc_id": target_doc_id, "strategy": strategy });
            run_and_record(
                &database,
                &db_parent,
                "align",
                params_json,
                "ok",
                aligner::align_pair(&database, pivot_doc_id, target_doc_id, parsed_strategy, threshold, debug),
            )
            .await
        }

        Commands::Export { kind } => {
            let db_parent = db::db_parent(&cfg);
            let database = db::connect(&cfg).await.map_err(ApiError::from)?;
            match kind {
                ExportKind::Tei { doc_id, output } => {
                    let output_str = output.as_ref().map(|p| p.display().to_string());
                    let params_json = json!({ "doc_id": doc_id, "output": output_str });
                    run_and_record(&database, &db_parent, "export", params_json.clone(), "ok", async {
                        export::export_tei(&database, doc_id, output.as_deref()).await?;
                        Ok(params_json)
                    })
                    .await
                }
                ExportKind::AlignCsv { align_run_id, output } => {
                    let output_str = output.as_ref().map(|p| p.display().to_string());
                    let params_json = json!({ "align_run_id": align_run_id, "output": output_str });
                    run_and_record(&database, &db_parent, "export", params_json.clone(), "ok", async {
                        export::export_align_csv(&database, &align_run_id, output.as_deref()).await?;
                        Ok(params_json)
                    })
                    .await
                }
                ExportKind::RunReport { target_run_id, output } => {
                    let output_str = output.as_ref().map(|p| p.display().to_string());
                    let params_json = json!({ "target_run_id": target_run_id, "output": output_str });
                    run_and_record(&database, &db_parent, "export", params_json.clone(), "ok", async {
                        export::export_run_report(&database, &target_run_id, output.as_deref()).await?;
                        Ok(params_json)
                    })
                    .await
                }
            }
        }

        Commands::ValidateMeta { doc_id } => {
            let db_parent = db::db_parent(&cfg);
            let database = db::connect(&cfg).await.map_err(ApiError::from)?;
            let params_json = json!({ "doc_id": doc_id });
            if let Some(doc_id) = doc_id {
                run_and_record(&database, &db_parent, "validate-meta", params_json, "ok", metadata::validate_document(&database, doc_id))
                    .await
            } else {
                run_and_record(&database, &db_parent, "validate-meta", params_json, "ok", metadata::validate_all_documents(&database))
                    .await
            }
        }

        Commands::Curate { doc_id, rules_file, preview, max_examples } => {
            let db_parent = db::db_parent(&cfg);
            let database = db::connect(&cfg).await.map_err(ApiError::from)?;
            let raw_rules = std::fs::read_to_string(&rules_file)
                .map_err(|e| ApiError::BadRequest(format!("reading {}: {}", rules_file.display(), e)))?;
            let specs: Vec<curation::CurationRuleSpec> = serde_json::from_str(&raw_rules)
                .map_err(|e| ApiError::BadRequest(format!("invalid rules file: {}", e)))?;
            let rules = curation::rules_from_list(&specs).map_err(|e| ApiError::Validation(e.to_string()))?;

            if preview {
                let doc_id = doc_id
                    .ok_or_else(|| ApiError::BadRequest("curate --preview requires --doc-id".to_string()))?;
                let max_examples = max_examples.clamp(1, 50);
                let preview = curation::preview_curation(&database, doc_id, &rules, max_examples)
                    .await
                    .map_err(ApiError::from)?;
                Ok(ok_envelope(
                    "ok",
                    None,
                    serde_json::to_value(preview).unwrap_or_else(|_| json!({})),
                ))
            } else {
                let params_json = json!({ "doc_id": doc_id, "rule_count": rules.len() });
                if let Some(doc_id) = doc_id {
                    run_and_record(&database, &db_parent, "curate", params_json, "ok", curation::curate_document(&database, doc_id, &rules))
                        .await
                } else {
                    run_and_record(&database, &db_parent, "curate", params_json, "ok", curation::curate_all_documents(&database, &rules))
                        .await
                }
            }
        }

        Commands::Segment { doc_id, language, pack } => {
            let db_parent = db::db_parent(&cfg);
            let database = db::connect(&cfg).await.map_err(ApiError::from)?;
            let params_json = json!({ "doc_id": doc_id, "language": language, "pack": pack });
            run_and_record(
                &database,
                &db_parent,
                "segment",
                params_json,
                "ok",
                segmenter::resegment_document(&database, doc_id, &language, pack.as_deref()),
            )
            .await
        }

        Commands::Serve { host, port, token_mode, token } => {
            let mut cfg = cfg;
            if let Some(host) = host {
                cfg.server.host = host;
            }
            if let Some(port) = port {
                cfg.server.port = port;
            }
            if let Some(mode) = token_mode {
                cfg.server.token_mode = match mode.as_str() {
                    "off" => config::TokenMode::Off,
                    "auto" => config::TokenMode::Auto,
                    "explicit" => config::TokenMode::Explicit,
                    other => return Err(ApiError::Validation(format!("unknown token_mode: {:?}", other))),
                };
            }
            if token.is_some() {
                cfg.server.token = token;
            }

            let db_parent = db::db_parent(&cfg);
            if let Some(existing) = server::check_existing(&db_parent).await.map_err(ApiError::from)? {
                return Ok(ok_envelope(
                    "already_running",
                    None,
                    json!({
                        "already_running": true,
                        "host": existing.host,
                        "port": existing.port,
                        "token": existing.token,
                    }),
                ));
            }

            let database = db::connect(&cfg).await.map_err(ApiError::from)?;
            migrate::apply_migrations(&database, &cfg.migrations.dir).await.map_err(ApiError::from)?;

            server::run_server(cfg, database).await.map_err(ApiError::from)?;
            Ok(ok_envelope("ok", None, json!({ "shutting_down": true })))
        }

        Commands::Status => {
            let db_parent = db::db_parent(&cfg);
            let sidecar_state = portfile::inspect_state(&db_parent).await.map_err(ApiError::from)?;
            let sidecar_json = match &sidecar_state {
                portfile::SidecarState::Missing => json!({ "state": "missing" }),
                portfile::SidecarState::Stale => json!({ "state": "stale" }),
                portfile::SidecarState::Running => {
                    let pf = portfile::read(&db_parent).map_err(ApiError::from)?;
                    json!({ "state": "running", "portfile": pf })
                }
            };

            let database = db::connect(&cfg).await.map_err(ApiError::from)?;
            let report = diagnostics::collect_diagnostics(&database).await.map_err(ApiError::from)?;
            let status_str = match &report.status {
                diagnostics::DbStatus::Ok => "ok",
                diagnostics::DbStatus::Warning => "warnings",
                diagnostics::DbStatus::Error => "error",
            };
            Ok(ok_envelope(
                status_str,
                None,
                json!({ "sidecar": sidecar_json, "diagnostics": report }),
            ))
        }

        Commands::Shutdown => {
            let db_parent = db::db_parent(&cfg);
            let pf = portfile::read(&db_parent)
                .map_err(ApiError::from)?
                .ok_or_else(|| ApiError::NotFound("no sidecar portfile found for this database".to_string()))?;

            let url = format!("http://{}:{}/shutdown", pf.host, pf.port);
            let client = reqwest::Client::new();
            let mut request = client.post(&url);
            if let Some(token) = &pf.token {
                request = request.header("X-Agrafes-Token", token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| ApiError::Internal(format!("contacting sidecar at {}: {}", url, e)))?;
            let body: Value = response
                .json()
                .await
                .map_err(|e| ApiError::Internal(format!("parsing sidecar response: {}", e)))?;
            Ok(body)
        }
    }
}

async fn init_project(
    config_path: &std::path::Path,
    db_path: PathBuf,
    migrations_dir: PathBuf,
) -> Result<Value, ApiError> {
    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| ApiError::Internal(e.to_string()))?;
        }
    }

    let cfg = config::Config {
        db: config::DbConfig { path: db_path.clone() },
        migrations: config::MigrationsConfig { dir: migrations_dir.clone() },
        server: config::ServerConfig::default(),
        segmentation: config::SegmentationConfig::default(),
        alignment: config::AlignmentConfig::default(),
    };
    let toml_text = toml::to_string_pretty(&TomlConfig::from(&cfg))
        .map_err(|e| ApiError::Internal(format!("serializing config: {}", e)))?;
    std::fs::write(config_path, toml_text)
        .map_err(|e| ApiError::Internal(format!("writing {}: {}", config_path.display(), e)))?;

    let db_parent = db::db_parent(&cfg);
    let database = db::connect(&cfg).await.map_err(ApiError::from)?;
    let params_json = json!({
        "db_path": db_path.display().to_string(),
        "migrations_dir": migrations_dir.display().to_string(),
    });
    run_and_record(&database, &db_parent, "init", params_json, "ok", async {
        let applied = migrate::apply_migrations(&database, &migrations_dir).await?;
        Ok(json!({ "migrations_applied": applied }))
    })
    .await
}

/// Mirrors [`config::Config`] with `Serialize` derived, so `init-project` can
/// write back a config file without requiring `Config` itself (which is
/// deserialize-only) to carry serialization baggage elsewhere.
#[derive(serde::Serialize)]
struct TomlConfig {
    db: TomlDbConfig,
    migrations: TomlMigrationsConfig,
    server: TomlServerConfig,
    segmentation: TomlSegmentationConfig,
    alignment: TomlAlignmentConfig,
}

#[derive(serde::Serialize)]
struct TomlDbConfig {
    path: PathBuf,
}

#[derive(serde::Serialize)]
struct TomlMigrationsConfig {
    dir: PathBuf,
}

#[derive(serde::Serialize)]
struct TomlServerConfig {
    host: String,
    port: u16,
    token_mode: String,
    token: Option<String>,
}

#[derive(serde::Serialize)]
struct TomlSegmentationConfig {
    default_pack: String,
}

#[derive(serde::Serialize)]
struct TomlAlignmentConfig {
    similarity_threshold: f64,
}

impl From<&config::Config> for TomlConfig {
    fn from(cfg: &config::Config) -> Self {
        TomlConfig {
            db: TomlDbConfig { path: cfg.db.path.clone() },
            migrations: TomlMigrationsConfig { dir: cfg.migrations.dir.clone() },
            server: TomlServerConfig {
                host: cfg.server.host.clone(),
                port: cfg.server.port,
                token_mode: match cfg.server.token_mode {
                    config::TokenMode::Off => "off".to_string(),
                    config::TokenMode::Auto => "auto".to_string(),
                    config::TokenMode::Explicit => "explicit".to_string(),
                },
                token: cfg.server.token.clone(),
            },
            segmentation: TomlSegmentationConfig { default_pack: cfg.segmentation.default_pack.clone() },
            alignment: TomlAlignmentConfig { similarity_threshold: cfg.alignment.similarity_threshold },
        }
    }
}
