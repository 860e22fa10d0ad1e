use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        logging: LoggingOverrides {
            log_level: Some("debug".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_match_documented_values() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
    assert_eq!(settings.server.graceful_shutdown, Duration::from_secs(30));
    assert_eq!(settings.storage.uploads_dir, PathBuf::from("storage/uploads"));
    assert_eq!(settings.storage.artifacts_dir, PathBuf::from("storage/pdfs"));
    assert_eq!(settings.storage.logs_dir, PathBuf::from("storage/logs"));
    assert_eq!(settings.storage.scratch_root, std::env::temp_dir());
    assert_eq!(settings.storage.scratch_prefix, DEFAULT_SCRATCH_PREFIX);
    assert_eq!(settings.compiler.latex_cli_path, PathBuf::from("pdflatex"));
    assert_eq!(settings.compiler.diagram_cli_path, PathBuf::from("asy"));
    assert!(settings.compiler.shell_escape);
    assert_eq!(settings.compiler.cleanup_attempts.get(), 3);
    assert_eq!(settings.compiler.cleanup_backoff, Duration::from_millis(500));
    assert_eq!(settings.compiler.cleanup_settle_delay, Duration::from_secs(1));
    assert_eq!(settings.retention.interval, Duration::from_secs(15 * 60));
    assert_eq!(settings.retention.startup_delay, Duration::from_secs(10));
    assert_eq!(settings.retention.scratch_retention, Duration::from_secs(15 * 60));
    assert_eq!(settings.retention.artifact_retention, Duration::from_secs(60 * 60));
    assert_eq!(settings.retention.task_retention, Duration::from_secs(2 * 60 * 60));
}

#[test]
fn uploads_limit_defaults_to_20_mib() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert_eq!(
        settings.uploads.max_request_bytes.get(),
        DEFAULT_UPLOAD_REQUEST_LIMIT_BYTES
    );
}

#[test]
fn uploads_limit_can_be_overridden_via_cli() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        uploads_max_request_bytes: Some(1_572_864),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.uploads.max_request_bytes.get(), 1_572_864);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        logging: LoggingOverrides {
            log_json: Some(true),
            ..Default::default()
        },
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn zero_windows_are_rejected() {
    let mut raw = RawSettings::default();
    raw.retention.artifact_minutes = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero window must fail");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "retention.artifact_minutes",
            ..
        }
    ));
}

#[test]
fn zero_cleanup_attempts_are_rejected() {
    let mut raw = RawSettings::default();
    raw.compiler.cleanup_attempts = Some(0);

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn zero_startup_delay_is_allowed() {
    let mut raw = RawSettings::default();
    raw.retention.startup_delay_seconds = Some(0);
    raw.compiler.cleanup_settle_ms = Some(0);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.retention.startup_delay, Duration::ZERO);
    assert_eq!(settings.compiler.cleanup_settle_delay, Duration::ZERO);
}

#[test]
fn scratch_prefix_rejects_separators() {
    let mut raw = RawSettings::default();
    raw.storage.scratch_prefix = Some("tmp/escape_".to_string());

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["texforge"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "texforge",
        "serve",
        "--server-port",
        "9090",
        "--compiler-latex-cli-path",
        "/opt/tex/bin/pdflatex",
        "--compiler-shell-escape",
        "false",
        "--storage-artifacts-dir",
        "/srv/pdfs",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            let overrides = serve.overrides;
            assert_eq!(overrides.server_port, Some(9090));
            assert_eq!(
                overrides.compiler.latex_cli_path.as_deref(),
                Some(std::path::Path::new("/opt/tex/bin/pdflatex"))
            );
            assert_eq!(overrides.compiler.shell_escape, Some(false));
            assert_eq!(
                overrides.storage.artifacts_dir.as_deref(),
                Some(std::path::Path::new("/srv/pdfs"))
            );
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_sweep_arguments() {
    let args = CliArgs::parse_from([
        "texforge",
        "sweep",
        "--storage-scratch-root",
        "/var/tmp/texforge",
        "--log-level",
        "warn",
    ]);

    match args.command.expect("sweep command") {
        Command::Sweep(sweep) => {
            assert_eq!(
                sweep.storage.scratch_root.as_deref(),
                Some(std::path::Path::new("/var/tmp/texforge"))
            );
            assert_eq!(sweep.logging.log_level.as_deref(), Some("warn"));
        }
        _ => panic!("wrong command parsed"),
    }
}
