use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_use_memory_store_and_no_database() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert!(settings.database.url.is_none());
    assert_eq!(
        settings.store.backend,
        StoreBackend::Memory {
            capacity: NonZeroUsize::new(DEFAULT_MEMORY_CAPACITY).unwrap()
        }
    );
    assert_eq!(settings.upstream.base_url.as_str(), "http://127.0.0.1:8080/");
    assert_eq!(settings.cache.default_ttl_secs, 3600);
}

#[test]
fn store_timeout_defaults_and_overrides() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert_eq!(settings.store.timeout, Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS));

    let mut raw = RawSettings::default();
    raw.store.timeout_ms = Some(75);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.store.timeout, Duration::from_millis(75));

    let mut raw = RawSettings::default();
    raw.store.timeout_ms = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn cli_selects_memcached() {
    let mut raw = RawSettings::default();
    raw.apply_store_overrides(&StoreOverrides {
        backend: Some(StoreBackendArg::Memcached),
        memcached_addr: Some("cache:11211".to_string()),
    });
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.store.backend,
        StoreBackend::Memcached {
            addr: "cache:11211".to_string()
        }
    );
}

#[test]
fn unknown_store_backend_is_rejected() {
    let mut raw = RawSettings::default();
    raw.store.backend = Some("redis".to_string());
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "store.backend",
            ..
        }
    ));
}

#[test]
fn empty_secret_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.secret_key = "  ".to_string();
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn upstream_must_be_http() {
    let mut raw = RawSettings::default();
    raw.upstream.url = Some("ftp://example.com".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn cache_flags_can_be_overridden() {
    let mut raw = RawSettings::default();
    raw.apply_serve_overrides(&ServeOverrides {
        cache_read_only: Some(true),
        cache_debug_headers: Some(true),
        ..Default::default()
    });
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.cache.read_only);
    assert!(settings.cache.debug_headers);
}

#[test]
fn cache_section_deserializes_tables() {
    let raw: RawSettings = Config::builder()
        .add_source(File::from_str(
            r#"
            [cache]
            key_prefix = "site"
            ignored_params = ["--referrer"]

            [cache.tables.orders]
            depends = ["customers"]
            track_used_tables = false

            [cache.actions.dashboard]
            depends = ["stats"]
            "#,
            config::FileFormat::Toml,
        ))
        .build()
        .expect("config builds")
        .try_deserialize()
        .expect("settings deserialize");

    assert_eq!(raw.cache.key_prefix, "site");
    assert_eq!(raw.cache.ignored_params, vec!["--referrer"]);
    assert_eq!(raw.cache.tables["orders"].depends, vec!["customers"]);
    assert_eq!(raw.cache.tables["orders"].track_used_tables, Some(false));
    assert_eq!(
        raw.cache.actions["dashboard"].depends,
        Some(vec!["stats".to_string()])
    );
    assert_eq!(raw.cache.default_ttl_secs, 3600);
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["pagecache"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "pagecache",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--upstream-url",
        "http://app:8080",
        "--store-backend",
        "memcached",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(
                serve.overrides.upstream_url.as_deref(),
                Some("http://app:8080")
            );
            assert_eq!(serve.overrides.store.backend, Some(StoreBackendArg::Memcached));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_clear_cache_arguments() {
    let args = CliArgs::parse_from([
        "pagecache",
        "clear-cache",
        "--memcached-addr",
        "10.0.0.5:11211",
    ]);

    match args.command.expect("clear-cache command") {
        Command::ClearCache(clear) => {
            assert_eq!(clear.store.memcached_addr.as_deref(), Some("10.0.0.5:11211"));
            assert_eq!(clear.store.backend, None);
        }
        _ => panic!("wrong command parsed"),
    }
}
