use clap::Parser;

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
fn cache_defaults_match_documented_values() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let cache = &settings.cache;

    assert_eq!(cache.snapshot_path, PathBuf::from(DEFAULT_SNAPSHOT_PATH));
    assert!(cache.disk_cache_enabled);
    assert!(cache.persist_changes);
    assert!(cache.check_disk_changes);
    assert_eq!(cache.staleness_check_interval, Duration::from_secs(1));
    assert!(cache.refresh_on_unknown_content_type);
}

#[test]
fn cache_flags_can_be_overridden_via_cli() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        cache: CacheOverrides {
            snapshot_path: Some(PathBuf::from("/var/lib/verdant/tree.json")),
            persist_changes: Some(false),
            staleness_check_interval_ms: Some(250),
            ..Default::default()
        },
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.cache.snapshot_path,
        PathBuf::from("/var/lib/verdant/tree.json")
    );
    assert!(!settings.cache.persist_changes);
    assert_eq!(
        settings.cache.staleness_check_interval,
        Duration::from_millis(250)
    );
}

#[test]
fn zero_timeouts_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.source_timeout_ms = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero timeout");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.source_timeout_ms",
            ..
        }
    ));
}

#[test]
fn empty_snapshot_path_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.snapshot_path = Some(PathBuf::new());

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn zero_port_is_rejected() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(0);

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
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["verdant"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_republish_subtree_arguments() {
    let args = CliArgs::parse_from([
        "verdant",
        "republish-subtree",
        "--database-url",
        "postgres://example",
        "--cache-disk-enabled",
        "false",
        "42",
    ]);

    match args.command.expect("republish-subtree command") {
        Command::RepublishSubtree(republish) => {
            assert_eq!(
                republish.database.database_url.as_deref(),
                Some("postgres://example")
            );
            assert_eq!(republish.cache.disk_cache_enabled, Some(false));
            assert_eq!(republish.id, 42);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "verdant",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--database-url",
        "postgres://override",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(
                serve.overrides.database.database_url.as_deref(),
                Some("postgres://override")
            );
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn resolved_cache_defaults_agree_with_cache_config() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let resolved = crate::cache::CacheConfig::from(&settings.cache);
    let defaults = crate::cache::CacheConfig::default();

    assert_eq!(resolved.snapshot_path, defaults.snapshot_path);
    assert_eq!(resolved.staleness_check_interval, defaults.staleness_check_interval);
    assert_eq!(resolved.source_timeout, defaults.source_timeout);
    assert_eq!(resolved.disk_timeout, defaults.disk_timeout);
    assert_eq!(resolved.flush_interval, defaults.flush_interval);
}
