//! Configuration loading and component construction, end to end through
//! the public API.

use anyhow::Result;
use std::io::Write;
use std::sync::Arc;

use plate_sentry::{
    build_detector, build_filter, build_recorder, build_source, Config, ConfigStore,
    RecorderConfig, Registry, SourceOrigin,
};

fn write_config(dir: &tempfile::TempDir, contents: &str) -> Result<std::path::PathBuf> {
    let path = dir.path().join("config.json");
    let mut file = std::fs::File::create(&path)?;
    file.write_all(contents.as_bytes())?;
    Ok(path)
}

#[test]
fn full_configuration_builds_every_component() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let data_dir = dir.path().join("data");
    let config_json = format!(
        r#"{{
            "data_dir": {:?},
            "sources": [
                {{"type": "rtsp", "name": "front gate", "capture_interval": 1.5,
                  "url": "rtsp://cam.local:554/stream"}},
                {{"type": "file", "name": "replay", "capture_interval": 1.0,
                  "file": "/videos/sample.mp4", "always_restart": true}}
            ],
            "filters": [
                {{"type": "motion"}},
                {{"type": "mask", "debug": true, "shapes": ["0,0,64,0,64,32"]}}
            ],
            "recorders": [
                {{"type": "sqlite", "db_path": {:?}}},
                {{"type": "mqtt", "url": "mqtt://broker.local:1883", "base_topic": "alpr"}},
                {{"type": "file", "pattern": "{{source}}/{{plate}}.jpeg", "retain_days": 3}}
            ],
            "alpr": {{"url": "http://alpr.local:3000/v1/identify"}}
        }}"#,
        data_dir,
        dir.path().join("plates.db"),
    );
    let path = write_config(&dir, &config_json)?;

    let store = ConfigStore::load(&path)?;
    let config = store.snapshot();

    let sources: Arc<plate_sentry::Sources> = Arc::new(Registry::new());
    for source_config in &config.sources {
        sources.add(Arc::new(build_source(source_config)?));
    }
    assert_eq!(sources.len(), 2);
    let first = sources.get(0).expect("first source");
    assert_eq!(first.name(), "front gate");
    assert!(matches!(first.origin(), SourceOrigin::Rtsp { .. }));
    assert!(!first.running());

    let filters: Arc<plate_sentry::Filters> = Arc::new(Registry::new());
    for filter_config in &config.filters {
        filters.add(Arc::new(build_filter(filter_config)?));
    }
    assert_eq!(filters.len(), 2);
    assert_eq!(filters.get(0).expect("motion").kind(), "motion");
    assert!(filters.get(1).expect("mask").debug());

    let recorders: Arc<plate_sentry::Recorders> = Arc::new(Registry::new());
    for recorder_config in &config.recorders {
        recorders.add(build_recorder(recorder_config, &config.data_dir())?);
    }
    assert_eq!(recorders.len(), 3);
    assert_eq!(recorders.get(0).expect("sqlite").kind(), "sqlite");
    assert_eq!(recorders.get(1).expect("mqtt").kind(), "mqtt");
    assert_eq!(recorders.get(2).expect("file").kind(), "file");

    let detector = build_detector(&config.alpr)?;
    assert_eq!(detector.url().port(), Some(3000));
    Ok(())
}

#[test]
fn invalid_source_names_fail_construction() -> Result<()> {
    let config: Config = serde_json::from_str(
        r#"{
            "sources": [{"type": "file", "name": "bad/name", "capture_interval": 1.0,
                         "file": "/videos/x.mp4"}],
            "alpr": {"url": "http://localhost:3000/"}
        }"#,
    )?;
    assert!(build_source(&config.sources[0]).is_err());
    Ok(())
}

#[test]
fn unknown_recorder_type_is_rejected_at_parse_time() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(
        &dir,
        r#"{
            "recorders": [{"type": "carrier-pigeon"}],
            "alpr": {"url": "http://localhost:3000/"}
        }"#,
    )?;
    assert!(ConfigStore::load(&path).is_err());
    Ok(())
}

#[test]
fn file_recorder_patterns_that_escape_the_data_dir_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = RecorderConfig::File {
        pattern: "../{plate}.jpeg".to_string(),
        retain_days: 3,
    };
    assert!(build_recorder(&config, dir.path()).is_err());
    Ok(())
}
