//! Config, topics and state files on disk, exercised through isolated temp
//! directories.

use chrono::{TimeZone, Utc};
use inquiry_broker::broker::correlation::RecentTopicEntry;
use inquiry_broker::broker::ledger::{InquiryRecord, InquiryStatus};
use inquiry_broker::broker::TopicRegistry;
use inquiry_broker::config::Config;
use inquiry_broker::store::{BrokerSnapshot, JsonFileStore, StateStore};
use std::fs;

// ─────────────────────────────────────────────────────────────────────────────
// config.toml
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn hand_written_config_with_whatsapp_section_loads() {
    let tmp = tempfile::TempDir::new().expect("tempdir creation should succeed");
    fs::write(
        tmp.path().join("config.toml"),
        r#"
[broker]
requester = "+15559990000"
attachment_send_delay_ms = 0

[whatsapp]
access_token = "EAAtoken"
phone_number_id = "1234567890"
verify_token = "verify-me"
api_base = "http://127.0.0.1:9999/v18.0"

[gateway]
port = 8080
"#,
    )
    .unwrap();

    let config = Config::load_or_init_in(tmp.path()).await.unwrap();
    assert_eq!(config.broker.requester, "+15559990000");
    assert_eq!(config.broker.group_suffix, "@g.us");
    assert_eq!(config.broker.attachment_send_delay().as_millis(), 0);
    assert_eq!(config.gateway.port, 8080);
    assert_eq!(config.gateway.host, "127.0.0.1");
    let wa = config.whatsapp.as_ref().unwrap();
    assert_eq!(wa.phone_number_id, "1234567890");
    assert!(config.validate().is_ok());
}

#[tokio::test]
async fn malformed_config_is_an_error_not_a_reset() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("config.toml");
    fs::write(&path, "[broker\nrequester = ").unwrap();

    let err = Config::load_or_init_in(tmp.path()).await.unwrap_err();
    assert!(format!("{err:#}").contains("Failed to parse config file"));
    assert_eq!(fs::read_to_string(&path).unwrap(), "[broker\nrequester = ");
}

#[tokio::test]
async fn save_leaves_no_temp_files_behind() {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut config = Config::load_or_init_in(tmp.path()).await.unwrap();
    config.normalizer.enabled = false;
    config.save().await.unwrap();

    let names: Vec<String> = fs::read_dir(tmp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["config.toml".to_string()]);

    let reloaded = Config::load_or_init_in(tmp.path()).await.unwrap();
    assert!(!reloaded.normalizer.enabled);
}

// ─────────────────────────────────────────────────────────────────────────────
// topics.json
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn topics_file_is_seeded_once_then_read_back() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = Config::load_or_init_in(tmp.path()).await.unwrap();
    let path = config.topics_path();

    let seeded = TopicRegistry::load_or_seed(&path).await.unwrap();
    assert!(path.exists());
    assert!(!seeded.is_empty());

    fs::write(&path, r#"{ "LAPTOP": ["g1@g.us", "g2@g.us"], "MOUSE": [] }"#).unwrap();
    let topics = TopicRegistry::load_or_seed(&path).await.unwrap();
    assert_eq!(topics.len(), 2);
    assert_eq!(topics.resolve("need a laptop"), Some("LAPTOP"));
    assert_eq!(topics.destinations("LAPTOP").len(), 2);
    assert!(topics.destinations("MOUSE").is_empty());
}

#[tokio::test]
async fn unreadable_topics_file_is_an_error() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("topics.json");
    fs::write(&path, "not json").unwrap();
    assert!(TopicRegistry::load_or_seed(&path).await.is_err());
}

// ─────────────────────────────────────────────────────────────────────────────
// state.json
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn state_snapshot_round_trips_through_disk() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = JsonFileStore::new(tmp.path().join("state.json"));
    assert!(store.load().unwrap().is_none());

    let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
    let mut snapshot = BrokerSnapshot {
        counter: 3,
        ..BrokerSnapshot::default()
    };
    snapshot.inquiries.insert(
        3,
        InquiryRecord {
            sequence: 3,
            topic: "LAPTOP".into(),
            body: "need laptop".into(),
            issued_at: at,
            status: InquiryStatus::Closed,
            responses: vec!["+15550001111".into()],
        },
    );
    snapshot.recent_topics.insert(
        "LAPTOP".into(),
        RecentTopicEntry {
            topic: "LAPTOP".into(),
            text: "need laptop".into(),
            issued_at: at,
            sequence: 3,
        },
    );

    store.save(&snapshot).unwrap();
    assert_eq!(store.load().unwrap(), Some(snapshot));

    let raw = fs::read_to_string(tmp.path().join("state.json")).unwrap();
    assert!(raw.contains("\"closed\""));
}

#[test]
fn older_state_without_optional_sections_still_loads() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("state.json");
    fs::write(&path, r#"{ "counter": 12 }"#).unwrap();

    let snapshot = JsonFileStore::new(path).load().unwrap().unwrap();
    assert_eq!(snapshot.counter, 12);
    assert!(snapshot.inquiries.is_empty());
    assert!(snapshot.recent_topics.is_empty());
}
