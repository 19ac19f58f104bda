//! Shared fixtures for integration tests: an in-process S3 bucket served by
//! wiremock, zip archive builders and engine wiring over temp directories.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tripsync_core::{
    Database, FileDigest, HttpClient, RetryPolicy, SqliteTableLoader, Store, SyncConfig,
    SyncEngine,
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

/// Builds an uncompressed zip holding the given entries.
pub fn zip_archive(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, body) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// CSV with a header and `rows` data rows.
pub fn trips_csv(rows: usize) -> String {
    let mut csv = String::from("ride_id,started_at,station\n");
    for i in 0..rows {
        csv.push_str(&format!("R{i:05},2024-01-01 00:00:{:02},Clark & Lake\n", i % 60));
    }
    csv
}

pub fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, d, 12, 0, 0).unwrap()
}

#[derive(Clone)]
struct Published {
    name: String,
    body: Vec<u8>,
    last_modified: DateTime<Utc>,
}

/// A bucket on a mock server. Every change remounts the whole bucket.
pub struct Bucket {
    pub server: MockServer,
    objects: Mutex<Vec<Published>>,
}

impl Bucket {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
            objects: Mutex::new(Vec::new()),
        }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Adds or replaces an object.
    pub async fn publish(&self, name: &str, body: &[u8], last_modified: DateTime<Utc>) {
        {
            let mut objects = self.objects.lock().unwrap();
            objects.retain(|o| o.name != name);
            objects.push(Published {
                name: name.to_string(),
                body: body.to_vec(),
                last_modified,
            });
        }
        self.remount().await;
    }

    /// Lists an object whose download fails with `status`.
    pub async fn publish_broken(&self, name: &str, status: u16) {
        self.publish(name, b"unreachable", day(1)).await;
        Mock::given(method("GET"))
            .and(path(format!("/{name}")))
            .respond_with(ResponseTemplate::new(status))
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    async fn remount(&self) {
        let objects = self.objects.lock().unwrap().clone();
        self.server.reset().await;

        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("list-type", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing_xml(&objects)))
            .mount(&self.server)
            .await;

        for object in objects {
            Mock::given(method("GET"))
                .and(path(format!("/{}", object.name)))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(object.body))
                .mount(&self.server)
                .await;
        }
    }
}

fn listing_xml(objects: &[Published]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<ListBucketResult>\n<IsTruncated>false</IsTruncated>\n",
    );
    for object in objects {
        xml.push_str(&contents_xml(
            &object.name,
            &object.body,
            object.last_modified,
        ));
    }
    xml.push_str("</ListBucketResult>\n");
    xml
}

/// One `<Contents>` element with an MD5 ETag, quoted the way S3 quotes it.
pub fn contents_xml(name: &str, body: &[u8], last_modified: DateTime<Utc>) -> String {
    format!(
        "<Contents><Key>{name}</Key><LastModified>{}</LastModified><ETag>&quot;{}&quot;</ETag><Size>{}</Size></Contents>\n",
        last_modified.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        FileDigest::of_bytes(body).md5,
        body.len()
    )
}

/// Engine, stores and directories for one test.
pub struct Harness {
    pub dir: TempDir,
    pub config: SyncConfig,
    pub store: Store,
    pub warehouse: Database,
    pub engine: SyncEngine,
}

impl Harness {
    pub async fn new(bucket: &Bucket) -> Self {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig {
            endpoint: Some(bucket.uri()),
            data_dir: dir.path().to_path_buf(),
            concurrency: 2,
            ..SyncConfig::default()
        };
        let paths = config.paths();
        let store = Store::new(Database::new(&paths.log_db).await.unwrap());
        let warehouse = Database::open_unmigrated(&paths.warehouse_db, config.database_options())
            .await
            .unwrap();
        let engine = SyncEngine::from_config(
            &config,
            store.clone(),
            Arc::new(HttpClient::new().unwrap()),
            Arc::new(SqliteTableLoader::new(warehouse.clone())),
        )
        .with_retry_policy(RetryPolicy::new(
            2,
            std::time::Duration::from_millis(5),
            std::time::Duration::from_millis(10),
            2.0,
        ));

        Self {
            dir,
            config,
            store,
            warehouse,
            engine,
        }
    }

    pub fn live(&self, name: &str) -> std::path::PathBuf {
        self.config.paths().download_dir.join(name)
    }

    pub async fn row_count(&self, table: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM \"{table}\""))
            .fetch_one(self.warehouse.pool())
            .await
            .unwrap()
    }
}
