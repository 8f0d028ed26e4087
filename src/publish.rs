//! Uploads committed table partitions to S3.
//!
//! Only files named by the table manifest are published, so a run that is
//! still staging never leaks partial partitions.

use std::io::Write;

use anyhow::{Context, Result};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, info};

use crate::materialize::TableStore;

#[derive(Debug, Clone)]
pub struct PublishObject {
    pub key: String,
    pub body: Bytes,
    pub content_type: &'static str,
    pub content_encoding: Option<&'static str>,
}

pub fn gzip_bytes(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Objects for every committed partition of `table`, plus its manifest.
///
/// Keys look like `{prefix}/{table}/service_date=2024-03-01/part.csv[.gz]`.
pub fn table_objects(store: &TableStore, table: &str, prefix: &str, gzip: bool) -> Result<Vec<PublishObject>> {
    let base = match prefix.trim_matches('/') {
        "" => table.to_string(),
        p => format!("{p}/{table}"),
    };

    let mut objects = Vec::new();
    for (label, path) in store.partition_files(table)? {
        let contents = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let object = if gzip {
            PublishObject {
                key: format!("{base}/{label}/part.csv.gz"),
                body: Bytes::from(gzip_bytes(&contents)?),
                content_type: "text/csv",
                content_encoding: Some("gzip"),
            }
        } else {
            PublishObject {
                key: format!("{base}/{label}/part.csv"),
                body: Bytes::from(contents),
                content_type: "text/csv",
                content_encoding: None,
            }
        };
        objects.push(object);
    }

    let manifest = store.manifest(table)?;
    objects.push(PublishObject {
        key: format!("{base}/_manifest.json"),
        body: Bytes::from(serde_json::to_vec(&manifest)?),
        content_type: "application/json",
        content_encoding: None,
    });
    Ok(objects)
}

pub async fn upload_objects(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    objects: Vec<PublishObject>,
) -> Result<usize> {
    let mut upload_count = 0;
    for object in objects {
        debug!(key = %object.key, bytes = object.body.len(), "Uploading object");
        let mut request = client
            .put_object()
            .bucket(bucket)
            .key(&object.key)
            .content_type(object.content_type)
            .body(ByteStream::from(object.body));
        if let Some(encoding) = object.content_encoding {
            request = request.content_encoding(encoding);
        }
        request
            .send()
            .await
            .with_context(|| format!("uploading s3://{bucket}/{}", object.key))?;
        upload_count += 1;
    }
    Ok(upload_count)
}

/// Publishes the current committed state of `table` to `bucket`.
#[tracing::instrument(skip(store))]
pub async fn publish_table(
    store: &TableStore,
    table: &str,
    bucket: &str,
    prefix: &str,
    gzip: bool,
) -> Result<usize> {
    let objects = table_objects(store, table, prefix, gzip)?;
    let config = aws_config::load_from_env().await;
    let client = aws_sdk_s3::Client::new(&config);

    let upload_count = upload_objects(&client, bucket, objects).await?;
    info!(upload_count, table, bucket, "S3 upload complete");
    Ok(upload_count)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::materialize::ReplaceScope;
    use crate::score::PriorityScore;

    fn store_with_scores(name: &str) -> TableStore {
        let dir = std::env::temp_dir().join(format!(
            "transit_reliability_publish_{}_{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let store = TableStore::new(dir);
        let score = PriorityScore {
            stop_id: "S1".to_string(),
            vulnerability_score: 50.0,
            crash_score: 100.0,
            reliability_score: 0.0,
            priority_score: 55.0,
            priority_rank: 1,
        };
        store.replace(ReplaceScope::All, vec![score], "seed").unwrap();
        store
    }

    #[test]
    fn test_gzip_round_trip() {
        let compressed = gzip_bytes(b"stop_id,score\nS1,1\n").unwrap();
        let mut decoded = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "stop_id,score\nS1,1\n");
    }

    #[test]
    fn test_table_objects_keys() {
        let store = store_with_scores("keys");

        let objects = table_objects(&store, "stop_priority", "/marts/", false).unwrap();
        let keys: Vec<&str> = objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["marts/stop_priority/all/part.csv", "marts/stop_priority/_manifest.json"]
        );
        assert!(objects[0].body.starts_with(b"stop_id,"));
    }

    #[test]
    fn test_table_objects_gzip() {
        let store = store_with_scores("gzip");

        let objects = table_objects(&store, "stop_priority", "", true).unwrap();
        assert_eq!(objects[0].key, "stop_priority/all/part.csv.gz");
        assert_eq!(objects[0].content_encoding, Some("gzip"));
        assert_eq!(objects.last().unwrap().content_encoding, None);
    }

    #[test]
    fn test_unwritten_table_publishes_manifest_only() {
        let store = store_with_scores("empty");
        let objects = table_objects(&store, "route_day_reliability", "", false).unwrap();
        assert_eq!(objects.len(), 1);
    }
}
