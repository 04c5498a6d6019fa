use anyhow::Result;
use object_store::{ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory};
use std::sync::Arc;
use url::Url;

/// Create the artifact store from a DSN string.
///
/// Supported schemes: `file://` for a local directory, `memory://` for
/// tests, `s3://` for S3 or an S3-compatible service
/// (`s3://[access_key:secret_key@]host[:port]/bucket`).
pub fn object_store_from_dsn(dsn: &str) -> Result<Arc<dyn ObjectStore>> {
    let url =
        Url::parse(dsn).map_err(|e| anyhow::anyhow!("Invalid storage DSN '{}': {}", dsn, e))?;

    match url.scheme() {
        "file" => {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(anyhow::anyhow!(
                    "File DSN must specify a path: file:///path/to/artifacts"
                ));
            }
            // file://.data/... parses with the dot-path as host+path; treat
            // a leading "/." as a relative path.
            let path = path.strip_prefix("/.").map_or(path, |_| &path[1..]);
            std::fs::create_dir_all(path)?;
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        "memory" => Ok(Arc::new(InMemory::new())),
        "s3" => {
            let builder = s3_builder_from_dsn(&url)?;
            Ok(Arc::new(builder.build()?))
        }
        scheme => Err(anyhow::anyhow!(
            "Unsupported storage scheme: {}. Supported: file, memory, s3",
            scheme
        )),
    }
}

/// Build an S3 client from a DSN, with credentials from the DSN userinfo or
/// the standard AWS environment variables.
fn s3_builder_from_dsn(dsn: &Url) -> Result<AmazonS3Builder> {
    let host = dsn
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("Missing S3 host in DSN"))?;
    let port = dsn.port();
    let bucket = dsn.path().trim_start_matches('/');

    if bucket.is_empty() {
        return Err(anyhow::anyhow!(
            "S3 DSN must specify a bucket: s3://host/bucket"
        ));
    }

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_region("us-east-1");

    let access_key = dsn.username();
    if !access_key.is_empty() {
        builder = builder
            .with_access_key_id(access_key)
            .with_secret_access_key(dsn.password().unwrap_or(""));
    }

    // Anything that is not real S3 needs a custom endpoint and path-style
    // requests (MinIO and friends).
    if !host.contains("amazonaws.com") {
        let scheme = if port == Some(443) { "https" } else { "http" };
        let endpoint = match port {
            Some(p) => format!("{scheme}://{host}:{p}"),
            None => format!("{scheme}://{host}"),
        };
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(true)
            .with_virtual_hosted_style_request(false);
    }

    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = object_store_from_dsn("memory://").unwrap();
        assert_eq!(Arc::strong_count(&store), 1);
    }

    #[test]
    fn test_filesystem_store() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let dsn = format!("file://{}", temp_dir.path().to_string_lossy());
        object_store_from_dsn(&dsn).unwrap();
    }

    #[test]
    fn test_s3_dsn() {
        assert!(object_store_from_dsn("s3://access:secret@localhost:9000/artifacts").is_ok());

        let err = object_store_from_dsn("s3://localhost:9000/").unwrap_err();
        assert!(err.to_string().contains("must specify a bucket"));
    }

    #[test]
    fn test_invalid_dsn() {
        let err = object_store_from_dsn("not-a-url").unwrap_err();
        assert!(err.to_string().contains("Invalid storage DSN"));
    }

    #[test]
    fn test_unsupported_scheme() {
        let err = object_store_from_dsn("ftp://bucket/prefix").unwrap_err();
        assert!(err.to_string().contains("Unsupported storage scheme"));
    }
}
