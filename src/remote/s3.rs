//! Anonymous S3 `ListObjectsV2` listing over plain HTTP.
//!
//! Each page is a `ListBucketResult` document, deserialized with serde:
//!
//! ```text
//! <ListBucketResult>
//!   <IsTruncated>true</IsTruncated>
//!   <NextContinuationToken>1ueGcxLPRx1Tr...</NextContinuationToken>
//!   <Contents>
//!     <Key>202401-divvy-tripdata.zip</Key>
//!     <LastModified>2024-02-06T14:19:13.000Z</LastModified>
//!     <ETag>&quot;6c2c3d0e0b1b4e1e8d3f2b5a7c9e0f11&quot;</ETag>
//!     <Size>18934520</Size>
//!   </Contents>
//! </ListBucketResult>
//! ```
//!
//! Some S3-compatible servers escape quotes as `&#34;`; the XML reader
//! decodes numeric character references along with the named entities.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{ListingError, RemoteListing, RemoteObjectRecord};
use crate::download::Transfer;
use crate::hasher::normalize_remote_fingerprint;

/// Hard stop for runaway pagination (1000 keys per page).
const MAX_LIST_PAGES: usize = 10_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_continuation_token: Option<String>,
    #[serde(default)]
    contents: Vec<ListContents>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListContents {
    key: String,
    last_modified: String,
    #[serde(rename = "ETag")]
    e_tag: String,
    size: String,
}

/// One parsed listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPage {
    /// Objects on this page, in document order.
    pub objects: Vec<RemoteObjectRecord>,
    /// Continuation token when more pages follow.
    pub next_token: Option<String>,
}

/// Lists a public bucket through a [`Transfer`].
pub struct S3Listing {
    transfer: Arc<dyn Transfer>,
    endpoint: String,
    suffix: String,
}

impl std::fmt::Debug for S3Listing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Listing")
            .field("endpoint", &self.endpoint)
            .field("suffix", &self.suffix)
            .finish_non_exhaustive()
    }
}

impl S3Listing {
    /// Creates a listing for the bucket at `endpoint` keeping keys ending in `suffix`.
    #[must_use]
    pub fn new(transfer: Arc<dyn Transfer>, endpoint: &str, suffix: &str) -> Self {
        Self {
            transfer,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            suffix: suffix.to_string(),
        }
    }

    fn page_url(&self, token: Option<&str>) -> String {
        match token {
            Some(token) => format!(
                "{}/?list-type=2&continuation-token={}",
                self.endpoint,
                urlencoding::encode(token)
            ),
            None => format!("{}/?list-type=2", self.endpoint),
        }
    }
}

#[async_trait]
impl RemoteListing for S3Listing {
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn list(&self) -> Result<Vec<RemoteObjectRecord>, ListingError> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;

        for page_number in 1..=MAX_LIST_PAGES {
            let body = self
                .transfer
                .fetch_text(&self.page_url(token.as_deref()))
                .await?;
            let page = parse_list_page(&body)?;
            debug!(page = page_number, keys = page.objects.len(), "listing page parsed");

            objects.extend(
                page.objects
                    .into_iter()
                    .filter(|o| o.name.ends_with(&self.suffix)),
            );

            match page.next_token {
                Some(next) => token = Some(next),
                None => {
                    debug!(objects = objects.len(), "listing complete");
                    return Ok(objects);
                }
            }
        }

        Err(ListingError::TooManyPages {
            pages: MAX_LIST_PAGES,
        })
    }

    fn object_url(&self, name: &str) -> String {
        let encoded: Vec<String> = name
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}", self.endpoint, encoded.join("/"))
    }
}

/// Parses one `ListObjectsV2` response page.
///
/// # Errors
///
/// Returns [`ListingError::Malformed`] when the document is not a listing,
/// a `<Contents>` entry lacks a field, a size or timestamp does not parse,
/// or a truncated page carries no continuation token.
pub fn parse_list_page(xml: &str) -> Result<ListPage, ListingError> {
    let result: ListBucketResult = quick_xml::de::from_str(xml)
        .map_err(|e| ListingError::malformed(format!("bad ListBucketResult: {e}")))?;

    let objects = result
        .contents
        .into_iter()
        .map(parse_contents)
        .collect::<Result<Vec<_>, _>>()?;

    let next_token = if result.is_truncated {
        let token = result
            .next_continuation_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ListingError::malformed("truncated page without continuation token"))?;
        Some(token)
    } else {
        None
    };

    Ok(ListPage {
        objects,
        next_token,
    })
}

fn parse_contents(entry: ListContents) -> Result<RemoteObjectRecord, ListingError> {
    let name = entry.key;
    let size = entry.size.trim().parse::<u64>().map_err(|_| {
        ListingError::malformed(format!("bad Size '{}' for {name}", entry.size))
    })?;
    let last_modified = DateTime::parse_from_rfc3339(entry.last_modified.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| {
            ListingError::malformed(format!(
                "bad LastModified '{}' for {name}",
                entry.last_modified
            ))
        })?;

    Ok(RemoteObjectRecord {
        remote_fingerprint: normalize_remote_fingerprint(&entry.e_tag).to_string(),
        name,
        size,
        last_modified,
    })
}
