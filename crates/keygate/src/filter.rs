//! Listing response filter
//!
//! Removes from a listing response every entry the caller may not see, keeping the
//! shape of the document. The walk understands both the `R2` binding shape
//! (`objects[].key`, `delimitedPrefixes[]`) and the S3 shape
//! (`Contents[].Key`, `CommonPrefixes[].Prefix`):
//!
//! + an array holding objects with a `key`/`Key` field is an entry array; objects whose
//!   key is not permitted are dropped,
//! + objects in such an array with a `prefix`/`Prefix` field instead are folders and
//!   are kept if anything under them is visible,
//! + string arrays under a prefix-list field name are folders too,
//! + anything inside an entry array that is neither is dropped.
//!
//! Filtering is idempotent.

use crate::authz::PermissionSet;
use crate::error::GateResult;
use crate::http::{APPLICATION_JSON, Body, HttpResponse, NO_STORE};

use hyper::HeaderMap;
use hyper::header::{CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use serde_json::{Map, Value};
use tracing::{debug, warn};

const KEY_FIELDS: &[&str] = &["key", "Key"];
const PREFIX_FIELDS: &[&str] = &["prefix", "Prefix"];
const PREFIX_LISTS: &[&str] = &["prefixes", "Prefixes", "delimitedPrefixes", "commonPrefixes", "CommonPrefixes"];
const KEY_LISTS: &[&str] = &["objects", "keys", "Contents"];

fn string_field<'a>(map: &'a Map<String, Value>, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|name| map.get(*name).and_then(Value::as_str))
}

fn has_any_field(map: &Map<String, Value>, names: &[&str]) -> bool {
    names.iter().any(|name| map.contains_key(*name))
}

fn is_entry_array(items: &[Value]) -> bool {
    items.iter().any(|item| match item {
        Value::Object(map) => has_any_field(map, KEY_FIELDS) || has_any_field(map, PREFIX_FIELDS),
        _ => false,
    })
}

fn keep_entry(item: &Value, perms: &PermissionSet) -> bool {
    let Value::Object(map) = item else { return false };
    if has_any_field(map, KEY_FIELDS) {
        return string_field(map, KEY_FIELDS).is_some_and(|key| perms.is_allowed(key));
    }
    string_field(map, PREFIX_FIELDS).is_some_and(|prefix| perms.may_list(prefix))
}

fn filter_array(field: Option<&str>, items: &mut Vec<Value>, perms: &PermissionSet) {
    if field.is_some_and(|f| PREFIX_LISTS.contains(&f)) {
        items.retain(|item| match item {
            Value::String(prefix) => perms.may_list(prefix),
            other => keep_entry(other, perms),
        });
        return;
    }

    if field.is_some_and(|f| KEY_LISTS.contains(&f)) && items.iter().any(Value::is_string) {
        items.retain(|item| match item {
            Value::String(key) => perms.is_allowed(key),
            other => keep_entry(other, perms),
        });
        return;
    }

    if is_entry_array(items) {
        items.retain(|item| keep_entry(item, perms));
        return;
    }

    for item in items {
        filter_value(None, item, perms);
    }
}

fn filter_value(field: Option<&str>, value: &mut Value, perms: &PermissionSet) {
    match value {
        Value::Object(map) => {
            for (k, v) in map.iter_mut() {
                filter_value(Some(k.as_str()), v, perms);
            }
        }
        Value::Array(items) => filter_array(field, items, perms),
        _ => {}
    }
}

/// Filters a parsed listing document in place.
///
/// ```
/// use keygate::authz::PermissionSet;
/// use keygate::filter::filter_listing;
/// use serde_json::json;
///
/// let mut listing = json!({"objects": [{"key": "a/1.txt"}, {"key": "b/2.txt"}], "delimitedPrefixes": ["a/x/", "b/"]});
/// filter_listing(&mut listing, &PermissionSet::from_prefixes(["a/"]));
/// assert_eq!(listing, json!({"objects": [{"key": "a/1.txt"}], "delimitedPrefixes": ["a/x/"]}));
/// ```
pub fn filter_listing(value: &mut Value, perms: &PermissionSet) {
    if perms.is_wildcard() {
        return;
    }
    filter_value(None, value, perms);
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<mime::Mime>().ok())
        .is_some_and(|m| m.essence_str() == mime::APPLICATION_JSON.essence_str())
}

fn is_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .is_some_and(|v| !v.as_bytes().eq_ignore_ascii_case(b"identity"))
}

/// Filters a listing response from the upstream service.
///
/// Non-JSON responses pass through untouched, as do JSON bodies that fail to parse
/// (logged, since the entries then reach the caller unfiltered).
///
/// # Errors
/// Returns `BadGateway` if the body cannot be read, exceeds `limit`, or is compressed.
pub async fn filter_response(res: HttpResponse, perms: &PermissionSet, limit: usize) -> GateResult<HttpResponse> {
    if perms.is_wildcard() || !is_json(res.headers()) {
        return Ok(res);
    }
    if is_encoded(res.headers()) {
        return Err(gate_error!(BadGateway, "listing response has a content encoding"));
    }

    let (mut parts, mut body) = res.into_parts();
    let bytes = body
        .store_all_limited(limit)
        .await
        .map_err(|e| gate_error!(BadGateway, "cannot buffer listing response: {e}"))?;

    let mut value: Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(err) => {
            warn!(%err, status = %parts.status, "listing response is not valid JSON, passing through unfiltered");
            return Ok(HttpResponse::from_parts(parts, body));
        }
    };

    filter_listing(&mut value, perms);

    let filtered = serde_json::to_vec(&value).map_err(|e| gate_error!(e, InternalError))?;
    debug!(before = bytes.len(), after = filtered.len(), "filtered listing");

    parts.headers.remove(CONTENT_LENGTH);
    parts.headers.remove(ETAG);
    parts.headers.remove(CONTENT_ENCODING);
    parts.headers.insert(CONTENT_TYPE, APPLICATION_JSON);
    parts.headers.insert(CACHE_CONTROL, NO_STORE);

    Ok(HttpResponse::from_parts(parts, Body::from(filtered)))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::GateErrorCode;

    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::StatusCode;
    use hyper::header::HeaderValue;
    use serde_json::json;

    fn perms() -> PermissionSet {
        PermissionSet::from_prefixes(["a/"])
    }

    fn filtered(mut value: Value, perms: &PermissionSet) -> Value {
        filter_listing(&mut value, perms);
        value
    }

    fn json_response(body: &'static str) -> HttpResponse {
        let mut res = HttpResponse::new(Body::http_body_unsync(Full::new(Bytes::from_static(body.as_bytes()))));
        res.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
        res.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        res.headers_mut().insert(ETAG, HeaderValue::from_static("\"abc\""));
        res.headers_mut().insert(CACHE_CONTROL, HeaderValue::from_static("public, max-age=60"));
        res
    }

    #[test]
    fn filters_r2_listing() {
        let listing = json!({
            "objects": [{"key": "a/1.txt", "size": 1}, {"key": "b/2.txt", "size": 2}],
            "delimitedPrefixes": ["a/sub/", "b/", "c/"],
            "truncated": false,
        });
        assert_eq!(
            filtered(listing, &perms()),
            json!({
                "objects": [{"key": "a/1.txt", "size": 1}],
                "delimitedPrefixes": ["a/sub/"],
                "truncated": false,
            })
        );
    }

    #[test]
    fn filters_s3_listing() {
        let listing = json!({
            "ListBucketResult": {
                "Contents": [{"Key": "a/1.txt"}, {"Key": "b/2.txt"}],
                "CommonPrefixes": [{"Prefix": "a/"}, {"Prefix": "b/"}],
            }
        });
        assert_eq!(
            filtered(listing, &perms()),
            json!({
                "ListBucketResult": {
                    "Contents": [{"Key": "a/1.txt"}],
                    "CommonPrefixes": [{"Prefix": "a/"}],
                }
            })
        );
    }

    #[test]
    fn root_folder_listing_keeps_ancestors() {
        let perms = PermissionSet::from_prefixes(["team-a/reports/"]);
        let listing = json!({"objects": [{"key": "readme.md"}], "delimitedPrefixes": ["team-a/", "team-b/"]});
        assert_eq!(
            filtered(listing, &perms),
            json!({"objects": [], "delimitedPrefixes": ["team-a/"]})
        );
    }

    #[test]
    fn drops_entries_without_usable_field() {
        let listing = json!({"objects": [{"key": "a/1"}, {"name": "x"}, {"key": 42}, "b/2", {"prefix": "a/d/"}]});
        assert_eq!(
            filtered(listing, &perms()),
            json!({"objects": [{"key": "a/1"}, {"prefix": "a/d/"}]})
        );
    }

    #[test]
    fn filters_string_key_lists() {
        let listing = json!({"keys": ["a/1.txt", "b/2.txt"]});
        assert_eq!(filtered(listing, &perms()), json!({"keys": ["a/1.txt"]}));
    }

    #[test]
    fn leaves_unrelated_arrays_alone() {
        let listing = json!({"buckets": [{"name": "main"}], "tags": ["x", "y"]});
        assert_eq!(filtered(listing.clone(), &perms()), listing);
    }

    #[test]
    fn idempotent() {
        let listing = json!({
            "objects": [{"key": "a/1"}, {"key": "b/2"}, {"other": 1}],
            "delimitedPrefixes": ["a/", "b/"],
            "nested": {"Contents": [{"Key": "a/3"}, {"Key": "c/4"}]},
        });
        let once = filtered(listing, &perms());
        let twice = filtered(once.clone(), &perms());
        assert_eq!(once, twice);
    }

    #[test]
    fn wildcard_is_untouched() {
        let listing = json!({"objects": [{"key": "b/2"}, {"nokey": true}]});
        assert_eq!(filtered(listing.clone(), &PermissionSet::All), listing);
    }

    #[tokio::test]
    async fn rewrites_response_headers() {
        let res = json_response(r#"{"objects":[{"key":"a/1.txt"},{"key":"b/2.txt"}]}"#);
        let res = filter_response(res, &perms(), 1024).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(res.headers()[CACHE_CONTROL], "no-store, private");
        assert!(res.headers().get(CONTENT_LENGTH).is_none());
        assert!(res.headers().get(ETAG).is_none());

        let body: Value = serde_json::from_slice(&res.body().bytes().unwrap()).unwrap();
        assert_eq!(body, json!({"objects": [{"key": "a/1.txt"}]}));
    }

    #[tokio::test]
    async fn passes_through_non_json_and_unparsable() {
        let mut res = HttpResponse::new(Body::from("b/2.txt"));
        res.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let res = filter_response(res, &perms(), 1024).await.unwrap();
        assert_eq!(res.body().bytes().unwrap(), "b/2.txt");

        let res = json_response(r#"{"objects": [{"key": "b/2.txt"}"#);
        let res = filter_response(res, &perms(), 1024).await.unwrap();
        assert_eq!(res.headers()[ETAG], "\"abc\"");
        assert_eq!(res.body().bytes().unwrap(), r#"{"objects": [{"key": "b/2.txt"}"#);
    }

    #[tokio::test]
    async fn oversized_listing_fails_closed() {
        let res = json_response(r#"{"objects":[{"key":"a/1.txt"},{"key":"b/2.txt"}]}"#);
        let err = filter_response(res, &perms(), 8).await.unwrap_err();
        assert_eq!(err.code(), GateErrorCode::BadGateway);
    }

    #[tokio::test]
    async fn compressed_listing_fails_closed() {
        let mut res = json_response(r#"{"objects":[]}"#);
        res.headers_mut().insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let err = filter_response(res, &perms(), 1024).await.unwrap_err();
        assert_eq!(err.code(), GateErrorCode::BadGateway);
    }

    #[tokio::test]
    async fn wildcard_response_streams_through() {
        let res = json_response(r#"{"objects":[{"key":"b/2.txt"}]}"#);
        let res = filter_response(res, &PermissionSet::All, 1).await.unwrap();
        assert!(res.body().bytes().is_none());
        assert_eq!(res.headers()[CACHE_CONTROL], "public, max-age=60");
    }
}
