//! Header bookkeeping between requests, connections and responses.

use http::header::{self, HeaderName, HeaderValue};
use http::HeaderMap;

/// Header names that describe the body rather than the message.
const CONTENT_HEADERS: [HeaderName; 11] = [
    header::ALLOW,
    header::CONTENT_DISPOSITION,
    header::CONTENT_ENCODING,
    header::CONTENT_LANGUAGE,
    header::CONTENT_LENGTH,
    header::CONTENT_LOCATION,
    HeaderName::from_static("content-md5"),
    header::CONTENT_RANGE,
    header::CONTENT_TYPE,
    header::EXPIRES,
    header::LAST_MODIFIED,
];

/// `true` if `name` belongs with the response content.
#[must_use]
pub fn is_content_header(name: &HeaderName) -> bool {
    CONTENT_HEADERS.contains(name)
}

/// Join all values of `name` into a single connection header value.
///
/// `User-Agent` products are separated by a space; everything else uses a
/// comma as the list separator.
///
/// # Errors
///
/// Returns an error if the joined value is not a valid header value.
pub fn joined_value(
    headers: &HeaderMap,
    name: &HeaderName,
) -> Result<Option<HeaderValue>, http::header::InvalidHeaderValue> {
    let mut values = headers.get_all(name).iter();
    let Some(first) = values.next() else {
        return Ok(None);
    };

    let rest: Vec<&HeaderValue> = values.collect();
    if rest.is_empty() {
        return Ok(Some(first.clone()));
    }

    let separator: &[u8] = if name == header::USER_AGENT { b" " } else { b"," };
    let mut joined = first.as_bytes().to_vec();
    for value in rest {
        joined.extend_from_slice(separator);
        joined.extend_from_slice(value.as_bytes());
    }

    let mut value = HeaderValue::from_bytes(&joined)?;
    value.set_sensitive(first.is_sensitive());
    Ok(Some(value))
}

/// Split a response header map into message headers and content headers.
#[must_use]
pub fn split_content_headers(all: HeaderMap) -> (HeaderMap, HeaderMap) {
    let mut message = HeaderMap::new();
    let mut content = HeaderMap::new();
    let mut current: Option<HeaderName> = None;

    for (name, value) in all {
        // `HeaderMap::into_iter` yields the name only for the first value.
        if let Some(name) = name {
            current = Some(name);
        }
        let Some(name) = current.clone() else {
            continue;
        };
        if is_content_header(&name) {
            content.append(name, value);
        } else {
            message.append(name, value);
        }
    }

    (message, content)
}
