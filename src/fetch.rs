use crate::feed_kind::{ClassifyError, FeedEnvelope, classify_feed};
use gtfs_realtime::FeedMessage;
use prost::Message;
use std::time::Duration;
use thiserror::Error;

/// Why a single feed's contribution to the cycle was lost. The coordinator
/// treats every variant the same way today (count, log, continue), but the
/// split keeps transport problems distinguishable from bad payloads.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("feed returned http status {0}")]
    Status(reqwest::StatusCode),
    #[error("feed payload malformed: {0}")]
    Malformed(#[from] prost::DecodeError),
    #[error(transparent)]
    Unclassifiable(#[from] ClassifyError),
}

/// GET one feed URL and decode the protobuf body into an envelope.
pub async fn fetch_feed(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<FeedEnvelope, FetchError> {
    log::debug!("Requesting {}", url);
    let response = client.get(url).timeout(timeout).send().await?;
    if !response.status().is_success() {
        return Err(FetchError::Status(response.status()));
    }
    let bytes = response.bytes().await?;
    let message = FeedMessage::decode(bytes.as_ref())?;
    let header_timestamp = header_timestamp_of(&message);
    let kind = classify_feed(url, &message)?;
    Ok(FeedEnvelope {
        url: url.to_string(),
        kind,
        message,
        header_timestamp,
    })
}

fn header_timestamp_of(message: &FeedMessage) -> Option<u64> {
    match message.header.timestamp {
        Some(0) | None => None,
        Some(ts) => Some(ts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtfs_realtime::FeedHeader;

    #[test]
    fn zero_header_timestamp_means_absent() {
        let mut message = FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                incrementality: None,
                timestamp: Some(0),
                feed_version: None,
            },
            entity: vec![],
        };
        assert_eq!(header_timestamp_of(&message), None);

        message.header.timestamp = None;
        assert_eq!(header_timestamp_of(&message), None);

        message.header.timestamp = Some(1700000123);
        assert_eq!(header_timestamp_of(&message), Some(1700000123));
    }

    #[test]
    fn garbage_bytes_fail_decode() {
        // Field 1 of FeedMessage is a message; a wire-type-0 tag here is
        // invalid, so decode must reject rather than fabricate an envelope.
        let garbage: &[u8] = &[0x08, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        assert!(FeedMessage::decode(garbage).is_err());
    }
}
