#![expect(
    clippy::module_name_repetitions,
    reason = "KeepaCodec names the service it encodes for"
)]

//! Wire codec for the Keepa push service.
//!
//! Requests go out as zlib-compressed JSON. Responses come back as raw deflate streams without a
//! zlib header; uncompressed JSON frames are accepted as well.

use miniz_oxide::deflate::compress_to_vec_zlib;
use miniz_oxide::inflate::decompress_to_vec_with_limit;
use serde_json::Value;

use super::types::request::ProductRequestTemplate;
use super::types::response::{ProductHistory, PushMessage};
use crate::Result;
use crate::ws::pending::CorrelationKey;
use crate::ws::traits::{Correlation, Decoded, MessageCodec};

/// Highest miniz compression level.
const BEST_COMPRESSION: u8 = 10;

/// Inflated frames larger than this are discarded.
const MAX_INFLATED_SIZE: usize = 64 * 1024 * 1024;

/// [`MessageCodec`] for product history requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepaCodec {
    template: ProductRequestTemplate,
}

impl KeepaCodec {
    #[must_use]
    pub fn new(template: ProductRequestTemplate) -> Self {
        Self { template }
    }

    #[must_use]
    pub fn template(&self) -> &ProductRequestTemplate {
        &self.template
    }
}

impl MessageCodec for KeepaCodec {
    type Payload = ProductHistory;

    fn encode(&self, key: &CorrelationKey) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(&self.template.request(key))?;
        Ok(compress_to_vec_zlib(&json, BEST_COMPRESSION))
    }

    fn decode(&self, frame: &[u8]) -> Decoded<ProductHistory> {
        let Some(message) = parse_frame(frame) else {
            return Decoded::Unrecognized;
        };

        let PushMessage {
            id,
            products,
            error,
        } = message;

        let product = products.and_then(|products| products.into_iter().next());
        let asin = product
            .as_ref()
            .and_then(|product| product.asin.as_deref())
            .filter(|asin| !asin.is_empty())
            .map(str::to_owned);

        let correlation = match (&asin, id) {
            (Some(asin), Some(id)) => {
                Some(Correlation::Exact(CorrelationKey::new(asin.as_str(), id)))
            }
            (Some(asin), None) => Some(Correlation::Product(asin.clone())),
            (None, Some(id)) => Some(Correlation::Sequence(id)),
            (None, None) => None,
        };

        if let Some(error) = error {
            return Decoded::ProtocolError {
                correlation,
                message: error_message(error),
            };
        }

        let (Some(correlation), Some(asin), Some(product)) = (correlation, asin, product) else {
            return Decoded::Unrecognized;
        };

        match product.into_history(asin) {
            Ok(payload) => Decoded::Response {
                correlation,
                payload,
            },
            Err(message) => Decoded::ProtocolError {
                correlation: Some(correlation),
                message,
            },
        }
    }
}

fn parse_frame(frame: &[u8]) -> Option<PushMessage> {
    if frame.trim_ascii_start().first() == Some(&b'{') {
        return serde_json::from_slice(frame).ok();
    }

    let inflated = decompress_to_vec_with_limit(frame, MAX_INFLATED_SIZE).ok()?;
    serde_json::from_slice(&inflated).ok()
}

fn error_message(error: Value) -> String {
    match error {
        Value::String(message) => message,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use miniz_oxide::deflate::compress_to_vec;
    use miniz_oxide::inflate::decompress_to_vec_zlib;
    use serde_json::json;

    use super::*;
    use crate::history::types::response::PriceType;

    fn deflate(value: &Value) -> Vec<u8> {
        compress_to_vec(value.to_string().as_bytes(), 6)
    }

    #[test]
    fn encode_produces_zlib_json() {
        let frame = KeepaCodec::default()
            .encode(&CorrelationKey::new("B08N5WRWNW", 42))
            .unwrap();

        let json: Value = serde_json::from_slice(&decompress_to_vec_zlib(&frame).unwrap()).unwrap();
        assert_eq!(json["asin"], "B08N5WRWNW");
        assert_eq!(json["id"], 42);
        assert_eq!(json["domainId"], 1);
        assert_eq!(json["path"], "product");
    }

    #[test]
    fn decode_deflated_response_with_id() {
        let frame = deflate(&json!({
            "id": 3,
            "products": [{ "asin": "B08N5WRWNW", "csv": [[0, 1999]] }]
        }));

        let Decoded::Response {
            correlation,
            payload,
        } = KeepaCodec::default().decode(&frame)
        else {
            panic!("expected a response");
        };

        assert_eq!(
            correlation,
            Correlation::Exact(CorrelationKey::new("B08N5WRWNW", 3))
        );
        assert_eq!(payload.latest(PriceType::Amazon).unwrap().value, 1999);
    }

    #[test]
    fn decode_plain_json_without_id_correlates_by_product() {
        let frame = json!({ "products": [{ "asin": "B07XJ8C8F5", "csv": [null] }] }).to_string();

        let Decoded::Response { correlation, .. } = KeepaCodec::default().decode(frame.as_bytes())
        else {
            panic!("expected a response");
        };
        assert_eq!(correlation, Correlation::Product("B07XJ8C8F5".to_owned()));
    }

    #[test]
    fn decode_bad_series_is_protocol_error() {
        let frame = deflate(&json!({
            "id": 9,
            "products": [{ "asin": "B08N5WRWNW", "csv": [[0, 1999, 5]] }]
        }));

        let Decoded::ProtocolError {
            correlation: Some(correlation),
            message,
        } = KeepaCodec::default().decode(&frame)
        else {
            panic!("expected a protocol error");
        };
        assert_eq!(
            correlation,
            Correlation::Exact(CorrelationKey::new("B08N5WRWNW", 9))
        );
        assert!(message.contains("odd length"));
    }

    #[test]
    fn decode_error_frame_with_only_id() {
        let frame = deflate(&json!({ "id": 4, "error": "too many requests" }));

        let Decoded::ProtocolError {
            correlation,
            message,
        } = KeepaCodec::default().decode(&frame)
        else {
            panic!("expected a protocol error");
        };
        assert_eq!(correlation, Some(Correlation::Sequence(4)));
        assert_eq!(message, "too many requests");
    }

    #[test]
    fn decode_garbage_is_unrecognized() {
        let codec = KeepaCodec::default();

        assert!(matches!(codec.decode(b"\x00\x01\x02"), Decoded::Unrecognized));
        assert!(matches!(codec.decode(b"{not json"), Decoded::Unrecognized));
        assert!(matches!(
            codec.decode(&deflate(&json!({ "status": "ok" }))),
            Decoded::Unrecognized
        ));
        assert!(matches!(
            codec.decode(&deflate(&json!({ "products": [] }))),
            Decoded::Unrecognized
        ));
    }
}
