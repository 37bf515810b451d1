//! Request types for the Keepa push service.
//!
//! [`ProductRequestTemplate`] uses the [`bon`](https://docs.rs/bon) crate for the builder pattern.

use bon::Builder;
use serde::Serialize;
use serde_repr::Serialize_repr;
use strum_macros::Display;

use crate::ws::pending::CorrelationKey;

/// Client build the push service expects in every product request.
pub const PROTOCOL_VERSION: &str = "20250108";

/// Amazon marketplace a product is looked up in.
#[non_exhaustive]
#[derive(
    Clone, Copy, Debug, Default, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize_repr,
)]
#[repr(u8)]
pub enum Domain {
    /// amazon.com
    #[default]
    Com = 1,
    /// amazon.co.uk
    CoUk = 2,
    /// amazon.de
    De = 3,
    /// amazon.fr
    Fr = 4,
    /// amazon.co.jp
    CoJp = 5,
    /// amazon.ca
    Ca = 6,
    /// amazon.it
    It = 8,
    /// amazon.es
    Es = 9,
    /// amazon.in
    In = 10,
    /// amazon.com.mx
    ComMx = 11,
    /// amazon.com.br
    ComBr = 12,
}

/// Fixed part of every product request.
///
/// # Example
///
/// ```
/// use keepa_client_sdk::history::{Domain, ProductRequestTemplate};
///
/// let template = ProductRequestTemplate::builder()
///     .domain(Domain::De)
///     .max_age(1)
///     .build();
/// assert_eq!(template.domain, Domain::De);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder)]
pub struct ProductRequestTemplate {
    #[builder(default)]
    pub domain: Domain,
    /// Maximum age, in hours, of cached data the service may answer with
    #[builder(default = 3)]
    pub max_age: u32,
    /// Ask the service to refresh the product before answering
    #[builder(default)]
    pub refresh_product: bool,
}

impl Default for ProductRequestTemplate {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ProductRequestTemplate {
    /// The request for the product in `key`, carrying the key's sequence as its `id`.
    #[must_use]
    pub fn request<'a>(&self, key: &'a CorrelationKey) -> ProductRequest<'a> {
        ProductRequest {
            path: "product",
            history: true,
            kind: "ws",
            basic: true,
            compact: true,
            domain_id: self.domain,
            max_age: self.max_age,
            refresh_product: self.refresh_product,
            id: key.sequence,
            version: PROTOCOL_VERSION,
            asin: &key.product_id,
        }
    }
}

/// Wire form of one product request, before compression.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRequest<'a> {
    pub path: &'static str,
    pub history: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub basic: bool,
    pub compact: bool,
    pub domain_id: Domain,
    pub max_age: u32,
    pub refresh_product: bool,
    pub id: u64,
    pub version: &'static str,
    pub asin: &'a str,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn product_request_serializes_expected_fields() {
        let key = CorrelationKey::new("B08N5WRWNW", 7);
        let value = serde_json::to_value(ProductRequestTemplate::default().request(&key)).unwrap();

        assert_eq!(
            value,
            json!({
                "path": "product",
                "history": true,
                "type": "ws",
                "basic": true,
                "compact": true,
                "domainId": 1,
                "maxAge": 3,
                "refreshProduct": false,
                "id": 7,
                "version": "20250108",
                "asin": "B08N5WRWNW"
            })
        );
    }

    #[test]
    fn domain_serializes_as_number() {
        assert_eq!(serde_json::to_string(&Domain::ComBr).unwrap(), "12");
        assert_eq!(Domain::default(), Domain::Com);
    }
}
