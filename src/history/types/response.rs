use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;

/// Unix timestamp of 2011-01-01T00:00:00Z, the origin of Keepa time.
pub const KEEPA_EPOCH: i64 = 1_293_840_000;

/// One history series of a product, by its position in the `csv` array.
#[non_exhaustive]
#[derive(
    Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceType {
    Amazon,
    New,
    Used,
    Sales,
    #[serde(rename = "LISTPRICE")]
    #[strum(serialize = "LISTPRICE")]
    ListPrice,
    Collectible,
    Refurbished,
    NewFbmShipping,
    LightningDeal,
    Warehouse,
    NewFba,
    CountNew,
    CountUsed,
    CountRefurbished,
    CountCollectible,
    ExtraInfoUpdates,
    Rating,
    CountReviews,
    BuyBoxShipping,
    UsedNewShipping,
    UsedVeryGoodShipping,
    UsedGoodShipping,
    UsedAcceptableShipping,
    CollectibleNewShipping,
    CollectibleVeryGoodShipping,
    CollectibleGoodShipping,
    CollectibleAcceptableShipping,
    RefurbishedShipping,
    EbayNewShipping,
    EbayUsedShipping,
    TradeIn,
    Rent,
    BuyBoxUsedShipping,
    PrimeExcl,
}

impl PriceType {
    /// Every known series, in `csv` order.
    pub const ALL: [Self; 34] = [
        Self::Amazon,
        Self::New,
        Self::Used,
        Self::Sales,
        Self::ListPrice,
        Self::Collectible,
        Self::Refurbished,
        Self::NewFbmShipping,
        Self::LightningDeal,
        Self::Warehouse,
        Self::NewFba,
        Self::CountNew,
        Self::CountUsed,
        Self::CountRefurbished,
        Self::CountCollectible,
        Self::ExtraInfoUpdates,
        Self::Rating,
        Self::CountReviews,
        Self::BuyBoxShipping,
        Self::UsedNewShipping,
        Self::UsedVeryGoodShipping,
        Self::UsedGoodShipping,
        Self::UsedAcceptableShipping,
        Self::CollectibleNewShipping,
        Self::CollectibleVeryGoodShipping,
        Self::CollectibleGoodShipping,
        Self::CollectibleAcceptableShipping,
        Self::RefurbishedShipping,
        Self::EbayNewShipping,
        Self::EbayUsedShipping,
        Self::TradeIn,
        Self::Rent,
        Self::BuyBoxUsedShipping,
        Self::PrimeExcl,
    ];

    /// The series at position `index` of the `csv` array.
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Position of this series in the `csv` array.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Convert Keepa minutes into a UTC timestamp.
#[must_use]
pub fn keepa_minutes_to_datetime(minutes: i64) -> Option<DateTime<Utc>> {
    let seconds = minutes.checked_mul(60)?.checked_add(KEEPA_EPOCH)?;
    DateTime::from_timestamp(seconds, 0)
}

/// One sample of a history series.
///
/// `value` is what the service reports: prices in the smallest currency unit, counts as counts,
/// and `-1` where no offer existed at that time.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub value: i64,
}

/// Price history of one product.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductHistory {
    pub asin: String,
    pub title: Option<String>,
    /// Every series present in the response; series the service sent as `null` are empty
    pub series: BTreeMap<PriceType, Vec<PricePoint>>,
}

impl ProductHistory {
    /// Samples of `price_type`, oldest first. Empty when the series was absent.
    #[must_use]
    pub fn get(&self, price_type: PriceType) -> &[PricePoint] {
        self.series.get(&price_type).map_or(&[], Vec::as_slice)
    }

    /// Most recent sample of `price_type`.
    #[must_use]
    pub fn latest(&self, price_type: PriceType) -> Option<&PricePoint> {
        self.get(price_type).last()
    }
}

/// Envelope of every inbound push frame.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct PushMessage {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub products: Option<Vec<RawProduct>>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawProduct {
    #[serde(default)]
    pub asin: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub csv: Option<Vec<Value>>,
}

impl RawProduct {
    /// Decode the `csv` series into a [`ProductHistory`] for `asin`.
    pub(crate) fn into_history(self, asin: String) -> Result<ProductHistory, String> {
        let csv = match self.csv {
            Some(csv) if !csv.is_empty() => csv,
            _ => return Err(format!("empty product data for {asin}")),
        };

        let mut series = BTreeMap::new();
        for (index, entry) in csv.into_iter().enumerate() {
            let price_type = PriceType::from_index(index)
                .ok_or_else(|| format!("unknown series index {index}"))?;
            series.insert(price_type, parse_series(price_type, &entry)?);
        }

        Ok(ProductHistory {
            asin,
            title: self.title,
            series,
        })
    }
}

fn parse_series(price_type: PriceType, entry: &Value) -> Result<Vec<PricePoint>, String> {
    let values = match entry {
        Value::Null => return Ok(Vec::new()),
        Value::Array(values) => values,
        other => return Err(format!("{price_type} series is not an array: {other}")),
    };

    if values.len() % 2 != 0 {
        return Err(format!(
            "{price_type} series has odd length {}",
            values.len()
        ));
    }

    values
        .chunks_exact(2)
        .map(|pair| {
            let minutes = as_integer(price_type, &pair[0])?;
            let value = as_integer(price_type, &pair[1])?;
            let timestamp = keepa_minutes_to_datetime(minutes)
                .ok_or_else(|| format!("{price_type} timestamp {minutes} is out of range"))?;
            Ok(PricePoint { timestamp, value })
        })
        .collect()
}

fn as_integer(price_type: PriceType, value: &Value) -> Result<i64, String> {
    value
        .as_i64()
        .ok_or_else(|| format!("{price_type} series holds a non-integer value: {value}"))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;
    use serde_json::json;

    use super::*;

    fn raw(csv: Value) -> RawProduct {
        serde_json::from_value(json!({ "asin": "B08N5WRWNW", "csv": csv })).unwrap()
    }

    #[test]
    fn keepa_epoch_is_2011() {
        let expected = Utc.with_ymd_and_hms(2011, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(keepa_minutes_to_datetime(0), Some(expected));

        let later = Utc.with_ymd_and_hms(2011, 1, 1, 1, 30, 0).unwrap();
        assert_eq!(keepa_minutes_to_datetime(90), Some(later));
    }

    #[test]
    fn price_type_index_round_trip() {
        assert_eq!(PriceType::from_index(0), Some(PriceType::Amazon));
        assert_eq!(PriceType::from_index(33), Some(PriceType::PrimeExcl));
        assert_eq!(PriceType::from_index(34), None);
        assert_eq!(PriceType::BuyBoxShipping.index(), 18);
        assert_eq!(PriceType::ListPrice.to_string(), "LISTPRICE");
        assert_eq!(PriceType::CountReviews.to_string(), "COUNT_REVIEWS");
    }

    #[test]
    fn into_history_pairs_timestamps_and_values() {
        let history = raw(json!([[0, 1999, 60, 1899], null, [120, -1]]))
            .into_history("B08N5WRWNW".to_owned())
            .unwrap();

        assert_eq!(history.series.len(), 3);
        assert_eq!(history.get(PriceType::Amazon).len(), 2);
        assert!(history.get(PriceType::New).is_empty());
        assert!(history.get(PriceType::Sales).is_empty());

        let latest = history.latest(PriceType::Amazon).unwrap();
        assert_eq!(latest.value, 1899);
        assert_eq!(latest.timestamp, keepa_minutes_to_datetime(60).unwrap());
        assert_eq!(history.latest(PriceType::Used).unwrap().value, -1);
    }

    #[test]
    fn into_history_rejects_malformed_series() {
        let odd = raw(json!([[0, 1999, 60]])).into_history("A".to_owned());
        assert!(odd.unwrap_err().contains("odd length"));

        let float = raw(json!([[0, 19.99]])).into_history("A".to_owned());
        assert!(float.unwrap_err().contains("non-integer"));

        let too_many = raw(Value::Array(vec![Value::Null; 35])).into_history("A".to_owned());
        assert!(too_many.unwrap_err().contains("unknown series index 34"));
    }

    #[test]
    fn into_history_rejects_empty_product() {
        let empty = raw(json!([])).into_history("B08N5WRWNW".to_owned());
        assert!(empty.unwrap_err().contains("empty product data"));

        let missing = RawProduct::default().into_history("B08N5WRWNW".to_owned());
        assert!(missing.is_err());
    }
}
