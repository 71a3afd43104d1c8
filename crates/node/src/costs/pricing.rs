//! The pricing timeline: at any instant, the effective pricing model is
//! the built-in default overridden by the deep-merge of all pricing
//! aggregate elements published up to that instant.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::PgConnection;

use models::cost::{
    default_pricing_model, pricing_model_from_aggregate, PricingModel, PRICE_AGGREGATE_KEY,
    PRICE_AGGREGATE_OWNER,
};
use models::merge::merge_json_objects;

/// Builds the pricing model from merged aggregate contents.
pub fn build_pricing_model(merged_content: &Map<String, Value>) -> PricingModel {
    let mut model = default_pricing_model();
    for (price_type, pricing) in pricing_model_from_aggregate(merged_content) {
        model.insert(price_type, pricing);
    }
    model
}

/// Folds a chronologically ordered list of pricing aggregate contents into
/// the timeline of `(change instant, model in force from that instant)`.
pub fn pricing_timeline(
    elements: impl IntoIterator<Item = (DateTime<Utc>, Map<String, Value>)>,
) -> Vec<(DateTime<Utc>, PricingModel)> {
    let mut merged = Map::new();
    let mut timeline = Vec::new();
    for (instant, content) in elements {
        merge_json_objects(&mut merged, &content);
        timeline.push((instant, build_pricing_model(&merged)));
    }
    timeline
}

/// The pricing model in force at `at`, rebuilt from the pricing aggregate
/// history.
pub async fn pricing_model_at(
    conn: &mut PgConnection,
    at: DateTime<Utc>,
) -> sqlx::Result<PricingModel> {
    let elements = node_sql::aggregates::get_aggregate_elements_by_key(
        conn,
        PRICE_AGGREGATE_KEY,
        PRICE_AGGREGATE_OWNER,
        at,
    )
    .await?;

    let mut merged = Map::new();
    for element in &elements {
        if let Some(content) = element.content.0.as_object() {
            merge_json_objects(&mut merged, content);
        }
    }
    Ok(build_pricing_model(&merged))
}

#[cfg(test)]
mod test {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::TimeZone;
    use models::cost::ProductPriceType;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn content(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn later_updates_override_earlier_prices() {
        let timeline = pricing_timeline([
            (
                at(1),
                content(serde_json::json!({
                    "storage": {"price": {"storage": {"holding": "0.2"}}},
                })),
            ),
            (
                at(3),
                content(serde_json::json!({
                    "storage": {"price": {"storage": {"holding": "0.3"}}},
                })),
            ),
        ]);

        assert_eq!(timeline.len(), 2);
        let storage_at_1 = &timeline[0].1[&ProductPriceType::Storage];
        assert_eq!(
            storage_at_1.price.storage.as_ref().unwrap().holding,
            "0.2".parse::<BigDecimal>().unwrap()
        );
        let storage_at_3 = &timeline[1].1[&ProductPriceType::Storage];
        assert_eq!(
            storage_at_3.price.storage.as_ref().unwrap().holding,
            "0.3".parse::<BigDecimal>().unwrap()
        );
    }

    #[test]
    fn updates_merge_instead_of_replacing_the_model() {
        let timeline = pricing_timeline([
            (
                at(1),
                content(serde_json::json!({
                    "storage": {"price": {"storage": {"holding": "0.2"}}},
                })),
            ),
            (
                at(2),
                content(serde_json::json!({
                    "program": {
                        "price": {
                            "storage": {"payg": "0.000001", "holding": "0.08"},
                            "compute_unit": {"payg": "0.015", "holding": "250"},
                        },
                        "compute_unit": {"vcpus": 1, "disk_mib": 2048, "memory_mib": 2048},
                    },
                })),
            ),
        ]);

        // The second update keeps the storage price of the first.
        let model = &timeline[1].1;
        assert_eq!(
            model[&ProductPriceType::Storage]
                .price
                .storage
                .as_ref()
                .unwrap()
                .holding,
            "0.2".parse::<BigDecimal>().unwrap()
        );
        assert_eq!(
            model[&ProductPriceType::Program]
                .price
                .compute_unit
                .as_ref()
                .unwrap()
                .holding,
            "250".parse::<BigDecimal>().unwrap()
        );
    }

    #[test]
    fn the_default_model_backs_unset_products() {
        let timeline = pricing_timeline([(
            at(1),
            content(serde_json::json!({
                "storage": {"price": {"storage": {"holding": "0.2"}}},
            })),
        )]);
        let model = &timeline[0].1;
        // Instance pricing was never published; the default applies.
        assert_eq!(
            model[&ProductPriceType::Instance]
                .price
                .compute_unit
                .as_ref()
                .unwrap()
                .holding,
            "1000".parse::<BigDecimal>().unwrap()
        );
    }
}
