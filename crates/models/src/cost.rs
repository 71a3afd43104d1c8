//! Pricing model types and cost-row enums.
//!
//! Pricing is distributed through the network itself: the `pricing`
//! aggregate of a fixed system address carries one entry per product price
//! type. A built-in model covers the period before the first on-chain
//! pricing update.

use std::collections::BTreeMap;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key of the pricing aggregate.
pub const PRICE_AGGREGATE_KEY: &str = "pricing";

/// System address publishing pricing updates.
pub const PRICE_AGGREGATE_OWNER: &str = "0xFba561a84A537fCaa567bb7A2257e7142701ae2A";

/// Credits issued before this instant use the historical scale
/// (100 credits = 1 USD) and are multiplied by [`CREDIT_PRECISION_MULTIPLIER`]
/// at insertion time to match the current scale (1,000,000 credits = 1 USD).
pub const CREDIT_PRECISION_CUTOFF_TIMESTAMP: i64 = 1_751_328_000;

pub const CREDIT_PRECISION_MULTIPLIER: i64 = 10_000;

pub const MIB: u64 = 1024 * 1024;

crate::text_enum! {
    /// Billable resource flavors, keys of the pricing aggregate.
    ProductPriceType {
        Storage => "storage",
        Web3Hosting => "web3_hosting",
        Program => "program",
        ProgramPersistent => "program_persistent",
        Instance => "instance",
        InstanceConfidential => "instance_confidential",
        InstanceGpuStandard => "instance_gpu_standard",
        InstanceGpuPremium => "instance_gpu_premium",
    }
}

crate::text_enum! {
    /// Cost components materialized in `account_costs`.
    CostType {
        Execution => "EXECUTION",
        Storage => "STORAGE",
        ExecutionVolumeInmutable => "EXECUTION_VOLUME_INMUTABLE",
        ExecutionVolumePersistent => "EXECUTION_VOLUME_PERSISTENT",
        ExecutionInstanceVolumeRootfs => "EXECUTION_INSTANCE_VOLUME_ROOTFS",
        ExecutionProgramVolumeCode => "EXECUTION_PROGRAM_VOLUME_CODE",
        ExecutionProgramVolumeRuntime => "EXECUTION_PROGRAM_VOLUME_RUNTIME",
        ExecutionProgramVolumeData => "EXECUTION_PROGRAM_VOLUME_DATA",
        ExecutionVolumeDiscount => "EXECUTION_VOLUME_DISCOUNT",
    }
}

mod decimal_serde {
    //! Pricing aggregates carry decimals as strings; tolerate raw numbers
    //! from older payloads.

    use bigdecimal::BigDecimal;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(value: &BigDecimal, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BigDecimal, D::Error> {
        let value = serde_json::Value::deserialize(d)?;
        let repr = match &value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            other => return Err(de::Error::custom(format!("invalid decimal: {other}"))),
        };
        BigDecimal::from_str(&repr).map_err(de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<BigDecimal>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => super::serialize(v, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<BigDecimal>, D::Error> {
            let value = Option::<serde_json::Value>::deserialize(d)?;
            match value {
                None | Some(serde_json::Value::Null) => Ok(None),
                Some(serde_json::Value::String(s)) => {
                    BigDecimal::from_str(&s).map(Some).map_err(de::Error::custom)
                }
                Some(serde_json::Value::Number(n)) => BigDecimal::from_str(&n.to_string())
                    .map(Some)
                    .map_err(de::Error::custom),
                Some(other) => Err(de::Error::custom(format!("invalid decimal: {other}"))),
            }
        }
    }
}

/// Per-payment-mode prices of one resource unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPriceOptions {
    /// Tokens locked while the resource is live (hold payment).
    #[serde(with = "decimal_serde")]
    pub holding: BigDecimal,
    /// Tokens streamed per hour (superfluid payment).
    #[serde(default, with = "decimal_serde::option", skip_serializing_if = "Option::is_none")]
    pub payg: Option<BigDecimal>,
    /// Credits burned per hour (credit payment).
    #[serde(default, with = "decimal_serde::option", skip_serializing_if = "Option::is_none")]
    pub credit: Option<BigDecimal>,
}

impl ProductPriceOptions {
    pub fn holding_only(holding: &str) -> Self {
        ProductPriceOptions {
            holding: holding.parse().expect("static decimal"),
            payg: None,
            credit: None,
        }
    }

    pub fn new(holding: &str, payg: &str) -> Self {
        ProductPriceOptions {
            holding: holding.parse().expect("static decimal"),
            payg: Some(payg.parse().expect("static decimal")),
            credit: None,
        }
    }

    pub fn payg(&self) -> BigDecimal {
        self.payg.clone().unwrap_or_default()
    }

    pub fn credit(&self) -> BigDecimal {
        self.credit.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductPrice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<ProductPriceOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_unit: Option<ProductPriceOptions>,
    /// Flat price, used by web3 hosting.
    #[serde(default, with = "decimal_serde::option", skip_serializing_if = "Option::is_none")]
    pub fixed: Option<BigDecimal>,
}

/// The (vCPU, memory, disk) bundle one compute unit buys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductComputeUnit {
    pub vcpus: u32,
    pub disk_mib: u64,
    pub memory_mib: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPricing {
    pub price: ProductPrice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_unit: Option<ProductComputeUnit>,
    /// GPU model list for the GPU product tiers. Entries are either plain
    /// strings or objects carrying a `model` or `name` field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpu_models: Vec<Value>,
}

impl ProductPricing {
    pub fn has_gpu_model(&self, model: &str) -> bool {
        self.gpu_models.iter().any(|entry| match entry {
            Value::String(s) => s == model,
            Value::Object(object) => object
                .get("model")
                .or_else(|| object.get("name"))
                .and_then(Value::as_str)
                == Some(model),
            _ => false,
        })
    }
}

pub type PricingModel = BTreeMap<ProductPriceType, ProductPricing>;

/// The pricing in force before any on-chain pricing aggregate.
pub fn default_pricing_model() -> PricingModel {
    let mut model = PricingModel::new();
    model.insert(
        ProductPriceType::Program,
        ProductPricing {
            price: ProductPrice {
                storage: Some(ProductPriceOptions::new("0.05", "0.000000977")),
                compute_unit: Some(ProductPriceOptions::new("200", "0.011")),
                fixed: None,
            },
            compute_unit: Some(ProductComputeUnit {
                vcpus: 1,
                disk_mib: 2048,
                memory_mib: 2048,
            }),
            gpu_models: Vec::new(),
        },
    );
    model.insert(
        ProductPriceType::ProgramPersistent,
        ProductPricing {
            price: ProductPrice {
                storage: Some(ProductPriceOptions::new("0.05", "0.000000977")),
                compute_unit: Some(ProductPriceOptions::new("1000", "0.055")),
                fixed: None,
            },
            compute_unit: Some(ProductComputeUnit {
                vcpus: 1,
                disk_mib: 20480,
                memory_mib: 2048,
            }),
            gpu_models: Vec::new(),
        },
    );
    model.insert(
        ProductPriceType::Instance,
        ProductPricing {
            price: ProductPrice {
                storage: Some(ProductPriceOptions::new("0.05", "0.000000977")),
                compute_unit: Some(ProductPriceOptions::new("1000", "0.055")),
                fixed: None,
            },
            compute_unit: Some(ProductComputeUnit {
                vcpus: 1,
                disk_mib: 20480,
                memory_mib: 2048,
            }),
            gpu_models: Vec::new(),
        },
    );
    model.insert(
        ProductPriceType::InstanceConfidential,
        ProductPricing {
            price: ProductPrice {
                storage: Some(ProductPriceOptions::new("0.05", "0.000000977")),
                compute_unit: Some(ProductPriceOptions::new("2000", "0.11")),
                fixed: None,
            },
            compute_unit: Some(ProductComputeUnit {
                vcpus: 1,
                disk_mib: 20480,
                memory_mib: 2048,
            }),
            gpu_models: Vec::new(),
        },
    );
    model.insert(
        ProductPriceType::Storage,
        ProductPricing {
            price: ProductPrice {
                storage: Some(ProductPriceOptions::holding_only("0.333333333")),
                compute_unit: None,
                fixed: None,
            },
            compute_unit: None,
            gpu_models: Vec::new(),
        },
    );
    model
}

/// Parses one pricing aggregate content into model entries. Unknown product
/// keys and malformed entries are skipped; a partial pricing update must
/// not invalidate the rest of the timeline.
pub fn pricing_model_from_aggregate(content: &serde_json::Map<String, Value>) -> PricingModel {
    let mut model = PricingModel::new();
    for (key, value) in content {
        let Ok(price_type) = key.parse::<ProductPriceType>() else {
            continue;
        };
        match serde_json::from_value::<ProductPricing>(value.clone()) {
            Ok(pricing) => {
                model.insert(price_type, pricing);
            }
            Err(_) => continue,
        }
    }
    model
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_model_covers_the_billable_products() {
        let model = default_pricing_model();
        assert!(model.contains_key(&ProductPriceType::Program));
        assert!(model.contains_key(&ProductPriceType::Instance));
        assert!(model.contains_key(&ProductPriceType::Storage));
        let instance = &model[&ProductPriceType::Instance];
        assert_eq!(instance.compute_unit.unwrap().disk_mib, 20480);
        assert_eq!(
            instance.price.compute_unit.as_ref().unwrap().holding,
            "1000".parse::<BigDecimal>().unwrap()
        );
    }

    #[test]
    fn parses_a_pricing_aggregate() {
        let content = serde_json::json!({
            "program": {
                "price": {
                    "storage": {"payg": "0.000001", "holding": "0.1"},
                    "compute_unit": {"payg": "0.02", "holding": "300"},
                },
                "compute_unit": {"vcpus": 1, "disk_mib": 2048, "memory_mib": 2048},
            },
            "not_a_product": {"price": {}},
        });
        let model = pricing_model_from_aggregate(content.as_object().unwrap());
        assert_eq!(model.len(), 1);
        let program = &model[&ProductPriceType::Program];
        assert_eq!(
            program.price.compute_unit.as_ref().unwrap().holding,
            "300".parse::<BigDecimal>().unwrap()
        );
    }

    #[test]
    fn gpu_model_lookup_supports_both_entry_shapes() {
        let pricing: ProductPricing = serde_json::from_value(serde_json::json!({
            "price": {"compute_unit": {"holding": "4000", "payg": "0.56"}},
            "compute_unit": {"vcpus": 1, "disk_mib": 20480, "memory_mib": 6144},
            "gpu_models": ["H100", {"model": "A100"}],
        }))
        .unwrap();
        assert!(pricing.has_gpu_model("H100"));
        assert!(pricing.has_gpu_model("A100"));
        assert!(!pricing.has_gpu_model("RTX 4090"));
    }
}
