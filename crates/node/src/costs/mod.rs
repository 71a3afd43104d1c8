//! The cost engine: values STORE and execution messages against the
//! pricing timeline, materializes per-component cost rows, and enforces
//! the hold-payment balance rule.

pub mod pricing;

use bigdecimal::{BigDecimal, Zero};
use sqlx::PgConnection;

use models::cost::{CostType, PricingModel, ProductPriceType, ProductPricing, MIB};
use models::execution::{InstanceContent, MachineVolume, PaymentType, ProgramContent};
use models::message::MessageContent;

use crate::error::MessageProcessingError;
use crate::handlers::ValidatedMessage;
use node_sql::costs::AccountCostRow;

const SECONDS_PER_HOUR: u64 = 3600;

/// One sized disk component of an execution message.
#[derive(Debug, Clone)]
struct CostComponent {
    cost_type: CostType,
    name: String,
    ref_: Option<String>,
    size_mib: u64,
}

fn bytes_to_mib(bytes: i64) -> u64 {
    (bytes.max(0) as u64 + MIB - 1) / MIB
}

/// Determines the billable product flavor of an execution message.
pub fn product_price_type(content: &MessageContent, model: &PricingModel) -> ProductPriceType {
    match content {
        MessageContent::Store(_) => ProductPriceType::Storage,
        MessageContent::Program(program) => {
            if program.is_persistent() {
                ProductPriceType::ProgramPersistent
            } else {
                ProductPriceType::Program
            }
        }
        MessageContent::Instance(instance) => {
            if instance.environment.trusted_execution.is_some() {
                return ProductPriceType::InstanceConfidential;
            }
            let gpu_model = instance
                .requirements
                .as_ref()
                .and_then(|requirements| requirements.gpu.first())
                .map(|gpu| gpu.model.as_str());
            if let Some(gpu_model) = gpu_model {
                let premium = model
                    .get(&ProductPriceType::InstanceGpuPremium)
                    .map(|pricing| pricing.has_gpu_model(gpu_model))
                    .unwrap_or(false);
                if premium {
                    ProductPriceType::InstanceGpuPremium
                } else {
                    ProductPriceType::InstanceGpuStandard
                }
            } else {
                ProductPriceType::Instance
            }
        }
        _ => ProductPriceType::Storage,
    }
}

fn pricing_for<'m>(model: &'m PricingModel, price_type: ProductPriceType) -> &'m ProductPricing {
    // GPU and confidential tiers may not exist in older models; they then
    // bill like a plain instance.
    model
        .get(&price_type)
        .or_else(|| model.get(&ProductPriceType::Instance))
        .expect("the default model always carries instance pricing")
}

/// `ceil(max(vcpus, memory / cu.memory))`, at least one unit.
pub fn compute_units_required(vcpus: u32, memory_mib: u64, pricing: &ProductPricing) -> u64 {
    let cu_memory = pricing
        .compute_unit
        .map(|cu| cu.memory_mib)
        .unwrap_or(2048)
        .max(1);
    let by_memory = (memory_mib + cu_memory - 1) / cu_memory;
    (vcpus as u64).max(by_memory).max(1)
}

async fn resolve_volume_size_mib(
    conn: &mut PgConnection,
    ref_: &str,
    estimated_size_mib: Option<u64>,
) -> sqlx::Result<u64> {
    if let Some(pin) = node_sql::files::get_message_file_pin(conn, ref_).await? {
        if let Some(file) = node_sql::files::get_file(conn, &pin.file_hash).await? {
            return Ok(bytes_to_mib(file.size));
        }
    }
    if let Some(tag) = node_sql::files::get_file_tag(conn, ref_).await? {
        if let Some(file) = node_sql::files::get_file(conn, &tag.file_hash).await? {
            return Ok(bytes_to_mib(file.size));
        }
    }
    Ok(estimated_size_mib.unwrap_or(0))
}

async fn machine_volume_components(
    conn: &mut PgConnection,
    volumes: &[MachineVolume],
) -> sqlx::Result<Vec<CostComponent>> {
    let mut components = Vec::new();
    for (index, volume) in volumes.iter().enumerate() {
        let component = match volume {
            MachineVolume::Immutable {
                ref_,
                mount,
                estimated_size_mib,
                ..
            } => CostComponent {
                cost_type: CostType::ExecutionVolumeInmutable,
                name: format!("#{index}:{}", mount.as_deref().unwrap_or(ref_)),
                ref_: Some(ref_.clone()),
                size_mib: resolve_volume_size_mib(conn, ref_, *estimated_size_mib).await?,
            },
            MachineVolume::Ephemeral {
                mount, size_mib, ..
            } => CostComponent {
                cost_type: CostType::ExecutionVolumeInmutable,
                name: format!("#{index}:{mount}"),
                ref_: None,
                size_mib: *size_mib,
            },
            MachineVolume::Persistent {
                mount, size_mib, ..
            } => CostComponent {
                cost_type: CostType::ExecutionVolumePersistent,
                name: format!("#{index}:{mount}"),
                ref_: None,
                size_mib: *size_mib,
            },
        };
        components.push(component);
    }
    Ok(components)
}

async fn instance_components(
    conn: &mut PgConnection,
    content: &InstanceContent,
) -> sqlx::Result<Vec<CostComponent>> {
    let mut components = vec![CostComponent {
        cost_type: CostType::ExecutionInstanceVolumeRootfs,
        name: CostType::ExecutionInstanceVolumeRootfs.to_string(),
        ref_: Some(content.rootfs.parent.ref_.clone()),
        size_mib: content.rootfs.size_mib,
    }];
    components.extend(machine_volume_components(conn, &content.volumes).await?);
    Ok(components)
}

async fn program_components(
    conn: &mut PgConnection,
    content: &ProgramContent,
) -> sqlx::Result<Vec<CostComponent>> {
    let mut components = vec![
        CostComponent {
            cost_type: CostType::ExecutionProgramVolumeCode,
            name: CostType::ExecutionProgramVolumeCode.to_string(),
            ref_: Some(content.code.ref_.clone()),
            size_mib: resolve_volume_size_mib(
                conn,
                &content.code.ref_,
                content.code.estimated_size_mib,
            )
            .await?,
        },
        CostComponent {
            cost_type: CostType::ExecutionProgramVolumeRuntime,
            name: CostType::ExecutionProgramVolumeRuntime.to_string(),
            ref_: Some(content.runtime.ref_.clone()),
            size_mib: resolve_volume_size_mib(
                conn,
                &content.runtime.ref_,
                content.runtime.estimated_size_mib,
            )
            .await?,
        },
    ];
    if let Some(data) = &content.data {
        components.push(CostComponent {
            cost_type: CostType::ExecutionProgramVolumeData,
            name: CostType::ExecutionProgramVolumeData.to_string(),
            ref_: Some(data.ref_.clone()),
            size_mib: resolve_volume_size_mib(conn, &data.ref_, data.estimated_size_mib).await?,
        });
    }
    components.extend(machine_volume_components(conn, &content.volumes).await?);
    Ok(components)
}

fn per_second(hourly: BigDecimal) -> BigDecimal {
    hourly / BigDecimal::from(SECONDS_PER_HOUR)
}

fn make_cost_row(
    message: &ValidatedMessage,
    payment_type: PaymentType,
    cost_type: CostType,
    name: String,
    ref_: Option<String>,
    cost_hold: BigDecimal,
    cost_stream: BigDecimal,
    cost_credit: BigDecimal,
) -> AccountCostRow {
    AccountCostRow {
        owner: message.content.address().to_string(),
        item_hash: message.row.item_hash.clone(),
        cost_type,
        name,
        ref_,
        payment_type,
        cost_hold,
        cost_stream,
        cost_credit,
    }
}

async fn execution_costs(
    conn: &mut PgConnection,
    message: &ValidatedMessage,
    model: &PricingModel,
) -> Result<Vec<AccountCostRow>, MessageProcessingError> {
    let (payment_type, vcpus, memory_mib, components) = match &message.content {
        MessageContent::Instance(content) => (
            content.payment_type(),
            content.resources.vcpus,
            content.resources.memory as u64,
            instance_components(conn, content).await?,
        ),
        MessageContent::Program(content) => (
            content.payment_type(),
            content.resources.vcpus,
            content.resources.memory as u64,
            program_components(conn, content).await?,
        ),
        _ => return Ok(Vec::new()),
    };

    let price_type = product_price_type(&message.content, model);
    let pricing = pricing_for(model, price_type);

    let compute_units = compute_units_required(vcpus, memory_mib, pricing);
    let included_disk_mib = pricing
        .compute_unit
        .map(|cu| cu.disk_mib)
        .unwrap_or(0)
        * compute_units;

    let cu_price = pricing.price.compute_unit.clone().unwrap_or_else(|| {
        models::cost::ProductPriceOptions::holding_only("0")
    });
    let storage_price = pricing
        .price
        .storage
        .clone()
        .unwrap_or_else(|| models::cost::ProductPriceOptions::holding_only("0"));

    let units = BigDecimal::from(compute_units);
    let mut rows = vec![make_cost_row(
        message,
        payment_type,
        CostType::Execution,
        CostType::Execution.to_string(),
        None,
        &units * &cu_price.holding,
        per_second(&units * cu_price.payg()),
        per_second(&units * cu_price.credit()),
    )];

    let mut total_disk_mib = 0u64;
    for component in components {
        let size = BigDecimal::from(component.size_mib);
        total_disk_mib += component.size_mib;
        rows.push(make_cost_row(
            message,
            payment_type,
            component.cost_type,
            component.name,
            component.ref_,
            &size * &storage_price.holding,
            per_second(&size * storage_price.payg()),
            per_second(&size * storage_price.credit()),
        ));
    }

    // The compute-unit bundle includes some disk; the overlap is refunded
    // through a negative discount row so that the per-volume rows stay
    // readable at full price.
    let discounted_mib = total_disk_mib.min(included_disk_mib);
    if discounted_mib > 0 {
        let discount = BigDecimal::from(discounted_mib);
        rows.push(make_cost_row(
            message,
            payment_type,
            CostType::ExecutionVolumeDiscount,
            CostType::ExecutionVolumeDiscount.to_string(),
            None,
            -(&discount * &storage_price.holding),
            -per_second(&discount * storage_price.payg()),
            -per_second(&discount * storage_price.credit()),
        ));
    }

    Ok(rows)
}

async fn storage_costs(
    conn: &mut PgConnection,
    message: &ValidatedMessage,
    model: &PricingModel,
) -> Result<Vec<AccountCostRow>, MessageProcessingError> {
    let MessageContent::Store(content) = &message.content else {
        return Ok(Vec::new());
    };

    let size_mib = match node_sql::files::get_file(conn, &content.item_hash).await? {
        Some(file) => bytes_to_mib(file.size),
        None => 0,
    };
    if size_mib == 0 {
        return Ok(Vec::new());
    }

    let storage_price = model
        .get(&ProductPriceType::Storage)
        .and_then(|pricing| pricing.price.storage.clone())
        .unwrap_or_else(|| models::cost::ProductPriceOptions::holding_only("0"));

    let size = BigDecimal::from(size_mib);
    Ok(vec![make_cost_row(
        message,
        PaymentType::Hold,
        CostType::Storage,
        CostType::Storage.to_string(),
        content.ref_.clone(),
        &size * &storage_price.holding,
        per_second(&size * storage_price.payg()),
        per_second(&size * storage_price.credit()),
    )])
}

/// The cost rows a processed message materializes. Message types without a
/// billable footprint yield no rows.
pub async fn message_costs(
    conn: &mut PgConnection,
    message: &ValidatedMessage,
) -> Result<Vec<AccountCostRow>, MessageProcessingError> {
    let model = pricing::pricing_model_at(conn, message.row.time).await?;
    match &message.content {
        MessageContent::Store(_) => storage_costs(conn, message, &model).await,
        MessageContent::Instance(_) | MessageContent::Program(_) => {
            execution_costs(conn, message, &model).await
        }
        _ => Ok(Vec::new()),
    }
}

/// Credit balance of an address with lazy recalculation.
///
/// The cached value stays valid until either a newer history row appears
/// or a credit expires inside `(cache.last_update, now]`. Either event
/// triggers a full FIFO re-evaluation and a cache refresh.
pub async fn get_credit_balance(
    conn: &mut PgConnection,
    address: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> sqlx::Result<i64> {
    let Some(latest_update) =
        node_sql::balances::latest_credit_history_update(conn, address).await?
    else {
        return Ok(0);
    };

    let cached = node_sql::balances::get_cached_credit_balance(conn, address).await?;

    let mut needs_recalculation = match &cached {
        None => true,
        Some(cache) => cache.last_update < latest_update,
    };
    if !needs_recalculation {
        if let Some(cache) = &cached {
            needs_recalculation = node_sql::balances::earliest_expiration_in_window(
                conn,
                address,
                cache.last_update,
                now,
            )
            .await?
            .is_some();
        }
    }

    if !needs_recalculation {
        return Ok(cached.map(|cache| cache.balance).unwrap_or(0));
    }

    let records = node_sql::balances::get_credit_history(conn, address).await?;
    let balance = node_sql::balances::calculate_credit_balance_fifo(&records, now);
    node_sql::balances::upsert_credit_balance(conn, address, balance, now).await?;
    Ok(balance)
}

/// Hold admission rule: the sender's balance must cover everything already
/// held plus the new message.
pub async fn check_hold_balance(
    conn: &mut PgConnection,
    sender: &str,
    new_costs: &[AccountCostRow],
) -> Result<(), MessageProcessingError> {
    let new_hold: BigDecimal = new_costs
        .iter()
        .map(|cost| cost.cost_hold.clone())
        .fold(BigDecimal::zero(), |acc, cost| acc + cost);
    if new_hold <= BigDecimal::zero() {
        return Ok(());
    }

    let held =
        node_sql::costs::get_total_cost_for_address(conn, sender, PaymentType::Hold).await?;
    let balance = node_sql::balances::get_total_balance(conn, sender).await?;

    let required = held + new_hold;
    if balance < required {
        return Err(MessageProcessingError::BalanceInsufficient {
            required: required.to_string(),
            available: balance.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use models::cost::default_pricing_model;

    fn instance_content(memory: u32, vcpus: u32) -> InstanceContent {
        serde_json::from_value(serde_json::json!({
            "address": "0xowner",
            "time": 1700000000.0,
            "rootfs": {
                "parent": {"ref": "a".repeat(64), "use_latest": true},
                "size_mib": 20480,
                "persistence": "host",
            },
            "resources": {"vcpus": vcpus, "memory": memory, "seconds": 30},
        }))
        .unwrap()
    }

    #[test]
    fn one_compute_unit_for_the_baseline_instance() {
        let model = default_pricing_model();
        let pricing = &model[&ProductPriceType::Instance];
        assert_eq!(compute_units_required(1, 2048, pricing), 1);
    }

    #[test]
    fn memory_drives_the_unit_count_up() {
        let model = default_pricing_model();
        let pricing = &model[&ProductPriceType::Instance];
        assert_eq!(compute_units_required(1, 8192, pricing), 4);
        // Partially used units round up.
        assert_eq!(compute_units_required(1, 2049, pricing), 2);
        // vcpus dominate when memory is small.
        assert_eq!(compute_units_required(4, 2048, pricing), 4);
    }

    #[test]
    fn product_type_reflects_the_execution_flavor() {
        let model = default_pricing_model();

        let instance = instance_content(2048, 1);
        assert_eq!(
            product_price_type(&MessageContent::Instance(instance.clone()), &model),
            ProductPriceType::Instance
        );

        let mut confidential = instance.clone();
        confidential.environment.trusted_execution =
            Some(serde_json::json!({"policy": 1, "firmware": "abc"}));
        assert_eq!(
            product_price_type(&MessageContent::Instance(confidential), &model),
            ProductPriceType::InstanceConfidential
        );

        let mut gpu = instance;
        gpu.requirements = serde_json::from_value(serde_json::json!({
            "gpu": [{"model": "RTX 4090"}],
        }))
        .ok();
        assert_eq!(
            product_price_type(&MessageContent::Instance(gpu), &model),
            ProductPriceType::InstanceGpuStandard
        );
    }

    #[test]
    fn per_second_streams_divide_hourly_prices() {
        let hourly: BigDecimal = "3600".parse::<BigDecimal>().unwrap();
        assert_eq!(per_second(hourly), "1".parse::<BigDecimal>().unwrap());
    }
}
