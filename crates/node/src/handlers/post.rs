//! POST messages: user documents with amend chains, plus the special
//! balance-snapshot and credit-ledger posts published through the network.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgConnection;

use models::message::{timestamp_to_datetime, MessageContent};
use models::{Chain, ErrorCode};
use node_sql::balances::{apply_credit_precision_multiplier, CreditHistoryRow};
use node_sql::posts::PostRow;
use node_sql::Json;

use crate::config::CreditsConfig;
use crate::error::MessageProcessingError;

use super::{ContentHandler, ValidatedMessage};

pub struct PostHandler {
    balances_addresses: Vec<String>,
    balances_post_type: String,
    credits: CreditsConfig,
}

impl PostHandler {
    pub fn new(
        balances_addresses: Vec<String>,
        balances_post_type: String,
        credits: CreditsConfig,
    ) -> Self {
        PostHandler {
            balances_addresses,
            balances_post_type,
            credits,
        }
    }
}

fn post_content(
    message: &ValidatedMessage,
) -> Result<&models::PostContent, MessageProcessingError> {
    match &message.content {
        MessageContent::Post(content) => Ok(content),
        _ => Err(MessageProcessingError::InvalidFormat(format!(
            "unexpected content type for post message: {}",
            message.row.item_hash
        ))),
    }
}

/// Body of a balance-snapshot post.
#[derive(Debug, Deserialize)]
struct BalancesSnapshot {
    #[serde(default)]
    chain: Option<Chain>,
    #[serde(default)]
    dapp: Option<String>,
    #[serde(default)]
    main_height: Option<i64>,
    #[serde(default)]
    height: Option<i64>,
    balances: std::collections::BTreeMap<String, f64>,
}

async fn apply_balances_snapshot(
    conn: &mut PgConnection,
    message: &ValidatedMessage,
    content: &models::PostContent,
) -> Result<(), MessageProcessingError> {
    let Some(body) = &content.content else {
        return Ok(());
    };
    let snapshot: BalancesSnapshot = match serde_json::from_value(body.clone()) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::warn!(%err, item_hash = %message.row.item_hash, "unusable balances post");
            return Ok(());
        }
    };

    let chain = snapshot.chain.unwrap_or(message.row.chain);
    let height = snapshot.main_height.or(snapshot.height).unwrap_or(0);
    let now = chrono::Utc::now();

    for (address, balance) in &snapshot.balances {
        let Ok(balance) = BigDecimal::try_from(*balance) else {
            continue;
        };
        node_sql::balances::upsert_balance(
            conn,
            address,
            chain,
            snapshot.dapp.as_deref(),
            &balance,
            height,
            now,
        )
        .await?;
    }
    Ok(())
}

fn decimal_from_value(value: &Value) -> Option<BigDecimal> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

/// One entry of a credit post. Distribution, expense and transfer posts
/// share the shape; each variant reads the fields it knows.
#[derive(Debug, Deserialize)]
struct CreditEntry {
    address: String,
    amount: i64,
    #[serde(default)]
    price: Option<Value>,
    #[serde(default)]
    bonus_amount: Option<i64>,
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    /// Expiration instant, milliseconds.
    #[serde(default)]
    expiration: Option<f64>,
    #[serde(default)]
    origin: Option<String>,
    #[serde(default, rename = "ref")]
    ref_: Option<String>,
    #[serde(default)]
    payment_method: Option<String>,
    #[serde(default)]
    execution_id: Option<String>,
    #[serde(default)]
    node_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreditPostBody {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    chain: Option<String>,
    credits: Vec<CreditEntry>,
}

fn parse_credit_body(message: &ValidatedMessage, body: &Value) -> Option<CreditPostBody> {
    match serde_json::from_value(body.clone()) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::warn!(%err, item_hash = %message.row.item_hash, "unusable credit post");
            None
        }
    }
}

fn base_credit_row(message: &ValidatedMessage, index: usize, address: &str) -> CreditHistoryRow {
    CreditHistoryRow {
        credit_ref: message.row.item_hash.clone(),
        credit_index: index as i32,
        address: address.to_string(),
        amount: 0,
        price: None,
        bonus_amount: None,
        expiration_date: None,
        message_timestamp: message.row.time,
        last_update: chrono::Utc::now(),
        tx_hash: None,
        token: None,
        chain: None,
        provider: None,
        origin: None,
        origin_ref: None,
        payment_method: None,
    }
}

/// Applies a credit-distribution post: one positive ledger row per entry,
/// carrying the full purchase metadata.
async fn apply_credit_distribution(
    conn: &mut PgConnection,
    message: &ValidatedMessage,
    body: &Value,
) -> Result<(), MessageProcessingError> {
    let Some(parsed) = parse_credit_body(message, body) else {
        return Ok(());
    };
    for (index, entry) in parsed.credits.iter().enumerate() {
        let row = CreditHistoryRow {
            amount: entry.amount.abs(),
            price: entry.price.as_ref().and_then(decimal_from_value),
            bonus_amount: entry.bonus_amount,
            expiration_date: entry
                .expiration
                .and_then(|ms| timestamp_to_datetime(ms / 1000.0)),
            tx_hash: entry.tx_hash.clone(),
            token: parsed.token.clone(),
            chain: parsed.chain.clone(),
            provider: entry.provider.clone(),
            origin: entry.origin.clone(),
            origin_ref: entry.ref_.clone(),
            payment_method: entry.payment_method.clone(),
            ..base_credit_row(message, index, &entry.address)
        };
        node_sql::balances::insert_credit_history(conn, &row).await?;
    }
    Ok(())
}

/// Applies a credit-expense post: one negative ledger row per entry,
/// pointing back at the execution that burned the credits.
async fn apply_credit_expense(
    conn: &mut PgConnection,
    message: &ValidatedMessage,
    body: &Value,
) -> Result<(), MessageProcessingError> {
    let Some(parsed) = parse_credit_body(message, body) else {
        return Ok(());
    };
    for (index, entry) in parsed.credits.iter().enumerate() {
        let row = CreditHistoryRow {
            amount: -entry.amount.abs(),
            price: entry.price.as_ref().and_then(decimal_from_value),
            tx_hash: entry.node_id.clone(),
            origin: entry.execution_id.clone(),
            origin_ref: entry.ref_.clone(),
            provider: Some("ALEPH".to_string()),
            payment_method: Some("credit_expense".to_string()),
            ..base_credit_row(message, index, &entry.address)
        };
        node_sql::balances::insert_credit_history(conn, &row).await?;
    }
    Ok(())
}

/// Applies a credit transfer: a positive row for each recipient and a
/// matching debit for the sender, unless the sender is whitelisted.
async fn apply_credit_transfer(
    conn: &mut PgConnection,
    message: &ValidatedMessage,
    body: &Value,
    whitelisted: &[String],
) -> Result<(), MessageProcessingError> {
    let Some(parsed) = parse_credit_body(message, body) else {
        return Ok(());
    };
    let sender = &message.row.sender;
    let debit_sender = !whitelisted.contains(sender);

    if debit_sender {
        let total: i64 = parsed
            .credits
            .iter()
            .map(|entry| apply_credit_precision_multiplier(entry.amount.abs(), message.row.time))
            .sum();
        let balance =
            crate::costs::get_credit_balance(conn, sender, chrono::Utc::now()).await?;
        if balance < total {
            return Err(MessageProcessingError::BalanceInsufficient {
                required: total.to_string(),
                available: balance.to_string(),
            });
        }
    }

    let mut index = 0;
    for entry in &parsed.credits {
        let credit = CreditHistoryRow {
            amount: entry.amount.abs(),
            expiration_date: entry
                .expiration
                .and_then(|ms| timestamp_to_datetime(ms / 1000.0)),
            origin: Some(sender.clone()),
            provider: Some("ALEPH".to_string()),
            payment_method: Some("credit_transfer".to_string()),
            ..base_credit_row(message, index, &entry.address)
        };
        node_sql::balances::insert_credit_history(conn, &credit).await?;
        index += 1;

        if debit_sender {
            let debit = CreditHistoryRow {
                amount: -entry.amount.abs(),
                origin: Some(entry.address.clone()),
                provider: Some("ALEPH".to_string()),
                payment_method: Some("credit_transfer".to_string()),
                ..base_credit_row(message, index, sender)
            };
            node_sql::balances::insert_credit_history(conn, &debit).await?;
            index += 1;
        }
    }
    Ok(())
}

#[async_trait]
impl ContentHandler for PostHandler {
    async fn check_dependencies(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        let content = post_content(message)?;
        if !content.is_amend() {
            return Ok(());
        }

        let ref_ = content.ref_.as_deref().ok_or_else(|| {
            MessageProcessingError::Dependency {
                code: ErrorCode::PostAmendNoTarget,
                details: format!("amend post {} has no ref", message.row.item_hash),
            }
        })?;

        let target = node_sql::posts::get_post(conn, ref_)
            .await?
            .ok_or_else(|| MessageProcessingError::Dependency {
                code: ErrorCode::PostAmendTargetNotFound,
                details: format!("amend target {ref_} not found"),
            })?;

        // Amend chains are flat: amending an amend is rejected.
        if target.amends.is_some() {
            return Err(MessageProcessingError::Dependency {
                code: ErrorCode::PostAmendAmend,
                details: format!("cannot amend amend post {ref_}"),
            });
        }

        if target.owner != content.address {
            return Err(MessageProcessingError::PermissionDenied(format!(
                "{} cannot amend a post owned by {}",
                content.address, target.owner
            )));
        }
        Ok(())
    }

    async fn process(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        let content = post_content(message)?;

        let amends = if content.is_amend() {
            content.ref_.clone()
        } else {
            None
        };

        let post = PostRow {
            item_hash: message.row.item_hash.clone(),
            owner: content.address.clone(),
            post_type: Some(content.post_type.clone()),
            ref_: content.ref_.clone(),
            amends: amends.clone(),
            channel: message.row.channel.clone(),
            content: Json(content.content.clone().unwrap_or(serde_json::Value::Null)),
            creation_datetime: message.row.time,
            latest_amend: None,
        };
        node_sql::posts::insert_post(conn, &post).await?;

        if let Some(target) = &amends {
            node_sql::posts::refresh_latest_amend(conn, target).await?;
        }

        if content.post_type == self.balances_post_type
            && self.balances_addresses.contains(&message.row.sender)
        {
            apply_balances_snapshot(conn, message, content).await?;
        }

        if let Some(body) = &content.content {
            let authorized = self.credits.addresses.contains(&message.row.sender);
            if content.post_type == self.credits.distribution_post_type && authorized {
                apply_credit_distribution(conn, message, body).await?;
            } else if content.post_type == self.credits.expense_post_type && authorized {
                apply_credit_expense(conn, message, body).await?;
            } else if content.post_type == self.credits.transfer_post_type {
                apply_credit_transfer(conn, message, body, &self.credits.addresses).await?;
            }
        }

        Ok(())
    }

    async fn forget_message(
        &self,
        conn: &mut PgConnection,
        message: &ValidatedMessage,
    ) -> Result<(), MessageProcessingError> {
        let content = post_content(message)?;
        node_sql::posts::delete_post(conn, &message.row.item_hash).await?;
        if content.is_amend() {
            if let Some(target) = &content.ref_ {
                node_sql::posts::refresh_latest_amend(conn, target).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_a_credit_distribution_body() {
        let body: CreditPostBody = serde_json::from_value(serde_json::json!({
            "token": "ALEPH",
            "chain": "ETH",
            "credits": [
                {
                    "address": "0xbuyer",
                    "amount": 5_000_000,
                    "price": "50.0",
                    "tx_hash": "0xpurchase",
                    "provider": "stripe",
                    "expiration": 1_735_689_600_000_i64,
                },
                {"address": "0xother", "amount": 100},
            ],
        }))
        .unwrap();
        assert_eq!(body.token.as_deref(), Some("ALEPH"));
        assert_eq!(body.credits.len(), 2);
        assert_eq!(body.credits[0].amount, 5_000_000);
        assert!(body.credits[1].expiration.is_none());
    }

    #[test]
    fn expense_entries_carry_their_execution_fields() {
        let entry: CreditEntry = serde_json::from_value(serde_json::json!({
            "address": "0xuser",
            "amount": 1200,
            "execution_id": "exec-42",
            "node_id": "node-7",
            "ref": "some-vm-hash",
        }))
        .unwrap();
        assert_eq!(entry.execution_id.as_deref(), Some("exec-42"));
        assert_eq!(entry.node_id.as_deref(), Some("node-7"));
        assert_eq!(entry.ref_.as_deref(), Some("some-vm-hash"));
    }

    #[test]
    fn decimals_parse_from_strings_and_numbers() {
        assert_eq!(
            decimal_from_value(&serde_json::json!("12.5")),
            Some("12.5".parse().unwrap())
        );
        assert_eq!(
            decimal_from_value(&serde_json::json!(3)),
            Some("3".parse().unwrap())
        );
        assert_eq!(decimal_from_value(&serde_json::json!({"nested": true})), None);
    }

    #[test]
    fn snapshot_bodies_tolerate_either_height_field() {
        let snapshot: BalancesSnapshot = serde_json::from_value(serde_json::json!({
            "main_height": 19_000_000,
            "balances": {"0xabc": 1000.5},
        }))
        .unwrap();
        assert_eq!(snapshot.main_height, Some(19_000_000));
        assert_eq!(snapshot.balances["0xabc"], 1000.5);
    }
}
