use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use models::cost::{CREDIT_PRECISION_CUTOFF_TIMESTAMP, CREDIT_PRECISION_MULTIPLIER};
use models::Chain;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BalanceRow {
    pub address: String,
    pub chain: Chain,
    pub dapp: Option<String>,
    pub balance: BigDecimal,
    pub eth_height: i64,
    pub last_update: DateTime<Utc>,
}

/// A credit movement: positive rows are distributions, negative rows are
/// expenses. The `(credit_ref, credit_index)` pair makes replays
/// idempotent.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CreditHistoryRow {
    pub credit_ref: String,
    pub credit_index: i32,
    pub address: String,
    pub amount: i64,
    pub price: Option<BigDecimal>,
    pub bonus_amount: Option<i64>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub message_timestamp: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub tx_hash: Option<String>,
    pub token: Option<String>,
    pub chain: Option<String>,
    pub provider: Option<String>,
    pub origin: Option<String>,
    pub origin_ref: Option<String>,
    pub payment_method: Option<String>,
}

pub async fn get_balance(
    conn: &mut PgConnection,
    address: &str,
    chain: Chain,
    dapp: Option<&str>,
) -> sqlx::Result<Option<BigDecimal>> {
    let row: Option<(BigDecimal,)> = sqlx::query_as(
        "select balance from balances where address = $1 and chain = $2 and dapp is not distinct from $3",
    )
    .bind(address)
    .bind(chain)
    .bind(dapp)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(|(balance,)| balance))
}

/// Total balance of an address across chains, excluding dapp-scoped rows.
pub async fn get_total_balance(
    conn: &mut PgConnection,
    address: &str,
) -> sqlx::Result<BigDecimal> {
    let row: Option<(Option<BigDecimal>,)> = sqlx::query_as(
        "select sum(balance) from balances where address = $1 and dapp is null group by address",
    )
    .bind(address)
    .fetch_optional(conn)
    .await?;
    Ok(row.and_then(|(sum,)| sum).unwrap_or_default())
}

/// Applies one balance from a snapshot post. The height guard makes
/// replayed and out-of-order snapshots harmless.
pub async fn upsert_balance(
    conn: &mut PgConnection,
    address: &str,
    chain: Chain,
    dapp: Option<&str>,
    balance: &BigDecimal,
    eth_height: i64,
    last_update: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into balances (address, chain, dapp, balance, eth_height, last_update)
           values ($1, $2, $3, $4, $5, $6)
           on conflict (address, chain, dapp) do update
           set balance = excluded.balance,
               eth_height = excluded.eth_height,
               last_update = case
                   when excluded.balance <> balances.balance then excluded.last_update
                   else balances.last_update
               end
           where excluded.eth_height > balances.eth_height"#,
    )
    .bind(address)
    .bind(chain)
    .bind(dapp)
    .bind(balance)
    .bind(eth_height)
    .bind(last_update)
    .execute(conn)
    .await?;
    Ok(())
}

/// Credits issued before the precision cutoff are scaled up to the current
/// credit unit. Applied at insertion time so the FIFO never mixes scales.
pub fn apply_credit_precision_multiplier(
    amount: i64,
    message_timestamp: DateTime<Utc>,
) -> i64 {
    if message_timestamp.timestamp() < CREDIT_PRECISION_CUTOFF_TIMESTAMP {
        amount * CREDIT_PRECISION_MULTIPLIER
    } else {
        amount
    }
}

pub async fn insert_credit_history(
    conn: &mut PgConnection,
    row: &CreditHistoryRow,
) -> sqlx::Result<()> {
    let amount = apply_credit_precision_multiplier(row.amount, row.message_timestamp);
    sqlx::query(
        r#"insert into credit_history
               (credit_ref, credit_index, address, amount, price, bonus_amount,
                expiration_date, message_timestamp, last_update, tx_hash, token,
                chain, provider, origin, origin_ref, payment_method)
           values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
           on conflict (credit_ref, credit_index) do nothing"#,
    )
    .bind(&row.credit_ref)
    .bind(row.credit_index)
    .bind(&row.address)
    .bind(amount)
    .bind(&row.price)
    .bind(row.bonus_amount)
    .bind(row.expiration_date)
    .bind(row.message_timestamp)
    .bind(row.last_update)
    .bind(&row.tx_hash)
    .bind(&row.token)
    .bind(&row.chain)
    .bind(&row.provider)
    .bind(&row.origin)
    .bind(&row.origin_ref)
    .bind(&row.payment_method)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_credit_history(
    conn: &mut PgConnection,
    address: &str,
) -> sqlx::Result<Vec<CreditHistoryRow>> {
    sqlx::query_as::<_, CreditHistoryRow>(
        r#"select credit_ref, credit_index, address, amount, price, bonus_amount,
                  expiration_date, message_timestamp, last_update, tx_hash, token,
                  chain, provider, origin, origin_ref, payment_method
           from credit_history
           where address = $1
           order by message_timestamp asc, credit_index asc"#,
    )
    .bind(address)
    .fetch_all(conn)
    .await
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CreditBalanceRow {
    pub address: String,
    pub balance: i64,
    pub last_update: DateTime<Utc>,
}

pub async fn get_cached_credit_balance(
    conn: &mut PgConnection,
    address: &str,
) -> sqlx::Result<Option<CreditBalanceRow>> {
    sqlx::query_as::<_, CreditBalanceRow>(
        "select address, balance, last_update from credit_balances where address = $1",
    )
    .bind(address)
    .fetch_optional(conn)
    .await
}

pub async fn upsert_credit_balance(
    conn: &mut PgConnection,
    address: &str,
    balance: i64,
    last_update: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into credit_balances (address, balance, last_update)
           values ($1, $2, $3)
           on conflict (address) do update
           set balance = excluded.balance, last_update = excluded.last_update"#,
    )
    .bind(address)
    .bind(balance)
    .bind(last_update)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn latest_credit_history_update(
    conn: &mut PgConnection,
    address: &str,
) -> sqlx::Result<Option<DateTime<Utc>>> {
    let row: (Option<DateTime<Utc>>,) =
        sqlx::query_as("select max(last_update) from credit_history where address = $1")
            .bind(address)
            .fetch_one(conn)
            .await?;
    Ok(row.0)
}

/// Earliest credit expiration falling inside `(after, until]`, which is
/// exactly the window that invalidates a cached balance.
pub async fn earliest_expiration_in_window(
    conn: &mut PgConnection,
    address: &str,
    after: DateTime<Utc>,
    until: DateTime<Utc>,
) -> sqlx::Result<Option<DateTime<Utc>>> {
    let row: (Option<DateTime<Utc>>,) = sqlx::query_as(
        r#"select min(expiration_date) from credit_history
           where address = $1
             and expiration_date is not null
             and expiration_date > $2
             and expiration_date <= $3"#,
    )
    .bind(address)
    .bind(after)
    .bind(until)
    .fetch_one(conn)
    .await?;
    Ok(row.0)
}

/// FIFO evaluation of a credit history.
///
/// Expenses consume the oldest credits first, and may only consume a
/// credit when they occurred strictly before its expiration. The returned
/// balance sums what remains of the credits still valid at `now`.
pub fn calculate_credit_balance_fifo(records: &[CreditHistoryRow], now: DateTime<Utc>) -> i64 {
    struct PositiveCredit {
        expiration_date: Option<DateTime<Utc>>,
        remaining: i64,
    }

    let mut credits: Vec<PositiveCredit> = Vec::new();
    let mut expenses: Vec<(i64, DateTime<Utc>)> = Vec::new();

    for record in records {
        if record.amount > 0 {
            credits.push(PositiveCredit {
                expiration_date: record.expiration_date,
                remaining: record.amount,
            });
        } else if record.amount < 0 {
            expenses.push((-record.amount, record.message_timestamp));
        }
    }

    for (amount, timestamp) in expenses {
        let mut remaining_expense = amount;
        for credit in credits.iter_mut() {
            if remaining_expense == 0 {
                break;
            }
            let expense_valid = match credit.expiration_date {
                None => true,
                Some(expiration) => timestamp < expiration,
            };
            if expense_valid && credit.remaining > 0 {
                let consumed = credit.remaining.min(remaining_expense);
                credit.remaining -= consumed;
                remaining_expense -= consumed;
            }
        }
    }

    let total: i64 = credits
        .iter()
        .filter(|credit| match credit.expiration_date {
            None => true,
            Some(expiration) => expiration > now,
        })
        .map(|credit| credit.remaining)
        .sum();

    total.max(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn credit(amount: i64, timestamp: i64, expiration: Option<i64>) -> CreditHistoryRow {
        CreditHistoryRow {
            credit_ref: format!("ref-{timestamp}"),
            credit_index: 0,
            address: "0xabc".to_string(),
            amount,
            price: None,
            bonus_amount: None,
            expiration_date: expiration.map(at),
            message_timestamp: at(timestamp),
            last_update: at(timestamp),
            tx_hash: None,
            token: None,
            chain: None,
            provider: None,
            origin: None,
            origin_ref: None,
            payment_method: None,
        }
    }

    #[test]
    fn expenses_consume_oldest_credits_first() {
        let records = vec![
            credit(1000, 1, None),
            credit(1000, 2, Some(100)),
            credit(-1500, 3, None),
        ];
        // The non-expiring credit (oldest) is fully consumed, then 500 of
        // the expiring one.
        assert_eq!(calculate_credit_balance_fifo(&records, at(50)), 500);
        // Past the expiration the remainder of the expiring credit is gone.
        assert_eq!(calculate_credit_balance_fifo(&records, at(150)), 0);
    }

    #[test]
    fn expense_cannot_consume_an_expired_credit() {
        let records = vec![credit(1000, 1, Some(10)), credit(-500, 20, None)];
        // The expense happened after expiration, so nothing was consumed,
        // and nothing is left either once the credit expired.
        assert_eq!(calculate_credit_balance_fifo(&records, at(30)), 0);
        // Before expiration the full credit is intact.
        assert_eq!(calculate_credit_balance_fifo(&records, at(5)), 1000);
    }

    #[test]
    fn expiration_boundary_is_exclusive_for_expenses() {
        // An expense at exactly the expiration instant cannot consume the
        // credit.
        let records = vec![credit(1000, 1, Some(10)), credit(-400, 10, None)];
        assert_eq!(calculate_credit_balance_fifo(&records, at(5)), 1000);
        // A credit expiring exactly at `now` is no longer valid.
        let records = vec![credit(1000, 1, Some(10))];
        assert_eq!(calculate_credit_balance_fifo(&records, at(10)), 0);
        assert_eq!(calculate_credit_balance_fifo(&records, at(9)), 1000);
    }

    #[test]
    fn balance_never_goes_negative() {
        let records = vec![credit(100, 1, None), credit(-500, 2, None)];
        assert_eq!(calculate_credit_balance_fifo(&records, at(10)), 0);
    }

    #[test]
    fn precision_multiplier_applies_before_the_cutoff() {
        let before = at(CREDIT_PRECISION_CUTOFF_TIMESTAMP - 1);
        let after = at(CREDIT_PRECISION_CUTOFF_TIMESTAMP);
        assert_eq!(apply_credit_precision_multiplier(100, before), 1_000_000);
        assert_eq!(apply_credit_precision_multiplier(100, after), 100);
    }
}
