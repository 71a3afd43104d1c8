use bigdecimal::BigDecimal;
use sqlx::PgConnection;

use models::cost::CostType;
use models::execution::PaymentType;

/// One cost component of a processed message.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccountCostRow {
    pub owner: String,
    pub item_hash: String,
    #[sqlx(rename = "type")]
    pub cost_type: CostType,
    pub name: String,
    #[sqlx(rename = "ref")]
    pub ref_: Option<String>,
    pub payment_type: PaymentType,
    pub cost_hold: BigDecimal,
    pub cost_stream: BigDecimal,
    pub cost_credit: BigDecimal,
}

pub async fn upsert_costs(conn: &mut PgConnection, costs: &[AccountCostRow]) -> sqlx::Result<()> {
    for cost in costs {
        sqlx::query(
            r#"insert into account_costs
                   (owner, item_hash, type, name, ref, payment_type, cost_hold,
                    cost_stream, cost_credit)
               values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               on conflict (owner, item_hash, type, name) do update
               set ref = excluded.ref,
                   payment_type = excluded.payment_type,
                   cost_hold = excluded.cost_hold,
                   cost_stream = excluded.cost_stream,
                   cost_credit = excluded.cost_credit"#,
        )
        .bind(&cost.owner)
        .bind(&cost.item_hash)
        .bind(cost.cost_type)
        .bind(&cost.name)
        .bind(&cost.ref_)
        .bind(cost.payment_type)
        .bind(&cost.cost_hold)
        .bind(&cost.cost_stream)
        .bind(&cost.cost_credit)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn get_costs_by_item_hash(
    conn: &mut PgConnection,
    item_hash: &str,
) -> sqlx::Result<Vec<AccountCostRow>> {
    sqlx::query_as::<_, AccountCostRow>(
        r#"select owner, item_hash, type, name, ref, payment_type, cost_hold,
                  cost_stream, cost_credit
           from account_costs where item_hash = $1"#,
    )
    .bind(item_hash)
    .fetch_all(conn)
    .await
}

pub async fn delete_costs_by_item_hash(
    conn: &mut PgConnection,
    item_hash: &str,
) -> sqlx::Result<()> {
    sqlx::query("delete from account_costs where item_hash = $1")
        .bind(item_hash)
        .execute(conn)
        .await?;
    Ok(())
}

/// Sum of the hold costs currently locked by an owner. The admission check
/// compares `balance >= held + new_cost`.
pub async fn get_total_cost_for_address(
    conn: &mut PgConnection,
    owner: &str,
    payment_type: PaymentType,
) -> sqlx::Result<BigDecimal> {
    let row: (Option<BigDecimal>,) = sqlx::query_as(
        "select sum(cost_hold) from account_costs where owner = $1 and payment_type = $2",
    )
    .bind(owner)
    .bind(payment_type)
    .fetch_one(conn)
    .await?;
    Ok(row.0.unwrap_or_default())
}
