use crate::error::FeedError;
use crate::market::now_unix_ms;
use crate::market::types::{
    normalize_trade_limit, normalize_wallet_address, Position, PositionUpsertArgs, Profile,
    ProfilePatch, RecordTradeArgs, TradeRecord, TradeSide,
};
use sqlx::{Row, SqlitePool};

fn map_profile_row(row: &sqlx::sqlite::SqliteRow) -> Result<Profile, FeedError> {
    Ok(Profile {
        wallet_address: row.try_get("wallet_address")?,
        display_name: row.try_get("display_name")?,
        bio: row.try_get("bio")?,
        avatar_url: row.try_get("avatar_url")?,
        followers: row.try_get("followers")?,
        following: row.try_get("following")?,
        created_at_ms: row.try_get("created_at_ms")?,
        updated_at_ms: row.try_get("updated_at_ms")?,
    })
}

fn map_position_row(row: &sqlx::sqlite::SqliteRow) -> Result<Position, FeedError> {
    let outcome_index: i64 = row.try_get("outcome_index")?;
    Ok(Position {
        wallet_address: row.try_get("wallet_address")?,
        market_id: row.try_get("market_id")?,
        outcome_index: outcome_index_from_sqlite(outcome_index)?,
        shares: row.try_get("shares")?,
        average_price: row.try_get("average_price")?,
        program_account: row.try_get("program_account")?,
        updated_at_ms: row.try_get("updated_at_ms")?,
    })
}

fn map_trade_row(row: &sqlx::sqlite::SqliteRow) -> Result<TradeRecord, FeedError> {
    let outcome_index: i64 = row.try_get("outcome_index")?;
    let side_raw: String = row.try_get("side")?;
    Ok(TradeRecord {
        id: row.try_get("id")?,
        wallet_address: row.try_get("wallet_address")?,
        market_id: row.try_get("market_id")?,
        outcome_index: outcome_index_from_sqlite(outcome_index)?,
        side: TradeSide::parse_str(&side_raw)?,
        shares: row.try_get("shares")?,
        price: row.try_get("price")?,
        signature: row.try_get("signature")?,
        program_account: row.try_get("program_account")?,
        executed_at_ms: row.try_get("executed_at_ms")?,
    })
}

fn outcome_index_from_sqlite(value: i64) -> Result<u32, FeedError> {
    u32::try_from(value).map_err(|_| {
        FeedError::InvalidArgument(format!("stored outcome index {value} is out of range"))
    })
}

pub async fn get_profile(
    pool: &SqlitePool,
    wallet_address: &str,
) -> Result<Option<Profile>, FeedError> {
    let wallet_address = normalize_wallet_address(wallet_address)?;
    let row = sqlx::query(
        "SELECT wallet_address, display_name, bio, avatar_url, followers, following, created_at_ms, updated_at_ms \
         FROM profiles WHERE wallet_address = ?",
    )
    .bind(wallet_address)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(map_profile_row).transpose()
}

/// Merges `patch` into the stored profile, creating it on first write.
pub async fn put_profile(
    pool: &SqlitePool,
    wallet_address: &str,
    patch: ProfilePatch,
) -> Result<Profile, FeedError> {
    let wallet_address = normalize_wallet_address(wallet_address)?;
    let patch = patch.normalize()?;
    let now_ms = now_unix_ms();

    let mut transaction = pool.begin().await?;
    let existing = sqlx::query(
        "SELECT wallet_address, display_name, bio, avatar_url, followers, following, created_at_ms, updated_at_ms \
         FROM profiles WHERE wallet_address = ?",
    )
    .bind(&wallet_address)
    .fetch_optional(&mut *transaction)
    .await?;

    let mut profile = match existing.as_ref() {
        Some(row) => map_profile_row(row)?,
        None => Profile {
            wallet_address: wallet_address.clone(),
            display_name: None,
            bio: None,
            avatar_url: None,
            followers: 0,
            following: 0,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        },
    };
    patch.apply_to(&mut profile);
    profile.updated_at_ms = now_ms;

    sqlx::query(
        "INSERT INTO profiles (wallet_address, display_name, bio, avatar_url, followers, following, created_at_ms, updated_at_ms) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(wallet_address) DO UPDATE SET \
           display_name=excluded.display_name, \
           bio=excluded.bio, \
           avatar_url=excluded.avatar_url, \
           followers=excluded.followers, \
           following=excluded.following, \
           updated_at_ms=excluded.updated_at_ms",
    )
    .bind(&profile.wallet_address)
    .bind(&profile.display_name)
    .bind(&profile.bio)
    .bind(&profile.avatar_url)
    .bind(profile.followers)
    .bind(profile.following)
    .bind(profile.created_at_ms)
    .bind(profile.updated_at_ms)
    .execute(&mut *transaction)
    .await?;
    transaction.commit().await?;

    Ok(profile)
}

pub async fn upsert_position(
    pool: &SqlitePool,
    args: PositionUpsertArgs,
) -> Result<Position, FeedError> {
    let normalized = args.normalize()?;
    let position = Position {
        wallet_address: normalized.wallet_address,
        market_id: normalized.market_id,
        outcome_index: normalized.outcome_index,
        shares: normalized.shares,
        average_price: normalized.average_price,
        program_account: normalized.program_account,
        updated_at_ms: now_unix_ms(),
    };

    sqlx::query(
        "INSERT INTO positions (wallet_address, market_id, outcome_index, shares, average_price, program_account, updated_at_ms) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(wallet_address, market_id, outcome_index) DO UPDATE SET \
           shares=excluded.shares, \
           average_price=excluded.average_price, \
           program_account=COALESCE(excluded.program_account, positions.program_account), \
           updated_at_ms=excluded.updated_at_ms",
    )
    .bind(&position.wallet_address)
    .bind(&position.market_id)
    .bind(i64::from(position.outcome_index))
    .bind(position.shares)
    .bind(position.average_price)
    .bind(&position.program_account)
    .bind(position.updated_at_ms)
    .execute(pool)
    .await?;

    let row = sqlx::query(
        "SELECT wallet_address, market_id, outcome_index, shares, average_price, program_account, updated_at_ms \
         FROM positions WHERE wallet_address = ? AND market_id = ? AND outcome_index = ?",
    )
    .bind(&position.wallet_address)
    .bind(&position.market_id)
    .bind(i64::from(position.outcome_index))
    .fetch_one(pool)
    .await?;

    map_position_row(&row)
}

pub async fn list_positions(
    pool: &SqlitePool,
    wallet_address: &str,
) -> Result<Vec<Position>, FeedError> {
    let wallet_address = normalize_wallet_address(wallet_address)?;
    let rows = sqlx::query(
        "SELECT wallet_address, market_id, outcome_index, shares, average_price, program_account, updated_at_ms \
         FROM positions \
         WHERE wallet_address = ? AND shares > 0 \
         ORDER BY market_id ASC, outcome_index ASC",
    )
    .bind(wallet_address)
    .fetch_all(pool)
    .await?;

    let mut positions = Vec::with_capacity(rows.len());
    for row in rows {
        positions.push(map_position_row(&row)?);
    }

    Ok(positions)
}

/// Stores a settled trade. Signatures are unique; recording the same one
/// twice is rejected.
pub async fn record_trade(
    pool: &SqlitePool,
    args: RecordTradeArgs,
) -> Result<TradeRecord, FeedError> {
    let normalized = args.normalize()?;
    let executed_at_ms = normalized.executed_at_ms.unwrap_or_else(now_unix_ms);

    let result = sqlx::query(
        "INSERT INTO trades (wallet_address, market_id, outcome_index, side, shares, price, signature, program_account, executed_at_ms) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&normalized.wallet_address)
    .bind(&normalized.market_id)
    .bind(i64::from(normalized.outcome_index))
    .bind(normalized.side.as_str())
    .bind(normalized.shares)
    .bind(normalized.price)
    .bind(&normalized.signature)
    .bind(&normalized.program_account)
    .bind(executed_at_ms)
    .execute(pool)
    .await;

    let result = match result {
        Ok(result) => result,
        Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
            return Err(FeedError::InvalidArgument(format!(
                "trade {} is already recorded",
                normalized.signature
            )));
        }
        Err(error) => return Err(error.into()),
    };

    Ok(TradeRecord {
        id: result.last_insert_rowid(),
        wallet_address: normalized.wallet_address,
        market_id: normalized.market_id,
        outcome_index: normalized.outcome_index,
        side: normalized.side,
        shares: normalized.shares,
        price: normalized.price,
        signature: normalized.signature,
        program_account: normalized.program_account,
        executed_at_ms,
    })
}

/// Newest trades first.
pub async fn list_trades(
    pool: &SqlitePool,
    wallet_address: &str,
    limit: Option<u32>,
) -> Result<Vec<TradeRecord>, FeedError> {
    let wallet_address = normalize_wallet_address(wallet_address)?;
    let limit = normalize_trade_limit(limit)?;
    let rows = sqlx::query(
        "SELECT id, wallet_address, market_id, outcome_index, side, shares, price, signature, program_account, executed_at_ms \
         FROM trades \
         WHERE wallet_address = ? \
         ORDER BY executed_at_ms DESC, id DESC \
         LIMIT ?",
    )
    .bind(wallet_address)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    let mut trades = Vec::with_capacity(rows.len());
    for row in rows {
        trades.push(map_trade_row(&row)?);
    }

    Ok(trades)
}
