

mod embedded {
	use refinery::embed_migrations;
	embed_migrations!("src/database/migrations");
}

pub mod model;


use std::collections::HashMap;

use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use tokio_postgres::{types::Type, Client, GenericClient, NoTls, Row};

use swap::{Preimage, Swap, SwapLeg, SwapStatus, SwapType};

use crate::config::Postgres as PostgresConfig;
use crate::database::model::{PendingLockup, RefundStatus, RefundTransaction};

const DEFAULT_DATABASE: &str = "postgres";


/// Persistence of swaps.
#[async_trait]
pub trait SwapRepository: Send + Sync + 'static {
	async fn insert_swap(&self, swap: &Swap) -> anyhow::Result<()>;

	async fn get_swap(&self, id: &str) -> anyhow::Result<Option<Swap>>;

	async fn get_swaps_by_status(
		&self,
		kind: SwapType,
		statuses: &[SwapStatus],
	) -> anyhow::Result<Vec<Swap>>;

	async fn set_status(
		&self,
		id: &str,
		status: SwapStatus,
		failure_reason: Option<String>,
	) -> anyhow::Result<()>;

	/// Store the preimage of a swap.
	///
	/// Returns false if the swap had a preimage already, which is kept.
	async fn set_preimage(&self, id: &str, preimage: Preimage) -> anyhow::Result<bool>;

	/// Mark the swap claimed and store the fee we paid for the claim.
	async fn set_claimed(&self, id: &str, fee: u64) -> anyhow::Result<()>;
}

/// Persistence of our refunds.
#[async_trait]
pub trait RefundTransactionRepository: Send + Sync + 'static {
	async fn add_refund(&self, refund: &RefundTransaction) -> anyhow::Result<()>;

	async fn get_pending_refunds(&self) -> anyhow::Result<Vec<RefundTransaction>>;

	/// Move a pending refund to `status`.
	///
	/// Returns false if the refund was not pending anymore.
	async fn set_refund_status(&self, id: &str, status: RefundStatus) -> anyhow::Result<bool>;
}

/// Persistence of the unconfirmed lockups we accepted.
#[async_trait]
pub trait PendingLockupRepository: Send + Sync + 'static {
	/// Keeps the existing record if the swap has one.
	async fn add_pending_lockup(&self, lockup: &PendingLockup) -> anyhow::Result<()>;

	async fn get_pending_lockup(&self, swap_id: &str) -> anyhow::Result<Option<PendingLockup>>;

	async fn get_pending_lockups(&self, symbol: &str) -> anyhow::Result<Vec<PendingLockup>>;

	async fn remove_pending_lockup(&self, swap_id: &str) -> anyhow::Result<()>;
}


#[derive(Clone)]
pub struct Db {
	pool: Pool<PostgresConnectionManager<NoTls>>
}

impl Db {
	async fn run_migrations(&self) -> anyhow::Result<()> {
		let mut conn = self.pool.get().await?;
		embedded::migrations::runner().run_async::<Client>(&mut conn).await?;
		info!("All migrations got successfully run");
		Ok(())
	}

	fn config(database: &str, config: &PostgresConfig) -> tokio_postgres::Config {
		let mut pg_config = tokio_postgres::Config::new();
		pg_config.host(&config.host);
		pg_config.port(config.port);
		pg_config.dbname(database);
		if let Some(user) = &config.user {
			pg_config.user(user);
		}
		if let Some(password) = &config.password {
			pg_config.password(password);
		}

		pg_config
	}

	async fn raw_connect(postgres_config: &PostgresConfig) -> anyhow::Result<Client> {
		let config = Self::config(&postgres_config.name, postgres_config);
		let (client, connection) = config.connect(NoTls).await?;

		tokio::spawn(async move {
			if let Err(e) = connection.await {
				error!("postgres connection error: {}", e);
			}
		});

		Ok(client)
	}

	async fn pool_connect(
		database: &str,
		postgres_config: &PostgresConfig,
	) -> anyhow::Result<Pool<PostgresConnectionManager<NoTls>>> {
		let config = Self::config(database, postgres_config);

		let manager = PostgresConnectionManager::new(config, NoTls);
		Ok(Pool::builder().build(manager).await?)
	}

	async fn check_database_emptiness(conn: &Client) -> anyhow::Result<()> {
		let statement = conn.prepare("
			SELECT COUNT(*)
			FROM pg_catalog.pg_tables
			WHERE schemaname NOT IN ('pg_catalog', 'information_schema');
		").await?;

		if conn.query_one(&statement, &[]).await?.get::<_, i64>(0) > 0 {
			bail!("Database must be empty to create a swap server in it.")
		}

		Ok(())
	}

	pub async fn connect(config: &PostgresConfig) -> anyhow::Result<Self> {
		let pool = Self::pool_connect(&config.name, config).await?;

		let db = Db { pool };
		db.run_migrations().await?;

		Ok(db)
	}

	pub async fn create(config: &PostgresConfig) -> anyhow::Result<Self> {
		info!("Checking if a database exists...");
		let connect = Self::raw_connect(config).await;

		if let Ok(conn) = connect {
			info!("A database already exists for the server, checking if it is empty.");
			Self::check_database_emptiness(&conn).await?;
		} else {
			info!("No database set up yet, creating a new one.");
			let pool = Self::pool_connect(DEFAULT_DATABASE, config).await?;
			let conn = pool.get().await?;

			let statement = conn.prepare(
				&format!("CREATE DATABASE \"{}\"", config.name)
			).await?;
			conn.execute(&statement, &[]).await?;
		}

		Self::connect(config).await
	}

	/**
	 * Swaps
	*/

	async fn inner_insert_leg<T: GenericClient + Sync>(
		client: &T,
		swap_id: &str,
		side: &str,
		leg: &SwapLeg,
	) -> anyhow::Result<()> {
		let statement = client.prepare_typed("
			INSERT INTO swap_leg (swap_id, side, symbol, key_index, their_public_key, swap_tree,
				amount, lockup_txid, lockup_vout, timeout_block_height, fee)
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11);
		", &[
			Type::TEXT, Type::TEXT, Type::TEXT, Type::INT8, Type::TEXT, Type::TEXT,
			Type::INT8, Type::TEXT, Type::INT4, Type::INT4, Type::INT8,
		]).await?;

		let swap_tree = leg.swap_tree.as_ref().map(serde_json::to_string).transpose()?;
		client.execute(&statement, &[
			&swap_id,
			&side,
			&leg.symbol,
			&i64::from(leg.key_index),
			&leg.their_public_key.map(|pk| pk.to_string()),
			&swap_tree,
			&i64::try_from(leg.amount)?,
			&leg.lockup_txid,
			&leg.lockup_vout.map(i32::try_from).transpose()?,
			&i32::try_from(leg.timeout_block_height)?,
			&leg.fee.map(i64::try_from).transpose()?,
		]).await?;
		Ok(())
	}

	/// Fetch the legs of the swaps with the given ids, grouped by swap.
	async fn inner_get_legs<T: GenericClient + Sync>(
		client: &T,
		ids: &[String],
	) -> anyhow::Result<HashMap<String, Vec<Row>>> {
		let statement = client.prepare_typed("
			SELECT swap_id, side, symbol, key_index, their_public_key, swap_tree,
				amount, lockup_txid, lockup_vout, timeout_block_height, fee
			FROM swap_leg WHERE swap_id = ANY($1);
		", &[Type::TEXT_ARRAY]).await?;

		let mut ret = HashMap::<String, Vec<Row>>::new();
		for row in client.query(&statement, &[&ids]).await? {
			ret.entry(row.get("swap_id")).or_default().push(row);
		}
		Ok(ret)
	}

	async fn rows_to_swaps<T: GenericClient + Sync>(
		client: &T,
		rows: Vec<Row>,
	) -> anyhow::Result<Vec<Swap>> {
		let ids = rows.iter().map(|r| r.get::<_, String>("id")).collect::<Vec<_>>();
		let mut legs = Self::inner_get_legs(client, &ids).await?;
		rows.iter().map(|row| {
			let legs = legs.remove(row.get::<_, &str>("id")).unwrap_or_default();
			model::swap_from_rows(row, &legs)
		}).collect()
	}
}

#[async_trait]
impl SwapRepository for Db {
	async fn insert_swap(&self, swap: &Swap) -> anyhow::Result<()> {
		let mut conn = self.pool.get().await?;
		let tx = conn.transaction().await?;

		let statement = tx.prepare_typed("
			INSERT INTO swap (id, kind, status, pair, version, preimage_hash, preimage, failure_reason)
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8);
		", &[
			Type::TEXT, Type::TEXT, Type::TEXT, Type::TEXT, Type::INT2, Type::TEXT, Type::TEXT, Type::TEXT,
		]).await?;
		tx.execute(&statement, &[
			&swap.id,
			&swap.kind().as_str(),
			&swap.status.as_str(),
			&swap.pair,
			&swap.version.to_i16(),
			&swap.preimage_hash.to_string(),
			&swap.preimage.map(|p| p.to_string()),
			&swap.failure_reason,
		]).await?;

		if let Some(leg) = swap.receiving_leg() {
			Self::inner_insert_leg(&tx, &swap.id, "receiving", leg).await?;
		}
		if let Some(leg) = swap.sending_leg() {
			Self::inner_insert_leg(&tx, &swap.id, "sending", leg).await?;
		}

		tx.commit().await?;
		Ok(())
	}

	async fn get_swap(&self, id: &str) -> anyhow::Result<Option<Swap>> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare_typed("
			SELECT id, kind, status, pair, version, preimage_hash, preimage, failure_reason
			FROM swap WHERE id = $1;
		", &[Type::TEXT]).await?;

		let rows = conn.query(&statement, &[&id]).await?;
		Ok(Self::rows_to_swaps(&*conn, rows).await?.pop())
	}

	async fn get_swaps_by_status(
		&self,
		kind: SwapType,
		statuses: &[SwapStatus],
	) -> anyhow::Result<Vec<Swap>> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare_typed("
			SELECT id, kind, status, pair, version, preimage_hash, preimage, failure_reason
			FROM swap WHERE kind = $1 AND status = ANY($2);
		", &[Type::TEXT, Type::TEXT_ARRAY]).await?;

		let statuses = statuses.iter().map(|s| s.as_str()).collect::<Vec<_>>();
		let rows = conn.query(&statement, &[&kind.as_str(), &statuses]).await?;
		Self::rows_to_swaps(&*conn, rows).await
	}

	async fn set_status(
		&self,
		id: &str,
		status: SwapStatus,
		failure_reason: Option<String>,
	) -> anyhow::Result<()> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare_typed("
			UPDATE swap SET status = $2, failure_reason = $3, updated_at = NOW() WHERE id = $1;
		", &[Type::TEXT, Type::TEXT, Type::TEXT]).await?;

		let updated = conn.execute(&statement, &[&id, &status.as_str(), &failure_reason]).await?;
		if updated == 0 {
			return not_found!([id], "swap does not exist");
		}
		Ok(())
	}

	async fn set_preimage(&self, id: &str, preimage: Preimage) -> anyhow::Result<bool> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare_typed("
			UPDATE swap SET preimage = $2, updated_at = NOW() WHERE id = $1 AND preimage IS NULL;
		", &[Type::TEXT, Type::TEXT]).await?;

		let updated = conn.execute(&statement, &[&id, &preimage.to_string()]).await?;
		Ok(updated > 0)
	}

	async fn set_claimed(&self, id: &str, fee: u64) -> anyhow::Result<()> {
		let mut conn = self.pool.get().await?;
		let tx = conn.transaction().await?;

		let statement = tx.prepare_typed("
			UPDATE swap SET status = $2, updated_at = NOW() WHERE id = $1;
		", &[Type::TEXT, Type::TEXT]).await?;
		let updated = tx.execute(&statement, &[&id, &SwapStatus::TransactionClaimed.as_str()]).await?;
		if updated == 0 {
			return not_found!([id], "swap does not exist");
		}

		let statement = tx.prepare_typed("
			UPDATE swap_leg SET fee = $2 WHERE swap_id = $1 AND side = 'receiving';
		", &[Type::TEXT, Type::INT8]).await?;
		tx.execute(&statement, &[&id, &i64::try_from(fee)?]).await?;

		tx.commit().await?;
		Ok(())
	}
}

#[async_trait]
impl RefundTransactionRepository for Db {
	async fn add_refund(&self, refund: &RefundTransaction) -> anyhow::Result<()> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare_typed("
			INSERT INTO refund_transaction (id, swap_id, vin, status) VALUES ($1, $2, $3, $4);
		", &[Type::TEXT, Type::TEXT, Type::INT4]).await?;

		conn.execute(&statement, &[
			&refund.id,
			&refund.swap_id,
			&refund.vin.map(i32::try_from).transpose()?,
			&refund.status,
		]).await?;
		Ok(())
	}

	async fn get_pending_refunds(&self) -> anyhow::Result<Vec<RefundTransaction>> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare("
			SELECT id, swap_id, vin, status FROM refund_transaction
			WHERE status = 'pending' ORDER BY created_at;
		").await?;

		let rows = conn.query(&statement, &[]).await?;
		rows.into_iter().map(RefundTransaction::try_from).collect()
	}

	async fn set_refund_status(&self, id: &str, status: RefundStatus) -> anyhow::Result<bool> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare_typed("
			UPDATE refund_transaction SET status = $2 WHERE id = $1 AND status = 'pending';
		", &[Type::TEXT]).await?;

		let updated = conn.execute(&statement, &[&id, &status]).await?;
		Ok(updated > 0)
	}
}

#[async_trait]
impl PendingLockupRepository for Db {
	async fn add_pending_lockup(&self, lockup: &PendingLockup) -> anyhow::Result<()> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare_typed("
			INSERT INTO pending_lockup (swap_id, symbol, txid, amount)
			VALUES ($1, $2, $3, $4::TEXT::NUMERIC)
			ON CONFLICT (swap_id) DO NOTHING;
		", &[Type::TEXT, Type::TEXT, Type::TEXT, Type::TEXT]).await?;

		conn.execute(&statement, &[
			&lockup.swap_id,
			&lockup.symbol,
			&lockup.txid,
			&lockup.amount.to_string(),
		]).await?;
		Ok(())
	}

	async fn get_pending_lockup(&self, swap_id: &str) -> anyhow::Result<Option<PendingLockup>> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare_typed("
			SELECT swap_id, symbol, txid, amount::TEXT AS amount FROM pending_lockup
			WHERE swap_id = $1;
		", &[Type::TEXT]).await?;

		conn.query_opt(&statement, &[&swap_id]).await?
			.map(PendingLockup::try_from).transpose()
	}

	async fn get_pending_lockups(&self, symbol: &str) -> anyhow::Result<Vec<PendingLockup>> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare_typed("
			SELECT swap_id, symbol, txid, amount::TEXT AS amount FROM pending_lockup
			WHERE symbol = $1 ORDER BY created_at;
		", &[Type::TEXT]).await?;

		let rows = conn.query(&statement, &[&symbol]).await?;
		rows.into_iter().map(PendingLockup::try_from).collect()
	}

	async fn remove_pending_lockup(&self, swap_id: &str) -> anyhow::Result<()> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare_typed("
			DELETE FROM pending_lockup WHERE swap_id = $1;
		", &[Type::TEXT]).await?;

		conn.execute(&statement, &[&swap_id]).await?;
		Ok(())
	}
}
